//! The crate's public operation surface.
//!
//! Inputs arrive as they would from a request layer: ISO dates, `"HH:MM"`
//! times and ULID strings. Every call carries the caller's `Actor` as issued
//! by the identity provider. Each operation is timed and counted under its
//! own `op` label.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::preview::{PreviewData, PreviewStore};
use crate::validation::{self, GuestRow, ValidatedRoster, ValidationReport};

#[derive(Debug, Clone, Deserialize)]
pub struct BookingRequest {
    pub agency_id: String,
    pub date: String,
    pub time: String,
    pub party_size: u32,
    #[serde(default)]
    pub precise_time: Option<String>,
    #[serde(default)]
    pub joint: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModifyRequest {
    pub party_size: u32,
    #[serde(default)]
    pub precise_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImmediateRequest {
    pub agency_id: String,
    pub date: String,
    pub time: String,
    pub party_size: u32,
    #[serde(default)]
    pub precise_time: Option<String>,
    pub rows: Vec<GuestRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuideRequest {
    pub name: String,
    pub last_name: String,
    #[serde(default)]
    pub badge: Option<String>,
}

/// Result of handing in guest rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The list is attached.
    Committed(GuestList),
    /// Clean spreadsheet import, staged until the agency confirms it.
    Staged {
        preview_id: Ulid,
        report: ValidationReport,
    },
    /// Some rows need fixing; the submission waits in a preview session.
    Corrigible {
        preview_id: Ulid,
        report: ValidationReport,
    },
}

pub fn parse_id(s: &str) -> Result<Ulid, EngineError> {
    Ulid::from_string(s.trim()).map_err(|_| EngineError::InvalidInput(format!("'{s}' is not a ULID")))
}

pub fn parse_slot(date: &str, time: &str) -> Result<SlotKey, EngineError> {
    Ok(SlotKey::new(parse_iso_date(date)?, time.parse()?))
}

fn parse_precise(s: Option<&str>) -> Result<Option<chrono::NaiveTime>, EngineError> {
    s.map(parse_hhmm).transpose()
}

/// Flatten every problem in a report into one message list.
fn report_messages(report: &ValidationReport) -> Vec<String> {
    let mut messages = report.general_errors.clone();
    for (i, row) in report.rows.iter().enumerate() {
        messages.extend(row.errors.iter().map(|e| format!("row {}: {e}", i + 1)));
    }
    messages
}

async fn observe<T, F>(op: &'static str, fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    let started = Instant::now();
    let result = fut.await;
    observability::record(op, started, &result);
    if let Err(e) = &result {
        debug!(op, "rejected: {e}");
    }
    result
}

pub struct VenueService {
    engine: Arc<Engine>,
    previews: PreviewStore,
}

impl VenueService {
    pub fn new(engine: Arc<Engine>, preview_ttl: Duration) -> Self {
        Self {
            engine,
            previews: PreviewStore::new(preview_ttl),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn previews(&self) -> &PreviewStore {
        &self.previews
    }

    fn today(&self) -> chrono::NaiveDate {
        self.engine.now().date()
    }

    /// Agencies see only their own bookings in shared views.
    fn redact(actor: &Actor, mut view: SlotView) -> SlotView {
        if !actor.is_admin() {
            view.bookings.retain(|b| b.booking.agency_id == actor.id);
        }
        view
    }

    async fn owned_booking(&self, actor: &Actor, id: Ulid) -> Result<BookingView, EngineError> {
        let view = self.engine.booking(id).await?;
        if !actor.may_act_for(view.booking.agency_id) {
            return Err(EngineError::NotOwner(id));
        }
        Ok(view)
    }

    fn roster_or_reject(report: ValidationReport) -> Result<ValidatedRoster, EngineError> {
        report
            .into_roster()
            .map_err(|report| EngineError::GuestListRejected(report_messages(&report)))
    }

    // ── Capacity and ledger ──────────────────────────────────

    pub async fn resolve_limit(&self, date: &str, time: &str) -> Result<u32, EngineError> {
        observe("resolve_limit", async {
            self.engine.resolve_limit(parse_slot(date, time)?).await
        })
        .await
    }

    pub async fn booked_count(
        &self,
        date: &str,
        time: &str,
        excluding: Option<&str>,
    ) -> Result<u32, EngineError> {
        observe("booked_count", async {
            let excluding = excluding.map(parse_id).transpose()?;
            self.engine.booked_count(parse_slot(date, time)?, excluding).await
        })
        .await
    }

    /// A slot's bookings in creation order; agencies see only their own.
    pub async fn bookings_for_slot(
        &self,
        actor: &Actor,
        date: &str,
        time: &str,
    ) -> Result<Vec<Booking>, EngineError> {
        observe("bookings_for_slot", async {
            let mut bookings = self.engine.bookings_for_slot(parse_slot(date, time)?).await?;
            if !actor.is_admin() {
                bookings.retain(|b| b.agency_id == actor.id);
            }
            Ok::<_, EngineError>(bookings)
        })
        .await
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn create_booking(&self, actor: &Actor, req: &BookingRequest) -> Result<Booking, EngineError> {
        observe("create_booking", async {
            let agency_id = parse_id(&req.agency_id)?;
            let slot = parse_slot(&req.date, &req.time)?;
            let precise = parse_precise(req.precise_time.as_deref())?;
            let kind = if req.joint { BookingKind::Joint } else { BookingKind::Regular };
            self.engine
                .create_booking(actor, agency_id, slot, req.party_size, precise, kind)
                .await
        })
        .await
    }

    pub async fn modify_booking(
        &self,
        actor: &Actor,
        booking_id: &str,
        req: &ModifyRequest,
    ) -> Result<Booking, EngineError> {
        observe("modify_booking", async {
            let id = parse_id(booking_id)?;
            let precise = parse_precise(req.precise_time.as_deref())?;
            self.engine.modify_booking(actor, id, req.party_size, precise).await
        })
        .await
    }

    pub async fn cancel_booking(&self, actor: &Actor, booking_id: &str) -> Result<Booking, EngineError> {
        observe("cancel_booking", async {
            self.engine.cancel_booking(actor, parse_id(booking_id)?).await
        })
        .await
    }

    /// Admin booking with its guest list in one step. Any validation problem
    /// rejects the whole request.
    pub async fn create_immediate(
        &self,
        actor: &Actor,
        req: &ImmediateRequest,
    ) -> Result<(Booking, GuestList), EngineError> {
        observe("create_immediate", async {
            let agency_id = parse_id(&req.agency_id)?;
            let slot = parse_slot(&req.date, &req.time)?;
            let precise = parse_precise(req.precise_time.as_deref())?;
            let report = validation::validate(req.party_size, &req.rows, self.today());
            let roster = Self::roster_or_reject(report)?;
            self.engine
                .create_immediate(actor, agency_id, slot, req.party_size, precise, roster)
                .await
        })
        .await
    }

    pub async fn booking_status(&self, actor: &Actor, booking_id: &str) -> Result<BookingStatus, EngineError> {
        observe("booking_status", async {
            Ok::<_, EngineError>(self.owned_booking(actor, parse_id(booking_id)?).await?.status)
        })
        .await
    }

    pub async fn booking(&self, actor: &Actor, booking_id: &str) -> Result<BookingView, EngineError> {
        observe("booking", async { self.owned_booking(actor, parse_id(booking_id)?).await }).await
    }

    pub async fn bookings_for_agency(
        &self,
        actor: &Actor,
        agency_id: &str,
    ) -> Result<Vec<BookingView>, EngineError> {
        observe("bookings_for_agency", async {
            let agency_id = parse_id(agency_id)?;
            if !actor.may_act_for(agency_id) {
                return Err(EngineError::Forbidden("agencies list only their own bookings"));
            }
            self.engine.bookings_for_agency(agency_id).await
        })
        .await
    }

    // ── Guest lists ──────────────────────────────────────────

    /// Check rows against a party size without touching any state.
    pub fn validate_guest_rows(&self, party_size: u32, rows: &[GuestRow]) -> ValidationReport {
        validation::validate(party_size, rows, self.today())
    }

    /// Hand in a guest list. Whole-list problems reject the submission;
    /// row problems, and every spreadsheet import, go to a preview session.
    pub async fn submit_guest_list(
        &self,
        actor: &Actor,
        booking_id: &str,
        rows: &[GuestRow],
        source: GuestListSource,
    ) -> Result<SubmitOutcome, EngineError> {
        observe("submit_guest_list", async {
            let id = parse_id(booking_id)?;
            let view = self.owned_booking(actor, id).await?;
            if view.status != BookingStatus::Booked {
                return Err(EngineError::GuestListExists(id));
            }
            let report = validation::validate(view.booking.party_size, rows, self.today());
            self.settle(id, view.booking.agency_id, source, rows, report, actor)
                .await
        })
        .await
    }

    /// Route a report: reject, stage, or commit.
    async fn settle(
        &self,
        booking_id: Ulid,
        agency_id: Ulid,
        source: GuestListSource,
        rows: &[GuestRow],
        report: ValidationReport,
        actor: &Actor,
    ) -> Result<SubmitOutcome, EngineError> {
        if !report.general_errors.is_empty() {
            return Err(EngineError::GuestListRejected(report.general_errors));
        }
        if report.has_row_errors() || source == GuestListSource::ExcelImport {
            let corrigible = report.has_row_errors();
            let preview_id = self.previews.create(PreviewData {
                booking_id,
                agency_id,
                source,
                rows: report.rows.clone(),
                general_errors: Vec::new(),
                submitted: rows.to_vec(),
            })?;
            metrics::counter!(observability::PREVIEWS_CREATED_TOTAL).increment(1);
            info!(
                "guest list for {booking_id} staged as preview {preview_id} ({} row errors)",
                report.row_error_count()
            );
            return Ok(if corrigible {
                SubmitOutcome::Corrigible { preview_id, report }
            } else {
                SubmitOutcome::Staged { preview_id, report }
            });
        }
        let roster = Self::roster_or_reject(report)?;
        let list = self
            .engine
            .attach_guest_list(actor, booking_id, roster, source)
            .await?;
        Ok(SubmitOutcome::Committed(list))
    }

    /// Confirm a staged submission, optionally with corrected rows. The
    /// session is checked against the caller and the booking before
    /// anything is consumed. Without corrections the rows are re-checked as
    /// first submitted, importer errors included. Remaining row errors
    /// replace the session with a fresh one.
    pub async fn confirm_preview(
        &self,
        actor: &Actor,
        preview_id: &str,
        booking_id: &str,
        corrected: Option<&[GuestRow]>,
    ) -> Result<SubmitOutcome, EngineError> {
        observe("confirm_preview", async {
            let pid = parse_id(preview_id)?;
            let booking_id = parse_id(booking_id)?;
            let session = self.previews.get(pid).ok_or(EngineError::SessionNotFound(pid))?;
            if !actor.may_act_for(session.agency_id) {
                return Err(EngineError::Forbidden("preview session belongs to another agency"));
            }
            if session.booking_id != booking_id {
                return Err(EngineError::SessionMismatch(booking_id));
            }

            let rows: &[GuestRow] = corrected.unwrap_or(&session.submitted);
            let view = self.owned_booking(actor, booking_id).await?;
            let report = validation::validate(view.booking.party_size, rows, self.today());
            if !report.general_errors.is_empty() {
                return Err(EngineError::GuestListRejected(report.general_errors));
            }
            if report.has_row_errors() {
                self.previews.delete(pid);
                // Still corrigible: a new session carries the new rows.
                return self
                    .settle(booking_id, session.agency_id, session.source, rows, report, actor)
                    .await;
            }

            let roster = Self::roster_or_reject(report)?;
            let list = self
                .engine
                .attach_guest_list(actor, booking_id, roster, session.source)
                .await?;
            self.previews.delete(pid);
            Ok(SubmitOutcome::Committed(list))
        })
        .await
    }

    pub fn get_preview(&self, actor: &Actor, preview_id: &str) -> Result<PreviewData, EngineError> {
        let pid = parse_id(preview_id)?;
        let session = self.previews.get(pid).ok_or(EngineError::SessionNotFound(pid))?;
        if !actor.may_act_for(session.agency_id) {
            return Err(EngineError::Forbidden("preview session belongs to another agency"));
        }
        Ok(session)
    }

    pub fn delete_preview(&self, actor: &Actor, preview_id: &str) -> Result<bool, EngineError> {
        let pid = parse_id(preview_id)?;
        match self.previews.get(pid) {
            Some(session) if !actor.may_act_for(session.agency_id) => {
                Err(EngineError::Forbidden("preview session belongs to another agency"))
            }
            Some(_) => Ok(self.previews.delete(pid)),
            None => Ok(false),
        }
    }

    /// Whole-list edit. Every row must be valid.
    pub async fn replace_guests(
        &self,
        actor: &Actor,
        booking_id: &str,
        rows: &[GuestRow],
    ) -> Result<GuestList, EngineError> {
        observe("replace_guests", async {
            let id = parse_id(booking_id)?;
            let view = self.owned_booking(actor, id).await?;
            let report = validation::validate(view.booking.party_size, rows, self.today());
            let roster = Self::roster_or_reject(report)?;
            self.engine.replace_guests(actor, id, roster).await
        })
        .await
    }

    pub async fn revoke_guest_list(&self, actor: &Actor, booking_id: &str) -> Result<(), EngineError> {
        observe("revoke_guest_list", async {
            self.engine.revoke_guest_list(actor, parse_id(booking_id)?).await
        })
        .await
    }

    pub async fn guest_list(&self, actor: &Actor, booking_id: &str) -> Result<GuestList, EngineError> {
        observe("guest_list", async {
            let id = parse_id(booking_id)?;
            self.owned_booking(actor, id).await?;
            self.engine.guest_list(id).await
        })
        .await
    }

    // ── Guides ───────────────────────────────────────────────

    pub async fn register_guide(
        &self,
        actor: &Actor,
        agency_id: &str,
        req: &GuideRequest,
    ) -> Result<Guide, EngineError> {
        observe("register_guide", async {
            self.engine
                .register_guide(actor, parse_id(agency_id)?, &req.name, &req.last_name, req.badge.clone())
                .await
        })
        .await
    }

    pub async fn update_guide(
        &self,
        actor: &Actor,
        guide_id: &str,
        req: &GuideRequest,
    ) -> Result<Guide, EngineError> {
        observe("update_guide", async {
            self.engine
                .update_guide(actor, parse_id(guide_id)?, &req.name, &req.last_name, req.badge.clone())
                .await
        })
        .await
    }

    pub async fn remove_guide(&self, actor: &Actor, guide_id: &str) -> Result<(), EngineError> {
        observe("remove_guide", async {
            self.engine.remove_guide(actor, parse_id(guide_id)?).await
        })
        .await
    }

    pub fn guides_for_agency(&self, actor: &Actor, agency_id: &str) -> Result<Vec<Guide>, EngineError> {
        let agency_id = parse_id(agency_id)?;
        if !actor.may_act_for(agency_id) {
            return Err(EngineError::Forbidden("agencies list only their own guides"));
        }
        Ok(self.engine.guides_for_agency(agency_id))
    }

    pub async fn assign_guide(
        &self,
        actor: &Actor,
        booking_id: &str,
        guide_id: &str,
    ) -> Result<GuideAssignment, EngineError> {
        observe("assign_guide", async {
            self.engine
                .assign_guide(actor, parse_id(booking_id)?, parse_id(guide_id)?)
                .await
        })
        .await
    }

    pub async fn reassign_guide(
        &self,
        actor: &Actor,
        booking_id: &str,
        old_guide_id: &str,
        new_guide_id: &str,
    ) -> Result<GuideAssignment, EngineError> {
        observe("reassign_guide", async {
            self.engine
                .reassign_guide(
                    actor,
                    parse_id(booking_id)?,
                    parse_id(old_guide_id)?,
                    parse_id(new_guide_id)?,
                )
                .await
        })
        .await
    }

    pub async fn unassign_guide(&self, actor: &Actor, booking_id: &str, guide_id: &str) -> Result<(), EngineError> {
        observe("unassign_guide", async {
            self.engine
                .unassign_guide(actor, parse_id(booking_id)?, parse_id(guide_id)?)
                .await
        })
        .await
    }

    // ── Capacity administration ──────────────────────────────

    pub async fn set_day_category(
        &self,
        actor: &Actor,
        date: &str,
        category: &str,
        limit: Option<u32>,
    ) -> Result<u32, EngineError> {
        observe("set_day_category", async {
            let date = parse_iso_date(date)?;
            self.engine
                .set_day_category(actor, date, category.parse()?, limit)
                .await
        })
        .await
    }

    pub async fn set_slot_limit(
        &self,
        actor: &Actor,
        date: &str,
        time: &str,
        limit: Option<u32>,
    ) -> Result<(), EngineError> {
        observe("set_slot_limit", async {
            self.engine.set_slot_limit(actor, parse_slot(date, time)?, limit).await
        })
        .await
    }

    /// Bulk override; `slots` are `(date, time)` pairs.
    pub async fn set_slot_limits(
        &self,
        actor: &Actor,
        limit: Option<u32>,
        slots: &[(String, String)],
    ) -> Result<usize, EngineError> {
        observe("set_slot_limits", async {
            let keys = slots
                .iter()
                .map(|(d, t)| parse_slot(d, t))
                .collect::<Result<Vec<_>, _>>()?;
            self.engine.set_slot_limits(actor, limit, &keys).await
        })
        .await
    }

    // ── Read models ──────────────────────────────────────────

    pub async fn slot_view(&self, actor: &Actor, date: &str, time: &str) -> Result<SlotView, EngineError> {
        observe("slot_view", async {
            let view = self.engine.slot_view(parse_slot(date, time)?).await?;
            Ok::<_, EngineError>(Self::redact(actor, view))
        })
        .await
    }

    pub async fn day_view(&self, actor: &Actor, date: &str) -> Result<DayView, EngineError> {
        observe("day_view", async {
            let mut view = self.engine.day_view(parse_iso_date(date)?).await?;
            view.slots = view.slots.into_iter().map(|s| Self::redact(actor, s)).collect();
            Ok::<_, EngineError>(view)
        })
        .await
    }

    /// Admin week grid, Monday first.
    pub async fn week_view(&self, actor: &Actor, date: &str) -> Result<Vec<DayView>, EngineError> {
        observe("week_view", async {
            if !actor.is_admin() {
                return Err(EngineError::Forbidden("the week grid is admin-only"));
            }
            self.engine.week_view(parse_iso_date(date)?).await
        })
        .await
    }

    pub async fn day_roster(&self, actor: &Actor, date: &str) -> Result<Vec<RosterEntry>, EngineError> {
        observe("day_roster", async {
            if !actor.is_admin() {
                return Err(EngineError::Forbidden("the day roster is admin-only"));
            }
            self.engine.day_roster(parse_iso_date(date)?).await
        })
        .await
    }
}
