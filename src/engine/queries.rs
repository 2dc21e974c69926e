use chrono::{Datelike, Duration, NaiveDate};
use ulid::Ulid;

use crate::limits::DEFAULT_DAY_LIMIT;
use crate::model::*;

use super::capacity::resolve_limit;
use super::ledger::{available, booked_count};
use super::status::booking_view;
use super::{Engine, EngineError};

fn slot_view(day: Option<&DayState>, slot: SlotKey) -> SlotView {
    let limit = resolve_limit(day, slot.time);
    let booked = booked_count(day, slot.time, None);
    let state = day.and_then(|d| d.slot(slot.time));
    SlotView {
        slot,
        limit,
        limited: state.is_some_and(|s| s.is_limited()),
        booked,
        remaining: available(limit, booked),
        bookings: state
            .map(|s| s.bookings.iter().map(booking_view).collect())
            .unwrap_or_default(),
    }
}

fn day_view(day: Option<&DayState>, date: NaiveDate) -> DayView {
    DayView {
        date,
        category: day.map_or(DayCategory::Open, |d| d.category),
        limit: day.map_or(DEFAULT_DAY_LIMIT, |d| d.limit),
        slots: SlotTime::all()
            .map(|time| slot_view(day, SlotKey::new(date, time)))
            .collect(),
    }
}

/// Monday of the ISO week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

impl Engine {
    pub async fn slot_view(&self, slot: SlotKey) -> Result<SlotView, EngineError> {
        let day = self.read_day(slot.date).await?;
        Ok(slot_view(day.as_deref(), slot))
    }

    /// Every slot of a day, earliest first.
    pub async fn day_view(&self, date: NaiveDate) -> Result<DayView, EngineError> {
        let day = self.read_day(date).await?;
        Ok(day_view(day.as_deref(), date))
    }

    /// Seven day views starting on the Monday of `date`'s week.
    pub async fn week_view(&self, date: NaiveDate) -> Result<Vec<DayView>, EngineError> {
        let monday = week_start(date);
        let views = futures::future::join_all(
            (0..7).map(|offset| self.day_view(monday + Duration::days(offset))),
        )
        .await;
        views.into_iter().collect()
    }

    pub async fn booking(&self, id: Ulid) -> Result<BookingView, EngineError> {
        let slot = self
            .booking_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::BookingNotFound(id))?;
        let day = self.read_day(slot.date).await?;
        day.as_deref()
            .and_then(|d| d.booking(&slot, id))
            .map(booking_view)
            .ok_or(EngineError::BookingNotFound(id))
    }

    /// One agency's bookings ordered by slot, then creation.
    pub async fn bookings_for_agency(&self, agency_id: Ulid) -> Result<Vec<BookingView>, EngineError> {
        let mut dates: Vec<NaiveDate> = self.days.iter().map(|e| *e.key()).collect();
        dates.sort();
        let mut out = Vec::new();
        for date in dates {
            if let Some(day) = self.read_day(date).await? {
                out.extend(
                    day.bookings()
                        .filter(|r| r.booking.agency_id == agency_id)
                        .map(booking_view),
                );
            }
        }
        Ok(out)
    }

    /// Guided bookings of a day by precise time, with guide details. Input
    /// for the security roster report.
    pub async fn day_roster(&self, date: NaiveDate) -> Result<Vec<RosterEntry>, EngineError> {
        let Some(day) = self.read_day(date).await? else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<RosterEntry> = day
            .bookings()
            .filter(|r| !r.guides.is_empty())
            .map(|r| RosterEntry {
                booking_id: r.booking.id,
                agency_id: r.booking.agency_id,
                precise_time: r.booking.precise_time,
                party_size: r.booking.party_size,
                guides: r.guides.iter().filter_map(|a| self.guide(a.guide_id)).collect(),
            })
            .collect();
        entries.sort_by_key(|e| e.precise_time);
        Ok(entries)
    }
}
