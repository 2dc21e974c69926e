use tracing::info;
use ulid::Ulid;

use crate::clock::now_ms;
use crate::limits::*;
use crate::model::*;

use super::{authorize, Engine, EngineError};

fn validate_guide_fields(name: &str, last_name: &str, badge: Option<&str>) -> Result<(), EngineError> {
    if name.trim().is_empty() || last_name.trim().is_empty() {
        return Err(EngineError::InvalidInput("guide name and last name are required".into()));
    }
    if name.len() > MAX_NAME_LEN || last_name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("guide name too long"));
    }
    if badge.is_some_and(|b| b.len() > MAX_BADGE_LEN) {
        return Err(EngineError::LimitExceeded("badge number too long"));
    }
    Ok(())
}

fn clean_badge(badge: Option<String>) -> Option<String> {
    badge
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
}

impl Engine {
    pub fn guide(&self, id: Ulid) -> Option<Guide> {
        self.guides.get(&id).map(|e| e.value().clone())
    }

    /// An agency's guides, sorted by last name then name.
    pub fn guides_for_agency(&self, agency_id: Ulid) -> Vec<Guide> {
        let mut guides: Vec<Guide> = self
            .guides
            .iter()
            .filter(|e| e.value().agency_id == agency_id)
            .map(|e| e.value().clone())
            .collect();
        guides.sort_by(|a, b| (&a.last_name, &a.name).cmp(&(&b.last_name, &b.name)));
        guides
    }

    pub async fn register_guide(
        &self,
        actor: &Actor,
        agency_id: Ulid,
        name: &str,
        last_name: &str,
        badge: Option<String>,
    ) -> Result<Guide, EngineError> {
        if !actor.may_act_for(agency_id) {
            return Err(EngineError::Forbidden("agencies register only their own guides"));
        }
        let badge = clean_badge(badge);
        validate_guide_fields(name, last_name, badge.as_deref())?;

        let _gate = self.enter().await?;
        let _registry = self.registry.lock().await;
        let guide = Guide {
            id: Ulid::new(),
            agency_id,
            name: name.trim().to_string(),
            last_name: last_name.trim().to_string(),
            badge,
        };
        self.persist_registry(Event::GuideRegistered {
            guide: guide.clone(),
        })
        .await?;
        info!("guide {} registered for {agency_id}", guide.id);
        Ok(guide)
    }

    pub async fn update_guide(
        &self,
        actor: &Actor,
        id: Ulid,
        name: &str,
        last_name: &str,
        badge: Option<String>,
    ) -> Result<Guide, EngineError> {
        let badge = clean_badge(badge);
        validate_guide_fields(name, last_name, badge.as_deref())?;

        let _gate = self.enter().await?;
        let _registry = self.registry.lock().await;
        let current = self.guide(id).ok_or(EngineError::GuideNotFound(id))?;
        if !actor.may_act_for(current.agency_id) {
            return Err(EngineError::Forbidden("guide belongs to another agency"));
        }
        let guide = Guide {
            name: name.trim().to_string(),
            last_name: last_name.trim().to_string(),
            badge,
            ..current
        };
        self.persist_registry(Event::GuideUpdated {
            guide: guide.clone(),
        })
        .await?;
        Ok(guide)
    }

    /// Refused while the guide is assigned to a tour that has not started.
    /// Every day from today on stays locked until the removal is durable, so
    /// no assignment can slip in between the check and the commit.
    pub async fn remove_guide(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.enter().await?;
        let _registry = self.registry.lock().await;
        let guide = self.guide(id).ok_or(EngineError::GuideNotFound(id))?;
        if !actor.may_act_for(guide.agency_id) {
            return Err(EngineError::Forbidden("guide belongs to another agency"));
        }

        let now = self.clock.now();
        let mut dates: Vec<_> = self
            .days
            .iter()
            .map(|e| *e.key())
            .filter(|d| *d >= now.date())
            .collect();
        dates.sort();
        let mut guards = Vec::with_capacity(dates.len());
        for date in dates {
            guards.push(self.lock_day(date).await?);
        }
        let busy = guards.iter().any(|day| {
            day.bookings().any(|r| {
                r.booking.tour_start() > now && r.guides.iter().any(|a| a.guide_id == id)
            })
        });
        if busy {
            return Err(EngineError::GuideBusy(id));
        }

        self.persist_registry(Event::GuideRemoved { id }).await?;
        info!("guide {id} removed");
        Ok(())
    }

    /// Checks shared by assign and reassign for the incoming guide.
    fn check_incoming_guide(&self, record: &BookingRecord, guide_id: Ulid) -> Result<(), EngineError> {
        let booking_id = record.booking.id;
        let guide = self.guide(guide_id).ok_or(EngineError::GuideNotFound(guide_id))?;
        if guide.agency_id != record.booking.agency_id {
            return Err(EngineError::Forbidden("guide belongs to another agency"));
        }
        if record.guides.iter().any(|a| a.guide_id == guide_id) {
            return Err(EngineError::GuideAlreadyAssigned { booking_id, guide_id });
        }
        Ok(())
    }

    /// The clock is read here, under the day lock, right before commit.
    fn check_tour_not_started(&self, record: &BookingRecord) -> Result<(), EngineError> {
        let starts = record.booking.tour_start();
        if starts <= self.clock.now() {
            return Err(EngineError::TourStarted(starts));
        }
        Ok(())
    }

    pub async fn assign_guide(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        guide_id: Ulid,
    ) -> Result<GuideAssignment, EngineError> {
        let (slot, mut day) = self.resolve_booking_write(booking_id).await?;
        let record = day
            .booking(&slot, booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        authorize(actor, &record.booking)?;
        if record.guest_list.is_none() {
            return Err(EngineError::GuestListRequired(booking_id));
        }
        self.check_incoming_guide(record, guide_id)?;
        self.check_tour_not_started(record)?;

        let assignment = GuideAssignment {
            id: Ulid::new(),
            booking_id,
            guide_id,
            created_at: now_ms(),
        };
        self.persist_and_apply(
            &mut day,
            vec![Event::GuideAssigned {
                slot,
                assignment: assignment.clone(),
            }],
        )
        .await?;
        info!("guide {guide_id} assigned to {booking_id}");
        Ok(assignment)
    }

    pub async fn reassign_guide(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        old_guide_id: Ulid,
        new_guide_id: Ulid,
    ) -> Result<GuideAssignment, EngineError> {
        if old_guide_id == new_guide_id {
            return Err(EngineError::InvalidInput("new guide is the same as the old one".into()));
        }
        let (slot, mut day) = self.resolve_booking_write(booking_id).await?;
        let record = day
            .booking(&slot, booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        authorize(actor, &record.booking)?;
        let current = record
            .guides
            .iter()
            .find(|a| a.guide_id == old_guide_id)
            .cloned()
            .ok_or(EngineError::AssignmentNotFound {
                booking_id,
                guide_id: old_guide_id,
            })?;
        self.check_incoming_guide(record, new_guide_id)?;
        self.check_tour_not_started(record)?;

        self.persist_and_apply(
            &mut day,
            vec![Event::GuideReassigned {
                slot,
                booking_id,
                assignment_id: current.id,
                guide_id: new_guide_id,
            }],
        )
        .await?;
        info!("booking {booking_id}: guide {old_guide_id} replaced by {new_guide_id}");
        Ok(GuideAssignment {
            guide_id: new_guide_id,
            ..current
        })
    }

    pub async fn unassign_guide(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        guide_id: Ulid,
    ) -> Result<(), EngineError> {
        let (slot, mut day) = self.resolve_booking_write(booking_id).await?;
        let record = day
            .booking(&slot, booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        authorize(actor, &record.booking)?;
        let assignment_id = record
            .guides
            .iter()
            .find(|a| a.guide_id == guide_id)
            .map(|a| a.id)
            .ok_or(EngineError::AssignmentNotFound { booking_id, guide_id })?;
        self.check_tour_not_started(record)?;

        self.persist_and_apply(
            &mut day,
            vec![Event::GuideUnassigned {
                slot,
                booking_id,
                assignment_id,
            }],
        )
        .await?;
        info!("guide {guide_id} unassigned from {booking_id}");
        Ok(())
    }
}
