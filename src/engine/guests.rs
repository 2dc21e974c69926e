use tracing::info;
use ulid::Ulid;

use crate::clock::now_ms;
use crate::model::*;
use crate::notify::Notification;
use crate::validation::ValidatedRoster;

use super::{authorize, require_admin, Engine, EngineError};

fn check_count(roster: &ValidatedRoster, party_size: u32) -> Result<(), EngineError> {
    if roster.len() != party_size as usize {
        return Err(EngineError::GuestCountMismatch {
            guests: roster.len(),
            party_size,
        });
    }
    Ok(())
}

impl Engine {
    /// Attach the one guest list a booking may have. The roster size is
    /// re-checked against the party size as it is now.
    pub async fn attach_guest_list(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        roster: ValidatedRoster,
        source: GuestListSource,
    ) -> Result<GuestList, EngineError> {
        let (slot, mut day) = self.resolve_booking_write(booking_id).await?;
        let record = day
            .booking(&slot, booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        authorize(actor, &record.booking)?;
        if record.guest_list.is_some() {
            return Err(EngineError::GuestListExists(booking_id));
        }
        check_count(&roster, record.booking.party_size)?;

        let now = now_ms();
        let list = GuestList {
            id: Ulid::new(),
            booking_id,
            source,
            guests: roster.into_guests(),
            created_at: now,
            updated_at: now,
        };
        self.persist_and_apply(
            &mut day,
            vec![Event::GuestListAttached {
                slot,
                list: list.clone(),
            }],
        )
        .await?;
        info!("guest list attached to {booking_id} ({} guests)", list.guests.len());
        Ok(list)
    }

    /// Replace every guest row. Frozen once the tour has started.
    pub async fn replace_guests(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        roster: ValidatedRoster,
    ) -> Result<GuestList, EngineError> {
        let (slot, mut day) = self.resolve_booking_write(booking_id).await?;
        let record = day
            .booking(&slot, booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        authorize(actor, &record.booking)?;
        if record.guest_list.is_none() {
            return Err(EngineError::GuestListNotFound(booking_id));
        }
        check_count(&roster, record.booking.party_size)?;
        let starts = record.booking.tour_start();
        if starts <= self.clock.now() {
            return Err(EngineError::TourStarted(starts));
        }

        self.persist_and_apply(
            &mut day,
            vec![Event::GuestsReplaced {
                booking_id,
                slot,
                guests: roster.into_guests(),
                at: now_ms(),
            }],
        )
        .await?;
        info!("guest list of {booking_id} replaced");
        day.booking(&slot, booking_id)
            .and_then(|r| r.guest_list.clone())
            .ok_or(EngineError::GuestListNotFound(booking_id))
    }

    /// Admin removal of a guest list. Guide assignments go with it and the
    /// booking is back to `booked`.
    pub async fn revoke_guest_list(&self, actor: &Actor, booking_id: Ulid) -> Result<(), EngineError> {
        require_admin(actor, "revoking guest lists is admin-only")?;
        let (slot, mut day) = self.resolve_booking_write(booking_id).await?;
        let record = day
            .booking(&slot, booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        if record.guest_list.is_none() {
            return Err(EngineError::GuestListNotFound(booking_id));
        }
        let agency_id = record.booking.agency_id;

        self.persist_and_apply(&mut day, vec![Event::GuestListRevoked { booking_id, slot }])
            .await?;
        drop(day);

        self.notify.send(Notification::GuestListRevoked {
            agency_id,
            booking_id,
            date: slot.date,
            time: slot.time,
        });
        info!("guest list of {booking_id} revoked");
        Ok(())
    }

    pub async fn guest_list(&self, booking_id: Ulid) -> Result<GuestList, EngineError> {
        let slot = self
            .booking_index
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let day = self.read_day(slot.date).await?;
        let record = day
            .as_deref()
            .and_then(|d| d.booking(&slot, booking_id))
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        record
            .guest_list
            .clone()
            .ok_or(EngineError::GuestListNotFound(booking_id))
    }
}
