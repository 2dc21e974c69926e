use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Sum of party sizes booked in a slot, skipping `excluding` (the booking
/// being modified). Computed fresh on every call.
pub fn booked_count(day: Option<&DayState>, time: SlotTime, excluding: Option<Ulid>) -> u32 {
    day.and_then(|d| d.slot(time))
        .map(|slot| {
            slot.bookings
                .iter()
                .filter(|r| Some(r.booking.id) != excluding)
                .map(|r| r.booking.party_size)
                .sum()
        })
        .unwrap_or(0)
}

/// Seats left; an over-full slot (limit lowered after booking) has none.
pub fn available(limit: u32, booked: u32) -> u32 {
    limit.saturating_sub(booked)
}

impl Engine {
    pub async fn booked_count(
        &self,
        slot: SlotKey,
        excluding: Option<Ulid>,
    ) -> Result<u32, EngineError> {
        let day = self.read_day(slot.date).await?;
        Ok(booked_count(day.as_deref(), slot.time, excluding))
    }

    /// Bookings of a slot in creation order.
    pub async fn bookings_for_slot(&self, slot: SlotKey) -> Result<Vec<Booking>, EngineError> {
        let day = self.read_day(slot.date).await?;
        Ok(day
            .as_deref()
            .and_then(|d| d.slot(slot.time))
            .map(|s| s.bookings.iter().map(|r| r.booking.clone()).collect())
            .unwrap_or_default())
    }
}
