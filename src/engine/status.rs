use ulid::Ulid;

use crate::limits::GUESTS_PER_GUIDE;
use crate::model::*;

use super::{Engine, EngineError};

/// Guides needed for a party: one per started block of 17 guests, at least one.
pub fn required_guides(party_size: u32) -> u32 {
    party_size.div_ceil(GUESTS_PER_GUIDE).max(1)
}

/// Status is a function of the booking's current rows; it is never stored.
pub fn derive_status(record: &BookingRecord) -> BookingStatus {
    if record.guest_list.is_none() {
        return BookingStatus::Booked;
    }
    if (record.guides.len() as u32) < required_guides(record.booking.party_size) {
        BookingStatus::Filled
    } else {
        BookingStatus::Assigned
    }
}

pub(super) fn booking_view(record: &BookingRecord) -> BookingView {
    BookingView {
        booking: record.booking.clone(),
        status: derive_status(record),
        guest_count: record.guest_list.as_ref().map_or(0, |l| l.guests.len()),
        guide_ids: record.guides.iter().map(|a| a.guide_id).collect(),
    }
}

impl Engine {
    pub async fn booking_status(&self, id: Ulid) -> Result<BookingStatus, EngineError> {
        Ok(self.booking(id).await?.status)
    }
}
