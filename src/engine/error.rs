use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::SlotKey;

/// Error classes callers route on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    NotFound,
    Conflict,
    /// Retryable: the operation did not take effect.
    Transient,
}

#[derive(Debug)]
pub enum EngineError {
    InvalidInput(String),
    BookingInPast(SlotKey),
    LimitRequired,
    GuestCountMismatch {
        guests: usize,
        party_size: u32,
    },
    /// Whole-submission checks failed; every message is listed.
    GuestListRejected(Vec<String>),
    Forbidden(&'static str),
    NotOwner(Ulid),
    BookingNotFound(Ulid),
    GuideNotFound(Ulid),
    GuestListNotFound(Ulid),
    AssignmentNotFound {
        booking_id: Ulid,
        guide_id: Ulid,
    },
    SessionNotFound(Ulid),
    CapacityExceeded {
        slot: SlotKey,
        available: u32,
    },
    GuestListExists(Ulid),
    GuestListRequired(Ulid),
    GuestListAttached(Ulid),
    GuideAlreadyAssigned {
        booking_id: Ulid,
        guide_id: Ulid,
    },
    GuideBusy(Ulid),
    TourStarted(NaiveDateTime),
    SessionMismatch(Ulid),
    LimitExceeded(&'static str),
    Timeout(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInput(_)
            | EngineError::BookingInPast(_)
            | EngineError::LimitRequired
            | EngineError::GuestCountMismatch { .. }
            | EngineError::GuestListRejected(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::Forbidden(_) | EngineError::NotOwner(_) => ErrorKind::Authorization,
            EngineError::BookingNotFound(_)
            | EngineError::GuideNotFound(_)
            | EngineError::GuestListNotFound(_)
            | EngineError::AssignmentNotFound { .. }
            | EngineError::SessionNotFound(_) => ErrorKind::NotFound,
            EngineError::CapacityExceeded { .. }
            | EngineError::GuestListExists(_)
            | EngineError::GuestListRequired(_)
            | EngineError::GuestListAttached(_)
            | EngineError::GuideAlreadyAssigned { .. }
            | EngineError::GuideBusy(_)
            | EngineError::TourStarted(_)
            | EngineError::SessionMismatch(_) => ErrorKind::Conflict,
            EngineError::Timeout(_) | EngineError::WalError(_) => ErrorKind::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::BookingInPast(slot) => write!(f, "cannot book in the past: {slot}"),
            EngineError::LimitRequired => write!(f, "limit is required for Limited category"),
            EngineError::GuestCountMismatch { guests, party_size } => write!(
                f,
                "guest count ({guests}) must match the booking party size ({party_size})"
            ),
            EngineError::GuestListRejected(errors) => {
                write!(f, "guest list rejected: {}", errors.join("; "))
            }
            EngineError::Forbidden(what) => write!(f, "forbidden: {what}"),
            EngineError::NotOwner(id) => {
                write!(f, "booking {id} belongs to another agency")
            }
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::GuideNotFound(id) => write!(f, "guide not found: {id}"),
            EngineError::GuestListNotFound(id) => {
                write!(f, "guest list not found for booking {id}")
            }
            EngineError::AssignmentNotFound { booking_id, guide_id } => {
                write!(f, "guide {guide_id} is not assigned to booking {booking_id}")
            }
            EngineError::SessionNotFound(id) => {
                write!(f, "preview session not found or expired: {id}")
            }
            EngineError::CapacityExceeded { available, .. } => {
                write!(f, "Not enough capacity. Available: {available}")
            }
            EngineError::GuestListExists(id) => {
                write!(f, "booking {id} already has a guest list")
            }
            EngineError::GuestListRequired(id) => {
                write!(f, "booking {id} has no guest list; guides need one")
            }
            EngineError::GuestListAttached(id) => write!(
                f,
                "booking {id} has a guest list; revoke it before changing the party size"
            ),
            EngineError::GuideAlreadyAssigned { booking_id, guide_id } => {
                write!(f, "guide {guide_id} is already assigned to booking {booking_id}")
            }
            EngineError::GuideBusy(id) => {
                write!(f, "guide {id} is assigned to an upcoming tour")
            }
            EngineError::TourStarted(at) => {
                write!(f, "tour started at {at}; guides and guests are frozen")
            }
            EngineError::SessionMismatch(id) => {
                write!(f, "preview session does not belong to booking {id}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Timeout(what) => write!(f, "timed out {what}; try again"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

