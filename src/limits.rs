//! Venue constants and input bounds.

/// Capacity of a day (and of every slot in it) until an admin says otherwise.
pub const DEFAULT_DAY_LIMIT: u32 = 51;

/// One guide covers up to this many guests.
pub const GUESTS_PER_GUIDE: u32 = 17;

/// Youngest guest admitted on a tour.
pub const MIN_GUEST_AGE: u32 = 12;

/// Age from which a guest counts as an adult.
pub const ADULT_AGE: u32 = 18;

/// Earliest year accepted in a date of birth.
pub const MIN_BIRTH_YEAR: i32 = 1900;

/// First bookable slot of a day, in minutes after midnight (09:00).
pub const FIRST_SLOT_MINUTE: u16 = 9 * 60;

/// Last bookable slot of a day, in minutes after midnight (19:30).
pub const LAST_SLOT_MINUTE: u16 = 19 * 60 + 30;

/// Slot granularity in minutes.
pub const SLOT_STEP_MINUTES: u16 = 30;

/// Default lifetime of a preview session.
pub const PREVIEW_TTL_MS: i64 = 30 * 60 * 1000;

/// Default bound on lock acquisition plus WAL commit for one operation.
pub const DEFAULT_OP_TIMEOUT_MS: u64 = 5_000;

pub const MAX_PARTY_SIZE: u32 = 1_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_BADGE_LEN: usize = 64;
pub const MAX_BULK_SLOTS: usize = 1_000;
pub const MAX_PREVIEW_SESSIONS: usize = 10_000;
