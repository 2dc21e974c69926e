use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::*;

/// Unix milliseconds, used for audit timestamps and session expiry.
pub type Ms = i64;

/// Start of a half-hour slot, stored as minutes after midnight.
///
/// Only the venue's bookable grid (09:00 through 19:30) can be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotTime(u16);

impl SlotTime {
    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        let m = hour * 60 + minute;
        if !(FIRST_SLOT_MINUTE..=LAST_SLOT_MINUTE).contains(&m) || m % SLOT_STEP_MINUTES != 0 {
            return None;
        }
        Some(Self(m))
    }

    /// Every slot of a day, earliest first.
    pub fn all() -> impl Iterator<Item = SlotTime> {
        (FIRST_SLOT_MINUTE..=LAST_SLOT_MINUTE)
            .step_by(SLOT_STEP_MINUTES as usize)
            .map(SlotTime)
    }

    pub fn hour(&self) -> u16 {
        self.0 / 60
    }

    pub fn minute(&self) -> u16 {
        self.0 % 60
    }

    pub fn to_naive_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(u32::from(self.hour()), u32::from(self.minute()), 0)
            .unwrap_or_default()
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for SlotTime {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = parse_hhmm(s)?;
        SlotTime::from_hm(t.hour() as u16, t.minute() as u16).ok_or_else(|| {
            EngineError::InvalidInput(format!(
                "slot time '{s}' must be a half-hour between 09:00 and 19:30"
            ))
        })
    }
}

/// Parse a 24-hour "HH:MM" string (a trailing ":SS" is tolerated).
pub fn parse_hhmm(s: &str) -> Result<NaiveTime, EngineError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map(|t| t.with_second(0).unwrap_or(t))
        .map_err(|_| EngineError::InvalidInput(format!("time '{s}' is not HH:MM")))
}

/// Parse an ISO calendar date.
pub fn parse_iso_date(s: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::InvalidInput(format!("date '{s}' is not YYYY-MM-DD")))
}

/// A slot is unique per (date, time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub time: SlotTime,
}

impl SlotKey {
    pub fn new(date: NaiveDate, time: SlotTime) -> Self {
        Self { date, time }
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.time.to_naive_time())
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.date, self.time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DayCategory {
    Open,
    Closed,
    /// Reduced capacity; the limit must be given explicitly.
    Limited,
}

impl fmt::Display for DayCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DayCategory::Open => "Open",
            DayCategory::Closed => "Closed",
            DayCategory::Limited => "Limited",
        })
    }
}

impl FromStr for DayCategory {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(DayCategory::Open),
            "closed" => Ok(DayCategory::Closed),
            "limited" => Ok(DayCategory::Limited),
            _ => Err(EngineError::InvalidInput(format!("unknown day category '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Agency,
}

/// Caller identity as supplied by the identity provider. Trusted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn admin(id: Ulid) -> Self {
        Self { id, role: Role::Admin }
    }

    pub fn agency(id: Ulid) -> Self {
        Self { id, role: Role::Agency }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins act for everyone; an agency only for itself.
    pub fn may_act_for(&self, agency_id: Ulid) -> bool {
        self.is_admin() || self.id == agency_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingKind {
    Regular,
    Joint,
    /// Booking created together with its guest list by an admin.
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub agency_id: Ulid,
    pub slot: SlotKey,
    pub party_size: u32,
    /// Display start time; independent of the slot grid.
    pub precise_time: NaiveTime,
    pub kind: BookingKind,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn tour_start(&self) -> NaiveDateTime {
        self.slot.date.and_time(self.precise_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestListSource {
    Manual,
    ExcelImport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub id: Ulid,
    pub name: String,
    pub date_of_birth: NaiveDate,
    pub age: u32,
    pub city: String,
    /// Normalized `8XXXXXXXXXX`.
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestList {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub source: GuestListSource,
    pub guests: Vec<Guest>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guide {
    pub id: Ulid,
    pub agency_id: Ulid,
    pub name: String,
    pub last_name: String,
    pub badge: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuideAssignment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub guide_id: Ulid,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    /// No guest list yet.
    Booked,
    /// Guest list present, not enough guides.
    Filled,
    /// Guest list present and fully guided.
    Assigned,
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BookingStatus::Booked => "booked",
            BookingStatus::Filled => "filled",
            BookingStatus::Assigned => "assigned",
        })
    }
}

// ── In-memory state ──────────────────────────────────────────────

/// A booking together with the rows that hang off it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRecord {
    pub booking: Booking,
    pub guest_list: Option<GuestList>,
    pub guides: Vec<GuideAssignment>,
}

impl BookingRecord {
    pub fn new(booking: Booking) -> Self {
        Self {
            booking,
            guest_list: None,
            guides: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotState {
    /// Explicit admin override. `None` inherits the day limit.
    pub override_limit: Option<u32>,
    /// Bookings in creation order.
    pub bookings: Vec<BookingRecord>,
}

impl SlotState {
    pub fn is_limited(&self) -> bool {
        self.override_limit.is_some()
    }

    pub fn booking(&self, id: Ulid) -> Option<&BookingRecord> {
        self.bookings.iter().find(|r| r.booking.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut BookingRecord> {
        self.bookings.iter_mut().find(|r| r.booking.id == id)
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<BookingRecord> {
        let pos = self.bookings.iter().position(|r| r.booking.id == id)?;
        Some(self.bookings.remove(pos))
    }
}

/// Everything stored for one calendar date. One lock guards all of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayState {
    pub date: NaiveDate,
    pub category: DayCategory,
    pub limit: u32,
    pub slots: BTreeMap<SlotTime, SlotState>,
}

impl DayState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            category: DayCategory::Open,
            limit: DEFAULT_DAY_LIMIT,
            slots: BTreeMap::new(),
        }
    }

    pub fn slot(&self, time: SlotTime) -> Option<&SlotState> {
        self.slots.get(&time)
    }

    /// Slot rows are created on first write.
    pub fn slot_mut(&mut self, time: SlotTime) -> &mut SlotState {
        self.slots.entry(time).or_default()
    }

    pub fn booking(&self, key: &SlotKey, id: Ulid) -> Option<&BookingRecord> {
        self.slots.get(&key.time).and_then(|s| s.booking(id))
    }

    pub fn booking_mut(&mut self, key: &SlotKey, id: Ulid) -> Option<&mut BookingRecord> {
        self.slots.get_mut(&key.time).and_then(|s| s.booking_mut(id))
    }

    pub fn bookings(&self) -> impl Iterator<Item = &BookingRecord> {
        self.slots.values().flat_map(|s| s.bookings.iter())
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DayCategorized {
        date: NaiveDate,
        category: DayCategory,
        limit: u32,
    },
    SlotLimitSet {
        slot: SlotKey,
        limit: Option<u32>,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingModified {
        id: Ulid,
        slot: SlotKey,
        party_size: u32,
        precise_time: NaiveTime,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        slot: SlotKey,
    },
    GuestListAttached {
        slot: SlotKey,
        list: GuestList,
    },
    GuestsReplaced {
        booking_id: Ulid,
        slot: SlotKey,
        guests: Vec<Guest>,
        at: Ms,
    },
    GuestListRevoked {
        booking_id: Ulid,
        slot: SlotKey,
    },
    GuideAssigned {
        slot: SlotKey,
        assignment: GuideAssignment,
    },
    GuideReassigned {
        slot: SlotKey,
        booking_id: Ulid,
        assignment_id: Ulid,
        guide_id: Ulid,
    },
    GuideUnassigned {
        slot: SlotKey,
        booking_id: Ulid,
        assignment_id: Ulid,
    },
    GuideRegistered {
        guide: Guide,
    },
    GuideUpdated {
        guide: Guide,
    },
    GuideRemoved {
        id: Ulid,
    },
}

impl Event {
    /// The day whose state this event changes, if any.
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            Event::DayCategorized { date, .. } => Some(*date),
            Event::SlotLimitSet { slot, .. }
            | Event::BookingModified { slot, .. }
            | Event::BookingCancelled { slot, .. }
            | Event::GuestListAttached { slot, .. }
            | Event::GuestsReplaced { slot, .. }
            | Event::GuestListRevoked { slot, .. }
            | Event::GuideAssigned { slot, .. }
            | Event::GuideReassigned { slot, .. }
            | Event::GuideUnassigned { slot, .. } => Some(slot.date),
            Event::BookingCreated { booking } => Some(booking.slot.date),
            Event::GuideRegistered { .. } | Event::GuideUpdated { .. } | Event::GuideRemoved { .. } => {
                None
            }
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub booking: Booking,
    pub status: BookingStatus,
    pub guest_count: usize,
    pub guide_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotView {
    pub slot: SlotKey,
    pub limit: u32,
    pub limited: bool,
    pub booked: u32,
    pub remaining: u32,
    pub bookings: Vec<BookingView>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayView {
    pub date: NaiveDate,
    pub category: DayCategory,
    pub limit: u32,
    pub slots: Vec<SlotView>,
}

/// One line of the end-of-day security roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub booking_id: Ulid,
    pub agency_id: Ulid,
    pub precise_time: NaiveTime,
    pub party_size: u32,
    pub guides: Vec<Guide>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn slot_time_grid() {
        let all: Vec<_> = SlotTime::all().collect();
        assert_eq!(all.len(), 22);
        assert_eq!(all[0].to_string(), "09:00");
        assert_eq!(all[21].to_string(), "19:30");
        assert!(all.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn slot_time_parse_rejects_off_grid() {
        assert_eq!("10:30".parse::<SlotTime>().unwrap(), SlotTime::from_hm(10, 30).unwrap());
        assert_eq!("10:30:00".parse::<SlotTime>().unwrap().to_string(), "10:30");
        assert!("10:15".parse::<SlotTime>().is_err());
        assert!("08:30".parse::<SlotTime>().is_err());
        assert!("20:00".parse::<SlotTime>().is_err());
        assert!("noon".parse::<SlotTime>().is_err());
    }

    #[test]
    fn day_category_parse_is_case_insensitive() {
        assert_eq!("closed".parse::<DayCategory>().unwrap(), DayCategory::Closed);
        assert_eq!("Limited".parse::<DayCategory>().unwrap(), DayCategory::Limited);
        assert!("half-open".parse::<DayCategory>().is_err());
    }

    #[test]
    fn actor_scope() {
        let agency = Ulid::new();
        assert!(Actor::agency(agency).may_act_for(agency));
        assert!(!Actor::agency(Ulid::new()).may_act_for(agency));
        assert!(Actor::admin(Ulid::new()).may_act_for(agency));
    }

    #[test]
    fn tour_start_uses_precise_time() {
        let slot = SlotKey::new(date(2025, 6, 1), SlotTime::from_hm(10, 0).unwrap());
        let booking = Booking {
            id: Ulid::new(),
            agency_id: Ulid::new(),
            slot,
            party_size: 5,
            precise_time: NaiveTime::from_hms_opt(10, 10, 0).unwrap(),
            kind: BookingKind::Regular,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(booking.tour_start(), date(2025, 6, 1).and_hms_opt(10, 10, 0).unwrap());
        assert_eq!(slot.starts_at(), date(2025, 6, 1).and_hms_opt(10, 0, 0).unwrap());
        assert_eq!(slot.to_string(), "2025-06-01|10:00");
    }

    #[test]
    fn day_state_lazy_slots_and_removal() {
        let mut day = DayState::new(date(2025, 6, 1));
        assert_eq!(day.limit, DEFAULT_DAY_LIMIT);
        let time = SlotTime::from_hm(11, 0).unwrap();
        assert!(day.slot(time).is_none());

        let key = SlotKey::new(day.date, time);
        let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        for &id in &ids {
            day.slot_mut(time).bookings.push(BookingRecord::new(Booking {
                id,
                agency_id: Ulid::new(),
                slot: key,
                party_size: 1,
                precise_time: time.to_naive_time(),
                kind: BookingKind::Regular,
                created_at: 0,
                updated_at: 0,
            }));
        }
        assert!(day.booking(&key, ids[1]).is_some());
        let removed = day.slot_mut(time).remove_booking(ids[1]).unwrap();
        assert_eq!(removed.booking.id, ids[1]);
        let left: Vec<Ulid> = day.bookings().map(|r| r.booking.id).collect();
        assert_eq!(left, vec![ids[0], ids[2]]);
        assert!(day.slot_mut(time).remove_booking(ids[1]).is_none());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::DayCategorized {
            date: date(2025, 6, 1),
            category: DayCategory::Limited,
            limit: 20,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
        assert_eq!(decoded.date(), Some(date(2025, 6, 1)));
    }
}
