use crate::limits::DEFAULT_DAY_LIMIT;
use crate::model::*;

use super::{Engine, EngineError};

/// Effective capacity of one slot.
///
/// A closed day caps every slot at zero, overrides included. Otherwise an
/// explicit slot override wins, then the day limit. A day that was never
/// referenced (`None`) behaves as an open day at the default limit.
pub fn resolve_limit(day: Option<&DayState>, time: SlotTime) -> u32 {
    let Some(day) = day else {
        return DEFAULT_DAY_LIMIT;
    };
    if day.category == DayCategory::Closed {
        return 0;
    }
    day.slot(time)
        .and_then(|s| s.override_limit)
        .unwrap_or(day.limit)
}

/// Base limit stored for a day of the given category.
pub fn day_limit_for(category: DayCategory, limit: Option<u32>) -> Result<u32, EngineError> {
    match category {
        DayCategory::Closed => Ok(0),
        DayCategory::Limited => limit.ok_or(EngineError::LimitRequired),
        DayCategory::Open => Ok(limit.unwrap_or(DEFAULT_DAY_LIMIT)),
    }
}

impl Engine {
    /// Read-only; never creates the day or slot.
    pub async fn resolve_limit(&self, slot: SlotKey) -> Result<u32, EngineError> {
        let day = self.read_day(slot.date).await?;
        Ok(resolve_limit(day.as_deref(), slot.time))
    }
}
