use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use tracing::{debug, info};
use ulid::Ulid;

use crate::clock::now_ms;
use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;
use crate::validation::ValidatedRoster;

use super::capacity::{day_limit_for, resolve_limit};
use super::ledger::{available, booked_count};
use super::{authorize, require_admin, Engine, EngineError};

fn validate_party_size(party_size: u32) -> Result<(), EngineError> {
    if party_size == 0 {
        return Err(EngineError::InvalidInput("party size must be at least 1".into()));
    }
    if party_size > MAX_PARTY_SIZE {
        return Err(EngineError::LimitExceeded("party size too large"));
    }
    Ok(())
}

/// Admit `party_size` more guests into `slot`, not counting `excluding`.
fn check_capacity(
    day: &DayState,
    slot: SlotKey,
    party_size: u32,
    excluding: Option<Ulid>,
) -> Result<(), EngineError> {
    let limit = resolve_limit(Some(day), slot.time);
    let booked = booked_count(Some(day), slot.time, excluding);
    let available = available(limit, booked);
    if party_size > available {
        debug!("{slot}: rejected {party_size}, limit {limit}, booked {booked}");
        return Err(EngineError::CapacityExceeded { slot, available });
    }
    Ok(())
}

impl Engine {
    /// A slot is bookable only while its start lies strictly in the future.
    fn check_not_past(&self, slot: SlotKey) -> Result<(), EngineError> {
        if slot.starts_at() <= self.clock.now() {
            return Err(EngineError::BookingInPast(slot));
        }
        Ok(())
    }

    /// Reserve seats in a slot. Limit resolution, the booked sum, the
    /// comparison and the insert all happen under the day's write lock.
    pub async fn create_booking(
        &self,
        actor: &Actor,
        agency_id: Ulid,
        slot: SlotKey,
        party_size: u32,
        precise_time: Option<NaiveTime>,
        kind: BookingKind,
    ) -> Result<Booking, EngineError> {
        if kind == BookingKind::Immediate {
            return Err(EngineError::Forbidden(
                "immediate bookings are created together with their guest list",
            ));
        }
        if !actor.may_act_for(agency_id) {
            return Err(EngineError::Forbidden("agencies book only for themselves"));
        }
        validate_party_size(party_size)?;

        let mut day = self.write_day(slot.date).await?;
        self.check_not_past(slot)?;
        check_capacity(&day, slot, party_size, None)?;

        let now = now_ms();
        let booking = Booking {
            id: Ulid::new(),
            agency_id,
            slot,
            party_size,
            precise_time: precise_time.unwrap_or_else(|| slot.time.to_naive_time()),
            kind,
            created_at: now,
            updated_at: now,
        };
        self.persist_and_apply(
            &mut day,
            vec![Event::BookingCreated {
                booking: booking.clone(),
            }],
        )
        .await?;
        info!("booking {} created: {slot} x{party_size} for {agency_id}", booking.id);
        Ok(booking)
    }

    /// Admin booking created together with its validated guest list.
    pub async fn create_immediate(
        &self,
        actor: &Actor,
        agency_id: Ulid,
        slot: SlotKey,
        party_size: u32,
        precise_time: Option<NaiveTime>,
        roster: ValidatedRoster,
    ) -> Result<(Booking, GuestList), EngineError> {
        require_admin(actor, "immediate bookings are admin-only")?;
        validate_party_size(party_size)?;
        if roster.len() != party_size as usize {
            return Err(EngineError::GuestCountMismatch {
                guests: roster.len(),
                party_size,
            });
        }

        let mut day = self.write_day(slot.date).await?;
        self.check_not_past(slot)?;
        check_capacity(&day, slot, party_size, None)?;

        let now = now_ms();
        let booking = Booking {
            id: Ulid::new(),
            agency_id,
            slot,
            party_size,
            precise_time: precise_time.unwrap_or_else(|| slot.time.to_naive_time()),
            kind: BookingKind::Immediate,
            created_at: now,
            updated_at: now,
        };
        let list = GuestList {
            id: Ulid::new(),
            booking_id: booking.id,
            source: GuestListSource::Manual,
            guests: roster.into_guests(),
            created_at: now,
            updated_at: now,
        };
        self.persist_and_apply(
            &mut day,
            vec![
                Event::BookingCreated {
                    booking: booking.clone(),
                },
                Event::GuestListAttached {
                    slot,
                    list: list.clone(),
                },
            ],
        )
        .await?;
        info!("immediate booking {} created: {slot} x{party_size}", booking.id);
        Ok((booking, list))
    }

    /// Change party size and/or precise time. Capacity is re-checked with
    /// the booking's own seats left out of the sum.
    pub async fn modify_booking(
        &self,
        actor: &Actor,
        id: Ulid,
        party_size: u32,
        precise_time: Option<NaiveTime>,
    ) -> Result<Booking, EngineError> {
        validate_party_size(party_size)?;
        let (slot, mut day) = self.resolve_booking_write(id).await?;
        let record = day.booking(&slot, id).ok_or(EngineError::BookingNotFound(id))?;
        authorize(actor, &record.booking)?;
        let old = record.booking.clone();
        if party_size != old.party_size && record.guest_list.is_some() {
            return Err(EngineError::GuestListAttached(id));
        }
        self.check_not_past(slot)?;
        check_capacity(&day, slot, party_size, Some(id))?;

        let precise_time = precise_time.unwrap_or(old.precise_time);
        self.persist_and_apply(
            &mut day,
            vec![Event::BookingModified {
                id,
                slot,
                party_size,
                precise_time,
                at: now_ms(),
            }],
        )
        .await?;
        let updated = day
            .booking(&slot, id)
            .map(|r| r.booking.clone())
            .ok_or(EngineError::BookingNotFound(id))?;
        drop(day);

        self.notify.send(Notification::BookingModified {
            agency_id: old.agency_id,
            booking_id: id,
            date: slot.date,
            time: slot.time,
            old_party_size: old.party_size,
            new_party_size: party_size,
            old_precise_time: old.precise_time,
            new_precise_time: precise_time,
        });
        info!("booking {id} modified: x{} -> x{party_size}", old.party_size);
        Ok(updated)
    }

    /// Hard delete. The guest list and guide assignments go with it.
    pub async fn cancel_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        let (slot, mut day) = self.resolve_booking_write(id).await?;
        let booking = day
            .booking(&slot, id)
            .map(|r| r.booking.clone())
            .ok_or(EngineError::BookingNotFound(id))?;
        authorize(actor, &booking)?;

        self.persist_and_apply(&mut day, vec![Event::BookingCancelled { id, slot }])
            .await?;
        drop(day);

        self.notify.send(Notification::BookingCancelled {
            agency_id: booking.agency_id,
            booking_id: id,
            date: slot.date,
            time: slot.time,
            party_size: booking.party_size,
        });
        info!("booking {id} cancelled, {slot} freed {}", booking.party_size);
        Ok(booking)
    }

    pub async fn set_day_category(
        &self,
        actor: &Actor,
        date: NaiveDate,
        category: DayCategory,
        limit: Option<u32>,
    ) -> Result<u32, EngineError> {
        require_admin(actor, "day categories are admin-only")?;
        let limit = day_limit_for(category, limit)?;
        let mut day = self.write_day(date).await?;
        self.persist_and_apply(
            &mut day,
            vec![Event::DayCategorized {
                date,
                category,
                limit,
            }],
        )
        .await?;
        info!("day {date} set to {category} ({limit})");
        Ok(limit)
    }

    /// `Some` sets an override, `None` returns the slot to the day limit.
    pub async fn set_slot_limit(
        &self,
        actor: &Actor,
        slot: SlotKey,
        limit: Option<u32>,
    ) -> Result<(), EngineError> {
        require_admin(actor, "slot limits are admin-only")?;
        let mut day = self.write_day(slot.date).await?;
        self.persist_and_apply(&mut day, vec![Event::SlotLimitSet { slot, limit }])
            .await?;
        info!("slot {slot} limit set to {limit:?}");
        Ok(())
    }

    /// Apply one override to many slots in one commit. Day locks are taken
    /// in ascending date order.
    pub async fn set_slot_limits(
        &self,
        actor: &Actor,
        limit: Option<u32>,
        slots: &[SlotKey],
    ) -> Result<usize, EngineError> {
        require_admin(actor, "slot limits are admin-only")?;
        if slots.len() > MAX_BULK_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots in one request"));
        }
        let mut by_date: BTreeMap<NaiveDate, Vec<SlotKey>> = BTreeMap::new();
        for slot in slots {
            let entry = by_date.entry(slot.date).or_default();
            if !entry.contains(slot) {
                entry.push(*slot);
            }
        }
        if by_date.is_empty() {
            return Ok(0);
        }

        let _gate = self.enter().await?;
        let mut guards = Vec::with_capacity(by_date.len());
        for date in by_date.keys() {
            guards.push(self.lock_day(*date).await?);
        }

        let events: Vec<Event> = by_date
            .values()
            .flatten()
            .map(|&slot| Event::SlotLimitSet { slot, limit })
            .collect();
        let count = events.len();
        self.wal_append(events).await?;
        for (guard, day_slots) in guards.iter_mut().zip(by_date.values()) {
            for &slot in day_slots {
                guard.slot_mut(slot.time).override_limit = limit;
            }
        }
        info!("{count} slot limits set to {limit:?} across {} days", guards.len());
        Ok(count)
    }
}
