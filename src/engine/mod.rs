mod allocator;
mod capacity;
mod error;
mod guests;
mod guides;
mod ledger;
mod queries;
mod status;

pub use capacity::{day_limit_for, resolve_limit};
pub use error::{EngineError, ErrorKind};
pub use ledger::{available, booked_count};
pub use status::{derive_status, required_guides};

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{
    mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};
use tracing::{debug, info};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedDayState = Arc<RwLock<DayState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// Events of one operation; durable together or not at all.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is running are written
/// as one batch and share a single fsync.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal<Event>, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal<Event>, batch: &[Pending]) -> io::Result<()> {
    let mut append_err = None;
    'outer: for (events, _) in batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Flush even after a failed append so the buffered bytes of a batch that
    // was reported as failed do not ride along with the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let mut batch = vec![(events, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── State application ────────────────────────────────────

/// Apply a dated event to its day. The caller holds the day's write lock.
fn apply_to_day(day: &mut DayState, event: &Event, index: &DashMap<Ulid, SlotKey>) {
    match event {
        Event::DayCategorized { category, limit, .. } => {
            day.category = *category;
            day.limit = *limit;
        }
        Event::SlotLimitSet { slot, limit } => {
            day.slot_mut(slot.time).override_limit = *limit;
        }
        Event::BookingCreated { booking } => {
            index.insert(booking.id, booking.slot);
            day.slot_mut(booking.slot.time)
                .bookings
                .push(BookingRecord::new(booking.clone()));
        }
        Event::BookingModified {
            id,
            slot,
            party_size,
            precise_time,
            at,
        } => {
            if let Some(record) = day.booking_mut(slot, *id) {
                record.booking.party_size = *party_size;
                record.booking.precise_time = *precise_time;
                record.booking.updated_at = *at;
            }
        }
        Event::BookingCancelled { id, slot } => {
            day.slot_mut(slot.time).remove_booking(*id);
            index.remove(id);
        }
        Event::GuestListAttached { slot, list } => {
            if let Some(record) = day.booking_mut(slot, list.booking_id) {
                record.guest_list = Some(list.clone());
            }
        }
        Event::GuestsReplaced {
            booking_id,
            slot,
            guests,
            at,
        } => {
            if let Some(list) = day
                .booking_mut(slot, *booking_id)
                .and_then(|r| r.guest_list.as_mut())
            {
                list.guests = guests.clone();
                list.updated_at = *at;
            }
        }
        Event::GuestListRevoked { booking_id, slot } => {
            if let Some(record) = day.booking_mut(slot, *booking_id) {
                record.guest_list = None;
                record.guides.clear();
            }
        }
        Event::GuideAssigned { slot, assignment } => {
            if let Some(record) = day.booking_mut(slot, assignment.booking_id) {
                record.guides.push(assignment.clone());
            }
        }
        Event::GuideReassigned {
            slot,
            booking_id,
            assignment_id,
            guide_id,
        } => {
            if let Some(a) = day
                .booking_mut(slot, *booking_id)
                .and_then(|r| r.guides.iter_mut().find(|a| a.id == *assignment_id))
            {
                a.guide_id = *guide_id;
            }
        }
        Event::GuideUnassigned {
            slot,
            booking_id,
            assignment_id,
        } => {
            if let Some(record) = day.booking_mut(slot, *booking_id) {
                record.guides.retain(|a| a.id != *assignment_id);
            }
        }
        Event::GuideRegistered { .. } | Event::GuideUpdated { .. } | Event::GuideRemoved { .. } => {}
    }
}

/// Apply an undated (guide registry) event.
fn apply_to_registry(guides: &DashMap<Ulid, Guide>, event: &Event) {
    match event {
        Event::GuideRegistered { guide } | Event::GuideUpdated { guide } => {
            guides.insert(guide.id, guide.clone());
        }
        Event::GuideRemoved { id } => {
            guides.remove(id);
        }
        _ => {}
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct EngineConfig {
    /// Bound on waiting for locks and for room in the WAL queue.
    pub op_timeout: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_millis(DEFAULT_OP_TIMEOUT_MS),
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct Engine {
    pub(super) days: DashMap<NaiveDate, SharedDayState>,
    /// Booking id → its slot. Bookings never move between slots.
    pub(super) booking_index: DashMap<Ulid, SlotKey>,
    pub(super) guides: DashMap<Ulid, Guide>,
    /// Serializes guide registry writes.
    pub(super) registry: Mutex<()>,
    /// Shared by every mutation, taken exclusively by compaction so a
    /// snapshot never races an in-flight append.
    gate: Arc<RwLock<()>>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    op_timeout: Duration,
}

/// Write access to one day, held together with the mutation gate.
pub(super) struct DayGuard {
    day: OwnedRwLockWriteGuard<DayState>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl Deref for DayGuard {
    type Target = DayState;

    fn deref(&self) -> &DayState {
        &self.day
    }
}

impl DerefMut for DayGuard {
    fn deref_mut(&mut self) -> &mut DayState {
        &mut self.day
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_config(wal_path, notify, EngineConfig::default())
    }

    /// Replay the WAL at `wal_path` and start its writer task. Must run
    /// inside a tokio runtime.
    pub fn with_config(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let (events, wal) = Wal::<Event>::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let booking_index = DashMap::new();
        let guides = DashMap::new();
        let mut days: HashMap<NaiveDate, DayState> = HashMap::new();
        for event in &events {
            match event.date() {
                Some(date) => {
                    let day = days.entry(date).or_insert_with(|| DayState::new(date));
                    apply_to_day(day, event, &booking_index);
                }
                None => apply_to_registry(&guides, event),
            }
        }
        info!(
            "replayed {} events from {} ({} days, {} bookings, {} guides)",
            events.len(),
            wal_path.display(),
            days.len(),
            booking_index.len(),
            guides.len()
        );

        Ok(Self {
            days: days
                .into_iter()
                .map(|(date, day)| (date, Arc::new(RwLock::new(day))))
                .collect(),
            booking_index,
            guides,
            registry: Mutex::new(()),
            gate: Arc::new(RwLock::new(())),
            wal_tx,
            notify,
            clock: config.clock,
            op_timeout: config.op_timeout,
        })
    }

    /// Venue-local wall clock time.
    pub fn now(&self) -> chrono::NaiveDateTime {
        self.clock.now()
    }

    async fn timed<F: std::future::Future>(
        &self,
        what: &'static str,
        fut: F,
    ) -> Result<F::Output, EngineError> {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| EngineError::Timeout(what))
    }

    /// Write events via the background group-commit writer.
    async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        // Only the enqueue is bounded: once queued the events may become
        // durable, so the outcome has to be awaited.
        self.timed(
            "waiting for the write-ahead log",
            self.wal_tx.send(WalCommand::Append {
                events,
                response: tx,
            }),
        )
        .await?
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn get_day(&self, date: NaiveDate) -> Option<SharedDayState> {
        self.days.get(&date).map(|e| e.value().clone())
    }

    /// Days are created on first write with the Open default.
    fn day_or_create(&self, date: NaiveDate) -> SharedDayState {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(date))))
            .value()
            .clone()
    }

    /// Shared mutation gate. Take it once per operation, before any day lock.
    pub(super) async fn enter(&self) -> Result<OwnedRwLockReadGuard<()>, EngineError> {
        self.timed("waiting for compaction", self.gate.clone().read_owned())
            .await
    }

    pub(super) async fn lock_day(
        &self,
        date: NaiveDate,
    ) -> Result<OwnedRwLockWriteGuard<DayState>, EngineError> {
        self.timed("waiting for the day lock", self.day_or_create(date).write_owned())
            .await
    }

    pub(super) async fn write_day(&self, date: NaiveDate) -> Result<DayGuard, EngineError> {
        let gate = self.enter().await?;
        let day = self.lock_day(date).await?;
        Ok(DayGuard { day, _gate: gate })
    }

    /// Read access without creating the day. `None` means never referenced.
    pub(super) async fn read_day(
        &self,
        date: NaiveDate,
    ) -> Result<Option<OwnedRwLockReadGuard<DayState>>, EngineError> {
        match self.get_day(date) {
            Some(day) => Ok(Some(
                self.timed("waiting for the day lock", day.read_owned()).await?,
            )),
            None => Ok(None),
        }
    }

    /// Look up a booking's slot and lock its day. Re-checks presence after
    /// the lock is held, since a cancel may have won the race.
    pub(super) async fn resolve_booking_write(
        &self,
        id: Ulid,
    ) -> Result<(SlotKey, DayGuard), EngineError> {
        let slot = self
            .booking_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::BookingNotFound(id))?;
        let guard = self.write_day(slot.date).await?;
        if guard.booking(&slot, id).is_none() {
            return Err(EngineError::BookingNotFound(id));
        }
        Ok((slot, guard))
    }

    /// WAL append, then apply. State is untouched if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        day: &mut DayState,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        self.wal_append(events.clone()).await?;
        for event in &events {
            apply_to_day(day, event, &self.booking_index);
        }
        Ok(())
    }

    pub(super) async fn persist_registry(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(vec![event.clone()]).await?;
        apply_to_registry(&self.guides, &event);
        Ok(())
    }

    /// Rewrite the WAL with just the events needed to rebuild current state.
    /// Blocks all mutations while it runs.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.gate.write().await;

        let mut events: Vec<Event> = self
            .guides
            .iter()
            .map(|e| Event::GuideRegistered {
                guide: e.value().clone(),
            })
            .collect();

        let days: BTreeMap<NaiveDate, SharedDayState> = self
            .days
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (date, day) in days {
            let day = day.read().await;
            if day.category != DayCategory::Open || day.limit != DEFAULT_DAY_LIMIT {
                events.push(Event::DayCategorized {
                    date,
                    category: day.category,
                    limit: day.limit,
                });
            }
            for (&time, slot) in &day.slots {
                let key = SlotKey::new(date, time);
                if let Some(limit) = slot.override_limit {
                    events.push(Event::SlotLimitSet {
                        slot: key,
                        limit: Some(limit),
                    });
                }
                for record in &slot.bookings {
                    events.push(Event::BookingCreated {
                        booking: record.booking.clone(),
                    });
                    if let Some(list) = &record.guest_list {
                        events.push(Event::GuestListAttached {
                            slot: key,
                            list: list.clone(),
                        });
                    }
                    for assignment in &record.guides {
                        events.push(Event::GuideAssigned {
                            slot: key,
                            assignment: assignment.clone(),
                        });
                    }
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        debug!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Owner or admin.
pub(super) fn authorize(actor: &Actor, booking: &Booking) -> Result<(), EngineError> {
    if actor.may_act_for(booking.agency_id) {
        Ok(())
    } else {
        Err(EngineError::NotOwner(booking.id))
    }
}

pub(super) fn require_admin(actor: &Actor, what: &'static str) -> Result<(), EngineError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden(what))
    }
}
