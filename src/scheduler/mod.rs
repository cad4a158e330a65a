mod admission;
mod error;
mod materialize;
mod mutations;
mod queries;

pub use error::SchedulerError;
pub use materialize::{materialize, overlap_warnings, validate_window, WindowWarning};
pub use queries::BookingFilter;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Scheduler {
    pub state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking id → resource id.
    pub(super) booking_to_resource: DashMap<Ulid, Ulid>,
    /// Building → resources index for O(1) building-view lookups.
    pub(super) by_building: DashMap<Ulid, Vec<Ulid>>,
}

/// Apply an event directly to a ResourceState (no locking — caller holds the lock).
/// Window and capacity changes re-derive the slot calendar, so a booking can
/// never observe a half-updated slot set.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, bookings: &DashMap<Ulid, Ulid>) {
    match event {
        Event::WindowsReplaced { windows, .. } => {
            rs.windows = windows.clone();
            rs.slots = materialize(&rs.windows, rs.capacity);
        }
        Event::ResourceUpdated { name, kind, location, capacity, .. } => {
            rs.name = name.clone();
            rs.kind = kind.clone();
            rs.location = location.clone();
            rs.capacity = *capacity;
            rs.slots = materialize(&rs.windows, rs.capacity);
        }
        Event::ResourceActiveSet { active, .. } => {
            rs.active = *active;
        }
        Event::SlotBooked { id, resource_id, user_id, date, start, created_at } => {
            rs.insert_booking(Booking {
                id: *id,
                user_id: *user_id,
                kind: BookingKind::Slot { date: *date, start: *start },
                status: BookingStatus::Confirmed,
                created_at: *created_at,
            });
            bookings.insert(*id, *resource_id);
        }
        Event::IntervalBooked { id, resource_id, user_id, start, end, created_at } => {
            rs.insert_booking(Booking {
                id: *id,
                user_id: *user_id,
                kind: BookingKind::Interval { start: *start, end: *end },
                status: BookingStatus::Confirmed,
                created_at: *created_at,
            });
            bookings.insert(*id, *resource_id);
        }
        Event::BookingCancelled { id, .. } => {
            // Status flip only — cancelled bookings stay for audit history.
            if let Some(b) = rs.booking_mut(*id) {
                b.status = BookingStatus::Cancelled;
            }
        }
        // ResourceCreated/Deleted are handled at the DashMap level, not here
        Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => {}
    }
}

impl Scheduler {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let scheduler = Self {
            state: DashMap::new(),
            wal_tx,
            booking_to_resource: DashMap::new(),
            by_building: DashMap::new(),
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never blocking_write here: this may run inside
        // an async context.
        for event in &events {
            match event {
                Event::ResourceCreated { id, building_id, name, kind, location, capacity } => {
                    let rs = ResourceState::new(
                        *id,
                        *building_id,
                        name.clone(),
                        kind.clone(),
                        location.clone(),
                        *capacity,
                    );
                    scheduler.state.insert(*id, Arc::new(RwLock::new(rs)));
                    scheduler.by_building.entry(*building_id).or_default().push(*id);
                }
                Event::ResourceDeleted { id } => {
                    scheduler.drop_resource_entry(id);
                }
                other => {
                    if let Some(resource_id) = event_resource_id(other)
                        && let Some(entry) = scheduler.state.get(&resource_id)
                    {
                        let rs_arc = entry.clone();
                        let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                        apply_to_resource(&mut guard, other, &scheduler.booking_to_resource);
                    }
                }
            }
        }

        Ok(scheduler)
    }

    /// Remove a resource from the live set and every index.
    pub(super) fn drop_resource_entry(&self, id: &Ulid) {
        if let Some((_, rs)) = self.state.remove(id) {
            let guard = rs.try_read().expect("delete: uncontended read");
            if let Some(mut members) = self.by_building.get_mut(&guard.building_id) {
                members.retain(|r| r != id);
            }
            for b in &guard.bookings {
                self.booking_to_resource.remove(&b.id);
            }
        }
    }

    /// Write event to the WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| SchedulerError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulerError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| SchedulerError::Storage(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn resource_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_resource.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply in one call: the write-ahead discipline for every
    /// mutation. The caller holds the resource write lock throughout.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), SchedulerError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.booking_to_resource);
        Ok(())
    }

    /// Lookup booking → resource, get resource, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ResourceState>, SchedulerError> {
        let resource_id = self
            .resource_for_booking(booking_id)
            .ok_or(SchedulerError::NotFound(*booking_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(SchedulerError::NotFound(resource_id))?;
        Ok(rs.write_owned().await)
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

/// Extract the resource_id from an event (for non-Create/Delete events).
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::WindowsReplaced { resource_id, .. }
        | Event::SlotBooked { resource_id, .. }
        | Event::IntervalBooked { resource_id, .. }
        | Event::BookingCancelled { resource_id, .. } => Some(*resource_id),
        Event::ResourceUpdated { id, .. } | Event::ResourceActiveSet { id, .. } => Some(*id),
        Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => None,
    }
}

/// Maintenance loop: rewrite the WAL from live state once enough appends
/// have accumulated since the last compaction.
pub async fn run_compactor(scheduler: Arc<Scheduler>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let appends = scheduler.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match scheduler.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}
