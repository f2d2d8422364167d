mod allocator;
mod availability;
mod error;
mod mutations;
mod oracle;
mod queries;

pub use availability::{building_info, floor_availability, min_free_across, zone_availability};
pub use error::ParkError;
pub use oracle::now_ms;
pub(crate) use oracle::validate_instant;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedBuildingState = Arc<RwLock<BuildingState>>;

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
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
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

pub struct Engine {
    pub state: DashMap<Ulid, SharedBuildingState>,
    pub sites: DashMap<Ulid, Site>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → building id
    pub(super) reservation_to_building: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to a BuildingState (no locking; caller holds the lock).
/// Keeps the per-slot occupancy index in step with reservation status: a claim
/// exists exactly while the reservation is in an occupying status.
fn apply_to_building(bs: &mut BuildingState, event: &Event, reservation_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ScheduleRuleAdded { rule, .. } => {
            bs.schedule.push(*rule);
        }
        Event::SlotAdded { key, vehicle, .. } => {
            bs.slots.insert(key.clone(), SlotState::new(*vehicle));
        }
        Event::ReservationCreated {
            building_id,
            reservation,
        } => {
            if reservation.status.is_occupying()
                && let Some(key) = &reservation.slot
                && let Some(slot) = bs.slots.get_mut(key)
            {
                slot.insert_occupancy(Occupancy {
                    reservation: reservation.id,
                    span: reservation.span,
                });
            }
            reservation_map.insert(reservation.id, *building_id);
            bs.reservations.insert(reservation.id, reservation.clone());
        }
        Event::ReservationStatusChanged { id, status, .. } => {
            let Some(r) = bs.reservations.get_mut(id) else {
                return;
            };
            let was_occupying = r.status.is_occupying();
            r.status = *status;
            let key = r.slot.clone();
            if was_occupying
                && !status.is_occupying()
                && let Some(key) = key
                && let Some(slot) = bs.slots.get_mut(&key)
            {
                slot.remove_occupancy(*id);
            }
        }
        // SiteCreated/BuildingCreated are handled at the DashMap level, not here
        Event::SiteCreated { .. } | Event::BuildingCreated { .. } => {}
    }
}

/// Listener payload for a committed event. Only reservation lifecycle events
/// fan out; schedule and slot inventory changes do not.
fn reservation_note(bs: &BuildingState, event: &Event) -> Option<ReservationEvent> {
    let id = match event {
        Event::ReservationCreated { reservation, .. } => reservation.id,
        Event::ReservationStatusChanged { id, .. } => *id,
        _ => return None,
    };
    let r = bs.reservations.get(&id)?;
    Some(ReservationEvent {
        building_id: r.building,
        reservation_id: r.id,
        status: r.status,
        slot_label: r.slot.as_ref().map(SlotKey::label),
        start: r.span.start,
        end: r.span.end,
    })
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            sites: DashMap::new(),
            wal_tx,
            notify,
            reservation_to_building: DashMap::new(),
        };

        // Replay events. We're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy campus creation).
        for event in &events {
            match event {
                Event::SiteCreated {
                    id,
                    name,
                    lat,
                    lng,
                    category,
                } => {
                    engine.sites.insert(
                        *id,
                        Site {
                            id: *id,
                            name: name.clone(),
                            lat: *lat,
                            lng: *lng,
                            category: *category,
                        },
                    );
                }
                Event::BuildingCreated { id, site_id, name } => {
                    let bs = BuildingState::new(*id, *site_id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(bs)));
                }
                other => {
                    if let Some(building_id) = other.building_id()
                        && let Some(entry) = engine.state.get(&building_id)
                    {
                        let bs_arc = entry.clone();
                        let mut guard = bs_arc.try_write().expect("replay: uncontended write");
                        apply_to_building(&mut guard, other, &engine.reservation_to_building);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), ParkError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| ParkError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| ParkError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| ParkError::WalError(e.to_string()))
    }

    pub fn get_building(&self, id: &Ulid) -> Option<SharedBuildingState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn building_of_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_building
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call. Eliminates the repeated 3-line pattern.
    pub(super) async fn persist_and_apply(
        &self,
        building_id: Ulid,
        bs: &mut BuildingState,
        event: &Event,
    ) -> Result<(), ParkError> {
        self.wal_append(event).await?;
        apply_to_building(bs, event, &self.reservation_to_building);
        if let Some(note) = reservation_note(bs, event) {
            self.notify.send(building_id, &note);
        }
        Ok(())
    }

    /// Lookup reservation → building, get building, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<BuildingState>), ParkError> {
        let building_id = self
            .building_of_reservation(reservation_id)
            .ok_or(ParkError::NotFound(*reservation_id))?;
        let bs = self
            .get_building(&building_id)
            .ok_or(ParkError::NotFound(building_id))?;
        let guard = bs.write_owned().await;
        Ok((building_id, guard))
    }
}
