mod catalog;
mod compaction;
mod conflict;
mod error;
mod reservations;
mod roster;
mod teams;

pub use catalog::Catalog;
pub use conflict::{find_conflict, has_conflict};
pub use error::{EngineError, ErrorDetail};
pub use roster::validate_application;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedTeamState = Arc<RwLock<TeamState>>;
type ResourceWriteGuard = OwnedRwLockWriteGuard<ResourceState>;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
/// A non-append command ends the batch; it runs after the batch is flushed.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
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

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_err = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .err();
    // Flush even after an append error so partial bytes don't leak into the
    // next batch; the whole batch is reported failed.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

// ── State application ────────────────────────────────────

/// Apply a reservation/resource event to one resource (caller holds the lock).
/// A moved reservation is removed from its old resource and inserted on the new
/// one, so the event is applied to both states.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ResourceAvailabilityChanged { is_available, .. } => {
            rs.info.is_available = *is_available;
        }
        Event::ReservationCreated {
            id,
            resource_id,
            title,
            span,
            participants,
        } => {
            rs.insert_reservation(Reservation {
                id: *id,
                resource_id: *resource_id,
                title: title.clone(),
                span: *span,
                participants: participants.clone(),
            });
            index.insert(*id, *resource_id);
        }
        Event::ReservationUpdated {
            id,
            previous_resource_id,
            resource_id,
            title,
            span,
            participants,
        } => {
            if rs.info.id == *previous_resource_id {
                rs.remove_reservation(*id);
            }
            if rs.info.id == *resource_id {
                rs.insert_reservation(Reservation {
                    id: *id,
                    resource_id: *resource_id,
                    title: title.clone(),
                    span: *span,
                    participants: participants.clone(),
                });
                index.insert(*id, *resource_id);
            }
        }
        Event::ReservationRemoved { id, .. } => {
            rs.remove_reservation(*id);
            index.remove(id);
        }
        _ => {}
    }
}

/// Seat-uniqueness constraint on the team store. Runs before the event is
/// logged so a race surfaces as `SlotFilled` instead of a double seat.
fn check_team_constraints(ts: &TeamState, event: &Event) -> Result<(), EngineError> {
    if let Event::SeatsTaken { seats, .. } = event {
        for seat in seats {
            let session = ts
                .sessions
                .iter()
                .find(|s| s.id == seat.team_session_id)
                .ok_or(EngineError::UnknownSession(seat.team_session_id))?;
            if session.occupant(seat.member.index).is_some() {
                return Err(EngineError::SlotFilled {
                    session_id: session.session_kind_id,
                    index: seat.member.index,
                });
            }
        }
    }
    Ok(())
}

/// Apply a roster/team event to one team (caller holds the lock).
fn apply_to_team(ts: &mut TeamState, event: &Event) {
    match event {
        Event::TeamUpdated {
            fields, sessions, ..
        } => {
            ts.fields = fields.clone();
            if let Some(sessions) = sessions {
                ts.sessions = sessions.clone();
            }
        }
        Event::SeatsTaken { seats, .. } => {
            for seat in seats {
                let seated = ts
                    .session_mut(seat.team_session_id)
                    .is_some_and(|s| s.occupy(seat.member.clone()));
                if !seated {
                    warn!(
                        "team {}: seat {} of {} not applied",
                        ts.id, seat.member.index, seat.team_session_id
                    );
                }
            }
        }
        Event::SeatsReleased { user_id, .. } => {
            ts.vacate_user(*user_id);
        }
        _ => {}
    }
}

fn team_from_event(event: &Event) -> Option<TeamState> {
    match event {
        Event::TeamCreated {
            id,
            performance_id,
            leader_id,
            fields,
            created_at,
            sessions,
        } => Some(TeamState {
            id: *id,
            performance_id: *performance_id,
            leader_id: *leader_id,
            fields: fields.clone(),
            created_at: *created_at,
            sessions: sessions.clone(),
        }),
        _ => None,
    }
}

pub struct Engine {
    pub catalog: Catalog,
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    /// Reverse lookup: reservation id → resource id
    pub(super) reservation_index: DashMap<Ulid, Ulid>,
    pub(super) teams: DashMap<Ulid, SharedTeamState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold a read guard for their whole duration; compaction takes
    /// the write guard so its snapshot never misses an in-flight event.
    pub(super) compaction_gate: RwLock<()>,
    /// Serializes catalog and resource registration so the uniqueness check
    /// and the insert happen as one step around the WAL append.
    pub(super) registry_lock: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            catalog: Catalog::default(),
            resources: DashMap::new(),
            reservation_index: DashMap::new(),
            teams: DashMap::new(),
            wal_tx,
            compaction_gate: RwLock::new(()),
            registry_lock: Mutex::new(()),
        };
        for event in &events {
            engine.replay_event(event);
        }
        tracing::debug!("replayed {} events from {}", events.len(), wal_path.display());
        Ok(engine)
    }

    /// Rebuild state from one logged event. We're the sole owner of every lock
    /// here, so try_write always succeeds; never block, since this may run
    /// inside an async context.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::UserRegistered { .. }
            | Event::PerformanceRegistered { .. }
            | Event::SessionKindRegistered { .. } => self.catalog.apply(event),
            Event::ResourceCreated {
                id,
                name,
                category,
                is_available,
            } => {
                let rs = ResourceState::new(ResourceInfo {
                    id: *id,
                    name: name.clone(),
                    category: *category,
                    is_available: *is_available,
                });
                self.resources.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::ResourceAvailabilityChanged { id, .. } => self.replay_on_resource(*id, event),
            Event::ReservationCreated { resource_id, .. }
            | Event::ReservationRemoved { resource_id, .. } => {
                self.replay_on_resource(*resource_id, event)
            }
            Event::ReservationUpdated {
                previous_resource_id,
                resource_id,
                ..
            } => {
                self.replay_on_resource(*previous_resource_id, event);
                if previous_resource_id != resource_id {
                    self.replay_on_resource(*resource_id, event);
                }
            }
            Event::TeamCreated { id, .. } => {
                if let Some(ts) = team_from_event(event) {
                    self.teams.insert(*id, Arc::new(RwLock::new(ts)));
                }
            }
            Event::TeamRemoved { id } => {
                self.teams.remove(id);
            }
            Event::TeamUpdated { id, .. }
            | Event::SeatsTaken { team_id: id, .. }
            | Event::SeatsReleased { team_id: id, .. } => {
                let Some(ts) = self.team_arc(id) else {
                    warn!("replay: event for unknown team {id}");
                    return;
                };
                match ts.try_write() {
                    Ok(mut guard) => apply_to_team(&mut guard, event),
                    Err(_) => warn!("replay: team {id} unexpectedly locked"),
                }
            }
        }
    }

    fn replay_on_resource(&self, resource_id: Ulid, event: &Event) {
        let Some(rs) = self.resource_arc(&resource_id) else {
            warn!("replay: event for unknown resource {resource_id}");
            return;
        };
        match rs.try_write() {
            Ok(mut guard) => apply_to_resource(&mut guard, event, &self.reservation_index),
            Err(_) => warn!("replay: resource {resource_id} unexpectedly locked"),
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn resource_arc(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub(super) fn resource(&self, id: Ulid) -> Result<SharedResourceState, EngineError> {
        self.resource_arc(&id)
            .ok_or(EngineError::not_found("resource", id))
    }

    pub fn team_arc(&self, id: &Ulid) -> Option<SharedTeamState> {
        self.teams.get(id).map(|e| e.value().clone())
    }

    /// WAL-append + apply on one resource.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.reservation_index);
        Ok(())
    }

    /// Constraint check + WAL-append + apply on one team.
    pub(super) async fn persist_and_apply_team(
        &self,
        ts: &mut TeamState,
        event: &Event,
    ) -> Result<(), EngineError> {
        check_team_constraints(ts, event)?;
        self.wal_append(event).await?;
        apply_to_team(ts, event);
        Ok(())
    }

    /// Acquire a team's write lock. A team removed while we waited is NotFound.
    pub(super) async fn lock_team(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<TeamState>, EngineError> {
        let ts = self
            .team_arc(&id)
            .ok_or(EngineError::not_found("team", id))?;
        let guard = ts.write_owned().await;
        if !self.teams.contains_key(&id) {
            return Err(EngineError::not_found("team", id));
        }
        Ok(guard)
    }

    /// Acquire the write lock of the resource currently holding a reservation.
    /// Retries if the reservation moved while we waited for the lock.
    pub(super) async fn lock_reservation(
        &self,
        id: Ulid,
    ) -> Result<ResourceWriteGuard, EngineError> {
        loop {
            let resource_id = self
                .reservation_index
                .get(&id)
                .map(|e| *e.value())
                .ok_or(EngineError::not_found("reservation", id))?;
            let guard = self.resource(resource_id)?.write_owned().await;
            if guard.reservation(id).is_some() {
                return Ok(guard);
            }
            match self.reservation_index.get(&id).map(|e| *e.value()) {
                Some(current) if current != resource_id => continue,
                _ => return Err(EngineError::not_found("reservation", id)),
            }
        }
    }

    /// Write locks for a reservation's current resource and, when `target`
    /// names a different one, the target too. Both are taken in id order, so
    /// a lower target means letting go of the current lock first; if the
    /// reservation moved in that gap, start over from its new home.
    pub(super) async fn lock_reservation_move(
        &self,
        id: Ulid,
        target: Option<Ulid>,
    ) -> Result<(ResourceWriteGuard, Option<ResourceWriteGuard>), EngineError> {
        loop {
            let current = self.lock_reservation(id).await?;
            let from = current.info.id;
            let to = match target {
                Some(to) if to != from => to,
                _ => return Ok((current, None)),
            };
            let target_rs = self.resource(to)?;
            if from < to {
                let t = target_rs.write_owned().await;
                return Ok((current, Some(t)));
            }
            drop(current);
            let t = target_rs.write_owned().await;
            let current = self.resource(from)?.write_owned().await;
            if current.reservation(id).is_some() {
                return Ok((current, Some(t)));
            }
        }
    }
}
