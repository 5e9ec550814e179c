//! Occupancy bookkeeping and propagation.
//!
//! [`ZoneState`] is the synchronous core: it assigns users to zones, recounts
//! occupancy and reclassifies density. [`SyncOrchestrator`] wraps it in a
//! single task that drains an ordered inbox and publishes immutable snapshots
//! over a watch channel. Changed records go to one writer task in the order
//! they were produced; the orchestrator never waits on it. Deletions stay
//! pending until the writer confirms them and are re-sent on every tick.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::density::reclassify_zone;
use crate::error::{CoreError, Result};
use crate::locator::ZoneIndex;
use crate::store::{PositionSink, ZoneRepository};
use crate::types::{Coordinate, DensityCategory, ManualOverride, UserPosition, Zone, ZoneAssignment, ZoneId};

/// One report from the position stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    pub user_id: String,
    pub coordinate: Coordinate,
    pub observed_at: DateTime<Utc>,
}

/// Immutable view handed to readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u64,
    pub zones: Vec<Zone>,
    pub positions: Vec<UserPosition>,
}

impl Snapshot {
    pub fn zone(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    pub fn position(&self, user_id: &str) -> Option<&UserPosition> {
        self.positions.iter().find(|p| p.user_id == user_id)
    }
}

/// Records touched by one state transition.
#[derive(Debug, Default, PartialEq)]
pub struct Changes {
    pub zones: Vec<ZoneId>,
    pub removed_zones: Vec<ZoneId>,
    pub positions: Vec<String>,
    pub removed_positions: Vec<String>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
            && self.removed_zones.is_empty()
            && self.positions.is_empty()
            && self.removed_positions.is_empty()
    }
}

pub struct ZoneState {
    zones: Vec<Zone>,
    index: ZoneIndex,
    positions: BTreeMap<String, UserPosition>,
}

impl ZoneState {
    /// Zones failing validation are dropped with a warning; the rest are
    /// classified from their seeded occupancy.
    pub fn new(zones: Vec<Zone>) -> Self {
        let mut accepted: Vec<Zone> = Vec::with_capacity(zones.len());
        for mut zone in zones {
            if let Err(e) = zone.validate() {
                warn!(error = %e, "dropping invalid zone");
                continue;
            }
            if accepted.iter().any(|z| z.id == zone.id) {
                warn!(zone_id = %zone.id, "dropping duplicate zone id");
                continue;
            }
            if let Err(e) = reclassify_zone(&mut zone) {
                warn!(error = %e, "dropping unclassifiable zone");
                continue;
            }
            accepted.push(zone);
        }

        let index = ZoneIndex::build(&accepted);
        Self {
            zones: accepted,
            index,
            positions: BTreeMap::new(),
        }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn zone(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    pub fn position(&self, user_id: &str) -> Option<&UserPosition> {
        self.positions.get(user_id)
    }

    pub fn snapshot(&self, version: u64) -> Snapshot {
        Snapshot {
            version,
            zones: self.zones.clone(),
            positions: self.positions.values().cloned().collect(),
        }
    }

    fn assign(&self, point: Coordinate) -> ZoneAssignment {
        if self.index.is_empty() {
            ZoneAssignment::Outside
        } else {
            self.index.locate(point)
        }
    }

    /// Locate one user and fold the result into the zone counts.
    pub fn apply_position(&mut self, update: PositionUpdate) -> Changes {
        let assigned = self.assign(update.coordinate);
        debug!(user_id = %update.user_id, zone = %assigned, "located position");

        let position = UserPosition {
            user_id: update.user_id.clone(),
            coordinate: update.coordinate,
            observed_at: update.observed_at,
            assigned_zone_id: assigned,
        };
        self.positions.insert(update.user_id.clone(), position);

        let mut changes = self.recount();
        changes.positions.push(update.user_id);
        changes
    }

    /// Recompute occupancy from current assignments and reclassify every
    /// zone whose count moved.
    pub fn recount(&mut self) -> Changes {
        let mut counts: HashMap<&str, u32> = HashMap::new();
        for position in self.positions.values() {
            if let Some(id) = position.assigned_zone_id.zone_id() {
                *counts.entry(id).or_default() += 1;
            }
        }

        let mut changed = Vec::new();
        for zone in &mut self.zones {
            let count = counts.get(zone.id.as_str()).copied().unwrap_or(0);
            if count == zone.occupant_count {
                continue;
            }
            zone.occupant_count = count;
            match reclassify_zone(zone) {
                Ok(_) => {}
                Err(e) => warn!(error = %e, "reclassification failed"),
            }
            changed.push(zone.id.clone());
        }

        Changes {
            zones: changed,
            ..Changes::default()
        }
    }

    /// Stop tracking a user. `None` when the user was never seen.
    pub fn remove_position(&mut self, user_id: &str) -> Option<Changes> {
        self.positions.remove(user_id)?;
        debug!(user_id, "position removed");

        let mut changes = self.recount();
        changes.removed_positions.push(user_id.to_string());
        Some(changes)
    }

    /// Drop every position last observed before `cutoff`.
    pub fn expire_positions(&mut self, cutoff: DateTime<Utc>) -> Changes {
        let stale: Vec<String> = self
            .positions
            .values()
            .filter(|p| p.observed_at < cutoff)
            .map(|p| p.user_id.clone())
            .collect();
        if stale.is_empty() {
            return Changes::default();
        }

        for user_id in &stale {
            self.positions.remove(user_id);
        }
        info!(expired = stale.len(), "expired stale positions");

        let mut changes = self.recount();
        changes.removed_positions = stale;
        changes
    }

    fn relocate_all(&mut self) -> Changes {
        let mut moved = Vec::new();
        let assignments: Vec<(String, ZoneAssignment)> = self
            .positions
            .values()
            .map(|p| (p.user_id.clone(), self.assign(p.coordinate)))
            .collect();

        for (user_id, assigned) in assignments {
            if let Some(position) = self.positions.get_mut(&user_id) {
                if position.assigned_zone_id != assigned {
                    position.assigned_zone_id = assigned;
                    moved.push(user_id);
                }
            }
        }

        let mut changes = self.recount();
        changes.positions = moved;
        changes
    }

    /// Add or replace a zone's admin-owned fields (name, boundary, capacity,
    /// adjacency). Occupancy and overrides of an existing zone are kept.
    pub fn upsert_zone(&mut self, zone: Zone) -> Result<Changes> {
        zone.validate()?;
        let id = zone.id.clone();

        match self.zones.iter_mut().find(|z| z.id == id) {
            Some(existing) => {
                existing.name = zone.name;
                existing.boundary = zone.boundary;
                existing.capacity = zone.capacity;
                existing.adjacent = zone.adjacent;
                reclassify_zone(existing)?;
            }
            None => {
                let mut fresh = Zone {
                    occupant_count: 0,
                    manual_override: None,
                    ..zone
                };
                reclassify_zone(&mut fresh)?;
                self.zones.push(fresh);
            }
        }

        self.index = ZoneIndex::build(&self.zones);
        let mut changes = self.relocate_all();
        if !changes.zones.contains(&id) {
            changes.zones.push(id);
        }
        Ok(changes)
    }

    pub fn delete_zone(&mut self, id: &str) -> Result<Changes> {
        let before = self.zones.len();
        self.zones.retain(|z| z.id != id);
        if self.zones.len() == before {
            return Err(CoreError::UnknownZone(id.to_string()));
        }

        self.index = ZoneIndex::build(&self.zones);
        let mut changes = self.relocate_all();
        changes.removed_zones.push(id.to_string());
        Ok(changes)
    }

    /// Pin a zone's density at its current occupancy.
    pub fn set_override(&mut self, id: &str, density: DensityCategory) -> Result<Changes> {
        let zone = self
            .zones
            .iter_mut()
            .find(|z| z.id == id)
            .ok_or_else(|| CoreError::UnknownZone(id.to_string()))?;

        zone.manual_override = Some(ManualOverride {
            density,
            occupant_count_at_override: zone.occupant_count,
        });
        zone.density = density;
        info!(zone_id = %id, %density, occupants = zone.occupant_count, "density override set");

        Ok(Changes {
            zones: vec![id.to_string()],
            ..Changes::default()
        })
    }

    pub fn clear_override(&mut self, id: &str) -> Result<Changes> {
        let zone = self
            .zones
            .iter_mut()
            .find(|z| z.id == id)
            .ok_or_else(|| CoreError::UnknownZone(id.to_string()))?;

        zone.manual_override = None;
        reclassify_zone(zone)?;
        info!(zone_id = %id, density = %zone.density, "density override cleared");

        Ok(Changes {
            zones: vec![id.to_string()],
            ..Changes::default()
        })
    }
}

enum Command {
    Position(PositionUpdate),
    RemovePosition {
        user_id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    UpsertZone {
        zone: Zone,
        reply: oneshot::Sender<Result<Zone>>,
    },
    DeleteZone {
        id: ZoneId,
        reply: oneshot::Sender<Result<()>>,
    },
    SetOverride {
        id: ZoneId,
        density: DensityCategory,
        reply: oneshot::Sender<Result<Zone>>,
    },
    ClearOverride {
        id: ZoneId,
        reply: oneshot::Sender<Result<Zone>>,
    },
}

/// Cloneable front door to a running orchestrator.
#[derive(Clone)]
pub struct SyncHandle {
    inbox: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Arc<Snapshot>>,
}

impl SyncHandle {
    /// Queue a position report. Reports from one caller are processed in the
    /// order they are submitted.
    pub async fn submit_position(&self, update: PositionUpdate) -> Result<()> {
        self.inbox
            .send(Command::Position(update))
            .await
            .map_err(|_| CoreError::OrchestratorStopped)
    }

    /// Forget a user. Resolves to `false` if the user was not tracked.
    pub async fn remove_position(&self, user_id: &str) -> Result<bool> {
        let user_id = user_id.to_string();
        self.request(|reply| Command::RemovePosition { user_id, reply }).await
    }

    pub async fn upsert_zone(&self, zone: Zone) -> Result<Zone> {
        self.request(|reply| Command::UpsertZone { zone, reply }).await
    }

    pub async fn delete_zone(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::DeleteZone { id, reply }).await
    }

    pub async fn set_override(&self, id: &str, density: DensityCategory) -> Result<Zone> {
        let id = id.to_string();
        self.request(|reply| Command::SetOverride { id, density, reply }).await
    }

    pub async fn clear_override(&self, id: &str) -> Result<Zone> {
        let id = id.to_string();
        self.request(|reply| Command::ClearOverride { id, reply }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(build(tx))
            .await
            .map_err(|_| CoreError::OrchestratorStopped)?;
        rx.await.map_err(|_| CoreError::OrchestratorStopped)?
    }

    /// Latest published state.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.clone()
    }
}

/// A record the repository must forget.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Removal {
    Zone(ZoneId),
    Position(String),
}

enum Write {
    Zone(Zone),
    Position(UserPosition),
    /// Tagged with the snapshot version that produced it, so a late
    /// confirmation cannot settle a newer removal of the same record.
    Remove(Removal, u64),
}

/// Applies writes one at a time in queue order.
struct Writer {
    repository: Arc<dyn ZoneRepository>,
    sink: Arc<dyn PositionSink>,
    confirmed: mpsc::UnboundedSender<(Removal, u64)>,
}

impl Writer {
    async fn run(self, mut queue: mpsc::UnboundedReceiver<Write>) {
        while let Some(write) = queue.recv().await {
            self.apply(write).await;
        }
        debug!("writer drained");
    }

    async fn apply(&self, write: Write) {
        match write {
            Write::Zone(zone) => {
                let id = zone.id.clone();
                if let Err(e) = self.repository.upsert_zone(zone).await {
                    warn!(zone_id = %id, error = %CoreError::PublishFailure(format!("{e:#}")), "zone write not propagated");
                }
            }
            Write::Position(position) => {
                let user_id = position.user_id.clone();
                if let Err(e) = self.sink.record_position(position).await {
                    warn!(user_id = %user_id, error = %CoreError::PublishFailure(format!("{e:#}")), "position write not propagated");
                }
            }
            Write::Remove(removal, version) => {
                let result = match &removal {
                    Removal::Zone(id) => self.repository.delete_zone(id).await,
                    Removal::Position(user_id) => self.sink.remove_position(user_id).await,
                };
                match result {
                    Ok(()) => {
                        let _ = self.confirmed.send((removal, version));
                    }
                    Err(e) => {
                        warn!(record = ?removal, error = %CoreError::PublishFailure(format!("{e:#}")), "removal not propagated, will retry");
                    }
                }
            }
        }
    }
}

pub struct SyncOrchestrator {
    state: ZoneState,
    inbox: mpsc::Receiver<Command>,
    snapshots: watch::Sender<Arc<Snapshot>>,
    writes: mpsc::UnboundedSender<Write>,
    writer: Option<(Writer, mpsc::UnboundedReceiver<Write>)>,
    confirmed: mpsc::UnboundedReceiver<(Removal, u64)>,
    pending_removals: BTreeMap<Removal, u64>,
    interval: Duration,
    position_ttl: Option<Duration>,
    version: u64,
}

impl SyncOrchestrator {
    pub fn new(
        zones: Vec<Zone>,
        repository: Arc<dyn ZoneRepository>,
        sink: Arc<dyn PositionSink>,
        config: &SyncConfig,
    ) -> (Self, SyncHandle) {
        let state = ZoneState::new(zones);
        let (inbox_tx, inbox_rx) = mpsc::channel(config.channel_capacity);
        let (snap_tx, snap_rx) = watch::channel(Arc::new(state.snapshot(0)));
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();

        let writer = Writer {
            repository,
            sink,
            confirmed: confirm_tx,
        };
        let orchestrator = Self {
            state,
            inbox: inbox_rx,
            snapshots: snap_tx,
            writes: write_tx,
            writer: Some((writer, write_rx)),
            confirmed: confirm_rx,
            pending_removals: BTreeMap::new(),
            interval: config.interval(),
            position_ttl: config.position_ttl(),
            version: 0,
        };
        let handle = SyncHandle {
            inbox: inbox_tx,
            snapshots: snap_rx,
        };
        (orchestrator, handle)
    }

    /// Process commands until every handle is dropped. The first tick fires
    /// at startup, so the repository receives the loaded zones before any
    /// position arrives; later ticks rewrite the full state and retry
    /// unconfirmed removals.
    pub async fn run(mut self) {
        info!(zones = self.state.zones().len(), interval_ms = self.interval.as_millis() as u64, "sync orchestrator started");

        if let Some((writer, queue)) = self.writer.take() {
            tokio::spawn(writer.run(queue));
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.inbox.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some((removal, version)) = self.confirmed.recv() => self.settle(removal, version),
                _ = ticker.tick() => {
                    self.expire_stale();
                    self.republish_all();
                }
            }
        }

        info!("sync orchestrator stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Position(update) => {
                let changes = self.state.apply_position(update);
                self.publish(changes);
            }
            Command::RemovePosition { user_id, reply } => {
                let removed = match self.state.remove_position(&user_id) {
                    Some(changes) => {
                        self.publish(changes);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(Ok(removed));
            }
            Command::UpsertZone { zone, reply } => {
                let id = zone.id.clone();
                let result = self.state.upsert_zone(zone).map(|changes| {
                    self.publish(changes);
                    self.zone_or_unknown(&id)
                });
                let _ = reply.send(result.and_then(|r| r));
            }
            Command::DeleteZone { id, reply } => {
                let result = self.state.delete_zone(&id).map(|changes| self.publish(changes));
                let _ = reply.send(result);
            }
            Command::SetOverride { id, density, reply } => {
                let result = self.state.set_override(&id, density).map(|changes| {
                    self.publish(changes);
                    self.zone_or_unknown(&id)
                });
                let _ = reply.send(result.and_then(|r| r));
            }
            Command::ClearOverride { id, reply } => {
                let result = self.state.clear_override(&id).map(|changes| {
                    self.publish(changes);
                    self.zone_or_unknown(&id)
                });
                let _ = reply.send(result.and_then(|r| r));
            }
        }
    }

    fn zone_or_unknown(&self, id: &str) -> Result<Zone> {
        self.state
            .zone(id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownZone(id.to_string()))
    }

    fn broadcast(&mut self) {
        self.version += 1;
        self.snapshots.send_replace(Arc::new(self.state.snapshot(self.version)));
    }

    fn enqueue(&self, write: Write) {
        if self.writes.send(write).is_err() {
            warn!("writer stopped, dropping write");
        }
    }

    fn remove(&mut self, removal: Removal) {
        self.pending_removals.insert(removal.clone(), self.version);
        self.enqueue(Write::Remove(removal, self.version));
    }

    fn settle(&mut self, removal: Removal, version: u64) {
        if self.pending_removals.get(&removal) == Some(&version) {
            self.pending_removals.remove(&removal);
            debug!(record = ?removal, "removal confirmed");
        }
    }

    /// Snapshot first, then queue writes for the touched records.
    fn publish(&mut self, changes: Changes) {
        self.broadcast();
        if changes.is_empty() {
            return;
        }

        let zones: BTreeSet<&ZoneId> = changes.zones.iter().collect();
        for id in zones {
            if let Some(zone) = self.state.zone(id) {
                // a re-created zone supersedes its pending delete
                self.pending_removals.remove(&Removal::Zone(id.clone()));
                self.enqueue(Write::Zone(zone.clone()));
            }
        }
        for user_id in changes.positions {
            if let Some(position) = self.state.position(&user_id) {
                self.pending_removals.remove(&Removal::Position(user_id.clone()));
                self.enqueue(Write::Position(position.clone()));
            }
        }
        for id in changes.removed_zones {
            self.remove(Removal::Zone(id));
        }
        for user_id in changes.removed_positions {
            self.remove(Removal::Position(user_id));
        }
    }

    fn expire_stale(&mut self) {
        let Some(ttl) = self.position_ttl else {
            return;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            warn!(ttl_secs = ttl.as_secs(), "position ttl out of range, expiry skipped");
            return;
        };

        let changes = self.state.expire_positions(Utc::now() - ttl);
        if !changes.is_empty() {
            self.publish(changes);
        }
    }

    fn republish_all(&mut self) {
        debug!(version = self.version, pending_removals = self.pending_removals.len(), "periodic republish");
        self.broadcast();
        for zone in self.state.zones() {
            self.enqueue(Write::Zone(zone.clone()));
        }
        for position in self.state.positions.values() {
            self.enqueue(Write::Position(position.clone()));
        }
        for (removal, version) in &self.pending_removals {
            self.enqueue(Write::Remove(removal.clone(), *version));
        }
    }
}
