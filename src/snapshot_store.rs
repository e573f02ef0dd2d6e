//! In-memory store of the latest state of every live vehicle.
//!
//! Writes are last-write-wins: a report that arrives later always replaces the
//! stored one, whatever its `reportedAt` says. Iteration is ordered by vehicle id.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::vehicle_position::{
    ConnectionId, LifecycleState, VehiclePositionReport, VehicleSnapshot,
};

#[derive(Debug, Default)]
pub struct SnapshotStore {
    vehicles: BTreeMap<String, VehicleSnapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the snapshot for `report.vehicle_id`.
    pub fn upsert(
        &mut self,
        report: VehiclePositionReport,
        owner_connection_id: ConnectionId,
        received_at: DateTime<Utc>,
    ) -> VehicleSnapshot {
        let snapshot = VehicleSnapshot::from_report(report, owner_connection_id, received_at);
        self.vehicles
            .insert(snapshot.vehicle_id.clone(), snapshot.clone());
        snapshot
    }

    pub fn remove(&mut self, vehicle_id: &str) -> Option<VehicleSnapshot> {
        self.vehicles.remove(vehicle_id)
    }

    pub fn get(&self, vehicle_id: &str) -> Option<&VehicleSnapshot> {
        self.vehicles.get(vehicle_id)
    }

    /// All snapshots ordered by vehicle id. Each call starts a fresh pass.
    pub fn get_all(&self) -> impl Iterator<Item = &VehicleSnapshot> + '_ {
        self.vehicles.values()
    }

    /// Flip the lifecycle state in place, returning the updated snapshot.
    pub fn set_lifecycle_state(
        &mut self,
        vehicle_id: &str,
        state: LifecycleState,
        at: DateTime<Utc>,
    ) -> Option<VehicleSnapshot> {
        let snapshot = self.vehicles.get_mut(vehicle_id)?;
        snapshot.lifecycle_state = state;
        snapshot.last_update_at = at;
        Some(snapshot.clone())
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }
}
