//! Registry of live transport connections.
//!
//! Each connection starts out `Unset` and becomes a producer once it sends an
//! accepted position report. The registry only knows which vehicle a
//! connection claims; the matching half of the back-reference lives in
//! [`crate::snapshot_store::SnapshotStore`] and is kept in step by the relay.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::vehicle_position::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    Unset,
    Producer,
    Subscriber,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub role: ConnectionRole,
    pub owned_vehicle_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Result of binding a connection to a vehicle
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Binding {
    /// Another connection that owned the vehicle and was evicted
    pub evicted: Option<ConnectionId>,
    /// Vehicle this connection owned before switching to the new one
    pub released: Option<String>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionRecord>,
    // vehicle id -> owning connection
    owners: HashMap<String, ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection in the `Unset` role. A second call for the same id is a no-op.
    pub fn register(&mut self, connection_id: ConnectionId) -> bool {
        if self.connections.contains_key(&connection_id) {
            return false;
        }
        self.connections.insert(
            connection_id,
            ConnectionRecord {
                connection_id,
                role: ConnectionRole::Unset,
                owned_vehicle_id: None,
                connected_at: Utc::now(),
            },
        );
        true
    }

    /// Make `connection_id` the producer for `vehicle_id`.
    ///
    /// Any other connection's claim on the vehicle is cleared (that connection
    /// stays registered). Returns `None` if the connection is not registered.
    pub fn bind_as_producer(
        &mut self,
        connection_id: ConnectionId,
        vehicle_id: &str,
    ) -> Option<Binding> {
        let previous = {
            let record = self.connections.get(&connection_id)?;
            record.owned_vehicle_id.clone()
        };

        let mut binding = Binding::default();

        if let Some(prev) = previous
            && prev != vehicle_id
        {
            if self.owners.get(&prev) == Some(&connection_id) {
                self.owners.remove(&prev);
            }
            binding.released = Some(prev);
        }

        if let Some(other) = self.owners.insert(vehicle_id.to_string(), connection_id)
            && other != connection_id
        {
            if let Some(other_record) = self.connections.get_mut(&other)
                && other_record.owned_vehicle_id.as_deref() == Some(vehicle_id)
            {
                other_record.owned_vehicle_id = None;
            }
            binding.evicted = Some(other);
        }

        if let Some(record) = self.connections.get_mut(&connection_id) {
            record.role = ConnectionRole::Producer;
            record.owned_vehicle_id = Some(vehicle_id.to_string());
        }

        Some(binding)
    }

    /// Flag a connection that only reads as a subscriber. Producers keep their role.
    pub fn mark_subscriber(&mut self, connection_id: ConnectionId) {
        if let Some(record) = self.connections.get_mut(&connection_id)
            && record.role == ConnectionRole::Unset
        {
            record.role = ConnectionRole::Subscriber;
        }
    }

    /// Remove a connection, returning its record so the caller can clean up its vehicle.
    pub fn unregister(&mut self, connection_id: ConnectionId) -> Option<ConnectionRecord> {
        let record = self.connections.remove(&connection_id)?;
        if let Some(vehicle_id) = &record.owned_vehicle_id
            && self.owners.get(vehicle_id) == Some(&connection_id)
        {
            self.owners.remove(vehicle_id);
        }
        Some(record)
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<&ConnectionRecord> {
        self.connections.get(&connection_id)
    }

    /// Connection currently holding `vehicle_id`, if any
    pub fn owner_of(&self, vehicle_id: &str) -> Option<ConnectionId> {
        self.owners.get(vehicle_id).copied()
    }

    /// True when `connection_id` is registered and claims `vehicle_id`
    pub fn owns(&self, connection_id: ConnectionId, vehicle_id: &str) -> bool {
        self.connections
            .get(&connection_id)
            .and_then(|r| r.owned_vehicle_id.as_deref())
            == Some(vehicle_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn producer_count(&self) -> usize {
        self.connections
            .values()
            .filter(|r| r.role == ConnectionRole::Producer)
            .count()
    }
}
