//! Relay engine: validates producer events, keeps the connection registry and
//! snapshot store in step, and fans events out to every connected client.
//!
//! Per-vehicle state is derived from the snapshot store:
//!
//! ```text
//! OFFLINE --position-report--> IDLE/ACTIVE (as reported)
//! IDLE    --trip-start-------> ACTIVE
//! any     --trip-stop--------> OFFLINE
//! any     --owner disconnect-> OFFLINE
//! ```
//!
//! Registry and store sit behind one mutex. Fan-out happens while the lock is
//! held so the broadcast order always matches the order of mutations.
//! Delivery is at-most-once: a receiver that falls more than the channel
//! capacity behind skips the events it missed.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection_registry::{ConnectionRecord, ConnectionRegistry};
use crate::protocol::{ClientEvent, ServerEvent, TripSignal};
use crate::snapshot_store::SnapshotStore;
use crate::vehicle_position::{
    ConnectionId, LifecycleState, ReportError, VehiclePositionReport, VehicleSnapshot,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RelayError {
    #[error("invalid position report: {0}")]
    InvalidReport(#[from] ReportError),
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
    #[error("connection is not the producer for vehicle {0}")]
    NotOwner(String),
    #[error("vehicle {0} is offline")]
    VehicleOffline(String),
}

/// Counts reported by the status endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub connections: usize,
    pub producers: usize,
    pub active_vehicles: usize,
}

#[derive(Debug, Default)]
struct RelayState {
    registry: ConnectionRegistry,
    store: SnapshotStore,
}

impl RelayState {
    fn record_gauges(&self) {
        metrics::gauge!("relay.connections.active").set(self.registry.len() as f64);
        metrics::gauge!("relay.vehicles.active").set(self.store.len() as f64);
    }
}

#[derive(Clone)]
pub struct RelayEngine {
    state: Arc<Mutex<RelayState>>,
    fanout: broadcast::Sender<ServerEvent>,
}

impl RelayEngine {
    /// `broadcast_capacity` bounds how far a slow client may fall behind
    /// before it starts skipping events.
    pub fn new(broadcast_capacity: usize) -> Self {
        let (fanout, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            state: Arc::new(Mutex::new(RelayState::default())),
            fanout,
        }
    }

    /// Register a fresh connection and hand back its id and fan-out receiver.
    pub async fn connect(&self) -> (ConnectionId, broadcast::Receiver<ServerEvent>) {
        let connection_id = Uuid::new_v4();
        let receiver = self.register(connection_id).await;
        (connection_id, receiver)
    }

    /// Register a connection under a caller-chosen id. Registering twice is harmless.
    pub async fn register(&self, connection_id: ConnectionId) -> broadcast::Receiver<ServerEvent> {
        // subscribe first so nothing published after registration is missed
        let receiver = self.fanout.subscribe();
        let mut state = self.state.lock().await;
        if state.registry.register(connection_id) {
            debug!(%connection_id, "Connection registered");
        }
        state.record_gauges();
        receiver
    }

    /// Apply one inbound client event and build the reply for the sender.
    pub async fn handle_event(&self, connection_id: ConnectionId, event: ClientEvent) -> ServerEvent {
        let name = event.name();
        match event {
            ClientEvent::PositionReport(report) => {
                let vehicle_id = report.vehicle_id.clone();
                match self.report_position(connection_id, report).await {
                    Ok(_) => ServerEvent::ack(name, &vehicle_id),
                    Err(e) => ServerEvent::error(Some(name), e.to_string()),
                }
            }
            ClientEvent::TripStart(signal) => {
                let vehicle_id = signal.vehicle_id.clone();
                match self.start_trip(connection_id, signal).await {
                    Ok(()) => ServerEvent::ack(name, &vehicle_id),
                    Err(e) => ServerEvent::error(Some(name), e.to_string()),
                }
            }
            ClientEvent::TripStop(signal) => {
                let vehicle_id = signal.vehicle_id.clone();
                match self.stop_trip(connection_id, signal).await {
                    Ok(()) => ServerEvent::ack(name, &vehicle_id),
                    Err(e) => ServerEvent::error(Some(name), e.to_string()),
                }
            }
            ClientEvent::QueryActiveVehicles => {
                ServerEvent::ActiveVehiclesList(self.subscriber_query(connection_id).await)
            }
        }
    }

    /// Accept a position report: bind the producer, store the snapshot and fan it out.
    #[tracing::instrument(skip(self, report), fields(vehicle_id = %report.vehicle_id))]
    pub async fn report_position(
        &self,
        connection_id: ConnectionId,
        report: VehiclePositionReport,
    ) -> Result<VehicleSnapshot, RelayError> {
        if let Err(e) = report.validate() {
            metrics::counter!("relay.reports.rejected_total").increment(1);
            info!(%connection_id, "Rejected position report: {}", e);
            return Err(e.into());
        }

        let received_at = Utc::now();
        let vehicle_id = report.vehicle_id.clone();
        let mut state = self.state.lock().await;

        if !state.registry.owns(connection_id, &vehicle_id) {
            let binding = state
                .registry
                .bind_as_producer(connection_id, &vehicle_id)
                .ok_or(RelayError::UnknownConnection(connection_id))?;

            if let Some(evicted) = binding.evicted {
                metrics::counter!("relay.ownership.takeover_total").increment(1);
                info!(
                    %connection_id,
                    previous_owner = %evicted,
                    "Producer took over vehicle {}", vehicle_id
                );
            }

            if let Some(released) = binding.released {
                let owned_snapshot = state
                    .store
                    .get(&released)
                    .is_some_and(|s| s.owner_connection_id == connection_id);
                info!(%connection_id, "Producer switched from vehicle {} to {}", released, vehicle_id);
                // a vehicle already taken offline by trip-stop gets no second event
                if owned_snapshot && state.store.remove(&released).is_some() {
                    self.publish(ServerEvent::VehicleOffline {
                        vehicle_id: released,
                    });
                }
            }
        }

        let snapshot = state.store.upsert(report, connection_id, received_at);
        metrics::counter!("relay.reports.accepted_total").increment(1);
        self.publish(ServerEvent::VehicleUpdated(snapshot.clone()));
        state.record_gauges();

        Ok(snapshot)
    }

    /// Mark the producer's vehicle as on a trip.
    pub async fn start_trip(
        &self,
        connection_id: ConnectionId,
        signal: TripSignal,
    ) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        Self::ensure_owner(&state.registry, connection_id, &signal.vehicle_id)?;

        let now = Utc::now();
        state
            .store
            .set_lifecycle_state(&signal.vehicle_id, LifecycleState::Active, now)
            .ok_or_else(|| RelayError::VehicleOffline(signal.vehicle_id.clone()))?;

        info!(%connection_id, "Trip started for vehicle {}", signal.vehicle_id);
        self.publish(ServerEvent::VehicleTripStarted {
            vehicle_id: signal.vehicle_id,
            timestamp: signal.timestamp.unwrap_or(now),
        });
        Ok(())
    }

    /// End the producer's trip; the vehicle goes offline until it reports again.
    pub async fn stop_trip(
        &self,
        connection_id: ConnectionId,
        signal: TripSignal,
    ) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        Self::ensure_owner(&state.registry, connection_id, &signal.vehicle_id)?;

        state.store.remove(&signal.vehicle_id);
        info!(%connection_id, "Trip stopped for vehicle {}", signal.vehicle_id);
        self.publish(ServerEvent::VehicleTripStopped {
            vehicle_id: signal.vehicle_id,
        });
        state.record_gauges();
        Ok(())
    }

    /// Drop a connection. If it owned a live vehicle, that vehicle goes offline.
    ///
    /// Returns the id of the vehicle taken offline, if any. A vehicle whose trip
    /// was already stopped stays silent.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Option<String> {
        let mut state = self.state.lock().await;
        let record = state.registry.unregister(connection_id);
        state.record_gauges();

        let ConnectionRecord {
            owned_vehicle_id: Some(vehicle_id),
            ..
        } = record?
        else {
            debug!(%connection_id, "Connection closed without a vehicle");
            return None;
        };

        if let Some(snapshot) = state.store.get(&vehicle_id)
            && snapshot.owner_connection_id != connection_id
        {
            metrics::counter!("relay.consistency.repaired_total").increment(1);
            warn!(
                %connection_id,
                snapshot_owner = %snapshot.owner_connection_id,
                "Registry and snapshot disagree on owner of vehicle {}, taking it offline",
                vehicle_id
            );
        }

        if state.store.remove(&vehicle_id).is_none() {
            debug!(%connection_id, "Producer disconnected, vehicle {} was already offline", vehicle_id);
            return None;
        }

        info!(%connection_id, "Producer disconnected, vehicle {} offline", vehicle_id);
        self.publish(ServerEvent::VehicleOffline {
            vehicle_id: vehicle_id.clone(),
        });
        state.record_gauges();

        Some(vehicle_id)
    }

    /// Remove every snapshot whose owner no longer claims it.
    ///
    /// Returns the vehicles that were taken offline.
    pub async fn reconcile(&self) -> Vec<String> {
        let mut guard = self.state.lock().await;
        let RelayState { registry, store } = &mut *guard;

        let orphaned: Vec<String> = store
            .get_all()
            .filter(|s| !registry.owns(s.owner_connection_id, &s.vehicle_id))
            .map(|s| s.vehicle_id.clone())
            .collect();

        for vehicle_id in &orphaned {
            store.remove(vehicle_id);
            metrics::counter!("relay.consistency.repaired_total").increment(1);
            warn!("Vehicle {} has no owning connection, taking it offline", vehicle_id);
            self.publish(ServerEvent::VehicleOffline {
                vehicle_id: vehicle_id.clone(),
            });
        }

        guard.record_gauges();
        orphaned
    }

    /// Point-in-time copy of every live vehicle, ordered by vehicle id.
    pub async fn query_active_vehicles(&self) -> Vec<VehicleSnapshot> {
        let state = self.state.lock().await;
        state.store.get_all().cloned().collect()
    }

    /// Same as [`Self::query_active_vehicles`], also recording the caller as a subscriber.
    pub async fn subscriber_query(&self, connection_id: ConnectionId) -> Vec<VehicleSnapshot> {
        let mut state = self.state.lock().await;
        state.registry.mark_subscriber(connection_id);
        state.store.get_all().cloned().collect()
    }

    pub async fn get_vehicle(&self, vehicle_id: &str) -> Option<VehicleSnapshot> {
        let state = self.state.lock().await;
        state.store.get(vehicle_id).cloned()
    }

    pub async fn connection(&self, connection_id: ConnectionId) -> Option<ConnectionRecord> {
        let state = self.state.lock().await;
        state.registry.get(connection_id).cloned()
    }

    pub async fn stats(&self) -> RelayStats {
        let state = self.state.lock().await;
        RelayStats {
            connections: state.registry.len(),
            producers: state.registry.producer_count(),
            active_vehicles: state.store.len(),
        }
    }

    /// Extra receiver on the fan-out channel (used by tests and diagnostics).
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.fanout.subscribe()
    }

    fn ensure_owner(
        registry: &ConnectionRegistry,
        connection_id: ConnectionId,
        vehicle_id: &str,
    ) -> Result<(), RelayError> {
        if registry.get(connection_id).is_none() {
            return Err(RelayError::UnknownConnection(connection_id));
        }
        if !registry.owns(connection_id, vehicle_id) {
            return Err(RelayError::NotOwner(vehicle_id.to_string()));
        }
        Ok(())
    }

    fn publish(&self, event: ServerEvent) {
        let name = event.name();
        match self.fanout.send(event) {
            Ok(receiver_count) => {
                metrics::counter!("relay.fanout.published_total").increment(1);
                debug!("Broadcast {} to {} receivers", name, receiver_count);
            }
            Err(broadcast::error::SendError(_)) => {
                debug!("No connected clients, {} dropped", name);
            }
        }
    }
}
