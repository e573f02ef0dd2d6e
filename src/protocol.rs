//! Wire protocol for the live vehicle socket.
//!
//! Every frame is a JSON text message shaped `{"event": "<name>", "data": <payload>}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vehicle_position::{ConnectionId, VehiclePositionReport, VehicleSnapshot};

/// Trip start/stop signal from a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripSignal {
    pub vehicle_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Events a client may send to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    PositionReport(VehiclePositionReport),
    TripStart(TripSignal),
    TripStop(TripSignal),
    QueryActiveVehicles,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::PositionReport(_) => "position-report",
            ClientEvent::TripStart(_) => "trip-start",
            ClientEvent::TripStop(_) => "trip-stop",
            ClientEvent::QueryActiveVehicles => "query-active-vehicles",
        }
    }
}

/// Events the relay sends, either fanned out to everyone or as a direct reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// First frame on every connection
    Connected { connection_id: ConnectionId },
    VehicleUpdated(VehicleSnapshot),
    VehicleTripStarted {
        vehicle_id: String,
        timestamp: DateTime<Utc>,
    },
    VehicleTripStopped { vehicle_id: String },
    VehicleOffline { vehicle_id: String },
    ActiveVehiclesList(Vec<VehicleSnapshot>),
    Ack { event: String, vehicle_id: String },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        reason: String,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::VehicleUpdated(_) => "vehicle-updated",
            ServerEvent::VehicleTripStarted { .. } => "vehicle-trip-started",
            ServerEvent::VehicleTripStopped { .. } => "vehicle-trip-stopped",
            ServerEvent::VehicleOffline { .. } => "vehicle-offline",
            ServerEvent::ActiveVehiclesList(_) => "active-vehicles-list",
            ServerEvent::Ack { .. } => "ack",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn ack(event: &str, vehicle_id: &str) -> Self {
        ServerEvent::Ack {
            event: event.to_string(),
            vehicle_id: vehicle_id.to_string(),
        }
    }

    pub fn error(event: Option<&str>, reason: impl Into<String>) -> Self {
        ServerEvent::Error {
            event: event.map(str::to_string),
            reason: reason.into(),
        }
    }
}
