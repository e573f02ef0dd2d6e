//! Vehicle position data model.
//!
//! A [`VehiclePositionReport`] is what a driver client sends; it is never
//! persisted, only validated, folded into the snapshot store and relayed.
//! A [`VehicleSnapshot`] is the latest accepted report for one vehicle plus
//! the connection currently allowed to update it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Maximum length (in characters) of a waypoint label
pub const MAX_WAYPOINT_LABEL_LEN: usize = 256;

/// Identifier of a single transport session
pub type ConnectionId = Uuid;

/// Longitude/latitude pair, carried on the wire as `[lon, lat]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Coordinates {
    pub longitude: f64,
    pub latitude: f64,
}

impl Coordinates {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }

    pub fn validate(&self) -> Result<(), ReportError> {
        if !self.longitude.is_finite() || !self.latitude.is_finite() {
            return Err(ReportError::NonFiniteCoordinates);
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ReportError::LongitudeOutOfRange(self.longitude));
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ReportError::LatitudeOutOfRange(self.latitude));
        }
        Ok(())
    }
}

impl From<[f64; 2]> for Coordinates {
    fn from([longitude, latitude]: [f64; 2]) -> Self {
        Self::new(longitude, latitude)
    }
}

impl From<Coordinates> for [f64; 2] {
    fn from(c: Coordinates) -> Self {
        [c.longitude, c.latitude]
    }
}

/// Whether the vehicle's driver has started a trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Idle,
    Active,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "idle"),
            LifecycleState::Active => write!(f, "active"),
        }
    }
}

/// Reasons a position report is refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReportError {
    #[error("vehicleId must not be empty")]
    MissingVehicleId,
    #[error("operatorId must not be empty")]
    MissingOperatorId,
    #[error("coordinates must be finite numbers")]
    NonFiniteCoordinates,
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("{field} exceeds 256 characters")]
    WaypointTooLong { field: &'static str },
}

/// Position report as sent by a producer connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclePositionReport {
    pub vehicle_id: String,
    pub operator_id: String,
    pub coordinates: Coordinates,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_waypoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_waypoint: Option<String>,
    #[serde(default)]
    pub lifecycle_state: LifecycleState,
    /// Producer clock; `None` means the receive time is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_at: Option<DateTime<Utc>>,
}

impl VehiclePositionReport {
    /// Check the report before it is allowed anywhere near the snapshot store.
    pub fn validate(&self) -> Result<(), ReportError> {
        if self.vehicle_id.trim().is_empty() {
            return Err(ReportError::MissingVehicleId);
        }
        if self.operator_id.trim().is_empty() {
            return Err(ReportError::MissingOperatorId);
        }
        self.coordinates.validate()?;

        let labels = [
            ("currentWaypoint", &self.current_waypoint),
            ("nextWaypoint", &self.next_waypoint),
        ];
        for (field, label) in labels {
            if let Some(label) = label
                && label.chars().count() > MAX_WAYPOINT_LABEL_LEN
            {
                return Err(ReportError::WaypointTooLong { field });
            }
        }

        Ok(())
    }
}

/// Latest known state of one live vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleSnapshot {
    pub vehicle_id: String,
    pub operator_id: String,
    pub coordinates: Coordinates,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_waypoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_waypoint: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub reported_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub owner_connection_id: ConnectionId,
    pub last_update_at: DateTime<Utc>,
}

impl VehicleSnapshot {
    pub fn from_report(
        report: VehiclePositionReport,
        owner_connection_id: ConnectionId,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            vehicle_id: report.vehicle_id,
            operator_id: report.operator_id,
            coordinates: report.coordinates,
            current_waypoint: report.current_waypoint,
            next_waypoint: report.next_waypoint,
            lifecycle_state: report.lifecycle_state,
            reported_at: report.reported_at.unwrap_or(received_at),
            received_at,
            owner_connection_id,
            last_update_at: received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(lon: f64, lat: f64) -> VehiclePositionReport {
        VehiclePositionReport {
            vehicle_id: "V1".to_string(),
            operator_id: "driver-7".to_string(),
            coordinates: Coordinates::new(lon, lat),
            current_waypoint: None,
            next_waypoint: None,
            lifecycle_state: LifecycleState::Idle,
            reported_at: None,
        }
    }

    #[test]
    fn test_accepts_boundary_coordinates() {
        assert!(report(180.0, 90.0).validate().is_ok());
        assert!(report(-180.0, -90.0).validate().is_ok());
        assert!(report(77.5, 12.9).validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_longitude() {
        assert_eq!(
            report(200.0, 10.0).validate(),
            Err(ReportError::LongitudeOutOfRange(200.0))
        );
    }

    #[test]
    fn test_rejects_out_of_range_latitude() {
        assert_eq!(
            report(10.0, -90.5).validate(),
            Err(ReportError::LatitudeOutOfRange(-90.5))
        );
    }

    #[test]
    fn test_rejects_non_finite_coordinates() {
        assert_eq!(
            report(f64::NAN, 10.0).validate(),
            Err(ReportError::NonFiniteCoordinates)
        );
        assert_eq!(
            report(10.0, f64::INFINITY).validate(),
            Err(ReportError::NonFiniteCoordinates)
        );
    }

    #[test]
    fn test_rejects_blank_ids() {
        let mut r = report(1.0, 1.0);
        r.vehicle_id = "   ".to_string();
        assert_eq!(r.validate(), Err(ReportError::MissingVehicleId));

        let mut r = report(1.0, 1.0);
        r.operator_id = String::new();
        assert_eq!(r.validate(), Err(ReportError::MissingOperatorId));
    }

    #[test]
    fn test_rejects_oversized_waypoint() {
        let mut r = report(1.0, 1.0);
        r.next_waypoint = Some("x".repeat(MAX_WAYPOINT_LABEL_LEN + 1));
        assert_eq!(
            r.validate(),
            Err(ReportError::WaypointTooLong {
                field: "nextWaypoint"
            })
        );
    }

    #[test]
    fn test_report_wire_format() {
        let json = r#"{
            "vehicleId": "V1",
            "operatorId": "driver-7",
            "coordinates": [77.5, 12.9],
            "currentWaypoint": "Majestic",
            "lifecycleState": "active"
        }"#;
        let r: VehiclePositionReport = serde_json::from_str(json).unwrap();
        assert_eq!(r.coordinates, Coordinates::new(77.5, 12.9));
        assert_eq!(r.current_waypoint.as_deref(), Some("Majestic"));
        assert_eq!(r.next_waypoint, None);
        assert_eq!(r.lifecycle_state, LifecycleState::Active);
        assert_eq!(r.reported_at, None);
    }

    #[test]
    fn test_lifecycle_defaults_to_idle() {
        let json = r#"{"vehicleId":"V1","operatorId":"d","coordinates":[0,0]}"#;
        let r: VehiclePositionReport = serde_json::from_str(json).unwrap();
        assert_eq!(r.lifecycle_state, LifecycleState::Idle);
    }

    #[test]
    fn test_snapshot_uses_receive_time_when_unreported() {
        let now = Utc::now();
        let owner = Uuid::new_v4();
        let snapshot = VehicleSnapshot::from_report(report(1.0, 2.0), owner, now);
        assert_eq!(snapshot.reported_at, now);
        assert_eq!(snapshot.received_at, now);
        assert_eq!(snapshot.last_update_at, now);
        assert_eq!(snapshot.owner_connection_id, owner);

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["coordinates"], serde_json::json!([1.0, 2.0]));
        assert_eq!(value["lifecycleState"], "idle");
        assert!(value.get("currentWaypoint").is_none());
    }
}
