//! bustrack - live bus position relay
//!
//! Drivers stream GPS reports over a WebSocket; the relay keeps the latest
//! position of every live vehicle in memory and fans each change out to all
//! connected passenger and admin clients. Late joiners ask for the current
//! snapshot instead of waiting for the next update.

pub mod actions;
pub mod connection_registry;
pub mod log_format;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod relay_config;
pub mod snapshot_store;
pub mod vehicle_position;
pub mod web;

pub use protocol::{ClientEvent, ServerEvent, TripSignal};
pub use relay::{RelayEngine, RelayError, RelayStats};
pub use relay_config::RelayConfig;
pub use vehicle_position::{
    ConnectionId, Coordinates, LifecycleState, ReportError, VehiclePositionReport,
    VehicleSnapshot,
};
