//! Status endpoint for build information, uptime and relay counts

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Instant;

use super::DataResponse;
use crate::relay::RelayStats;
use crate::web::AppState;

/// Server start time - initialized on first status request
static SERVER_START_TIME: OnceLock<Instant> = OnceLock::new();

/// Initialize the server start time (call this when the server starts)
pub fn init_server_start_time() {
    SERVER_START_TIME.get_or_init(Instant::now);
}

/// Git version, falling back to the crate version outside a git checkout
pub fn version() -> &'static str {
    option_env!("VERGEN_GIT_DESCRIBE").unwrap_or(env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    pub version: &'static str,
    pub git_commit: Option<&'static str>,
    pub build_timestamp: Option<&'static str>,
    pub uptime_seconds: u64,
    pub uptime_human: String,
    pub relay: RelayStats,
}

/// Format seconds into a human-readable duration string
fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Handler for GET /data/status
#[tracing::instrument(skip(state))]
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let start_time = SERVER_START_TIME.get_or_init(Instant::now);
    let uptime_seconds = start_time.elapsed().as_secs();

    let status = StatusInfo {
        version: version(),
        git_commit: option_env!("VERGEN_GIT_SHA"),
        build_timestamp: option_env!("VERGEN_BUILD_TIMESTAMP"),
        uptime_seconds,
        uptime_human: format_duration(uptime_seconds),
        relay: state.relay.stats().await,
    };

    (StatusCode::OK, Json(DataResponse { data: status }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration_seconds() {
        assert_eq!(format_duration(45), "45s");
    }

    #[test]
    fn test_format_duration_minutes() {
        assert_eq!(format_duration(125), "2m 5s");
    }

    #[test]
    fn test_format_duration_days() {
        assert_eq!(format_duration(90125), "1d 1h 2m 5s");
    }

    #[test]
    fn test_version_is_never_empty() {
        assert!(!version().is_empty());
    }
}
