use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use tracing::debug;

use super::{DataListResponse, DataResponse, json_error};
use crate::web::AppState;

/// Handler for GET /data/vehicles/active
///
/// Same snapshot a socket client gets from `query-active-vehicles`.
pub async fn get_active_vehicles(State(state): State<AppState>) -> impl IntoResponse {
    let vehicles = state.relay.query_active_vehicles().await;
    debug!("Returning {} active vehicles", vehicles.len());
    Json(DataListResponse { data: vehicles })
}

/// Handler for GET /data/vehicles/active/{vehicle_id}
pub async fn get_active_vehicle(
    Path(vehicle_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.relay.get_vehicle(&vehicle_id).await {
        Some(snapshot) => (StatusCode::OK, Json(DataResponse { data: snapshot })).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "Vehicle is not live").into_response(),
    }
}
