pub mod live_vehicles;
pub mod status;
pub mod vehicles;

pub use live_vehicles::*;
pub use status::*;
pub use vehicles::*;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

/// Envelope for single-item responses
#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

/// Envelope for list responses
#[derive(Debug, Serialize)]
pub struct DataListResponse<T> {
    pub data: Vec<T>,
}

pub fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "errors": message }))).into_response()
}
