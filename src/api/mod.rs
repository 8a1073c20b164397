//! HTTP surface
//!
//! Every response carries a `success` flag. Successful payloads are merged
//! into the envelope (`{"success": true, "newBalance": ...}`); failures become
//! `{"success": false, "error": {"code", "message"}}` with the status code
//! taken from the ledger error.

pub mod handlers;
pub mod routes;

pub use routes::{create_router, AppState};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use crate::error::LedgerError;

#[derive(Debug)]
pub struct ApiError(pub LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Ledger operation failed");
        }
        let body = json!({
            "success": false,
            "error": {
                "code": self.0.error_code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult = Result<Json<Value>, ApiError>;

/// Wrap a payload in the success envelope. Objects are merged; anything else
/// lands under `data`.
pub fn success<T: Serialize>(payload: T) -> ApiResult {
    let value = serde_json::to_value(payload).map_err(LedgerError::from)?;
    let body = match value {
        Value::Object(mut map) => {
            map.insert("success".to_string(), Value::Bool(true));
            Value::Object(map)
        }
        other => json!({ "success": true, "data": other }),
    };
    Ok(Json(body))
}
