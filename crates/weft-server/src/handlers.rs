use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use weft_core::ids::{AgentName, InstanceId, SessionId, SessionKey};
use weft_core::WeftError;
use weft_runtime::RaiseAck;

use crate::server::AppState;

/// JSON error envelope: `{"error": …, "retryable": …}` with a status code
/// matched to the error class.
pub struct ApiError(WeftError);

impl From<WeftError> for ApiError {
    fn from(e: WeftError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WeftError::UnknownAgent(_)
            | WeftError::UnknownOrchestration(_)
            | WeftError::UnknownInstance(_) => StatusCode::NOT_FOUND,
            WeftError::Busy(_) => StatusCode::TOO_MANY_REQUESTS,
            WeftError::Adapter(_) => StatusCode::BAD_GATEWAY,
            WeftError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            WeftError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.0.to_string(),
            "retryable": self.0.retryable(),
        });
        (status, Json(body)).into_response()
    }
}

/// POST /agents/{agent}/sessions/{session}/run
pub async fn run_session(
    State(state): State<AppState>,
    Path((agent, session)): Path<(String, String)>,
    Json(input): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let key = SessionKey::new(AgentName::new(agent), SessionId::from_raw(session));
    let output = state.dispatcher.run(&key, input).await?;
    Ok(Json(json!({ "output": output })))
}

/// POST /orchestrations/{name}
pub async fn start_orchestration(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(input): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state.engine.start_instance(&name, input).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "instanceId": id }))))
}

/// GET /instances/{id}
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let row = state.engine.instance(&InstanceId::from_raw(id))?;
    Ok(Json(json!({
        "instanceId": row.id,
        "orchestration": row.orchestration,
        "status": row.status,
        "output": row.output,
        "error": row.error,
        "customStatus": row.custom_status,
        "lastUpdated": row.updated_at,
    })))
}

/// POST /instances/{id}/events/{name}
pub async fn raise_event(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let ack = state
        .bus
        .raise(&InstanceId::from_raw(id), &name, payload)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": ack == RaiseAck::Accepted })),
    ))
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}
