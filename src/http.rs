//! HTTP surface: `/register/`, `/api/` and `/health`

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{bridge::Bridge, error::BridgeError, headers::AmiField};

/// Query key carrying the session token.
pub const TOKEN_PARAM: &str = "token";
/// Query key carrying the display name on registration.
pub const NAME_PARAM: &str = "name";

/// Query string in request order. Repeated keys are kept.
type Params = Vec<(String, String)>;

fn param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Error returned to HTTP callers as a plain-text body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        let status = match &err {
            BridgeError::UnknownSession { .. } => StatusCode::NOT_FOUND,
            BridgeError::QueueFull | BridgeError::DispatcherStopped => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BridgeError::ReplyTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::Protocol { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

/// Build the router over a shared bridge.
pub fn router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/register/", get(register))
        .route("/api/", get(api))
        .route("/health", get(health))
        .with_state(bridge)
}

/// `GET /register/?token=<token>&name=<name>`: body is the session token.
pub async fn register(
    State(bridge): State<Arc<Bridge>>,
    Query(params): Query<Params>,
) -> String {
    let name = param(&params, NAME_PARAM).unwrap_or_default();
    let session = bridge
        .register(param(&params, TOKEN_PARAM), name)
        .await;
    session
        .token()
        .to_string()
}

/// `GET /api/?token=<token>&Action=<action>&<Key>=<Value>...`
///
/// Every parameter other than `token` and `Action` becomes a command field.
/// Body is the session's buffered records, terminated by a blank line.
pub async fn api(
    State(bridge): State<Arc<Bridge>>,
    Query(params): Query<Params>,
) -> Result<String, ApiError> {
    let action = param(&params, AmiField::Action.as_str())
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing Action parameter"))?;
    let token = param(&params, TOKEN_PARAM).unwrap_or_default();

    let fields = params
        .iter()
        .filter(|(k, _)| k != TOKEN_PARAM && k != AmiField::Action.as_str())
        .map(|(k, v)| (k.clone(), v.as_str()));

    debug!("[HTTP] {} for {}", action, token);
    let events = bridge
        .action(token, action, fields)
        .await
        .map_err(|e| {
            warn!("[HTTP] {} for {} failed: {}", action, token, e);
            ApiError::from(e)
        })?;
    Ok(events.text)
}

/// `GET /health`
pub async fn health() -> &'static str {
    "ok"
}
