//! HTTP handlers for the lookup API.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::dispatch::Dispatcher;
use crate::error::ProxyError;
use crate::upstream::{NameChange, NameRecord, Profile};

/// Build the `/v1` router over a dispatcher.
pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/v1", get(version))
        .route("/v1/profile/:name", get(lookup_profile))
        .route("/v1/profile/:name/history", get(lookup_history))
        .route("/v1/name/:name", get(lookup_identifier))
        .route("/v1/name", post(lookup_identifiers))
        .with_state(dispatcher)
}

/// Optional point in time, in epoch seconds.
#[derive(Debug, Default, Deserialize)]
pub struct AtQuery {
    pub at: Option<i64>,
}

impl AtQuery {
    fn timestamp(&self) -> Result<Option<DateTime<Utc>>, ProxyError> {
        self.at
            .map(|secs| {
                DateTime::from_timestamp(secs, 0)
                    .ok_or_else(|| ProxyError::InvalidRequest(format!("timestamp out of range: {secs}")))
            })
            .transpose()
    }
}

/// Unpack `?at=`, reporting a malformed query like any other bad request.
fn requested_at(query: Result<Query<AtQuery>, QueryRejection>) -> Result<Option<DateTime<Utc>>, ProxyError> {
    let Query(query) = query.map_err(|e| ProxyError::InvalidRequest(e.body_text()))?;
    query.timestamp()
}

/// Service name and version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub name: String,
    pub version: String,
    pub vendor: String,
}

impl ServerVersion {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            vendor: env!("CARGO_PKG_AUTHORS").to_string(),
        }
    }
}

async fn version() -> Json<ServerVersion> {
    Json(ServerVersion::current())
}

#[instrument(skip(dispatcher))]
async fn lookup_profile(
    State(dispatcher): State<Dispatcher>,
    Path(name): Path<String>,
    query: Result<Query<AtQuery>, QueryRejection>,
) -> Result<Json<Profile>, ApiError> {
    let at = requested_at(query)?;
    Ok(Json(dispatcher.lookup_profile(&name, at).await?))
}

#[instrument(skip(dispatcher))]
async fn lookup_history(
    State(dispatcher): State<Dispatcher>,
    Path(name): Path<String>,
) -> Result<Json<Vec<NameChange>>, ApiError> {
    Ok(Json(dispatcher.lookup_name_history(&name).await?))
}

#[instrument(skip(dispatcher))]
async fn lookup_identifier(
    State(dispatcher): State<Dispatcher>,
    Path(name): Path<String>,
    query: Result<Query<AtQuery>, QueryRejection>,
) -> Result<Json<NameRecord>, ApiError> {
    let at = requested_at(query)?;
    Ok(Json(dispatcher.lookup_identifier(&name, at).await?))
}

#[instrument(skip(dispatcher, names), fields(count = names.len()))]
async fn lookup_identifiers(
    State(dispatcher): State<Dispatcher>,
    Json(names): Json<Vec<String>>,
) -> Result<Json<Vec<NameRecord>>, ApiError> {
    Ok(Json(dispatcher.lookup_identifiers(&names).await?))
}

/// JSON error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// A [`ProxyError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ProxyError);

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Http(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamProtocol { .. }
            | ProxyError::InvalidResponse(_)
            | ProxyError::Http(_)
            | ProxyError::Decode(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if self.0.is_client_error() {
            debug!(error = %self.0, status = status.as_u16(), "Lookup rejected");
        } else {
            warn!(error = %self.0, status = status.as_u16(), "Lookup failed");
        }

        let body = ErrorBody {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
