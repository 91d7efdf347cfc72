//!
//! src/api.rs  Andrew Belles  Oct 5th, 2025
//!
//! HTTP surface: one GET route per aggregation plus /health. Bodies are
//! served as the cached json bytes; x-cache says whether they came from the
//! store
//!

use axum::{
    extract::{Query, State},
    http::{header, HeaderName},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::cache::CachedBody;
use crate::errors::AggregatorError;
use crate::policy::Policies;
use crate::types::Identifier;

#[derive(Clone)]
pub struct AppState {
    pub policies: Policies,
    pub started_at: DateTime<Utc>
}

impl AppState {
    pub fn new(policies: Policies) -> Self {
        Self { policies, started_at: Utc::now() }
    }
}

/// Query string shared by the aggregation routes. `nocache` only has to be
/// present, its value is ignored
#[derive(Debug, Default, Deserialize)]
pub struct AggregateQuery {
    pub ids: Option<String>,
    pub subject: Option<String>,
    pub user: Option<String>,
    pub nocache: Option<String>
}

impl AggregateQuery {
    fn ids(&self) -> Vec<Identifier> {
        self.ids.as_deref().map(Identifier::parse_csv).unwrap_or_default()
    }

    fn non_empty(value: &Option<String>) -> Option<Identifier> {
        value.as_deref()
            .filter(|s| !s.is_empty())
            .map(Identifier::from)
    }

    fn bypass(&self) -> bool {
        self.nocache.is_some()
    }
}

fn respond(out: CachedBody) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/json"),
            (HeaderName::from_static("x-cache"), out.lookup.as_str()),
        ],
        out.body
    ).into_response()
}

fn empty_batch() -> Response {
    Json(json!({})).into_response()
}

pub async fn profile_info(State(state): State<AppState>, Query(q): Query<AggregateQuery>)
    -> Result<Response, AggregatorError> {
    let ids = q.ids();
    if ids.is_empty() {
        return Ok(empty_batch());
    }
    Ok(respond(state.policies.profile_info(&ids, q.bypass()).await?))
}

pub async fn recent_tracks(State(state): State<AppState>, Query(q): Query<AggregateQuery>)
    -> Result<Response, AggregatorError> {
    let ids = q.ids();
    if ids.is_empty() {
        return Ok(empty_batch());
    }
    Ok(respond(state.policies.recent_tracks(&ids, q.bypass()).await?))
}

pub async fn compatibility(State(state): State<AppState>, Query(q): Query<AggregateQuery>)
    -> Result<Response, AggregatorError> {
    let ids = q.ids();
    let Some(subject) = AggregateQuery::non_empty(&q.subject) else {
        debug!("compatibility.no_subject");
        return Ok(empty_batch());
    };
    if ids.is_empty() {
        return Ok(empty_batch());
    }
    Ok(respond(state.policies.compatibility(&ids, &subject, q.bypass()).await?))
}

pub async fn stations(State(state): State<AppState>, Query(q): Query<AggregateQuery>)
    -> Result<Response, AggregatorError> {
    Ok(respond(state.policies.stations(q.bypass()).await?))
}

pub async fn user_info(State(state): State<AppState>, Query(q): Query<AggregateQuery>)
    -> Result<Response, AggregatorError> {
    let Some(user) = AggregateQuery::non_empty(&q.user) else {
        return Ok(Json(json!({"lastfmProfileImage": null})).into_response());
    };
    Ok(respond(state.policies.user_info(&user, q.bypass()).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.started_at);
    Json(HealthResponse {
        status: "ok".to_string(),
        module: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds().max(0) as u64
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/aggregate/profile-info", get(profile_info))
        .route("/aggregate/recent-tracks", get(recent_tracks))
        .route("/aggregate/compatibility", get(compatibility))
        .route("/aggregate/stations", get(stations))
        .route("/aggregate/user-info", get(user_info))
        .route("/health", get(health))
        .with_state(state)
}
