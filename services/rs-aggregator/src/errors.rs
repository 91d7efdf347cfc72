//!
//! src/errors.rs  Andrew Belles  Oct 2nd, 2025
//!
//! Defines enums and methods of error conversion
//! for errors the aggregator uses, and how they are rendered over http
//!
//!

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("config error: {0}")]
    Config(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("malformed upstream response: {0}")]
    MalformedUpstream(String),
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error)
}

impl AggregatorError {
    /// Short machine readable code used in json error bodies
    pub fn code(&self) -> &'static str {
        match self {
            AggregatorError::Config(_)              => "CONFIG_ERROR",
            AggregatorError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            AggregatorError::RateLimited(_)         => "RATE_LIMITED",
            AggregatorError::MalformedUpstream(_)   => "MALFORMED_UPSTREAM",
            AggregatorError::CacheUnavailable(_)    => "CACHE_UNAVAILABLE",
            AggregatorError::Db(_)                  => "DB_ERROR",
            AggregatorError::Io(_)                  => "IO_ERROR",
        }
    }
}

impl From<reqwest::Error> for AggregatorError {
    fn from(e: reqwest::Error) -> Self {
        AggregatorError::UpstreamUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for AggregatorError {
    fn from(e: serde_json::Error) -> Self {
        AggregatorError::MalformedUpstream(e.to_string())
    }
}

impl From<sqlx::Error> for AggregatorError {
    fn from(e: sqlx::Error) -> Self { AggregatorError::Db(e.to_string()) }
}

impl IntoResponse for AggregatorError {
    fn into_response(self) -> Response {
        let status = StatusCode::INTERNAL_SERVER_ERROR;

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}
