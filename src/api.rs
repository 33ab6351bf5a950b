//! HTTP surface
//!
//! `GET /views/:view_name` queries a view (or queues an export) and
//! `GET /jobs/:job_id` polls an export's status.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::error;

use crate::error::Error;
use crate::format::{render, OutputFormat, Rendered};
use crate::jobs::{JobRecord, JobStatusStore};
use crate::query::QueryRequest;
use crate::router::{QueryRouter, Routed};

#[derive(Clone)]
pub struct AppState {
    pub router: QueryRouter,
    pub jobs: Arc<dyn JobStatusStore>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/views/:view_name", get(query_view))
        .route("/jobs/:job_id", get(job_status))
        .with_state(state)
}

/// Raw query string of a view request
#[derive(Debug, Default, Deserialize)]
pub struct ViewParams {
    pub select: Option<String>,
    pub filters: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub format: Option<String>,
    pub debug: Option<String>,
}

fn bad_param(name: &str, reason: impl Into<String>) -> Error {
    Error::invalid_value(name, reason)
}

fn parse_count(name: &str, value: Option<String>) -> Result<Option<u64>, Error> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| bad_param(name, format!("expected a non-negative integer, got {v:?}")))
        })
        .transpose()
}

fn parse_select(value: Option<String>) -> Result<Option<Vec<String>>, Error> {
    let Some(raw) = value.filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    if raw.trim_start().starts_with('[') {
        let columns: Vec<String> = serde_json::from_str(&raw)
            .map_err(|e| bad_param("select", format!("expected a JSON list of names: {e}")))?;
        Ok(Some(columns))
    } else {
        Ok(Some(vec![raw.trim().to_string()]))
    }
}

fn parse_filters(value: Option<String>) -> Result<Option<Map<String, Value>>, Error> {
    let Some(raw) = value.filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(filters)) => Ok(Some(filters)),
        Ok(Value::Null) => Ok(None),
        Ok(_) => Err(bad_param("filters", "expected a JSON object")),
        Err(e) => Err(bad_param("filters", format!("invalid JSON: {e}"))),
    }
}

fn parse_flag(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("true" | "1" | "yes" | "t")
    )
}

/// Turn raw query parameters into a request and an output format
pub fn parse_request(view: String, params: ViewParams) -> Result<(QueryRequest, OutputFormat), Error> {
    let format = OutputFormat::parse(params.format.as_deref().unwrap_or("json"));
    let request = QueryRequest {
        view,
        select: parse_select(params.select)?,
        filters: parse_filters(params.filters)?,
        limit: parse_count("limit", params.limit)?,
        offset: parse_count("offset", params.offset)?,
        debug: parse_flag(params.debug.as_deref()),
    };
    Ok((request, format))
}

async fn query_view(
    State(state): State<AppState>,
    Path(view_name): Path<String>,
    Query(params): Query<ViewParams>,
) -> Result<Response, ApiError> {
    let (request, format) = parse_request(view_name, params)?;
    match state.router.handle(&request).await? {
        Routed::Job { job_id } => Ok(Json(json!({ "job_id": job_id })).into_response()),
        Routed::Rows(rows) => Ok(render(&rows, format, &request.view)?.into_response()),
    }
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.jobs.get(&job_id).await?))
}

impl IntoResponse for Rendered {
    fn into_response(self) -> Response {
        let mut response = (
            [(header::CONTENT_TYPE, HeaderValue::from_static(self.content_type))],
            self.body,
        )
            .into_response();
        if let Some(filename) = self.filename {
            if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
                response.headers_mut().insert(header::CONTENT_DISPOSITION, value);
            }
        }
        response
    }
}

/// Maps the error taxonomy onto HTTP statuses
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        if self.0.is_client_error() {
            StatusCode::BAD_REQUEST
        } else if self.0.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
