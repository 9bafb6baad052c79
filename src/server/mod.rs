//! HTTP front-end for upstream schedulers.
//!
//! A thin adapter: deserialise the upstream request, validate that the
//! host and weight domains match, hand it to the live pipeline for the
//! domain, and return the ordered host list. Everything interesting
//! happens in the pipeline runtime; this module only owns the error-kind
//! to status-code mapping.
//!
//! Routes: `POST /scheduler/{domain}/external`, `GET /metrics`,
//! `GET /up`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::metrics::kpis::KpiCollector;
use crate::metrics::prometheus::export_metrics;
use crate::scheduling::pipeline::PipelineError;
use crate::scheduling::reloader::PipelineReloader;
use crate::scheduling::request::{Domain, ExternalSchedulerRequest, RequestContext, RequestMeta};

/// Shared state behind the router.
#[derive(Clone)]
pub struct AppState {
    pub reloader: Arc<PipelineReloader<ExternalSchedulerRequest>>,
    pub kpis: Option<Arc<KpiCollector>>,
    pub request_timeout: Duration,
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/scheduler/{domain}/external", post(schedule))
        .route("/metrics", get(metrics))
        .route("/up", get(up))
        .with_state(state)
}

/// Errors surfaced to the upstream scheduler.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Body parse failure or host/weight domain mismatch.
    #[error("{0}")]
    BadRequest(String),

    /// The requested pipeline is not configured.
    #[error("No pipeline '{0}' for this domain")]
    PipelineMissing(String),

    /// The internal deadline expired.
    #[error("Scheduling deadline exceeded")]
    Timeout,

    /// The pipeline could not produce a ranking.
    #[error("Pipeline error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::PipelineMissing(_) => StatusCode::BAD_REQUEST,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// The upstream scheduling request body.
#[derive(Debug, Deserialize)]
pub struct ScheduleBody {
    /// Optional explicit pipeline name; the domain default otherwise.
    #[serde(default)]
    pub pipeline: Option<String>,
    /// Domain-specific request spec, passed through to the steps.
    #[serde(default)]
    pub spec: serde_json::Value,
    /// Request correlation fields.
    #[serde(default)]
    pub context: RequestMeta,
    /// Candidate hosts as `{"<idField>": "<subject>"}` objects.
    pub hosts: Vec<serde_json::Value>,
    /// Upstream baseline weights over exactly the hosts.
    pub weights: HashMap<String, f64>,
}

/// The ordered response, best host first.
#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub hosts: Vec<String>,
}

/// Extracts the subject ids from the upstream host objects.
fn parse_hosts(domain: Domain, hosts: &[serde_json::Value]) -> Result<Vec<String>, ApiError> {
    let field = domain.id_field();
    hosts
        .iter()
        .map(|host| {
            host.get(field)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    ApiError::BadRequest(format!("host object is missing the '{}' field", field))
                })
        })
        .collect()
}

async fn schedule(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Json(body): Json<ScheduleBody>,
) -> Result<Json<ScheduleResponse>, ApiError> {
    let domain: Domain = domain
        .parse()
        .map_err(|e: crate::scheduling::request::RequestError| ApiError::BadRequest(e.to_string()))?;

    let subjects = parse_hosts(domain, &body.hosts)?;

    let request = ExternalSchedulerRequest::new(
        domain,
        body.spec,
        body.context,
        subjects,
        body.weights,
    )
    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let request = match body.pipeline {
        Some(pipeline) => request.with_pipeline(pipeline),
        None => request,
    };

    let live = state.reloader.live();
    let pipeline = live
        .resolve(domain, request.pipeline.as_deref())
        .ok_or_else(|| {
            ApiError::PipelineMissing(
                request
                    .pipeline
                    .clone()
                    .unwrap_or_else(|| format!("default for {}", domain)),
            )
        })?;

    let ctx = RequestContext::for_request(&request, state.request_timeout);
    match pipeline.run(&ctx, &request).await {
        Ok(outcome) => {
            info!(
                pipeline = %outcome.pipeline,
                domain = %domain,
                subjects = outcome.ordered_subjects.len(),
                degraded = outcome.degraded,
                "Scheduling request served"
            );
            Ok(Json(ScheduleResponse {
                hosts: outcome.ordered_subjects,
            }))
        }
        // No candidates survive filtering: an empty list is a valid
        // answer, not a failure.
        Err(PipelineError::SubjectsEmpty) => Ok(Json(ScheduleResponse { hosts: Vec::new() })),
        Err(PipelineError::Timeout) => Err(ApiError::Timeout),
        Err(PipelineError::Request(e)) => Err(ApiError::BadRequest(e.to_string())),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

async fn metrics(State(state): State<AppState>) -> String {
    if let Some(kpis) = &state.kpis {
        if let Err(e) = kpis.refresh().await {
            warn!(error = %e, "KPI refresh failed on scrape");
        }
    }
    export_metrics()
}

async fn up() -> &'static str {
    "OK"
}
