//! Research task endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use super::routes::AppState;
use crate::llm::ProviderKind;
use crate::publish::{tracking_url, TrackingParams};
use crate::research::{
    DerivedState, ResearchError, ResearchTask, Step, StepFailure, StepStatus, StopAck,
    TaskHandle, STEP_TOTAL,
};
use crate::subjects::SubjectError;

type ApiError = (StatusCode, String);

fn research_error(e: ResearchError) -> ApiError {
    let status = match &e {
        ResearchError::AlreadyRunning(_) | ResearchError::NothingToResume(_) => {
            StatusCode::CONFLICT
        }
        ResearchError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        ResearchError::ProviderNotConfigured(_) => StatusCode::BAD_REQUEST,
        ResearchError::Store(err) => {
            tracing::error!("Task store error: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub subject_id: i64,
    pub provider: ProviderKind,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Deserialize)]
pub struct SubjectRequest {
    pub subject_id: i64,
}

#[derive(Debug, Serialize)]
pub struct StepView {
    pub index: u8,
    pub label: &'static str,
    pub status: StepStatus,
    pub output: Option<String>,
    pub error: Option<StepFailure>,
    pub truncated: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub subject_id: i64,
    pub provider: ProviderKind,
    pub state: DerivedState,
    pub step_total: u8,
    pub steps: Vec<StepView>,
    pub report_url: Option<String>,
    pub report_published_at: Option<DateTime<Utc>>,
    pub publish_error: Option<String>,
    pub cost_cents: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<ResearchTask> for StatusResponse {
    fn from(task: ResearchTask) -> Self {
        let state = task.derived_state();
        let steps = Step::ALL
            .into_iter()
            .zip(task.steps)
            .map(|(step, s)| StepView {
                index: step.index(),
                label: step.label(),
                status: s.status,
                output: s.output,
                error: s.error,
                truncated: s.truncated,
            })
            .collect();
        Self {
            subject_id: task.subject_id,
            provider: task.provider,
            state,
            step_total: STEP_TOTAL,
            steps,
            report_url: task.report_url,
            report_published_at: task.report_published_at,
            publish_error: task.publish_error,
            cost_cents: task.cost_cents,
            updated_at: task.updated_at,
        }
    }
}

pub async fn start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRequest>,
) -> Result<(StatusCode, Json<TaskHandle>), ApiError> {
    let handle = state
        .supervisor
        .start(req.subject_id, req.provider, req.force_refresh)
        .await
        .map_err(research_error)?;
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

pub async fn resume(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubjectRequest>,
) -> Result<(StatusCode, Json<TaskHandle>), ApiError> {
    let handle = state
        .supervisor
        .resume(req.subject_id)
        .await
        .map_err(research_error)?;
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

pub async fn stop(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubjectRequest>,
) -> Result<Json<StopAck>, ApiError> {
    state
        .supervisor
        .stop(req.subject_id)
        .await
        .map(Json)
        .map_err(research_error)
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<i64>,
) -> Result<Json<StatusResponse>, ApiError> {
    let task = state
        .supervisor
        .status(subject_id)
        .await
        .map_err(research_error)?;
    Ok(Json(task.into()))
}

#[derive(Debug, Deserialize)]
pub struct TrackingQuery {
    pub recipient: String,
    pub campaign: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TrackingResponse {
    pub url: String,
}

pub async fn tracking(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<i64>,
    Query(query): Query<TrackingQuery>,
) -> Result<Json<TrackingResponse>, ApiError> {
    if query.recipient.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "recipient is required".to_string()));
    }

    let task = state
        .supervisor
        .status(subject_id)
        .await
        .map_err(research_error)?;
    let Some(report_url) = task.report_url else {
        return Err((
            StatusCode::CONFLICT,
            format!("report for subject {} is not published", subject_id),
        ));
    };

    let subject = state.subjects.get(subject_id).await.map_err(|e| match e {
        SubjectError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        SubjectError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    })?;

    let defaults = &state.config.tracking;
    let params = TrackingParams {
        campaign: query.campaign.unwrap_or_else(|| defaults.campaign.clone()),
        content: query.content.unwrap_or_else(|| defaults.content.clone()),
        ..defaults.clone()
    };

    let url = tracking_url(&report_url, &subject.name, &query.recipient, &params).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("stored report url is invalid: {}", e),
        )
    })?;
    Ok(Json(TrackingResponse { url }))
}

/// Push stream of progress events.
pub async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.supervisor.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse = Event::default()
                        .event("progress")
                        .json_data(&event)
                        .unwrap_or_else(|_| Event::default().event("progress"));
                    yield Ok(sse);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Progress subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
