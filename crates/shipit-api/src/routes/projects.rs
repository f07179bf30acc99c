//! Build submission and status endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use shipit_core::{BuildId, Job};
use std::collections::BTreeMap;
use tracing::{error, info};

use crate::AppState;
use crate::error::ApiError;

/// Upper bound for `GET /project?limit=`.
const MAX_LIST_LIMIT: i64 = 200;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/project", post(submit_project).get(list_projects))
        .route("/project/{id}", get(get_project))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    #[serde(default, alias = "buildId")]
    build_id: Option<String>,
    #[serde(default, alias = "repoUrl")]
    repo_url: Option<String>,
    #[serde(default, alias = "userId")]
    user_id: Option<String>,
    #[serde(default, alias = "envVars")]
    env_vars: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuedData {
    build_id: String,
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    status: &'static str,
    data: QueuedData,
}

impl SubmitRequest {
    /// Turn the request into a new job, rejecting anything malformed.
    fn into_job(self) -> Result<Job, ApiError> {
        let repo_url = self
            .repo_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ApiError::BadRequest("repo_url is required".to_string()))?;
        url::Url::parse(&repo_url)
            .map_err(|e| ApiError::BadRequest(format!("repo_url is not a valid URL: {}", e)))?;

        let id = match self.build_id.as_deref().map(str::trim) {
            None | Some("") => BuildId::generate(),
            Some(raw) => BuildId::parse(raw)?,
        };

        Ok(Job::new(
            id,
            repo_url,
            self.user_id,
            self.env_vars.unwrap_or_default(),
        ))
    }
}

async fn submit_project(
    State(state): State<AppState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let job = request.into_job()?;

    state.store.insert(&job).await.map_err(|e| match e {
        shipit_db::DbError::Duplicate(_) => {
            ApiError::Conflict(format!("build {} already exists", job.id))
        }
        other => {
            error!(job_id = %job.id, error = %other, "Failed to store job");
            ApiError::QueueFailed(other.to_string())
        }
    })?;

    if let Err(e) = state.queue.enqueue(&job.id, 1).await {
        error!(job_id = %job.id, error = %e, "Failed to enqueue job");
        return Err(e.into());
    }

    info!(job_id = %job.id, repo_url = %job.repo_url, "Job queued");
    Ok(Json(SubmitResponse {
        status: "queued",
        data: QueuedData {
            build_id: job.id.to_string(),
            message: "Job successfully queued",
        },
    }))
}

async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id = BuildId::parse(&id)?;
    let job = state.store.get(&id).await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

async fn list_projects(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, MAX_LIST_LIMIT);
    let jobs = state.store.list(limit).await?;
    Ok(Json(jobs))
}
