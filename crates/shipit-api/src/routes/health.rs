//! Health check endpoints.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use serde_json::{Value, json};
use tracing::warn;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready once the dispatch queue answers; reports its depth.
async fn ready(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let depth = state.queue.depth().await.map_err(|e| {
        warn!(error = %e, "Readiness check failed");
        ApiError::Unavailable(format!("dispatch queue unavailable: {}", e))
    })?;

    Ok(Json(json!({
        "status": "ready",
        "queue": {
            "backend": state.queue.name(),
            "depth": depth,
        },
        "bus": state.bus.name(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use shipit_core::{BuildId, Job};
    use shipit_db::{JobStore, MemoryJobStore};
    use shipit_scheduler::{DispatchQueue, InMemoryLogBus, MemoryDispatchQueue, RetryPolicy};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_ready_reports_queue_depth() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryDispatchQueue::new(RetryPolicy::default()));
        for raw in ["a", "b"] {
            let job = Job::new(
                BuildId::parse(raw).unwrap(),
                "https://x.test/r.git",
                None,
                BTreeMap::new(),
            );
            store.insert(&job).await.unwrap();
            queue.enqueue(&job.id, 1).await.unwrap();
        }
        let app = crate::routes::router(AppState::new(
            store,
            queue,
            Arc::new(InMemoryLogBus::default()),
        ));

        let response = app
            .clone()
            .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["queue"]["depth"], 2);
        assert_eq!(body["queue"]["backend"], "memory");

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
