//! HTTP surface for the reporter service.
//!
//! The service is built by a construction function that returns plain values
//! (cache, submitter, router); nothing lives in process-wide state, so tests
//! build as many independent reporters as they like. The periodic refresh
//! task holds a weak handle to the cache: dropping the reporter ends the
//! task instead of keeping the cache alive forever.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use vigil_core::audit::AuditWriter;
use vigil_core::clock::SharedClock;
use vigil_core::config::ReporterConfig;
use vigil_core::warehouse::SharedWarehouse;

use crate::cache::{ReferenceCache, RefreshOutcome};
use crate::submit::{SubmitStatus, SubmitTransport, Submitter};

/// A fully wired reporter instance.
pub struct Reporter {
    pub cache: Arc<ReferenceCache>,
    pub submitter: Arc<Submitter>,
}

/// Build a reporter: cache, submitter, and an initial cache load.
pub async fn build_reporter(
    config: &ReporterConfig,
    warehouse: SharedWarehouse,
    transport: Arc<dyn SubmitTransport>,
    clock: SharedClock,
) -> Arc<Reporter> {
    let cache = Arc::new(ReferenceCache::new(
        warehouse.clone(),
        clock.clone(),
        Duration::from_secs_f64(config.cache_miss_timeout_seconds),
        config.stale_threshold_seconds,
    ));
    let submitter = Arc::new(Submitter::new(
        cache.clone(),
        warehouse.clone(),
        AuditWriter::new(warehouse, "control"),
        transport,
        config.retry.clone(),
        clock,
    ));

    cache.refresh(false).await;
    info!(
        refresh_interval = config.refresh_interval_seconds,
        max_retry_attempts = config.retry.max_attempts,
        "reporter initialised"
    );

    Arc::new(Reporter { cache, submitter })
}

/// Periodic background refresh. The task owns only a weak cache handle.
pub fn spawn_refresh_task(
    cache: &Arc<ReferenceCache>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(cache);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(cache) = weak.upgrade() else {
                break;
            };
            cache.refresh(false).await;
        }
    })
}

/// The reporter's HTTP routes.
pub fn router(reporter: Arc<Reporter>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/submit", post(submit))
        .route("/admin/refresh-cache", post(refresh_cache))
        .route("/admin/cache-status", get(cache_status))
        .with_state(reporter)
}

async fn health(
    State(reporter): State<Arc<Reporter>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let cache = reporter.cache.status();
    let healthy = !cache.is_stale;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "cache": cache,
        })),
    )
}

async fn submit(
    State(reporter): State<Arc<Reporter>>,
    body: Option<Json<serde_json::Value>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(Json(event)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "No event data provided"})),
        );
    };
    if !event.is_object() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "No event data provided"})),
        );
    }

    let result = reporter.submitter.submit_event(event).await;
    let code = match result.status {
        // A duplicate is not an error; the caller's event is safely recorded.
        SubmitStatus::Success | SubmitStatus::Duplicate => StatusCode::OK,
        SubmitStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, Json(serde_json::to_value(result).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct RefreshParams {
    force: Option<String>,
}

async fn refresh_cache(
    State(reporter): State<Arc<Reporter>>,
    Query(params): Query<RefreshParams>,
) -> (StatusCode, Json<serde_json::Value>) {
    let force = params
        .force
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let outcome = reporter.cache.refresh(force).await;
    let code = match outcome {
        RefreshOutcome::Success { .. } => StatusCode::OK,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, Json(serde_json::to_value(outcome).unwrap_or_default()))
}

async fn cache_status(State(reporter): State<Arc<Reporter>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(reporter.cache.status()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submit::{TransportFailure, TransportResponse};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use vigil_core::clock::SystemClock;
    use vigil_core::config::RetryConfig;
    use vigil_core::warehouse::memory::MemoryWarehouse;

    struct OkTransport;

    #[async_trait]
    impl SubmitTransport for OkTransport {
        async fn post(
            &self,
            _payload: &serde_json::Value,
            _idempotency_key: &str,
        ) -> Result<TransportResponse, TransportFailure> {
            Ok(TransportResponse {
                status: 200,
                body: json!({"reference": "R-1"}),
            })
        }
    }

    async fn reporter() -> Arc<Reporter> {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.seed("snapshots.traders_snapshot", vec![]).await;
        wh.seed("snapshots.counterparties_snapshot", vec![]).await;
        wh.seed("curation.dim_instrument", vec![]).await;
        wh.seed("snapshots.books_snapshot", vec![]).await;

        let config = ReporterConfig {
            regulator_api_url: "https://reg.example/submit".into(),
            regulator_api_key: String::new(),
            refresh_interval_seconds: 300,
            cache_miss_timeout_seconds: 1.0,
            stale_threshold_seconds: 600,
            retry: RetryConfig {
                max_attempts: 2,
                initial_delay_seconds: 0.001,
                max_delay_seconds: 0.002,
                exponential_base: 2.0,
            },
            port: 0,
        };
        build_reporter(&config, wh, Arc::new(OkTransport), Arc::new(SystemClock)).await
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_fresh_cache() {
        let app = router(reporter().await);
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["cache"]["is_stale"], false);
    }

    #[tokio::test]
    async fn submit_then_duplicate_over_http() {
        let app = router(reporter().await);
        let event = json!({"source_system": "MX", "source_event_id": "T1"});

        let (status, body) = call(&app, "POST", "/submit", Some(event.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        let event_id = body["event_id"].as_str().unwrap().to_string();
        assert_eq!(body["regulator_reference"], "R-1");

        let (status, body) = call(&app, "POST", "/submit", Some(event)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "duplicate");
        assert_eq!(body["event_id"], event_id.as_str());
        assert!(body.get("regulator_reference").is_none());
    }

    #[tokio::test]
    async fn submit_without_body_is_bad_request() {
        let app = router(reporter().await);
        let (status, body) = call(&app, "POST", "/submit", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No event data provided");
    }

    #[tokio::test]
    async fn admin_endpoints_round_trip() {
        let app = router(reporter().await);

        let (status, body) = call(&app, "POST", "/admin/refresh-cache?force=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");

        let (status, body) = call(&app, "GET", "/admin/cache-status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["last_refresh"].is_string());
        assert_eq!(body["counts"]["traders"], 0);
    }
}
