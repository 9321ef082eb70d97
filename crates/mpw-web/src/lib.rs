//! Axum + Askama operational surface: a small dashboard plus the JSON API
//! used by operators and the CLI.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::net::TcpListener;

use mpw_storage::{
    AlertStore, CaseStore, ScheduleStore, SharedStore, SyncQueueStore, WatermarkStore,
};
use mpw_sync::SyncPipeline;

pub const CRATE_NAME: &str = "mpw-web";

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    /// Present when the web surface runs inside the daemon; POST /api/run
    /// is rejected without it.
    pub pipeline: Option<Arc<SyncPipeline>>,
}

impl AppState {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            pipeline: None,
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<SyncPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
struct ScheduleRow {
    source_id: String,
    tier: String,
    interval_minutes: i64,
    next_run_at: String,
    reason: String,
    confidence: f64,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    total_cases: i64,
    pending_operations: i64,
    active_alerts: usize,
    health_score: String,
    schedules: Vec<ScheduleRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/schedules", get(api_schedules_handler))
        .route("/api/sync/pending", get(api_sync_pending_handler))
        .route("/api/sync/status", get(api_sync_status_handler))
        .route("/api/alerts", get(api_alerts_handler))
        .route("/api/health", get(api_health_handler))
        .route("/api/run", post(api_run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let data = async {
        let total_cases = state.store.case_count().await?;
        let pending_operations = state.store.pending_count().await?;
        let active_alerts = state.store.active_alerts().await?.len();
        let health_score = state
            .store
            .latest_health_snapshot()
            .await?
            .map(|s| format!("{:.0}", s.overall_health_score))
            .unwrap_or_else(|| "n/a".to_string());
        let schedules = state
            .store
            .latest_recommendations()
            .await?
            .into_iter()
            .map(|r| ScheduleRow {
                source_id: r.source_id,
                tier: r.tier.as_str().to_string(),
                interval_minutes: r.interval_minutes,
                next_run_at: r.next_run_at.to_rfc3339(),
                reason: r.reason,
                confidence: r.confidence,
            })
            .collect();
        Ok::<_, mpw_storage::StoreError>(IndexTemplate {
            total_cases,
            pending_operations,
            active_alerts,
            health_score,
            schedules,
        })
    }
    .await;

    match data {
        Ok(tpl) => render_html(tpl),
        Err(err) => server_error(anyhow::anyhow!(err)),
    }
}

async fn api_schedules_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest_recommendations().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => json_error(err),
    }
}

async fn api_sync_pending_handler(State(state): State<Arc<AppState>>) -> Response {
    let preview = async {
        let count = state.store.pending_count().await?;
        // Read-only peek at the head of the queue, all priorities.
        let head = state.store.pending_batch(5, 0.0, 50).await?;
        Ok::<_, mpw_storage::StoreError>(serde_json::json!({
            "pending": count,
            "head": head,
        }))
    }
    .await;
    match preview {
        Ok(body) => Json(body).into_response(),
        Err(err) => json_error(err),
    }
}

async fn api_sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.all_watermarks().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => json_error(err),
    }
}

async fn api_alerts_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.active_alerts().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => json_error(err),
    }
}

async fn api_health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest_health_snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => json_error(err),
    }
}

async fn api_run_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(pipeline) = &state.pipeline else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "no pipeline attached; run via the daemon" })),
        )
            .into_response();
    };
    match pipeline.run_due(Utc::now()).await {
        Ok(summaries) => Json(summaries).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn json_error(err: mpw_storage::StoreError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use mpw_core::{Alert, AlertSeverity, AlertStatus, AlertType, CaseRecord};
    use mpw_storage::MemoryStore;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn seeded_state() -> AppState {
        let store: SharedStore = Arc::new(MemoryStore::new());
        store
            .upsert_case(&CaseRecord {
                case_number: "MP-4410".into(),
                source_id: "namus".into(),
                name: Some("Maria Delgado".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .insert_alert(&Alert {
                id: Uuid::new_v4(),
                alert_type: AlertType::DataStaleness,
                severity: AlertSeverity::High,
                title: "export_csv is critical".into(),
                message: "artifact export_csv is 30.0h old".into(),
                source: Some("export_csv".into()),
                metric_values: serde_json::json!({}),
                threshold_values: serde_json::json!({}),
                status: AlertStatus::Active,
                created_at: Utc::now(),
                acknowledged_at: None,
                resolved_at: None,
                suppressed_until: None,
            })
            .await
            .unwrap();
        AppState::new(store)
    }

    async fn get_ok(app: Router, uri: &str) -> serde_json::Value {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "GET {uri}");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn dashboard_renders_with_store_counts() {
        let app = app(seeded_state().await);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Missing Persons Watch"));
        assert!(text.contains("1"));
    }

    #[tokio::test]
    async fn api_endpoints_serve_store_contents() {
        let state = seeded_state().await;

        let alerts = get_ok(app(state.clone()), "/api/alerts").await;
        assert_eq!(alerts.as_array().unwrap().len(), 1);

        let pending = get_ok(app(state.clone()), "/api/sync/pending").await;
        assert_eq!(pending["pending"], 0);

        let schedules = get_ok(app(state.clone()), "/api/schedules").await;
        assert!(schedules.as_array().unwrap().is_empty());

        let health = get_ok(app(state), "/api/health").await;
        assert!(health.is_null());
    }

    #[tokio::test]
    async fn run_without_pipeline_is_rejected() {
        let app = app(seeded_state().await);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
