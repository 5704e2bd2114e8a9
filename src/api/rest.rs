// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public. Everything else
// requires the trigger secret via the `AuthBearer` extractor, which rejects
// before the handler body runs.
//
// The cron endpoints accept both GET and POST so any external scheduler can
// drive them.
//
// CORS is configured permissively; the trigger secret is the only gate.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::assessor::PortfolioAssessment;
use crate::decider::DecisionResult;
use crate::error::PipelineError;
use crate::nav_monitor::run_nav_check;
use crate::scheduler::run_tick;
use crate::types::PortfolioId;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS, request tracing and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route(
            "/api/v1/cron/auto-rebalance",
            get(auto_rebalance).post(auto_rebalance),
        )
        .route(
            "/api/v1/cron/nav-monitor",
            get(nav_monitor).post(nav_monitor),
        )
        .route("/api/v1/portfolios/:id/preview", get(preview))
        .route("/api/v1/results", get(results))
        // ── Middleware & State ───────────────────────────────────────
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn error_body(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": message,
        })),
    )
        .into_response()
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
    uptime_secs: u64,
    execution_mode: String,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: Utc::now().timestamp_millis(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        execution_mode: state.config.execution_mode.to_string(),
    };
    Json(resp)
}

// =============================================================================
// Cron triggers (authenticated)
// =============================================================================

async fn auto_rebalance(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> Response {
    let now = Utc::now();
    info!("auto-rebalance triggered");

    let report = run_tick(&state.pipeline_deps(), now).await;

    if report.success {
        state.record_tick(now, report.summary.clone(), report.duration_ms, &report.results);
        (StatusCode::OK, Json(report)).into_response()
    } else {
        let msg = report.error.clone().unwrap_or_default();
        warn!(error = %msg, "auto-rebalance tick failed");
        state.push_error(msg);
        (StatusCode::INTERNAL_SERVER_ERROR, Json(report)).into_response()
    }
}

async fn nav_monitor(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> Response {
    info!("nav monitor triggered");

    let report = run_nav_check(&state.nav_deps(), Utc::now()).await;

    if report.success {
        (StatusCode::OK, Json(report)).into_response()
    } else {
        let msg = report.error.clone().unwrap_or_default();
        warn!(error = %msg, "nav check failed");
        state.push_error(msg);
        (StatusCode::INTERNAL_SERVER_ERROR, Json(report)).into_response()
    }
}

// =============================================================================
// Preview (authenticated) — assess + decide, no execution
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PreviewResponse {
    success: bool,
    assessment: PortfolioAssessment,
    decision: DecisionResult,
}

async fn preview(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let id = PortfolioId::new(id);

    let config = match state.config_store.get_portfolio(&id).await {
        Ok(Some(entry)) => match entry.into_config() {
            Ok(c) => c,
            Err(e) => return error_body(StatusCode::BAD_REQUEST, e.to_string()),
        },
        Ok(None) => return error_body(StatusCode::NOT_FOUND, format!("unknown portfolio {id}")),
        Err(e) => {
            return error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("config store unavailable: {e:#}"),
            )
        }
    };

    let wallet = match config.validate() {
        Ok(w) => w,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let assessment = match state.assessor.assess(&id, wallet).await {
        Ok(a) => a,
        Err(e @ PipelineError::DataUnavailable(_)) => {
            return error_body(StatusCode::BAD_GATEWAY, e.to_string())
        }
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let cooldown = match state.cooldown_store.load_state(&id).await {
        Ok(c) => c,
        Err(e) => {
            return error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("cooldown read failed: {e:#}"),
            )
        }
    };

    let decision = state.decider.decide(&assessment, &config, &cooldown, Utc::now());

    Json(PreviewResponse {
        success: true,
        assessment,
        decision,
    })
    .into_response()
}

// =============================================================================
// Recent results (authenticated)
// =============================================================================

async fn results(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    use crate::chain::simulated::SimulatedPortfolio;
    use crate::chain::{AssetHolding, SimulatedChainClient, TargetAllocation};
    use crate::config_store::{ConfigEntry, ConfigStore, MemoryConfigStore, RebalanceConfig};
    use crate::notify::RiskNotifier;
    use crate::runtime_config::ServiceConfig;
    use crate::store::MemoryStore;

    const SECRET: &str = "test-secret";

    fn drifted() -> SimulatedPortfolio {
        let holding = |s: &str, v: f64| AssetHolding {
            symbol: s.into(),
            value_usd: v,
            pnl_percent: None,
        };
        let target = |s: &str, p: f64| TargetAllocation {
            symbol: s.into(),
            percent: p,
        };
        SimulatedPortfolio {
            portfolio_id: PortfolioId::from(7),
            entry_value_usd: None,
            assets: vec![
                holding("BTC", 3_800.0),
                holding("ETH", 3_000.0),
                holding("CRO", 2_000.0),
                holding("SUI", 1_200.0),
            ],
            targets: vec![
                target("BTC", 35.0),
                target("ETH", 30.0),
                target("CRO", 20.0),
                target("SUI", 15.0),
            ],
        }
    }

    fn config() -> RebalanceConfig {
        RebalanceConfig {
            portfolio_id: PortfolioId::from(7),
            enabled: true,
            wallet_address: Some("0xabc".into()),
            drift_threshold_percent: 2.0,
            auto_approval_enabled: true,
            auto_approval_value_ceiling_usd: None,
            inception_nav_usd: None,
            loss_protection: None,
        }
    }

    fn setup() -> (Arc<AppState>, Arc<SimulatedChainClient>) {
        let chain = Arc::new(SimulatedChainClient::new());
        chain.upsert(drifted());
        (AppState::for_tests(chain.clone(), vec![config()], SECRET), chain)
    }

    fn request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(t) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {t}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Config store that counts how often it was consulted.
    struct CountingConfigStore {
        inner: MemoryConfigStore,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl ConfigStore for CountingConfigStore {
        async fn list_enabled_portfolios(&self) -> anyhow::Result<Vec<ConfigEntry>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.list_enabled_portfolios().await
        }
        async fn get_portfolio(&self, id: &PortfolioId) -> anyhow::Result<Option<ConfigEntry>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_portfolio(id).await
        }
    }

    #[tokio::test]
    async fn health_is_public() {
        let (state, _) = setup();
        let resp = router(state)
            .oneshot(request("GET", "/api/v1/health", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn unauthorized_trigger_touches_nothing() {
        let chain = Arc::new(SimulatedChainClient::new());
        chain.upsert(drifted());
        let configs = Arc::new(CountingConfigStore {
            inner: MemoryConfigStore::new(vec![config()]),
            reads: AtomicUsize::new(0),
        });
        let (notifier, _rx) = RiskNotifier::channel(8);
        let state = Arc::new(AppState::new(
            ServiceConfig::default(),
            SECRET.to_string(),
            chain.clone(),
            configs.clone(),
            Arc::new(MemoryStore::new()),
            notifier,
            None,
        ));
        let app = router(state);

        for token in [None, Some("wrong")] {
            for method in ["GET", "POST"] {
                let resp = app
                    .clone()
                    .oneshot(request(method, "/api/v1/cron/auto-rebalance", token))
                    .await
                    .unwrap();
                assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
                let body = json_body(resp).await;
                assert_eq!(body["success"], false);
                assert!(body.get("summary").is_none());
            }
        }

        assert_eq!(configs.reads.load(Ordering::SeqCst), 0);
        assert!(chain.submissions().is_empty());
    }

    #[tokio::test]
    async fn authorized_trigger_returns_summary() {
        let (state, chain) = setup();
        let app = router(state.clone());

        let resp = app
            .clone()
            .oneshot(request("POST", "/api/v1/cron/auto-rebalance", Some(SECRET)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["summary"]["total"], 1);
        assert_eq!(body["summary"]["rebalanced"], 1);
        assert!(body["durationMs"].is_u64());
        assert_eq!(body["results"][0]["status"], "rebalanced");
        assert_eq!(chain.submissions().len(), 1);

        let resp = app
            .oneshot(request("GET", "/api/v1/results", Some(SECRET)))
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["recentResults"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["lastTick"]["summary"]["rebalanced"], 1);
    }

    #[tokio::test]
    async fn preview_decides_without_executing() {
        let (state, chain) = setup();
        let resp = router(state.clone())
            .oneshot(request("GET", "/api/v1/portfolios/7/preview", Some(SECRET)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["decision"]["status"], "REBALANCE_PROPOSED");
        assert_eq!(body["decision"]["plan"]["kind"], "rebalance");
        assert!(chain.submissions().is_empty());
        let cooldown = state.cooldown_store.load_state(&PortfolioId::from(7)).await.unwrap();
        assert!(cooldown.last_rebalance_at.is_none());
    }

    #[tokio::test]
    async fn preview_unknown_portfolio_is_404() {
        let (state, _) = setup();
        let resp = router(state)
            .oneshot(request("GET", "/api/v1/portfolios/99/preview", Some(SECRET)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn nav_monitor_requires_auth_and_reports() {
        let (state, _) = setup();
        let app = router(state);

        let denied = app
            .clone()
            .oneshot(request("GET", "/api/v1/cron/nav-monitor", None))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(request("GET", "/api/v1/cron/nav-monitor", Some(SECRET)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["checked"], 1);
        assert_eq!(body["results"][0]["navUSD"], 10_000.0);
    }
}
