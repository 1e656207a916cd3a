pub mod ai;
pub mod config;
pub mod error;
pub mod jobs;
pub mod limits;
pub mod model;
pub mod pipeline;
pub mod routes;

use crate::ai::{GuardedAiClient, OpenAiBackend};
use crate::config::ResearchConfig;
use crate::jobs::{CancelRegistry, JobStore};
use crate::limits::{CircuitBreaker, RateLimiter};
use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use utoipa::OpenApi;
// Conditionally import SwaggerUi only when needed (not test)
#[cfg(not(test))]
use utoipa_swagger_ui::SwaggerUi;
// Conditionally import CORS only when needed (not test)
#[cfg(not(test))]
use tower_http::cors::{Any, CorsLayer};
// Conditionally import Governor only when needed (not test)
#[cfg(not(test))]
use std::num::NonZeroU32;
#[cfg(not(test))]
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};

/// How long finished jobs are kept around for late result reads.
const JOB_TTL: Duration = Duration::from_secs(3600);

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
    pub cancellations: CancelRegistry,
    pub http_client: reqwest::Client,
    pub ai: Option<Arc<GuardedAiClient>>,
    pub config: ResearchConfig,
}

impl AppState {
    /// Build state from a config, wiring the AI backend from the
    /// environment when credentials are present. Without them the
    /// pipeline still runs; jobs complete with raw pages and no
    /// synthesized fields.
    pub fn from_config(config: ResearchConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.page_timeout())
            .build()
            .unwrap_or_default();

        let ai = match OpenAiBackend::from_env() {
            Ok(backend) => Some(Arc::new(GuardedAiClient::new(
                Arc::new(backend),
                Arc::new(RateLimiter::new(
                    config.rate_capacity,
                    config.rate_refill_per_minute,
                )),
                Arc::new(CircuitBreaker::new(
                    config.breaker_failure_threshold,
                    config.breaker_cooldown(),
                    config.breaker_cooldown_cap(),
                )),
                &config,
            ))),
            Err(reason) => {
                tracing::warn!("AI synthesis disabled: {}", reason);
                None
            }
        };

        Self {
            store: JobStore::new(),
            cancellations: CancelRegistry::new(),
            http_client,
            ai,
            config,
        }
    }

    /// Test-friendly constructor that never touches the environment.
    pub fn with_ai(config: ResearchConfig, ai: Option<Arc<GuardedAiClient>>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.page_timeout())
            .build()
            .unwrap_or_default();
        Self {
            store: JobStore::new(),
            cancellations: CancelRegistry::new(),
            http_client,
            ai,
            config,
        }
    }
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = String)
    )
)]
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "Service is healthy")
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Company Intel API",
        version = "0.1.0",
        description = "Automated business intelligence extraction from company websites"
    ),
    paths(
        routes::research::start_research,
        routes::research::get_progress,
        routes::research::get_result,
        routes::research::cancel_job,
        health_check
    ),
    components(schemas(
        routes::research::ResearchRequest,
        routes::research::ResearchAcceptedResponse,
        routes::research::ProgressResponse,
        routes::research::ResultResponse,
        config::ResearchConfig,
        model::TargetField,
        model::Phase,
        model::JobStatus,
        model::PhaseStatus,
        model::PhaseRecord,
        model::FieldExtraction,
        model::TokenUsage,
        model::CompanyIntelligence,
        model::PageProvenance
    ))
)]
struct ApiDoc;

/// Create the application with all routes and middleware
pub fn create_app(state: AppState) -> Router {
    // Build our API documentation (needed regardless for ApiDoc::openapi())
    let api_doc = ApiDoc::openapi();
    #[cfg(test)]
    let _ = api_doc;

    // --- Define API routes separately ---
    let api_routes = Router::new()
        .route("/research/company", post(routes::research::start_research))
        .route(
            "/research/jobs/{id}/progress",
            get(routes::research::get_progress),
        )
        .route(
            "/research/jobs/{id}/result",
            get(routes::research::get_result),
        )
        .route("/research/jobs/{id}", delete(routes::research::cancel_job))
        .route("/health", get(health_check))
        .with_state(state);

    // --- Conditionally apply layers and Swagger UI only when NOT running tests ---
    #[cfg(not(test))]
    let (docs_router, rate_limited_api_routes) = {
        let docs_router = SwaggerUi::new("/docs").url("/api-doc/openapi.json", api_doc);

        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .key_extractor(SmartIpKeyExtractor)
                .period(std::time::Duration::from_secs(60))
                .burst_size(NonZeroU32::new(10).map(NonZeroU32::get).unwrap_or(10))
                .finish()
                .expect("static governor configuration"),
        );
        let rate_limited_api_routes = api_routes.layer(GovernorLayer {
            config: governor_conf,
        });

        (docs_router, rate_limited_api_routes)
    };

    // For test builds, use the original api_routes and an empty router for docs
    #[cfg(test)]
    let (docs_router, rate_limited_api_routes) = (Router::new(), api_routes);

    // --- Build the final application router ---
    #[cfg_attr(test, allow(unused_mut))]
    let mut app = Router::new()
        .merge(rate_limited_api_routes)
        .merge(docs_router);

    // --- Apply CORS to the whole app (both API and docs) if needed ---
    #[cfg(not(test))]
    {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    app
}

/// Background maintenance: evict finished jobs the caller never collected.
pub fn spawn_maintenance(state: &AppState) -> tokio::task::JoinHandle<()> {
    state.store.spawn_sweeper(JOB_TTL)
}
