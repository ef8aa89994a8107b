//! JSON HTTP API over the aggregation pipeline.

use std::fmt;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use roar_core::DriverContext;
use roar_engine::{
    maybe_build_scheduler, pipeline_from_settings, AggregationPipeline, ContextError, CycleOutcome,
    DriverContextProvider, EngineSettings,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "roar-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<AggregationPipeline>,
    pub contexts: Arc<dyn DriverContextProvider>,
}

impl AppState {
    pub fn new(pipeline: Arc<AggregationPipeline>, contexts: Arc<dyn DriverContextProvider>) -> Self {
        Self { pipeline, contexts }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl From<ContextError> for ApiError {
    fn from(err: ContextError) -> Self {
        let status = match &err {
            ContextError::UnknownDriver(_) => StatusCode::NOT_FOUND,
            ContextError::InvalidDriverId(_) => StatusCode::BAD_REQUEST,
            ContextError::Io { .. } | ContextError::Parse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct SourceView {
    source_id: String,
    enabled: bool,
    internal: bool,
    priority: u32,
    desirability: f64,
    commission_rate: f64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/sources", get(sources_handler))
        .route("/recommendations", post(recommendations_handler))
        .route("/drivers/{driver_id}/recommendations", get(driver_recommendations_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let settings = EngineSettings::from_env();
    let pipeline = Arc::new(pipeline_from_settings(&settings).await?);
    let contexts: Arc<dyn DriverContextProvider> = Arc::new(settings.context_provider());

    let scheduler = maybe_build_scheduler(&settings, pipeline.clone(), contexts.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %settings.cycle_cron, "scheduled cycles enabled");
    }

    let listener = TcpListener::bind(("0.0.0.0", settings.web_port)).await?;
    info!(port = settings.web_port, "serving recommendations api");
    axum::serve(listener, app(AppState::new(pipeline, contexts))).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn sources_handler(State(state): State<AppState>) -> Json<Vec<SourceView>> {
    let sources = state
        .pipeline
        .config()
        .sources
        .iter()
        .map(|s| SourceView {
            source_id: s.source_id.clone(),
            enabled: s.enabled,
            internal: s.internal,
            priority: s.priority,
            desirability: s.desirability,
            commission_rate: s.commission_rate,
        })
        .collect();
    Json(sources)
}

async fn recommendations_handler(
    State(state): State<AppState>,
    body: Result<Json<DriverContext>, JsonRejection>,
) -> Result<Json<CycleOutcome>, ApiError> {
    let Json(ctx) = body?;
    if ctx.driver_id.trim().is_empty() {
        return Err(ApiError::bad_request("driver_id must not be empty"));
    }
    Ok(Json(state.pipeline.run_cycle(&ctx).await))
}

async fn driver_recommendations_handler(
    State(state): State<AppState>,
    Path(driver_id): Path<String>,
) -> Result<Json<CycleOutcome>, ApiError> {
    let ctx = state.contexts.driver_context(&driver_id).await?;
    Ok(Json(state.pipeline.run_cycle(&ctx).await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::{Duration, Utc};
    use http_body_util::BodyExt;
    use roar_core::{AggregationConfig, GeoPoint, Offer, Pickup, UrgencyTier};
    use roar_engine::StaticContextProvider;
    use roar_sources::{SourceKind, SourcePort, StaticSource};
    use tower::ServiceExt;

    fn live_offer(id: &str, source_id: &str) -> Offer {
        let now = Utc::now();
        Offer {
            id: id.into(),
            source_id: source_id.into(),
            pickup: Pickup {
                point: GeoPoint::new(52.52, 13.405),
                address: "Alexanderplatz".into(),
                requested_at: now + Duration::minutes(10),
            },
            dropoff: None,
            fare_minor: 2_200,
            distance_km: 5.0,
            duration_min: 14.0,
            counterpart_rating: Some(4.7),
            special_requests: None,
            urgency: UrgencyTier::High,
            created_at: now - Duration::minutes(1),
            expires_at: now + Duration::minutes(20),
        }
    }

    fn test_app() -> Router {
        let config = AggregationConfig::default();
        let ports: Vec<Arc<dyn SourcePort>> = vec![
            Arc::new(StaticSource::offers(
                "direct",
                SourceKind::DirectChannel,
                vec![live_offer("d-1", "direct")],
            )),
            Arc::new(StaticSource::offers("cityride", SourceKind::ExternalPlatform, vec![])),
            Arc::new(StaticSource::failing("swiftcab", SourceKind::ExternalPlatform, "503")),
            Arc::new(StaticSource::offers("metrotaxi", SourceKind::ExternalPlatform, vec![])),
        ];
        let pipeline = Arc::new(AggregationPipeline::new(config, ports).unwrap());
        let contexts: Arc<dyn DriverContextProvider> =
            Arc::new(StaticContextProvider::new([DriverContext::new("driver-42")]));
        app(AppState::new(pipeline, contexts))
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let resp = test_app()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn sources_are_listed_in_declaration_order() {
        let resp = test_app()
            .oneshot(Request::builder().uri("/sources").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(resp).await;
        let ids: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["source_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["direct", "cityride", "swiftcab", "metrotaxi"]);
        assert_eq!(body[0]["internal"], true);
    }

    #[tokio::test]
    async fn post_recommendations_runs_a_cycle() {
        let request = Request::builder()
            .method("POST")
            .uri("/recommendations")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"driver_id":"d-9","location":{"lat":52.52,"lng":13.40}}"#))
            .unwrap();
        let resp = test_app().oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        assert_eq!(body["driver_id"], "d-9");
        assert_eq!(body["ranked"][0]["offer"]["id"], "d-1");
        assert_eq!(body["failures"]["swiftcab"], "503");
    }

    #[tokio::test]
    async fn empty_driver_id_is_a_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/recommendations")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"driver_id":"  "}"#))
            .unwrap();
        let resp = test_app().oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(resp).await["error"].as_str().unwrap().contains("driver_id"));
    }

    #[tokio::test]
    async fn malformed_bodies_get_json_errors() {
        let broken = Request::builder()
            .method("POST")
            .uri("/recommendations")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"driver_id": "#))
            .unwrap();
        let resp = test_app().oneshot(broken).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(resp).await["error"].is_string());

        let wrong_shape = Request::builder()
            .method("POST")
            .uri("/recommendations")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"location": "downtown"}"#))
            .unwrap();
        let resp = test_app().oneshot(wrong_shape).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json_body(resp).await["error"].is_string());

        let no_content_type = Request::builder()
            .method("POST")
            .uri("/recommendations")
            .body(Body::from(r#"{"driver_id":"d-9"}"#))
            .unwrap();
        let resp = test_app().oneshot(no_content_type).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(json_body(resp).await["error"].is_string());
    }

    #[tokio::test]
    async fn known_driver_gets_recommendations_and_unknown_gets_404() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/drivers/driver-42/recommendations")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["stats"]["returned"], 1);

        let resp = app
            .oneshot(Request::builder().uri("/drivers/nobody/recommendations").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(json_body(resp).await["error"].as_str().unwrap().contains("nobody"));
    }
}
