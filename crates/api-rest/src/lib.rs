//! # API REST
//!
//! REST API for the consent engine.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (JSON serialization, CORS, status codes)
//!
//! Sessions live in an in-memory registry keyed by patient id. Each session owns its decision
//! cache, so closing or replacing a session discards the cache.

#![warn(rust_2018_idioms)]

pub mod dto;
mod error;
pub mod handlers;

pub use error::ApiError;

use axum::{
    routing::{delete, get, post},
    Router,
};
use consent_core::{
    ConsentResult, CoreConfig, FhirStore, HttpFhirStore, HttpLabelingClient, LabelingService,
    PatientSession,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Application state shared across REST API handlers
#[derive(Clone)]
pub struct AppState {
    cfg: Arc<CoreConfig>,
    store: Arc<dyn FhirStore>,
    labeler: Arc<dyn LabelingService>,
    sessions: Arc<RwLock<HashMap<String, Arc<PatientSession>>>>,
}

impl AppState {
    pub fn new(
        cfg: CoreConfig,
        store: Arc<dyn FhirStore>,
        labeler: Arc<dyn LabelingService>,
    ) -> Self {
        Self {
            cfg: Arc::new(cfg),
            store,
            labeler,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// State backed by the HTTP record store and labeling client named in `cfg`.
    pub fn from_config(cfg: CoreConfig) -> ConsentResult<Self> {
        let store = Arc::new(HttpFhirStore::new(&cfg)?);
        let labeler = Arc::new(HttpLabelingClient::new(&cfg)?);
        Ok(Self::new(cfg, store, labeler))
    }

    pub(crate) async fn session(&self, patient_id: &str) -> Result<Arc<PatientSession>, ApiError> {
        self.sessions
            .read()
            .await
            .get(patient_id)
            .cloned()
            .ok_or_else(|| handlers::no_session(patient_id))
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::open_session,
        handlers::close_session,
        handlers::list_consents,
        handlers::view,
        handlers::redacted_bundle,
        handlers::transfer,
    ),
    components(schemas(
        dto::HealthRes,
        dto::ErrorRes,
        dto::PurposeReq,
        dto::OpenSessionReq,
        dto::OpenSessionRes,
        dto::ConsentSummary,
        dto::ListConsentsRes,
        dto::LabelMode,
        dto::LabelFilterReq,
        dto::SharingFilterReq,
        dto::DecisionReq,
        dto::ViewReq,
        dto::ViewResource,
        dto::ViewGroupRes,
        dto::ViewRes,
        dto::TransferReq,
        dto::TransferRes,
    ))
)]
pub struct ApiDoc;

/// Build the REST router with Swagger UI at `/swagger-ui`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions", post(handlers::open_session))
        .route("/sessions/:patient_id", delete(handlers::close_session))
        .route("/sessions/:patient_id/consents", get(handlers::list_consents))
        .route("/sessions/:patient_id/view", post(handlers::view))
        .route("/sessions/:patient_id/bundle", post(handlers::redacted_bundle))
        .route("/sessions/:patient_id/transfer", post(handlers::transfer))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use consent_core::{ConfidenceThreshold, ConsentError, IndexedResource, LabelingResult};
    use fhir::{Bundle, ResourceKey};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    struct FakeStore {
        submitted: Mutex<Vec<Bundle>>,
    }

    #[async_trait]
    impl FhirStore for FakeStore {
        fn base_url(&self) -> &str {
            "http://fhir.test"
        }

        async fn fetch_page(&self, url: &str) -> ConsentResult<Bundle> {
            if url != "http://fhir.test/Patient/p1/$everything" {
                return Err(ConsentError::Upstream {
                    url: url.into(),
                    message: "status 404 Not Found".into(),
                });
            }
            Ok(Bundle::from_value(json!({
                "resourceType": "Bundle",
                "type": "searchset",
                "entry": [
                    {"resource": {"resourceType": "Patient", "id": "p1"}},
                    {"resource": {"resourceType": "Condition", "id": "A"}},
                    {"resource": {"resourceType": "Condition", "id": "B"}},
                    {"resource": {
                        "resourceType": "Consent", "id": "deny-sud", "status": "active",
                        "decision": "deny",
                        "subject": {"reference": "Patient/p1"},
                        "provision": [{"securityLabel": [{"code": "SUD"}]}]
                    }}
                ]
            }))?)
        }

        async fn submit_transaction(
            &self,
            _destination: &str,
            bundle: &Bundle,
        ) -> ConsentResult<Value> {
            self.submitted.lock().unwrap().push(bundle.clone());
            Ok(json!({"resourceType": "Bundle", "type": "transaction-response"}))
        }
    }

    #[derive(Default)]
    struct FakeLabeler {
        failing: AtomicBool,
    }

    #[async_trait]
    impl LabelingService for FakeLabeler {
        async fn label(
            &self,
            _resources: &[IndexedResource],
            _patient_id: &str,
            _threshold: ConfidenceThreshold,
        ) -> ConsentResult<LabelingResult> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ConsentError::LabelingFailed("service unavailable".into()));
            }
            let mut result = LabelingResult::default();
            result.insert(ResourceKey::from("Condition/A"), ["SUD".to_string()].into());
            Ok(result)
        }
    }

    fn app_with(labeler: Arc<FakeLabeler>) -> (Router, Arc<FakeStore>) {
        let cfg = CoreConfig::new(
            "http://fhir.test",
            "http://sls.test",
            ConfidenceThreshold::new(0.5).unwrap(),
            Duration::from_secs(5),
            50,
            "xfer-",
        )
        .unwrap();
        let store = Arc::new(FakeStore {
            submitted: Mutex::new(Vec::new()),
        });
        let state = AppState::new(cfg, store.clone(), labeler);
        (router(state), store)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn open(app: &Router) {
        let (status, body) = call(app, "POST", "/sessions", Some(json!({"patientId": "p1"}))).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _) = app_with(Arc::default());
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn open_session_reports_counts_and_watermark() {
        let (app, _) = app_with(Arc::default());
        let (status, body) =
            call(&app, "POST", "/sessions", Some(json!({"patientId": "p1"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["resources"], 4);
        assert_eq!(body["candidates"], 1);
        assert_eq!(body["watermarkConsentId"], "deny-sud");

        let (status, body) = call(&app, "GET", "/sessions/p1/consents", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["candidates"][0]["maskedCategories"], json!(["SUD"]));
    }

    #[tokio::test]
    async fn failed_record_fetch_is_bad_gateway() {
        let (app, _) = app_with(Arc::default());
        let (status, body) =
            call(&app, "POST", "/sessions", Some(json!({"patientId": "other"}))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("page 1"));

        let (status, _) = call(&app, "POST", "/sessions", Some(json!({"patientId": " "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn view_marks_denied_resources() {
        let (app, _) = app_with(Arc::default());
        open(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            "/sessions/p1/view",
            Some(json!({"sharingFilter": "denied-only"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["consentId"], "deny-sud");
        assert_eq!(body["threshold"], "0.50");
        assert_eq!(body["sharingMode"], "custom-deny-masked");
        assert_eq!(body["denied"], 1);
        let groups = body["groups"].as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["resources"][0]["key"], "Condition/A");
        assert_eq!(groups[0]["resources"][0]["labels"], json!(["SUD"]));
    }

    #[tokio::test]
    async fn unknown_consent_yields_null_view() {
        let (app, _) = app_with(Arc::default());
        open(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            "/sessions/p1/view",
            Some(json!({"consentId": "missing"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["groups"].is_null());
        assert_eq!(body["denied"], 0);

        let (status, _) = call(
            &app,
            "POST",
            "/sessions/p1/bundle",
            Some(json!({"consentId": "missing"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn labeling_failure_is_reported_in_view_and_blocks_bundle() {
        let labeler = Arc::new(FakeLabeler::default());
        labeler.failing.store(true, Ordering::SeqCst);
        let (app, _) = app_with(labeler);
        open(&app).await;

        let (status, body) = call(&app, "POST", "/sessions/p1/view", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["labelingError"]
            .as_str()
            .unwrap()
            .contains("unavailable"));
        assert_eq!(body["denied"], 0);

        let (status, _) = call(&app, "POST", "/sessions/p1/bundle", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn bundle_and_transfer_exclude_denied_resources() {
        let (app, store) = app_with(Arc::default());
        open(&app).await;

        let (status, body) = call(&app, "POST", "/sessions/p1/bundle", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "collection");
        assert_eq!(body["entry"].as_array().unwrap().len(), 3);

        let (status, body) = call(
            &app,
            "POST",
            "/sessions/p1/transfer",
            Some(json!({"destination": "http://dest/fhir"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["submitted"], 3);
        assert_eq!(body["denied"], 1);
        assert_eq!(store.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_threshold_is_bad_request() {
        let (app, _) = app_with(Arc::default());
        open(&app).await;
        let (status, body) = call(
            &app,
            "POST",
            "/sessions/p1/view",
            Some(json!({"threshold": 1.5})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("threshold"));
    }

    #[tokio::test]
    async fn closed_sessions_are_not_found() {
        let (app, _) = app_with(Arc::default());
        open(&app).await;

        let (status, _) = call(&app, "DELETE", "/sessions/p1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = call(&app, "POST", "/sessions/p1/view", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("p1"));
        let (status, _) = call(&app, "DELETE", "/sessions/p1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
