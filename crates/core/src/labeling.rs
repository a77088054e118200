//! Labeling service boundary.
//!
//! The labeling algorithm is an external consult service; this module only owns the
//! request/response contract:
//! - resources are wrapped in a synthetic `collection` bundle addressed to the patient
//! - the confidence threshold travels as a two-decimal header value
//! - the reply is a card (or a list of cards) whose `extension.content` bundle carries the
//!   labeled resources with `meta.security` codes
//!
//! Resources missing from the reply are simply unlabeled. Any transport, status or decode
//! problem surfaces as [`ConsentError::LabelingFailed`].

use crate::constants::{CONFIDENCE_THRESHOLD_HEADER, LABELING_HOOK};
use crate::index::{identity_key, IndexedResource};
use crate::{ConsentError, ConsentResult, CoreConfig};
use consent_types::ConfidenceThreshold;
use fhir::{Bundle, BundleEntry, ResourceKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Labels assigned by one labeling request, keyed by resource identity key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelingResult {
    labels: HashMap<ResourceKey, BTreeSet<String>>,
}

impl LabelingResult {
    /// Extract labels from a bundle of labeled resources.
    ///
    /// Entries whose resource cannot be parsed or keyed are ignored.
    pub fn from_bundle(bundle: &Bundle) -> Self {
        let mut result = Self::default();
        for entry in &bundle.entry {
            let Some(Ok(resource)) = entry.parse_resource() else {
                continue;
            };
            if let Some(key) = identity_key(&resource, entry.full_url.as_deref()) {
                result.insert(key, resource.security_labels().clone());
            }
        }
        result
    }

    /// Record labels for `key`, merging with any already recorded.
    pub fn insert(&mut self, key: ResourceKey, labels: BTreeSet<String>) {
        self.labels.entry(key).or_default().extend(labels);
    }

    pub fn labels_for(&self, key: &ResourceKey) -> Option<&BTreeSet<String>> {
        self.labels.get(key)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceKey, &BTreeSet<String>)> {
        self.labels.iter()
    }
}

/// External labeling service.
#[async_trait::async_trait]
pub trait LabelingService: Send + Sync {
    /// Label `resources` for `patient_id` at `threshold`.
    async fn label(
        &self,
        resources: &[IndexedResource],
        patient_id: &str,
        threshold: ConfidenceThreshold,
    ) -> ConsentResult<LabelingResult>;
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsultRequest<'a> {
    hook: &'static str,
    hook_instance: Uuid,
    context: ConsultContext<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsultContext<'a> {
    patient_id: &'a str,
    content: Bundle,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConsultResponse {
    Cards { cards: Vec<Card> },
    Single(Card),
}

#[derive(Debug, Default, Deserialize)]
struct Card {
    #[serde(default)]
    extension: Option<CardExtension>,
}

#[derive(Debug, Default, Deserialize)]
struct CardExtension {
    #[serde(default)]
    content: Option<Bundle>,
}

impl ConsultResponse {
    fn into_result(self) -> LabelingResult {
        let cards = match self {
            Self::Cards { cards } => cards,
            Self::Single(card) => vec![card],
        };

        let mut result = LabelingResult::default();
        for bundle in cards
            .into_iter()
            .filter_map(|card| card.extension.and_then(|extension| extension.content))
        {
            for (key, labels) in LabelingResult::from_bundle(&bundle).labels {
                result.insert(key, labels);
            }
        }
        result
    }
}

/// Build the synthetic collection bundle sent for labeling.
pub fn labeling_request_bundle(resources: &[IndexedResource]) -> Bundle {
    Bundle::collection(
        resources
            .iter()
            .map(|entry| BundleEntry::new(entry.origin.clone(), &entry.resource)),
    )
}

// ============================================================================
// HTTP client
// ============================================================================

/// HTTP client for the labeling consult service.
#[derive(Clone, Debug)]
pub struct HttpLabelingClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLabelingClient {
    /// Create a client posting to `cfg.labeling_url()`.
    pub fn new(cfg: &CoreConfig) -> ConsentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.http_timeout())
            .build()
            .map_err(ConsentError::HttpClient)?;
        Ok(Self::with_client(client, cfg.labeling_url()))
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait::async_trait]
impl LabelingService for HttpLabelingClient {
    async fn label(
        &self,
        resources: &[IndexedResource],
        patient_id: &str,
        threshold: ConfidenceThreshold,
    ) -> ConsentResult<LabelingResult> {
        let request = ConsultRequest {
            hook: LABELING_HOOK,
            hook_instance: Uuid::new_v4(),
            context: ConsultContext {
                patient_id,
                content: labeling_request_bundle(resources),
            },
        };

        tracing::debug!(
            resources = resources.len(),
            %threshold,
            "sending labeling request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONFIDENCE_THRESHOLD_HEADER, threshold.to_string())
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ConsentError::LabelingFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConsentError::LabelingFailed(format!(
                "labeling service returned {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ConsentError::LabelingFailed(e.to_string()))?;
        let reply: ConsultResponse = serde_json::from_str(&body)
            .map_err(|e| ConsentError::LabelingFailed(format!("invalid labeling reply: {e}")))?;

        let result = reply.into_result();
        tracing::info!(labeled = result.len(), "labeling request completed");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ResourceIndex;
    use axum::{http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    fn sample_index() -> ResourceIndex {
        ResourceIndex::build(
            &Bundle::from_value(json!({
                "resourceType": "Bundle",
                "type": "searchset",
                "entry": [
                    {"fullUrl": "http://fhir/Condition/a", "resource": {"resourceType": "Condition", "id": "a"}},
                    {"fullUrl": "http://fhir/Condition/b", "resource": {"resourceType": "Condition", "id": "b"}}
                ]
            }))
            .expect("bundle"),
        )
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}/cds-services/sls")
    }

    #[test]
    fn parses_card_list_and_single_card() {
        let card = json!({
            "extension": {"content": {
                "resourceType": "Bundle",
                "type": "collection",
                "entry": [{"resource": {
                    "resourceType": "Condition", "id": "a",
                    "meta": {"security": [{"code": "SUD"}]}
                }}]
            }}
        });

        let list: ConsultResponse =
            serde_json::from_value(json!({"cards": [card.clone()]})).expect("cards");
        let single: ConsultResponse = serde_json::from_value(card).expect("card");

        for reply in [list, single] {
            let result = reply.into_result();
            assert_eq!(result.len(), 1);
            assert!(result
                .labels_for(&ResourceKey::from("Condition/a"))
                .expect("labeled")
                .contains("SUD"));
        }
    }

    #[test]
    fn card_without_content_yields_no_labels() {
        let reply: ConsultResponse =
            serde_json::from_value(json!({"cards": [{"summary": "nothing"}]})).expect("cards");
        assert!(reply.into_result().is_empty());
    }

    #[tokio::test]
    async fn posts_collection_with_threshold_header() {
        let seen: Arc<Mutex<Option<(String, Value)>>> = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let app = Router::new().route(
            "/cds-services/sls",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let captured = captured.clone();
                async move {
                    let threshold = headers
                        .get(CONFIDENCE_THRESHOLD_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    *captured.lock().unwrap() = Some((threshold, body));
                    Json(json!({"cards": [{"extension": {"content": {
                        "resourceType": "Bundle",
                        "type": "collection",
                        "entry": [{"fullUrl": "http://fhir/Condition/b", "resource": {
                            "resourceType": "Condition", "id": "b",
                            "meta": {"security": [{"code": "PSY"}, {"code": "MENCAT"}]}
                        }}]
                    }}}]}))
                }
            }),
        );
        let endpoint = serve(app).await;
        let client = HttpLabelingClient::with_client(reqwest::Client::new(), endpoint);

        let index = sample_index();
        let threshold = ConfidenceThreshold::new(0.7).unwrap();
        let result = client
            .label(index.entries(), "123", threshold)
            .await
            .expect("labeling should succeed");

        assert_eq!(result.len(), 1);
        let labels = result
            .labels_for(&ResourceKey::from("Condition/b"))
            .expect("b labeled");
        assert_eq!(labels.len(), 2);
        assert!(result
            .labels_for(&ResourceKey::from("Condition/a"))
            .is_none());

        let (threshold_header, body) = seen.lock().unwrap().clone().expect("request captured");
        assert_eq!(threshold_header, "0.70");
        assert_eq!(body["hook"], LABELING_HOOK);
        assert_eq!(body["context"]["patientId"], "123");
        assert_eq!(body["context"]["content"]["type"], "collection");
        assert_eq!(
            body["context"]["content"]["entry"].as_array().map(Vec::len),
            Some(2)
        );
    }

    #[tokio::test]
    async fn error_status_is_labeling_failed() {
        let app = Router::new().route(
            "/cds-services/sls",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let endpoint = serve(app).await;
        let client = HttpLabelingClient::with_client(reqwest::Client::new(), endpoint);

        let err = client
            .label(sample_index().entries(), "123", ConfidenceThreshold::MIN)
            .await
            .expect_err("should fail");
        match err {
            ConsentError::LabelingFailed(msg) => assert!(msg.contains("503")),
            other => panic!("expected LabelingFailed error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_service_is_labeling_failed() {
        let client = HttpLabelingClient::with_client(
            reqwest::Client::new(),
            "http://127.0.0.1:9/cds-services/sls",
        );
        let err = client
            .label(sample_index().entries(), "123", ConfidenceThreshold::MIN)
            .await
            .expect_err("should fail");
        assert!(matches!(err, ConsentError::LabelingFailed(_)));
    }
}
