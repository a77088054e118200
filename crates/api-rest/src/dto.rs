//! Request and response bodies for the REST API.
//!
//! These are the JSON shapes documented in the OpenAPI schema; conversion to and from core
//! types happens here so handlers stay thin.

use consent_core::{
    ConfidenceThreshold, ConsentChoice, DisplayFilters, FilteredView, LabelFilter, Purpose,
    SessionDecisions, SharingDecision, SharingFilter,
};
use fhir::Consent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::error::ApiError;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorRes {
    pub error: String,
}

/// Purpose a candidate consent must cover.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PurposeReq {
    Treatment,
    Research,
}

impl From<PurposeReq> for Purpose {
    fn from(purpose: PurposeReq) -> Self {
        match purpose {
            PurposeReq::Treatment => Purpose::Treatment,
            PurposeReq::Research => Purpose::Research,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionReq {
    pub patient_id: String,
    /// Controller organisation id; when absent, consents are read from the record.
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub purposes: Vec<PurposeReq>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionRes {
    pub patient_id: String,
    pub resources: usize,
    pub candidates: usize,
    pub watermark_consent_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsentSummary {
    pub id: String,
    pub decision: Option<String>,
    pub status: String,
    pub masked_categories: Vec<String>,
    pub masked_label_count: usize,
    pub purposes: Vec<String>,
    pub last_updated: Option<String>,
}

impl From<&Consent> for ConsentSummary {
    fn from(consent: &Consent) -> Self {
        Self {
            id: consent.id.clone(),
            decision: consent.decision.map(|d| d.as_str().to_string()),
            status: consent.status.as_str().to_string(),
            masked_categories: consent.masked_categories().into_iter().collect(),
            masked_label_count: consent.masked_label_count(),
            purposes: consent.purposes().into_iter().collect(),
            last_updated: consent.last_updated.map(|ts| ts.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListConsentsRes {
    pub patient_id: String,
    pub candidates: Vec<ConsentSummary>,
    pub watermark_consent_id: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum LabelMode {
    #[default]
    ShowAll,
    Only,
    Except,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct LabelFilterReq {
    #[serde(default)]
    pub mode: LabelMode,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum SharingFilterReq {
    #[default]
    All,
    PermittedOnly,
    DeniedOnly,
}

/// Selects the consent and threshold to decide with.
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecisionReq {
    /// Explicit consent id; the watermark consent is used when absent.
    #[serde(default)]
    pub consent_id: Option<String>,
    /// Confidence threshold in `[0, 1]`; the configured default is used when absent.
    #[serde(default)]
    pub threshold: Option<f64>,
}

impl DecisionReq {
    pub fn choice(&self) -> ConsentChoice {
        ConsentChoice::from_optional(self.consent_id.clone())
    }

    pub fn threshold(&self) -> Result<Option<ConfidenceThreshold>, ApiError> {
        self.threshold
            .map(ConfidenceThreshold::new)
            .transpose()
            .map_err(|e| ApiError::BadRequest(format!("invalid threshold: {e}")))
    }
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ViewReq {
    #[serde(flatten)]
    pub decision: DecisionReq,
    #[serde(default)]
    pub label_filter: Option<LabelFilterReq>,
    #[serde(default)]
    pub sharing_filter: Option<SharingFilterReq>,
}

impl ViewReq {
    pub fn filters(&self) -> DisplayFilters {
        let labels = match &self.label_filter {
            None => LabelFilter::ShowAll,
            Some(filter) => {
                let labels = filter.labels.iter().cloned().collect();
                match filter.mode {
                    LabelMode::ShowAll => LabelFilter::ShowAll,
                    LabelMode::Only => LabelFilter::OnlyLabeledAs(labels),
                    LabelMode::Except => LabelFilter::ExceptLabeledAs(labels),
                }
            }
        };
        let sharing = match self.sharing_filter.unwrap_or_default() {
            SharingFilterReq::All => SharingFilter::All,
            SharingFilterReq::PermittedOnly => SharingFilter::PermittedOnly,
            SharingFilterReq::DeniedOnly => SharingFilter::DeniedOnly,
        };
        DisplayFilters { labels, sharing }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ViewResource {
    pub key: Option<String>,
    pub id: Option<String>,
    /// `permit` or `deny`.
    pub decision: String,
    pub labels: Vec<String>,
    #[schema(value_type = Object)]
    pub resource: Value,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ViewGroupRes {
    pub resource_type: String,
    pub resources: Vec<ViewResource>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ViewRes {
    pub patient_id: String,
    /// `None` when no consent applies.
    pub consent_id: Option<String>,
    pub threshold: String,
    pub sharing_mode: Option<String>,
    pub denied: usize,
    /// Set when labeling failed and resources were treated as unlabeled.
    pub labeling_error: Option<String>,
    /// `None` when no consent applies.
    pub groups: Option<Vec<ViewGroupRes>>,
}

impl ViewRes {
    pub fn new(patient_id: &str, decisions: &SessionDecisions, filters: &DisplayFilters) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            consent_id: decisions.consent.as_ref().map(|c| c.id.clone()),
            threshold: decisions.threshold.to_string(),
            sharing_mode: decisions.policy().map(|p| p.mode_name().to_string()),
            denied: decisions.denials.len(),
            labeling_error: decisions.labeling_error.clone(),
            groups: decisions.view(filters).as_ref().map(groups_from_view),
        }
    }
}

fn groups_from_view(view: &FilteredView<'_>) -> Vec<ViewGroupRes> {
    view.groups()
        .iter()
        .map(|group| ViewGroupRes {
            resource_type: group.resource_type.to_string(),
            resources: group
                .items
                .iter()
                .map(|item| ViewResource {
                    key: item.entry.key.as_ref().map(|k| k.as_str().to_string()),
                    id: item.entry.resource.id().map(str::to_string),
                    decision: match item.decision {
                        SharingDecision::Permit => "permit".into(),
                        SharingDecision::Deny => "deny".into(),
                    },
                    labels: item
                        .entry
                        .resource
                        .security_labels()
                        .iter()
                        .cloned()
                        .collect(),
                    resource: item.entry.resource.payload().clone(),
                })
                .collect(),
        })
        .collect()
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransferReq {
    /// Base URL of the destination store.
    pub destination: String,
    #[serde(flatten)]
    pub decision: DecisionReq,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransferRes {
    pub submitted: usize,
    pub denied: usize,
    #[schema(value_type = Object)]
    pub response: Value,
}
