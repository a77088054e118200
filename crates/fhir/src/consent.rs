//! FHIR-aligned consent wire models and translation helpers.
//!
//! Consents follow the FHIR R5 shape: a top-level `decision` (`permit`/`deny`), a `subject`
//! reference to the patient, `controller` organisations and a list of `provision`s carrying
//! `securityLabel` and `purpose` codings.
//!
//! Responsibilities:
//! - Define the public domain-level [`Consent`] used by the decision engine
//! - Define the wire model for serialisation/deserialisation
//! - Flatten nested provisions into a single ordered list
//!
//! Notes:
//! - Consents are read-only for the engine; authoring happens elsewhere

use crate::{from_json_str, from_json_value, Coding, FhirError, FhirResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

// ============================================================================
// Public domain-level types
// ============================================================================

/// Top-level consent decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentDecision {
    /// Provisions describe what may be shared.
    Permit,
    /// Provisions describe what is withheld.
    Deny,
}

impl ConsentDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Permit => "permit",
            Self::Deny => "deny",
        }
    }

    fn parse(s: &str) -> Result<Self, FhirError> {
        match s {
            "permit" => Ok(Self::Permit),
            "deny" => Ok(Self::Deny),
            other => Err(FhirError::InvalidInput(format!(
                "Invalid consent decision: {other}"
            ))),
        }
    }
}

/// Consent status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsentStatus {
    Draft,
    Active,
    Inactive,
    NotDone,
    EnteredInError,
    Unknown,
}

impl ConsentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::NotDone => "not-done",
            Self::EnteredInError => "entered-in-error",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a status code; unrecognised codes map to [`ConsentStatus::Unknown`].
    pub fn parse(s: &str) -> Self {
        match s {
            "draft" => Self::Draft,
            "active" => Self::Active,
            "inactive" => Self::Inactive,
            "not-done" => Self::NotDone,
            "entered-in-error" => Self::EnteredInError,
            _ => Self::Unknown,
        }
    }
}

/// One consent provision.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Provision {
    /// Masked category codes, in document order.
    pub security_labels: Vec<String>,

    /// Purpose-of-use codes (for example `TREAT`, `HRESCH`).
    pub purposes: Vec<String>,
}

/// Domain-level consent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Consent {
    pub id: String,

    /// `None` when the document omits a decision.
    pub decision: Option<ConsentDecision>,

    pub status: ConsentStatus,

    /// Id part of `subject.reference` when it points at a Patient.
    pub subject_patient_id: Option<String>,

    /// `controller[].reference` values.
    pub controllers: Vec<String>,

    /// Provisions flattened in document order.
    pub provisions: Vec<Provision>,

    pub last_updated: Option<DateTime<Utc>>,
}

impl Consent {
    /// Parse a consent from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError`] if the JSON does not match the wire schema, `resourceType` is not
    /// `Consent`, the id is missing, or the decision code is not `permit`/`deny`.
    pub fn parse_json(json_text: &str) -> FhirResult<Self> {
        wire_to_domain(from_json_str::<ConsentWire>(json_text, "Consent")?)
    }

    /// Parse a consent from a decoded JSON value (for example a bundle entry resource).
    pub fn from_value(value: Value) -> FhirResult<Self> {
        wire_to_domain(from_json_value::<ConsentWire>(value, "Consent")?)
    }

    /// Render the consent back to its JSON wire form.
    pub fn to_value(&self) -> FhirResult<Value> {
        serde_json::to_value(domain_to_wire(self))
            .map_err(|e| FhirError::Translation(format!("Failed to serialise consent: {e}")))
    }

    /// Effective masked-category set: the union of every provision's security labels.
    pub fn masked_categories(&self) -> BTreeSet<String> {
        self.provisions
            .iter()
            .flat_map(|provision| provision.security_labels.iter().cloned())
            .collect()
    }

    /// Total number of masked-category labels across all provisions.
    pub fn masked_label_count(&self) -> usize {
        self.provisions
            .iter()
            .map(|provision| provision.security_labels.len())
            .sum()
    }

    /// Union of every provision's purpose codes.
    pub fn purposes(&self) -> BTreeSet<String> {
        self.provisions
            .iter()
            .flat_map(|provision| provision.purposes.iter().cloned())
            .collect()
    }

    pub fn is_active(&self) -> bool {
        self.status == ConsentStatus::Active
    }
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsentWire {
    resource_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<MetaWire>,

    status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<ReferenceWire>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    controller: Vec<ReferenceWire>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    decision: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    provision: Vec<ProvisionWire>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_updated: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct ReferenceWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reference: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionWire {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    security_label: Vec<Coding>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    purpose: Vec<Coding>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    provision: Vec<ProvisionWire>,
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn wire_to_domain(wire: ConsentWire) -> FhirResult<Consent> {
    if wire.resource_type != "Consent" {
        return Err(FhirError::InvalidInput(format!(
            "Expected resourceType 'Consent', got '{}'",
            wire.resource_type
        )));
    }

    let id = wire
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| FhirError::InvalidInput("Consent is missing id".into()))?;

    let decision = wire
        .decision
        .as_deref()
        .map(ConsentDecision::parse)
        .transpose()?;

    let subject_patient_id = wire
        .subject
        .and_then(|subject| subject.reference)
        .and_then(|reference| patient_id_from_reference(&reference));

    let mut provisions = Vec::new();
    flatten_provisions(&wire.provision, &mut provisions);

    Ok(Consent {
        id,
        decision,
        status: ConsentStatus::parse(&wire.status),
        subject_patient_id,
        controllers: wire
            .controller
            .into_iter()
            .filter_map(|controller| controller.reference)
            .collect(),
        provisions,
        last_updated: wire.meta.and_then(|meta| meta.last_updated),
    })
}

fn domain_to_wire(consent: &Consent) -> ConsentWire {
    ConsentWire {
        resource_type: "Consent".into(),
        id: Some(consent.id.clone()),
        meta: consent.last_updated.map(|last_updated| MetaWire {
            last_updated: Some(last_updated),
        }),
        status: consent.status.as_str().to_string(),
        subject: consent
            .subject_patient_id
            .as_ref()
            .map(|patient_id| ReferenceWire {
                reference: Some(format!("Patient/{patient_id}")),
            }),
        controller: consent
            .controllers
            .iter()
            .map(|reference| ReferenceWire {
                reference: Some(reference.clone()),
            })
            .collect(),
        decision: consent.decision.map(|d| d.as_str().to_string()),
        provision: consent
            .provisions
            .iter()
            .map(|provision| ProvisionWire {
                security_label: provision
                    .security_labels
                    .iter()
                    .map(|code| Coding {
                        system: Some(crate::SECURITY_LABEL_SYSTEM.to_string()),
                        code: Some(code.clone()),
                        display: None,
                    })
                    .collect(),
                purpose: provision
                    .purposes
                    .iter()
                    .map(|code| Coding {
                        code: Some(code.clone()),
                        ..Coding::default()
                    })
                    .collect(),
                provision: Vec::new(),
            })
            .collect(),
    }
}

/// Depth-first, document-order flattening of nested provisions.
fn flatten_provisions(wire: &[ProvisionWire], out: &mut Vec<Provision>) {
    for provision in wire {
        out.push(Provision {
            security_labels: codes(&provision.security_label),
            purposes: codes(&provision.purpose),
        });
        flatten_provisions(&provision.provision, out);
    }
}

fn codes(codings: &[Coding]) -> Vec<String> {
    codings
        .iter()
        .filter_map(|coding| coding.code.clone())
        .collect()
}

/// `Patient/123` or `http://host/fhir/Patient/123` → `123`.
fn patient_id_from_reference(reference: &str) -> Option<String> {
    let (prefix, id) = reference.rsplit_once('/')?;
    let resource_type = prefix.rsplit('/').next()?;
    (resource_type == "Patient" && !id.is_empty()).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "resourceType": "Consent",
            "id": "consent-1",
            "meta": {"lastUpdated": "2024-03-01T12:00:00Z"},
            "status": "active",
            "subject": {"reference": "Patient/123"},
            "controller": [{"reference": "Organization/org-1"}],
            "decision": "deny",
            "provision": [
                {
                    "securityLabel": [
                        {"system": "http://terminology.hl7.org/CodeSystem/v3-ActCode", "code": "SUD"}
                    ],
                    "purpose": [{"code": "TREAT"}],
                    "provision": [
                        {"securityLabel": [{"code": "MENCAT"}]}
                    ]
                },
                {"securityLabel": [{"code": "SUD"}]}
            ]
        })
    }

    #[test]
    fn parses_r5_consent() {
        let consent = Consent::from_value(sample()).expect("parse consent");

        assert_eq!(consent.id, "consent-1");
        assert_eq!(consent.decision, Some(ConsentDecision::Deny));
        assert!(consent.is_active());
        assert_eq!(consent.subject_patient_id.as_deref(), Some("123"));
        assert_eq!(consent.controllers, vec!["Organization/org-1".to_string()]);
        assert_eq!(consent.provisions.len(), 3);
        assert!(consent.last_updated.is_some());
    }

    #[test]
    fn masked_categories_are_a_union_but_count_is_total() {
        let consent = Consent::from_value(sample()).expect("parse consent");

        let masked = consent.masked_categories();
        assert_eq!(masked.len(), 2);
        assert!(masked.contains("SUD"));
        assert!(masked.contains("MENCAT"));
        assert_eq!(consent.masked_label_count(), 3);
        assert!(consent.purposes().contains("TREAT"));
    }

    #[test]
    fn rejects_unknown_decision() {
        let mut value = sample();
        value["decision"] = json!("maybe");
        let err = Consent::from_value(value).expect_err("should reject");
        match err {
            FhirError::InvalidInput(msg) => assert!(msg.contains("maybe")),
            other => panic!("expected InvalidInput error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_id() {
        let mut value = sample();
        value.as_object_mut().unwrap().remove("id");
        assert!(Consent::from_value(value).is_err());
    }

    #[test]
    fn missing_decision_is_none() {
        let mut value = sample();
        value.as_object_mut().unwrap().remove("decision");
        let consent = Consent::from_value(value).expect("parse");
        assert_eq!(consent.decision, None);
    }

    #[test]
    fn unknown_status_maps_to_unknown() {
        let consent = Consent::parse_json(
            r#"{"resourceType": "Consent", "id": "c", "status": "rejected"}"#,
        )
        .expect("parse");
        assert_eq!(consent.status, ConsentStatus::Unknown);
        assert!(consent.provisions.is_empty());
    }

    #[test]
    fn absolute_subject_reference_yields_patient_id() {
        assert_eq!(
            patient_id_from_reference("http://fhir.example/Patient/abc").as_deref(),
            Some("abc")
        );
        assert_eq!(patient_id_from_reference("Group/abc"), None);
    }

    #[test]
    fn renders_back_to_wire() {
        let consent = Consent::from_value(sample()).expect("parse consent");
        let value = consent.to_value().expect("render");
        let reparsed = Consent::from_value(value).expect("reparse");
        assert_eq!(reparsed.masked_categories(), consent.masked_categories());
        assert_eq!(reparsed.decision, consent.decision);
        assert_eq!(reparsed.subject_patient_id, consent.subject_patient_id);
    }
}
