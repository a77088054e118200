//! Clinical resources as seen by the consent engine.
//!
//! The engine only interprets three facts about a resource: its type, its id and its security
//! labels. Everything else is kept as an opaque JSON payload so resources can be delivered or
//! transferred without loss.

use crate::{FhirError, FhirResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Code system used when security labels are written back into `meta.security`.
pub const SECURITY_LABEL_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/v3-ActCode";

// ============================================================================
// Resource type tag
// ============================================================================

/// Resource type tag.
///
/// Known clinical types get their own variant; anything else is carried verbatim in
/// [`ResourceType::Other`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    AllergyIntolerance,
    CarePlan,
    Condition,
    Consent,
    DiagnosticReport,
    DocumentReference,
    Encounter,
    Immunization,
    Medication,
    MedicationRequest,
    MedicationStatement,
    Observation,
    Organization,
    Patient,
    Practitioner,
    Procedure,
    Other(String),
}

impl ResourceType {
    /// Parse the `resourceType` string used on the wire.
    pub fn parse(s: &str) -> Self {
        match s {
            "AllergyIntolerance" => Self::AllergyIntolerance,
            "CarePlan" => Self::CarePlan,
            "Condition" => Self::Condition,
            "Consent" => Self::Consent,
            "DiagnosticReport" => Self::DiagnosticReport,
            "DocumentReference" => Self::DocumentReference,
            "Encounter" => Self::Encounter,
            "Immunization" => Self::Immunization,
            "Medication" => Self::Medication,
            "MedicationRequest" => Self::MedicationRequest,
            "MedicationStatement" => Self::MedicationStatement,
            "Observation" => Self::Observation,
            "Organization" => Self::Organization,
            "Patient" => Self::Patient,
            "Practitioner" => Self::Practitioner,
            "Procedure" => Self::Procedure,
            other => Self::Other(other.to_string()),
        }
    }

    /// The `resourceType` string used on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Self::AllergyIntolerance => "AllergyIntolerance",
            Self::CarePlan => "CarePlan",
            Self::Condition => "Condition",
            Self::Consent => "Consent",
            Self::DiagnosticReport => "DiagnosticReport",
            Self::DocumentReference => "DocumentReference",
            Self::Encounter => "Encounter",
            Self::Immunization => "Immunization",
            Self::Medication => "Medication",
            Self::MedicationRequest => "MedicationRequest",
            Self::MedicationStatement => "MedicationStatement",
            Self::Observation => "Observation",
            Self::Organization => "Organization",
            Self::Patient => "Patient",
            Self::Practitioner => "Practitioner",
            Self::Procedure => "Procedure",
            Self::Other(other) => other,
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Identity key
// ============================================================================

/// Identity key of a resource within one indexing pass.
///
/// Either `Type/id`, or the entry's origin reference (`fullUrl`) when the resource has no id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Key for a resource with an id.
    pub fn from_parts(resource_type: &ResourceType, id: &str) -> Self {
        Self(format!("{}/{}", resource_type.as_str(), id))
    }

    /// Key taken verbatim from an origin reference.
    pub fn from_origin(origin: &str) -> Self {
        Self(origin.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Shared wire fragments
// ============================================================================

/// A FHIR `Coding` fragment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

// ============================================================================
// Resource
// ============================================================================

/// A clinical resource: type tag, optional id, security labels and the full JSON body.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    resource_type: ResourceType,
    id: Option<String>,
    security_labels: BTreeSet<String>,
    payload: Value,
}

impl Resource {
    /// Build a resource from its JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidInput`] if the body is not an object, has no string
    /// `resourceType`, or has a non-string `id`.
    pub fn from_json(payload: Value) -> FhirResult<Self> {
        let object = payload
            .as_object()
            .ok_or_else(|| FhirError::InvalidInput("resource must be a JSON object".into()))?;

        let resource_type = object
            .get("resourceType")
            .and_then(Value::as_str)
            .map(ResourceType::parse)
            .ok_or_else(|| FhirError::InvalidInput("resource is missing resourceType".into()))?;

        let id = match object.get("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) if id.trim().is_empty() => None,
            Some(Value::String(id)) => Some(id.clone()),
            Some(other) => {
                return Err(FhirError::InvalidInput(format!(
                    "{resource_type} id must be a string, got {other}"
                )))
            }
        };

        let security_labels = security_codes(object);

        Ok(Self {
            resource_type,
            id,
            security_labels,
            payload,
        })
    }

    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Category codes currently attached to this resource.
    pub fn security_labels(&self) -> &BTreeSet<String> {
        &self.security_labels
    }

    /// The full JSON body, including `meta.security` reflecting [`Self::security_labels`].
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Consume the resource, returning its JSON body.
    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// `Type/id` reference for this resource, if it has an id.
    pub fn reference(&self) -> Option<String> {
        self.id
            .as_ref()
            .map(|id| format!("{}/{}", self.resource_type, id))
    }

    /// Return a copy carrying exactly `labels` as its security labels.
    ///
    /// `meta.security` in the payload is rewritten to match: existing codings whose code is kept
    /// are preserved as-is, new codes are added under [`SECURITY_LABEL_SYSTEM`].
    pub fn with_security_labels(&self, labels: BTreeSet<String>) -> Self {
        let mut payload = self.payload.clone();
        if let Some(object) = payload.as_object_mut() {
            write_security_codes(object, &labels);
        }
        Self {
            resource_type: self.resource_type.clone(),
            id: self.id.clone(),
            security_labels: labels,
            payload,
        }
    }

    /// Return a copy whose id (and payload `id`) is replaced.
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        let id = id.into();
        let mut payload = self.payload.clone();
        if let Some(object) = payload.as_object_mut() {
            object.insert("id".into(), Value::String(id.clone()));
        }
        Self {
            resource_type: self.resource_type.clone(),
            id: Some(id),
            security_labels: self.security_labels.clone(),
            payload,
        }
    }

    /// Return a copy with a transformed payload; type, id and labels are kept.
    pub fn map_payload(&self, f: impl FnOnce(&mut Value)) -> Self {
        let mut payload = self.payload.clone();
        f(&mut payload);
        Self {
            payload,
            ..self.clone()
        }
    }
}

/// Collect `meta.security[].code` values.
fn security_codes(object: &Map<String, Value>) -> BTreeSet<String> {
    object
        .get("meta")
        .and_then(|meta| meta.get("security"))
        .and_then(Value::as_array)
        .map(|codings| {
            codings
                .iter()
                .filter_map(|coding| coding.get("code").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn write_security_codes(object: &mut Map<String, Value>, labels: &BTreeSet<String>) {
    let meta = object
        .entry("meta")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(meta) = meta.as_object_mut() else {
        return;
    };

    let mut kept: Vec<Value> = meta
        .get("security")
        .and_then(Value::as_array)
        .map(|codings| {
            codings
                .iter()
                .filter(|coding| {
                    coding
                        .get("code")
                        .and_then(Value::as_str)
                        .is_some_and(|code| labels.contains(code))
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    let present: BTreeSet<String> = kept
        .iter()
        .filter_map(|coding| coding.get("code").and_then(Value::as_str))
        .map(str::to_string)
        .collect();

    for code in labels.difference(&present) {
        let coding = Coding {
            system: Some(SECURITY_LABEL_SYSTEM.to_string()),
            code: Some(code.clone()),
            display: None,
        };
        if let Ok(value) = serde_json::to_value(coding) {
            kept.push(value);
        }
    }

    if kept.is_empty() {
        meta.remove("security");
    } else {
        meta.insert("security".into(), Value::Array(kept));
    }
}
