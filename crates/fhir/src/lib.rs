//! FHIR wire/boundary support for the consent engine.
//!
//! This crate provides **wire models** and **format/translation helpers** for the FHIR payloads the
//! consent engine consumes and produces:
//! - Bundles (searchset pages, collections sent for labeling, transaction bundles)
//! - Clinical resources as a tagged type plus an opaque JSON payload
//! - Consent resources (FHIR R5 shape: top-level `decision`, flat `provision` list)
//!
//! This crate focuses on:
//! - serialisation/deserialisation of JSON (wire) and YAML (fixtures on disk)
//! - translation between domain primitives and wire structs
//!
//! It deliberately does not validate resources against FHIR profiles.

pub mod bundle;
pub mod consent;
pub mod resource;

// Re-export public domain-level types
pub use bundle::{Bundle, BundleEntry, BundleLink, BundleRequest, BundleType, HttpVerb};
pub use consent::{Consent, ConsentDecision, ConsentStatus, Provision};
pub use resource::{Coding, Resource, ResourceKey, ResourceType, SECURITY_LABEL_SYSTEM};

use serde::de::DeserializeOwned;

/// Errors returned by the `fhir` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    #[error("translation error: {0}")]
    Translation(String),
}

/// Type alias for Results that can fail with a [`FhirError`].
pub type FhirResult<T> = Result<T, FhirError>;

/// Deserialize JSON text, reporting the path of the first mismatching field.
///
/// `what` names the expected document (for example `Bundle`) in the error message.
pub(crate) fn from_json_str<T: DeserializeOwned>(json_text: &str, what: &str) -> FhirResult<T> {
    let mut deserializer = serde_json::Deserializer::from_str(json_text);
    serde_path_to_error::deserialize(&mut deserializer)
        .map_err(|err| schema_mismatch(what, err.path().to_string(), err.into_inner()))
}

/// Deserialize YAML text, reporting the path of the first mismatching field.
pub(crate) fn from_yaml_str<T: DeserializeOwned>(yaml_text: &str, what: &str) -> FhirResult<T> {
    let deserializer = serde_yaml::Deserializer::from_str(yaml_text);
    serde_path_to_error::deserialize(deserializer)
        .map_err(|err| schema_mismatch(what, err.path().to_string(), err.into_inner()))
}

/// Deserialize an already-parsed JSON value, reporting the failing path.
pub(crate) fn from_json_value<T: DeserializeOwned>(
    value: serde_json::Value,
    what: &str,
) -> FhirResult<T> {
    serde_path_to_error::deserialize(value)
        .map_err(|err| schema_mismatch(what, err.path().to_string(), err.into_inner()))
}

fn schema_mismatch(what: &str, path: String, source: impl std::fmt::Display) -> FhirError {
    let path = if path.is_empty() || path == "." {
        "<root>".to_string()
    } else {
        path
    };
    FhirError::Translation(format!("{what} schema mismatch at {path}: {source}"))
}
