//! FHIR Bundle wire model.
//!
//! Bundles reach the engine in three shapes:
//! - `searchset` pages from the patient-record store, chained by `link[relation=next]`
//! - `collection` bundles wrapping resources sent for labeling or delivered after redaction
//! - `transaction` bundles built for transfer to a destination store
//!
//! Unknown top-level keys (for example `meta` or `timestamp` added by servers) are ignored
//! rather than rejected, since pages come from third-party stores.

use crate::{from_json_str, from_json_value, from_yaml_str, FhirError, FhirResult, Resource};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bundle type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleType {
    Document,
    Message,
    Transaction,
    TransactionResponse,
    Batch,
    BatchResponse,
    History,
    Searchset,
    Collection,
    SubscriptionNotification,
}

/// HTTP verb of a transaction entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpVerb {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
}

/// A `Bundle.link` element.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleLink {
    pub relation: String,
    pub url: String,
}

/// A `Bundle.entry.request` element.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRequest {
    pub method: HttpVerb,
    pub url: String,
}

/// A `Bundle.entry` element.
///
/// The resource body is kept as raw JSON; use [`BundleEntry::parse_resource`] to obtain a typed
/// [`Resource`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<BundleRequest>,
}

impl BundleEntry {
    /// Entry carrying a resource and its origin reference.
    pub fn new(full_url: Option<String>, resource: &Resource) -> Self {
        Self {
            full_url,
            resource: Some(resource.payload().clone()),
            request: None,
        }
    }

    /// Parse the entry's resource body, if any.
    pub fn parse_resource(&self) -> Option<FhirResult<Resource>> {
        self.resource.clone().map(Resource::from_json)
    }
}

/// A FHIR Bundle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub resource_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type")]
    pub bundle_type: BundleType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link: Vec<BundleLink>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<BundleEntry>,
}

impl Bundle {
    /// Empty bundle of the given type.
    pub fn new(bundle_type: BundleType) -> Self {
        Self {
            resource_type: "Bundle".into(),
            id: None,
            bundle_type,
            total: None,
            link: Vec::new(),
            entry: Vec::new(),
        }
    }

    /// Collection bundle wrapping `entries` in order.
    pub fn collection(entries: impl IntoIterator<Item = BundleEntry>) -> Self {
        let mut bundle = Self::new(BundleType::Collection);
        bundle.entry = entries.into_iter().collect();
        bundle.total = Some(bundle.entry.len() as u64);
        bundle
    }

    /// Parse a bundle from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::Translation`] naming the failing field path when the JSON does not
    /// match the wire schema, or [`FhirError::InvalidInput`] if `resourceType` is not `Bundle`.
    pub fn parse_json(json_text: &str) -> FhirResult<Self> {
        from_json_str::<Self>(json_text, "Bundle")?.validated()
    }

    /// Parse a bundle from YAML text (fixtures and files on disk).
    pub fn parse_yaml(yaml_text: &str) -> FhirResult<Self> {
        from_yaml_str::<Self>(yaml_text, "Bundle")?.validated()
    }

    /// Parse a bundle from an already-decoded JSON value.
    pub fn from_value(value: Value) -> FhirResult<Self> {
        from_json_value::<Self>(value, "Bundle")?.validated()
    }

    /// Render the bundle as pretty JSON.
    pub fn render_json(&self) -> FhirResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| FhirError::Translation(format!("Failed to serialise bundle: {e}")))
    }

    /// URL of the `next` page, if this is not the last page.
    pub fn next_link(&self) -> Option<&str> {
        self.link
            .iter()
            .find(|link| link.relation == "next")
            .map(|link| link.url.as_str())
    }

    /// Append the entries of `other`, keeping this bundle's type and links.
    pub fn extend_entries(&mut self, other: Bundle) {
        self.entry.extend(other.entry);
    }

    fn validated(self) -> FhirResult<Self> {
        if self.resource_type != "Bundle" {
            return Err(FhirError::InvalidInput(format!(
                "Expected resourceType 'Bundle', got '{}'",
                self.resource_type
            )));
        }
        Ok(self)
    }
}
