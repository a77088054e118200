//! Transaction bundles for a destination store.
//!
//! Destination stores may assign their own numeric ids, so purely numeric ids are replaced by a
//! prefixed id before transfer and every `reference` pointing at them is rewritten. Resources
//! with an id are written with `PUT Type/id`; resources without one are created with `POST Type`
//! under a `urn:uuid:` full URL.

use crate::index::IndexedResource;
use crate::store::FhirStore;
use crate::{ConsentError, ConsentResult};
use fhir::{Bundle, BundleEntry, BundleRequest, BundleType, HttpVerb, ResourceType};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const URN_UUID: &str = "urn:uuid:";

/// Old reference → new reference.
pub type ReferenceMap = HashMap<String, String>;

/// Builds transaction bundles.
#[derive(Clone, Debug)]
pub struct TransferBuilder {
    id_prefix: String,
}

impl TransferBuilder {
    pub fn new(id_prefix: impl Into<String>) -> Self {
        Self {
            id_prefix: id_prefix.into(),
        }
    }

    /// Collect the reference rewrites needed for `resources`.
    ///
    /// Numeric ids map both `Type/id` and the entry's origin reference to `Type/{prefix}id`.
    /// Entries without an id map their origin reference to their `urn:uuid:` full URL.
    pub fn reference_map<'a>(
        &self,
        resources: impl IntoIterator<Item = &'a IndexedResource>,
    ) -> ReferenceMap {
        self.plan(resources)
            .into_iter()
            .flat_map(|planned| planned.rewrites)
            .collect()
    }

    /// Build the transaction bundle for `resources`, preserving their order.
    pub fn build<'a>(&self, resources: impl IntoIterator<Item = &'a IndexedResource>) -> Bundle {
        let planned = self.plan(resources);
        let mapping: ReferenceMap = planned
            .iter()
            .flat_map(|planned| planned.rewrites.iter().cloned())
            .collect();

        let mut bundle = Bundle::new(BundleType::Transaction);
        bundle.entry = planned
            .into_iter()
            .map(|planned| {
                let mut payload = planned.payload;
                rewrite_references(&mut payload, &mapping);
                BundleEntry {
                    full_url: planned.full_url,
                    resource: Some(payload),
                    request: Some(planned.request),
                }
            })
            .collect();

        tracing::info!(
            entries = bundle.entry.len(),
            rewritten = mapping.len(),
            "built transaction bundle"
        );
        bundle
    }

    fn plan<'a>(
        &self,
        resources: impl IntoIterator<Item = &'a IndexedResource>,
    ) -> Vec<PlannedEntry> {
        let resources: Vec<&IndexedResource> = resources.into_iter().collect();
        let mut taken: HashSet<String> = resources
            .iter()
            .filter_map(|entry| entry.resource.reference())
            .collect();

        resources
            .into_iter()
            .map(|entry| {
                let resource_type = entry.resource.resource_type();
                let mut rewrites = Vec::new();

                match entry.resource.id() {
                    Some(id) => {
                        let id = if is_numeric(id) {
                            let new_id = self.unique_id(resource_type, id, &mut taken);
                            let new_reference = format!("{resource_type}/{new_id}");
                            rewrites.push((format!("{resource_type}/{id}"), new_reference.clone()));
                            if let Some(origin) = &entry.origin {
                                rewrites.push((origin.clone(), new_reference));
                            }
                            new_id
                        } else {
                            id.to_string()
                        };
                        PlannedEntry {
                            payload: entry.resource.with_id(id.clone()).into_payload(),
                            full_url: None,
                            request: BundleRequest {
                                method: HttpVerb::Put,
                                url: format!("{resource_type}/{id}"),
                            },
                            rewrites,
                        }
                    }
                    None => {
                        let full_url = match &entry.origin {
                            Some(origin) if origin.starts_with(URN_UUID) => origin.clone(),
                            _ => format!("{URN_UUID}{}", Uuid::new_v4()),
                        };
                        if let Some(origin) = &entry.origin {
                            if origin != &full_url {
                                rewrites.push((origin.clone(), full_url.clone()));
                            }
                        }
                        PlannedEntry {
                            payload: entry.resource.payload().clone(),
                            full_url: Some(full_url),
                            request: post_request(resource_type),
                            rewrites,
                        }
                    }
                }
            })
            .collect()
    }

    /// `{prefix}{id}`, suffixed with `-2`, `-3`, ... while that id is already used by another
    /// resource of the same type or by an earlier rename. The chosen reference is reserved.
    fn unique_id(
        &self,
        resource_type: &ResourceType,
        id: &str,
        taken: &mut HashSet<String>,
    ) -> String {
        let base = format!("{}{id}", self.id_prefix);
        let mut candidate = base.clone();
        let mut suffix = 2u32;
        while taken.contains(&format!("{resource_type}/{candidate}")) {
            candidate = format!("{base}-{suffix}");
            suffix += 1;
        }
        taken.insert(format!("{resource_type}/{candidate}"));
        if candidate != base {
            tracing::warn!(
                resource_type = %resource_type,
                id,
                renamed = %candidate,
                "prefixed id already in use, renamed with a suffix"
            );
        }
        candidate
    }

    /// Submit `bundle` to `destination` through `store`.
    ///
    /// # Errors
    ///
    /// Every failure is reported as [`ConsentError::TransferFailed`]; nothing is retried.
    pub async fn submit(
        store: &dyn FhirStore,
        destination: &str,
        bundle: &Bundle,
    ) -> ConsentResult<Value> {
        store
            .submit_transaction(destination, bundle)
            .await
            .map_err(|e| match e {
                ConsentError::TransferFailed(_) => e,
                other => ConsentError::TransferFailed(other.to_string()),
            })
    }
}

struct PlannedEntry {
    payload: Value,
    full_url: Option<String>,
    request: BundleRequest,
    rewrites: Vec<(String, String)>,
}

fn post_request(resource_type: &ResourceType) -> BundleRequest {
    BundleRequest {
        method: HttpVerb::Post,
        url: resource_type.to_string(),
    }
}

fn is_numeric(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_digit())
}

/// Rewrite every string `reference` field found in `value` using `mapping`.
///
/// Unmapped references are left untouched.
pub fn rewrite_references(value: &mut Value, mapping: &ReferenceMap) {
    match value {
        Value::Object(object) => {
            for (key, child) in object.iter_mut() {
                if key == "reference" {
                    if let Value::String(reference) = child {
                        if let Some(new_reference) = mapping.get(reference.as_str()) {
                            *reference = new_reference.clone();
                        }
                        continue;
                    }
                }
                rewrite_references(child, mapping);
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_references(item, mapping);
            }
        }
        _ => {}
    }
}
