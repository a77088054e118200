//! Resource index.
//!
//! Normalises a raw bundle into lookups by type, by identity key and by origin reference. The
//! index owns its resources; every lookup hands out references into the same storage, so a key
//! keeps resolving to the same instance for the lifetime of the index.
//!
//! Indexing rules:
//! - identity key is `Type/id`, falling back to the entry's origin reference (`fullUrl`)
//! - the first occurrence of a key wins, later duplicates are dropped
//! - entries with neither id nor origin reference are kept but have no key
//! - entries whose resource body cannot be parsed are skipped with a warning

use crate::labeling::LabelingResult;
use fhir::{Bundle, Resource, ResourceKey, ResourceType};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// One indexed resource with its origin and identity key.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexedResource {
    /// `fullUrl` of the bundle entry the resource came from.
    pub origin: Option<String>,
    /// `None` when the entry had neither id nor origin reference.
    pub key: Option<ResourceKey>,
    pub resource: Resource,
}

/// Resources of one type, in first-seen order.
#[derive(Clone, Debug, PartialEq)]
struct TypeGroup {
    resource_type: ResourceType,
    positions: Vec<usize>,
}

/// Lookup structure over one patient's resources.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceIndex {
    entries: Vec<IndexedResource>,
    groups: Vec<TypeGroup>,
    by_key: HashMap<ResourceKey, usize>,
    by_origin: HashMap<String, usize>,
}

impl ResourceIndex {
    /// Index a bundle in a single pass over its entries.
    pub fn build(bundle: &Bundle) -> Self {
        let mut index = Self::default();
        let mut skipped = 0usize;
        let mut duplicates = 0usize;

        for (position, entry) in bundle.entry.iter().enumerate() {
            let resource = match entry.parse_resource() {
                Some(Ok(resource)) => resource,
                Some(Err(e)) => {
                    tracing::warn!("skipping bundle entry {position}: {e}");
                    skipped += 1;
                    continue;
                }
                None => continue,
            };

            let origin = entry
                .full_url
                .as_ref()
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty());

            if !index.insert(origin, resource) {
                duplicates += 1;
            }
        }

        tracing::debug!(
            resources = index.entries.len(),
            duplicates,
            skipped,
            "indexed bundle"
        );
        index
    }

    /// Insert one resource. Returns `false` when its key was already present.
    fn insert(&mut self, origin: Option<String>, resource: Resource) -> bool {
        let key = identity_key(&resource, origin.as_deref());

        if let Some(key) = &key {
            if self.by_key.contains_key(key) {
                return false;
            }
        }

        let position = self.entries.len();
        if let Some(key) = &key {
            self.by_key.insert(key.clone(), position);
        }
        if let Some(origin) = &origin {
            self.by_origin.entry(origin.clone()).or_insert(position);
        }

        match self
            .groups
            .iter_mut()
            .find(|group| &group.resource_type == resource.resource_type())
        {
            Some(group) => group.positions.push(position),
            None => self.groups.push(TypeGroup {
                resource_type: resource.resource_type().clone(),
                positions: vec![position],
            }),
        }

        self.entries.push(IndexedResource {
            origin,
            key,
            resource,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All indexed resources in first-seen order.
    pub fn entries(&self) -> &[IndexedResource] {
        &self.entries
    }

    /// Resource types in first-seen order.
    pub fn resource_types(&self) -> impl Iterator<Item = &ResourceType> {
        self.groups.iter().map(|group| &group.resource_type)
    }

    /// Groups of resources by type, in first-seen order.
    pub fn groups(&self) -> impl Iterator<Item = (&ResourceType, Vec<&IndexedResource>)> {
        self.groups.iter().map(|group| {
            (
                &group.resource_type,
                group
                    .positions
                    .iter()
                    .map(|&position| &self.entries[position])
                    .collect(),
            )
        })
    }

    /// Resources of one type.
    pub fn of_type(&self, resource_type: &ResourceType) -> Vec<&IndexedResource> {
        self.groups
            .iter()
            .find(|group| &group.resource_type == resource_type)
            .map(|group| {
                group
                    .positions
                    .iter()
                    .map(|&position| &self.entries[position])
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every identity key in the index.
    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.entries.iter().filter_map(|entry| entry.key.as_ref())
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&IndexedResource> {
        self.by_key.get(key).map(|&position| &self.entries[position])
    }

    pub fn by_origin(&self, origin: &str) -> Option<&IndexedResource> {
        self.by_origin
            .get(origin)
            .map(|&position| &self.entries[position])
    }

    /// Resolve a reference (`Type/id` or an absolute origin reference) to an indexed resource.
    ///
    /// Absolute URLs that are not origins of any entry are retried using their trailing
    /// `Type/id` segments.
    pub fn resolve(&self, reference: &str) -> Option<&IndexedResource> {
        let reference = reference.trim();
        if let Some(found) = self
            .get(&ResourceKey::from(reference))
            .or_else(|| self.by_origin(reference))
        {
            return Some(found);
        }

        let mut segments = reference.rsplit('/');
        let id = segments.next()?;
        let resource_type = segments.next()?;
        if id.is_empty() || resource_type.is_empty() {
            return None;
        }
        self.get(&ResourceKey::from_parts(
            &ResourceType::parse(resource_type),
            id,
        ))
    }

    /// Find a contained resource (`#id` reference) inside `resource`'s payload.
    pub fn resolve_contained<'a>(resource: &'a Resource, reference: &str) -> Option<&'a Value> {
        let local_id = reference.strip_prefix('#')?;
        resource
            .payload()
            .get("contained")?
            .as_array()?
            .iter()
            .find(|contained| contained.get("id").and_then(Value::as_str) == Some(local_id))
    }

    /// Return a copy whose resources carry the labels assigned in `result`.
    ///
    /// Resources absent from the result carry no labels.
    pub fn relabel(&self, result: &LabelingResult) -> Self {
        let mut relabeled = self.clone();
        for entry in &mut relabeled.entries {
            let labels = entry
                .key
                .as_ref()
                .and_then(|key| result.labels_for(key))
                .cloned()
                .unwrap_or_else(BTreeSet::new);
            entry.resource = entry.resource.with_security_labels(labels);
        }
        relabeled
    }

    /// Rebuild a collection bundle of every indexed resource, keeping origins.
    pub fn to_bundle(&self) -> Bundle {
        Bundle::collection(
            self.entries
                .iter()
                .map(|entry| fhir::BundleEntry::new(entry.origin.clone(), &entry.resource)),
        )
    }
}

/// Identity key for a resource: `Type/id`, else the origin reference.
pub fn identity_key(resource: &Resource, origin: Option<&str>) -> Option<ResourceKey> {
    match resource.id() {
        Some(id) => Some(ResourceKey::from_parts(resource.resource_type(), id)),
        None => origin.map(ResourceKey::from_origin),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle(entries: Value) -> Bundle {
        Bundle::from_value(json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": entries
        }))
        .expect("valid bundle")
    }

    #[test]
    fn groups_by_type_in_insertion_order() {
        let index = ResourceIndex::build(&bundle(json!([
            {"resource": {"resourceType": "Condition", "id": "c1"}},
            {"resource": {"resourceType": "Observation", "id": "o1"}},
            {"resource": {"resourceType": "Condition", "id": "c2"}}
        ])));

        let types: Vec<&str> = index.resource_types().map(ResourceType::as_str).collect();
        assert_eq!(types, vec!["Condition", "Observation"]);
        let conditions = index.of_type(&ResourceType::Condition);
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[1].resource.id(), Some("c2"));
    }

    #[test]
    fn first_occurrence_wins_for_duplicate_keys() {
        let index = ResourceIndex::build(&bundle(json!([
            {"fullUrl": "http://a/Condition/c1", "resource": {"resourceType": "Condition", "id": "c1", "code": "first"}},
            {"fullUrl": "http://b/Condition/c1", "resource": {"resourceType": "Condition", "id": "c1", "code": "second"}}
        ])));

        assert_eq!(index.len(), 1);
        let found = index.get(&ResourceKey::from("Condition/c1")).expect("indexed");
        assert_eq!(found.resource.payload()["code"], "first");
        assert!(index.by_origin("http://b/Condition/c1").is_none());
    }

    #[test]
    fn falls_back_to_origin_reference_without_id() {
        let index = ResourceIndex::build(&bundle(json!([
            {"fullUrl": "urn:uuid:1", "resource": {"resourceType": "Observation"}},
            {"fullUrl": "urn:uuid:1", "resource": {"resourceType": "Observation"}},
            {"resource": {"resourceType": "Observation"}},
            {"resource": {"resourceType": "Observation"}}
        ])));

        assert_eq!(index.len(), 3);
        assert_eq!(
            index.entries()[0].key.as_ref().map(ResourceKey::as_str),
            Some("urn:uuid:1")
        );
        assert!(index.entries()[1].key.is_none());
        assert!(index.entries()[2].key.is_none());
    }

    #[test]
    fn skips_unparseable_entries() {
        let index = ResourceIndex::build(&bundle(json!([
            {"resource": {"id": "no-type"}},
            {"fullUrl": "urn:uuid:empty"},
            {"resource": {"resourceType": "Patient", "id": "p"}}
        ])));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn resolves_relative_absolute_and_contained_references() {
        let index = ResourceIndex::build(&bundle(json!([
            {"fullUrl": "http://fhir/Medication/m1", "resource": {"resourceType": "Medication", "id": "m1"}},
            {"resource": {
                "resourceType": "MedicationRequest",
                "id": "mr1",
                "contained": [{"resourceType": "Medication", "id": "med"}],
                "medicationReference": {"reference": "#med"}
            }}
        ])));

        let by_key = index.resolve("Medication/m1").expect("relative");
        let by_origin = index.resolve("http://fhir/Medication/m1").expect("absolute");
        let by_segments = index.resolve("http://other/fhir/Medication/m1").expect("segments");
        assert!(std::ptr::eq(by_key, by_origin));
        assert!(std::ptr::eq(by_key, by_segments));
        assert!(index.resolve("Medication/missing").is_none());

        let request = index.resolve("MedicationRequest/mr1").expect("request");
        let contained =
            ResourceIndex::resolve_contained(&request.resource, "#med").expect("contained");
        assert_eq!(contained["resourceType"], "Medication");
        assert!(ResourceIndex::resolve_contained(&request.resource, "med").is_none());
    }

    #[test]
    fn relabel_replaces_labels_and_clears_absent() {
        let index = ResourceIndex::build(&bundle(json!([
            {"resource": {"resourceType": "Condition", "id": "a", "meta": {"security": [{"code": "OLD"}]}}},
            {"resource": {"resourceType": "Condition", "id": "b"}}
        ])));

        let mut result = LabelingResult::default();
        result.insert(ResourceKey::from("Condition/b"), ["SUD".to_string()].into());

        let labeled = index.relabel(&result);
        let a = labeled.get(&ResourceKey::from("Condition/a")).unwrap();
        let b = labeled.get(&ResourceKey::from("Condition/b")).unwrap();
        assert!(a.resource.security_labels().is_empty());
        assert!(b.resource.security_labels().contains("SUD"));
        // original untouched
        let original = index.get(&ResourceKey::from("Condition/a")).unwrap();
        assert!(original.resource.security_labels().contains("OLD"));
    }
}
