//! Permit/deny decisions for labeled resources.
//!
//! A consent is reduced to a [`SharingPolicy`] before any resource is looked at. The policy is an
//! explicit three-mode flag rather than something inferred per resource:
//!
//! - [`SharingPolicy::ShareAll`]: nothing is denied
//! - [`SharingPolicy::ShareNone`]: every keyed resource is denied, whatever its labels
//! - [`SharingPolicy::Custom`]: the masked-category set is applied with a [`Polarity`]
//!
//! Resources without an identity key cannot be recorded in a [`DenialSet`] and therefore always
//! pass through.

use crate::index::IndexedResource;
use fhir::{Consent, ConsentDecision, ResourceKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How masked categories are applied by a custom policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Polarity {
    /// A resource is denied iff it carries at least one masked category.
    DenyMasked,
    /// Masked categories are the ones that may be shared: a resource is denied iff it carries
    /// at least one label outside the masked set. Unlabeled resources are permitted.
    ///
    /// A resource carrying a masked category together with any other label is denied: the
    /// masked category does not exempt it.
    PermitMasked,
}

/// Sharing mode applied to a set of labeled resources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SharingPolicy {
    ShareAll,
    ShareNone,
    Custom {
        masked: BTreeSet<String>,
        polarity: Polarity,
    },
}

impl SharingPolicy {
    /// Derive the policy a consent expresses.
    ///
    /// | decision | masked set | policy                   |
    /// |----------|------------|--------------------------|
    /// | permit   | empty      | share-all                |
    /// | permit   | non-empty  | custom, permit-masked    |
    /// | deny     | empty      | share-none               |
    /// | deny     | non-empty  | custom, deny-masked      |
    /// | missing  | any        | share-none               |
    pub fn for_consent(consent: &Consent) -> Self {
        let masked = consent.masked_categories();
        match consent.decision {
            Some(ConsentDecision::Permit) if masked.is_empty() => Self::ShareAll,
            Some(ConsentDecision::Permit) => Self::Custom {
                masked,
                polarity: Polarity::PermitMasked,
            },
            Some(ConsentDecision::Deny) if masked.is_empty() => Self::ShareNone,
            Some(ConsentDecision::Deny) => Self::Custom {
                masked,
                polarity: Polarity::DenyMasked,
            },
            None => Self::ShareNone,
        }
    }

    /// Whether a resource carrying `labels` is denied under this policy.
    pub fn denies(&self, labels: &BTreeSet<String>) -> bool {
        match self {
            Self::ShareAll => false,
            Self::ShareNone => true,
            Self::Custom {
                masked,
                polarity: Polarity::DenyMasked,
            } => !labels.is_disjoint(masked),
            Self::Custom {
                masked,
                polarity: Polarity::PermitMasked,
            } => !labels.is_subset(masked),
        }
    }

    /// Short name used in logs and API responses.
    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::ShareAll => "share-all",
            Self::ShareNone => "share-none",
            Self::Custom {
                polarity: Polarity::DenyMasked,
                ..
            } => "custom-deny-masked",
            Self::Custom {
                polarity: Polarity::PermitMasked,
                ..
            } => "custom-permit-masked",
        }
    }
}

/// Per-resource outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingDecision {
    Permit,
    Deny,
}

/// Identity keys of resources judged denied.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DenialSet(BTreeSet<ResourceKey>);

impl DenialSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.0.contains(key)
    }

    pub fn insert(&mut self, key: ResourceKey) -> bool {
        self.0.insert(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceKey> {
        self.0.iter()
    }

    /// Decision for an indexed resource; unkeyed resources are always permitted.
    pub fn decision_for(&self, entry: &IndexedResource) -> SharingDecision {
        match &entry.key {
            Some(key) if self.contains(key) => SharingDecision::Deny,
            _ => SharingDecision::Permit,
        }
    }
}

impl FromIterator<ResourceKey> for DenialSet {
    fn from_iter<I: IntoIterator<Item = ResourceKey>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Computes denial sets.
pub struct DecisionEngine;

impl DecisionEngine {
    /// Apply `policy` to every labeled resource.
    pub fn decide<'a>(
        resources: impl IntoIterator<Item = &'a IndexedResource>,
        policy: &SharingPolicy,
    ) -> DenialSet {
        resources
            .into_iter()
            .filter_map(|entry| {
                let key = entry.key.as_ref()?;
                policy
                    .denies(entry.resource.security_labels())
                    .then(|| key.clone())
            })
            .collect()
    }

    /// Apply the policy expressed by `consent`.
    pub fn decide_for_consent<'a>(
        resources: impl IntoIterator<Item = &'a IndexedResource>,
        consent: &Consent,
    ) -> DenialSet {
        let policy = SharingPolicy::for_consent(consent);
        let denials = Self::decide(resources, &policy);
        tracing::debug!(
            consent = %consent.id,
            mode = policy.mode_name(),
            denied = denials.len(),
            "computed denial set"
        );
        denials
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ResourceIndex;
    use fhir::{Bundle, ConsentStatus, Provision};
    use serde_json::json;

    fn labeled(entries: &[(&str, &[&str])]) -> ResourceIndex {
        let entries: Vec<_> = entries
            .iter()
            .map(|(id, labels)| {
                let security: Vec<_> = labels.iter().map(|code| json!({"code": code})).collect();
                json!({"resource": {
                    "resourceType": "Condition",
                    "id": id,
                    "meta": {"security": security}
                }})
            })
            .collect();
        ResourceIndex::build(
            &Bundle::from_value(json!({
                "resourceType": "Bundle",
                "type": "collection",
                "entry": entries
            }))
            .expect("bundle"),
        )
    }

    fn consent(decision: Option<ConsentDecision>, labels: &[&str]) -> Consent {
        Consent {
            id: "c".into(),
            decision,
            status: ConsentStatus::Active,
            subject_patient_id: Some("p".into()),
            controllers: vec![],
            provisions: vec![Provision {
                security_labels: labels.iter().map(|s| s.to_string()).collect(),
                purposes: vec![],
            }],
            last_updated: None,
        }
    }

    fn keys(denials: &DenialSet) -> Vec<&str> {
        denials.iter().map(ResourceKey::as_str).collect()
    }

    #[test]
    fn deny_consent_denies_resources_carrying_masked_categories() {
        let index = labeled(&[("A", &["SUD"]), ("B", &["DEMO"])]);
        let denials = DecisionEngine::decide_for_consent(
            index.entries(),
            &consent(Some(ConsentDecision::Deny), &["SUD", "MENCAT"]),
        );
        assert_eq!(keys(&denials), vec!["Condition/A"]);
    }

    #[test]
    fn share_all_denies_nothing() {
        let index = labeled(&[("A", &["SUD"]), ("B", &["HIV", "PSY"]), ("C", &[])]);
        let denials = DecisionEngine::decide_for_consent(
            index.entries(),
            &consent(Some(ConsentDecision::Permit), &[]),
        );
        assert!(denials.is_empty());
    }

    #[test]
    fn share_none_denies_every_keyed_resource() {
        let index = labeled(&[("A", &["SUD"]), ("B", &[]), ("C", &["DEMO"])]);
        let policy = SharingPolicy::for_consent(&consent(Some(ConsentDecision::Deny), &[]));
        assert_eq!(policy, SharingPolicy::ShareNone);
        let denials = DecisionEngine::decide(index.entries(), &policy);
        assert_eq!(denials.len(), index.len());
    }

    #[test]
    fn missing_decision_fails_closed() {
        let policy = SharingPolicy::for_consent(&consent(None, &["SUD"]));
        assert_eq!(policy, SharingPolicy::ShareNone);
    }

    #[test]
    fn permit_masked_shares_only_listed_categories() {
        let index = labeled(&[
            ("A", &["SUD"]),
            ("B", &["SUD", "HIV"]),
            ("C", &["PSY"]),
            ("D", &[]),
        ]);
        let policy = SharingPolicy::for_consent(&consent(Some(ConsentDecision::Permit), &["SUD"]));
        let denials = DecisionEngine::decide(index.entries(), &policy);
        assert_eq!(keys(&denials), vec!["Condition/B", "Condition/C"]);
    }

    #[test]
    fn permit_masked_denies_mixed_label_resources() {
        let policy = SharingPolicy::Custom {
            masked: ["SUD".to_string(), "PSY".to_string()].into(),
            polarity: Polarity::PermitMasked,
        };
        let set = |labels: &[&str]| labels.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();

        assert!(!policy.denies(&set(&["SUD", "PSY"])));
        assert!(policy.denies(&set(&["SUD", "HIV"])));
        assert!(policy.denies(&set(&["PSY", "DEMO"])));
        assert!(!policy.denies(&set(&[])));
    }

    #[test]
    fn explicit_policy_overrides_consent_polarity() {
        let index = labeled(&[("A", &["SUD"]), ("B", &["DEMO"])]);
        let policy = SharingPolicy::Custom {
            masked: ["DEMO".to_string()].into(),
            polarity: Polarity::DenyMasked,
        };
        let denials = DecisionEngine::decide(index.entries(), &policy);
        assert_eq!(keys(&denials), vec!["Condition/B"]);
    }

    #[test]
    fn unkeyed_resources_are_never_denied() {
        let index = ResourceIndex::build(
            &Bundle::from_value(json!({
                "resourceType": "Bundle",
                "type": "collection",
                "entry": [{"resource": {
                    "resourceType": "Observation",
                    "meta": {"security": [{"code": "SUD"}]}
                }}]
            }))
            .expect("bundle"),
        );
        let denials = DecisionEngine::decide(index.entries(), &SharingPolicy::ShareNone);
        assert!(denials.is_empty());
        assert_eq!(
            denials.decision_for(&index.entries()[0]),
            SharingDecision::Permit
        );
    }

    #[test]
    fn deny_masked_property_holds_for_label_combinations() {
        let masked: BTreeSet<String> = ["SUD".to_string(), "MENCAT".to_string()].into();
        let policy = SharingPolicy::Custom {
            masked: masked.clone(),
            polarity: Polarity::DenyMasked,
        };
        let codes = ["SUD", "MENCAT", "DEMO", "HIV"];
        for mask in 0u8..16 {
            let labels: BTreeSet<String> = codes
                .iter()
                .enumerate()
                .filter(|(bit, _)| mask & (1 << bit) != 0)
                .map(|(_, code)| code.to_string())
                .collect();
            assert_eq!(policy.denies(&labels), !labels.is_disjoint(&masked));
        }
    }
}
