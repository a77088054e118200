//! Redacted views and deliverable bundles.
//!
//! A [`FilteredView`] groups an index's resources by type and pairs each with its sharing
//! decision. Display filters narrow the view further; they never touch the denial set.

use crate::decision::{DenialSet, SharingDecision};
use crate::index::{IndexedResource, ResourceIndex};
use fhir::{Bundle, BundleEntry, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Category-label visibility filter, matched against a resource's own labels.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "labels", rename_all = "kebab-case")]
pub enum LabelFilter {
    #[default]
    ShowAll,
    /// Resources carrying at least one of the labels.
    OnlyLabeledAs(BTreeSet<String>),
    /// Resources carrying none of the labels.
    ExceptLabeledAs(BTreeSet<String>),
}

impl LabelFilter {
    pub fn accepts(&self, labels: &BTreeSet<String>) -> bool {
        match self {
            Self::ShowAll => true,
            Self::OnlyLabeledAs(wanted) => !labels.is_disjoint(wanted),
            Self::ExceptLabeledAs(hidden) => labels.is_disjoint(hidden),
        }
    }
}

/// Sharing-decision filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SharingFilter {
    #[default]
    All,
    PermittedOnly,
    DeniedOnly,
}

impl SharingFilter {
    pub fn accepts(self, decision: SharingDecision) -> bool {
        match self {
            Self::All => true,
            Self::PermittedOnly => decision == SharingDecision::Permit,
            Self::DeniedOnly => decision == SharingDecision::Deny,
        }
    }
}

/// Display filters; a resource is shown iff it passes both.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayFilters {
    #[serde(default)]
    pub labels: LabelFilter,
    #[serde(default)]
    pub sharing: SharingFilter,
}

impl DisplayFilters {
    /// Filters showing permitted resources only.
    pub fn permitted() -> Self {
        Self {
            labels: LabelFilter::ShowAll,
            sharing: SharingFilter::PermittedOnly,
        }
    }

    fn accepts(&self, item: &ViewItem<'_>) -> bool {
        self.sharing.accepts(item.decision)
            && self.labels.accepts(item.entry.resource.security_labels())
    }
}

/// One shown resource.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewItem<'a> {
    pub entry: &'a IndexedResource,
    pub decision: SharingDecision,
}

/// Shown resources of one type, in index order.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewGroup<'a> {
    pub resource_type: &'a ResourceType,
    pub items: Vec<ViewItem<'a>>,
}

/// Resources of an index that survive a denial set and display filters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilteredView<'a> {
    groups: Vec<ViewGroup<'a>>,
}

impl<'a> FilteredView<'a> {
    /// Groups in first-seen type order. Empty groups are omitted.
    pub fn groups(&self) -> &[ViewGroup<'a>] {
        &self.groups
    }

    pub fn items(&self) -> impl Iterator<Item = &ViewItem<'a>> {
        self.groups.iter().flat_map(|group| group.items.iter())
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(|group| group.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Apply `filters` to the resources already in this view.
    pub fn refilter(&self, filters: &DisplayFilters) -> Self {
        let groups = self
            .groups
            .iter()
            .map(|group| ViewGroup {
                resource_type: group.resource_type,
                items: group
                    .items
                    .iter()
                    .filter(|item| filters.accepts(item))
                    .copied()
                    .collect(),
            })
            .filter(|group| !group.items.is_empty())
            .collect();
        Self { groups }
    }

    /// Collection bundle of the shown resources, keeping origin references.
    pub fn to_bundle(&self) -> Bundle {
        Bundle::collection(
            self.items()
                .map(|item| BundleEntry::new(item.entry.origin.clone(), &item.entry.resource)),
        )
    }
}

/// Builds filtered views over an index.
pub struct RedactionEngine;

impl RedactionEngine {
    /// Permitted resources only.
    pub fn filter<'a>(index: &'a ResourceIndex, denials: &DenialSet) -> FilteredView<'a> {
        Self::filter_with(index, denials, &DisplayFilters::permitted())
    }

    /// Resources passing `filters`, each tagged with its sharing decision.
    pub fn filter_with<'a>(
        index: &'a ResourceIndex,
        denials: &DenialSet,
        filters: &DisplayFilters,
    ) -> FilteredView<'a> {
        let groups = index
            .groups()
            .map(|(resource_type, entries)| ViewGroup {
                resource_type,
                items: entries
                    .into_iter()
                    .map(|entry| ViewItem {
                        entry,
                        decision: denials.decision_for(entry),
                    })
                    .filter(|item| filters.accepts(item))
                    .collect(),
            })
            .filter(|group| !group.items.is_empty())
            .collect();
        FilteredView { groups }
    }

    /// Deliverable collection bundle of permitted resources, in index order.
    pub fn redacted_bundle(index: &ResourceIndex, denials: &DenialSet) -> Bundle {
        Bundle::collection(
            index
                .entries()
                .iter()
                .filter(|entry| denials.decision_for(entry) == SharingDecision::Permit)
                .map(|entry| BundleEntry::new(entry.origin.clone(), &entry.resource)),
        )
    }
}
