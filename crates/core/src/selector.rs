//! Operative-consent selection ("highest watermark").
//!
//! Rules, first match wins:
//! 1. any `deny` consents: the one with the fewest masked labels (a zero-label deny therefore
//!    always wins)
//! 2. otherwise among `permit` consents: the one with the most masked labels
//! 3. otherwise the first candidate
//!
//! Ties are broken by the smallest consent id, then by the latest `lastUpdated`, so the result
//! does not depend on candidate order.

use crate::constants::{PURPOSE_RESEARCH, PURPOSE_TREATMENT};
use fhir::{Consent, ConsentDecision};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// How the operative consent is chosen.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ConsentChoice {
    #[default]
    Watermark,
    /// A consent picked by the user, by id.
    Explicit(String),
}

impl ConsentChoice {
    /// Explicit when `id` is given, watermark otherwise.
    pub fn from_optional(id: Option<String>) -> Self {
        match id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()) {
            Some(id) => Self::Explicit(id),
            None => Self::Watermark,
        }
    }
}

/// Purpose of use a consent must cover to be eligible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Treatment,
    Research,
}

impl Purpose {
    pub fn code(self) -> &'static str {
        match self {
            Self::Treatment => PURPOSE_TREATMENT,
            Self::Research => PURPOSE_RESEARCH,
        }
    }
}

/// Pick the operative consent among `candidates`.
pub fn select(candidates: &[Consent]) -> Option<&Consent> {
    let with_decision = |decision| {
        candidates
            .iter()
            .filter(move |consent| consent.decision == Some(decision))
    };

    let selected = with_decision(ConsentDecision::Deny)
        .min_by(|a, b| {
            a.masked_label_count()
                .cmp(&b.masked_label_count())
                .then_with(|| tie_break(a, b))
        })
        .or_else(|| {
            with_decision(ConsentDecision::Permit).min_by(|a, b| {
                b.masked_label_count()
                    .cmp(&a.masked_label_count())
                    .then_with(|| tie_break(a, b))
            })
        })
        .or_else(|| candidates.first());

    if let Some(consent) = selected {
        tracing::info!(
            consent = %consent.id,
            candidates = candidates.len(),
            "selected operative consent"
        );
    }
    selected
}

/// Smallest id, then latest `lastUpdated`, then provisions and controllers.
fn tie_break(a: &Consent, b: &Consent) -> Ordering {
    a.id.cmp(&b.id)
        .then_with(|| b.last_updated.cmp(&a.last_updated))
        .then_with(|| content_key(a).cmp(&content_key(b)))
}

fn content_key(consent: &Consent) -> (Vec<(Vec<&str>, Vec<&str>)>, Vec<&str>) {
    let mut provisions: Vec<(Vec<&str>, Vec<&str>)> = consent
        .provisions
        .iter()
        .map(|provision| {
            let mut labels: Vec<&str> =
                provision.security_labels.iter().map(String::as_str).collect();
            labels.sort_unstable();
            let mut purposes: Vec<&str> = provision.purposes.iter().map(String::as_str).collect();
            purposes.sort_unstable();
            (labels, purposes)
        })
        .collect();
    provisions.sort_unstable();
    let mut controllers: Vec<&str> = consent.controllers.iter().map(String::as_str).collect();
    controllers.sort_unstable();
    (provisions, controllers)
}

/// Resolve the operative consent for `choice`.
///
/// An explicit id that is not among the candidates yields `None`.
pub fn resolve<'a>(candidates: &'a [Consent], choice: &ConsentChoice) -> Option<&'a Consent> {
    match choice {
        ConsentChoice::Watermark => select(candidates),
        ConsentChoice::Explicit(id) => {
            let found = candidates.iter().find(|consent| &consent.id == id);
            if found.is_none() {
                tracing::warn!(consent = %id, "selected consent is not among the candidates");
            }
            found
        }
    }
}

/// Candidates that may be selected for `patient_id` under the requested purposes.
///
/// A consent must be active, be about the patient, and cover every requested purpose. A consent
/// without any purpose codes covers every purpose.
pub fn eligible(
    candidates: &[Consent],
    patient_id: &str,
    purposes: &BTreeSet<Purpose>,
) -> Vec<Consent> {
    candidates
        .iter()
        .filter(|consent| consent.is_active())
        .filter(|consent| consent.subject_patient_id.as_deref() == Some(patient_id))
        .filter(|consent| {
            let covered = consent.purposes();
            covered.is_empty()
                || purposes
                    .iter()
                    .all(|purpose| covered.contains(purpose.code()))
        })
        .cloned()
        .collect()
}
