//! Patient-view sessions.
//!
//! A [`PatientSession`] owns everything one patient view needs: the indexed record, the
//! candidate consents, the labeling service and the session's caches. Dropping the session drops
//! its caches.
//!
//! Computing decisions:
//! 1. resolve the operative consent (watermark or explicit choice)
//! 2. label the record at the requested threshold (memoised per threshold)
//! 3. derive the denial set (memoised per consent and threshold)
//!
//! If labeling fails, decisions are computed over unlabeled resources and the failure is
//! reported alongside them. Such fallback results are never cached.

use crate::cache::{DecisionCache, DecisionKey, OnceMap};
use crate::constants::{
    DEFAULT_CONSENT_PAGE_SIZE, DEFAULT_THRESHOLD_HUNDREDTHS, DEFAULT_TRANSFER_ID_PREFIX,
};
use crate::decision::{DecisionEngine, DenialSet, SharingPolicy};
use crate::index::ResourceIndex;
use crate::labeling::{LabelingResult, LabelingService};
use crate::redaction::{DisplayFilters, FilteredView, RedactionEngine};
use crate::selector::{self, ConsentChoice, Purpose};
use crate::store::FhirStore;
use crate::transfer::TransferBuilder;
use crate::{ConsentError, ConsentResult, CoreConfig};
use consent_types::ConfidenceThreshold;
use fhir::{Bundle, Consent, ResourceType};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Per-session settings.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub default_threshold: ConfidenceThreshold,
    pub consent_page_size: u32,
    pub transfer_id_prefix: String,
    /// Purposes a consent must cover to be a candidate; empty means any.
    pub purposes: BTreeSet<Purpose>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_threshold: ConfidenceThreshold::from_hundredths(DEFAULT_THRESHOLD_HUNDREDTHS)
                .unwrap_or(ConfidenceThreshold::MIN),
            consent_page_size: DEFAULT_CONSENT_PAGE_SIZE,
            transfer_id_prefix: DEFAULT_TRANSFER_ID_PREFIX.to_string(),
            purposes: BTreeSet::new(),
        }
    }
}

impl SessionSettings {
    pub fn from_config(cfg: &CoreConfig) -> Self {
        Self {
            default_threshold: cfg.default_threshold(),
            consent_page_size: cfg.consent_page_size(),
            transfer_id_prefix: cfg.transfer_id_prefix().to_string(),
            purposes: BTreeSet::new(),
        }
    }

    pub fn with_purposes(mut self, purposes: BTreeSet<Purpose>) -> Self {
        self.purposes = purposes;
        self
    }
}

/// Outcome of one decision request.
#[derive(Clone, Debug)]
pub struct SessionDecisions {
    /// `None` when no consent applies (no candidates, or the chosen id is unknown).
    pub consent: Option<Consent>,
    pub threshold: ConfidenceThreshold,
    /// Index the decisions were made over: labeled, or unlabeled after a labeling failure.
    pub index: Arc<ResourceIndex>,
    pub denials: Arc<DenialSet>,
    /// Set when labeling failed and the fallback was used.
    pub labeling_error: Option<String>,
}

impl SessionDecisions {
    /// Filtered view, or `None` when no consent applies.
    pub fn view(&self, filters: &DisplayFilters) -> Option<FilteredView<'_>> {
        self.consent.as_ref()?;
        Some(RedactionEngine::filter_with(
            &self.index,
            &self.denials,
            filters,
        ))
    }

    /// Deliverable bundle of permitted resources, or `None` when no consent applies.
    pub fn redacted_bundle(&self) -> Option<Bundle> {
        self.consent.as_ref()?;
        Some(RedactionEngine::redacted_bundle(&self.index, &self.denials))
    }

    pub fn policy(&self) -> Option<SharingPolicy> {
        self.consent.as_ref().map(SharingPolicy::for_consent)
    }
}

/// One patient-view session.
pub struct PatientSession {
    patient_id: String,
    index: Arc<ResourceIndex>,
    unlabeled: Arc<ResourceIndex>,
    candidates: Vec<Consent>,
    labeler: Arc<dyn LabelingService>,
    settings: SessionSettings,
    labeled: OnceMap<ConfidenceThreshold, ResourceIndex>,
    decisions: DecisionCache,
}

impl std::fmt::Debug for PatientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatientSession")
            .field("patient_id", &self.patient_id)
            .field("resources", &self.index.len())
            .field("candidates", &self.candidates.len())
            .finish_non_exhaustive()
    }
}

impl PatientSession {
    /// Session over an already-fetched record.
    ///
    /// Candidates are narrowed with [`selector::eligible`] using the settings' purposes.
    pub fn new(
        patient_id: impl Into<String>,
        index: ResourceIndex,
        candidates: Vec<Consent>,
        labeler: Arc<dyn LabelingService>,
        settings: SessionSettings,
    ) -> Self {
        let patient_id = patient_id.into();
        let candidates = selector::eligible(&candidates, &patient_id, &settings.purposes);
        let unlabeled = Arc::new(index.relabel(&LabelingResult::default()));
        Self {
            patient_id,
            index: Arc::new(index),
            unlabeled,
            candidates,
            labeler,
            settings,
            labeled: OnceMap::new(),
            decisions: DecisionCache::new(),
        }
    }

    /// Fetch a patient's record and candidate consents and open a session.
    ///
    /// With an `organization`, candidates come from a consent search by controller; without
    /// one, they are the Consent resources found in the record itself.
    ///
    /// # Errors
    ///
    /// Fails with [`ConsentError::PaginationFailed`] if any record page fails (nothing partial is
    /// kept) or [`ConsentError::ConsentSearchFailed`] if the consent search fails.
    pub async fn load(
        store: &dyn FhirStore,
        labeler: Arc<dyn LabelingService>,
        settings: SessionSettings,
        patient_id: &str,
        organization: Option<&str>,
    ) -> ConsentResult<Self> {
        let record = store.fetch_record(patient_id).await?;
        let index = ResourceIndex::build(&record);

        let candidates = match organization {
            Some(organization) => {
                store
                    .search_consents(organization, patient_id, settings.consent_page_size)
                    .await?
            }
            None => consents_in_record(&index),
        };

        let session = Self::new(patient_id, index, candidates, labeler, settings);
        tracing::info!(
            patient = patient_id,
            resources = session.index.len(),
            candidates = session.candidates.len(),
            "opened patient session"
        );
        Ok(session)
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    /// The record as fetched, with store-supplied labels.
    pub fn index(&self) -> &ResourceIndex {
        &self.index
    }

    pub fn candidates(&self) -> &[Consent] {
        &self.candidates
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// The consent the watermark rule selects.
    pub fn watermark(&self) -> Option<&Consent> {
        selector::select(&self.candidates)
    }

    pub fn decision_cache(&self) -> &DecisionCache {
        &self.decisions
    }

    /// Compute (or reuse) decisions for `choice` at `threshold` (session default if `None`).
    pub async fn decisions(
        &self,
        choice: &ConsentChoice,
        threshold: Option<ConfidenceThreshold>,
    ) -> ConsentResult<SessionDecisions> {
        let threshold = threshold.unwrap_or(self.settings.default_threshold);

        let Some(consent) = selector::resolve(&self.candidates, choice).cloned() else {
            return Ok(SessionDecisions {
                consent: None,
                threshold,
                index: self.unlabeled.clone(),
                denials: Arc::new(DenialSet::new()),
                labeling_error: None,
            });
        };

        let key = DecisionKey::new(consent.id.clone(), threshold);
        let computed = self
            .decisions
            .get_or_compute(key, || async {
                let labeled = self.labeled_index(threshold).await?;
                Ok(DecisionEngine::decide_for_consent(
                    labeled.entries(),
                    &consent,
                ))
            })
            .await;

        match computed {
            Ok(denials) => {
                let index = self.labeled_index(threshold).await?;
                Ok(SessionDecisions {
                    consent: Some(consent),
                    threshold,
                    index,
                    denials,
                    labeling_error: None,
                })
            }
            Err(ConsentError::LabelingFailed(message)) => {
                tracing::warn!(
                    patient = %self.patient_id,
                    consent = %consent.id,
                    "labeling failed, deciding over unlabeled resources: {message}"
                );
                let denials =
                    DecisionEngine::decide_for_consent(self.unlabeled.entries(), &consent);
                Ok(SessionDecisions {
                    consent: Some(consent),
                    threshold,
                    index: self.unlabeled.clone(),
                    denials: Arc::new(denials),
                    labeling_error: Some(message),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn labeled_index(
        &self,
        threshold: ConfidenceThreshold,
    ) -> ConsentResult<Arc<ResourceIndex>> {
        self.labeled
            .get_or_compute(threshold, || async {
                let result = self
                    .labeler
                    .label(self.index.entries(), &self.patient_id, threshold)
                    .await?;
                Ok(self.index.relabel(&result))
            })
            .await
    }

    /// Build the transaction bundle of permitted resources and submit it to `destination`.
    ///
    /// # Errors
    ///
    /// Refuses with [`ConsentError::LabelingFailed`] when labeling failed, and with
    /// [`ConsentError::InvalidInput`] when no consent applies. Submission failures are
    /// [`ConsentError::TransferFailed`].
    pub async fn transfer(
        &self,
        store: &dyn FhirStore,
        destination: &str,
        choice: &ConsentChoice,
        threshold: Option<ConfidenceThreshold>,
    ) -> ConsentResult<TransferOutcome> {
        let decisions = self.decisions(choice, threshold).await?;
        if let Some(message) = decisions.labeling_error {
            return Err(ConsentError::LabelingFailed(message));
        }
        let Some(view) = decisions.view(&DisplayFilters::permitted()) else {
            return Err(ConsentError::InvalidInput(
                "no applicable consent for transfer".into(),
            ));
        };

        let bundle = TransferBuilder::new(&self.settings.transfer_id_prefix)
            .build(view.items().map(|item| item.entry));
        let response = TransferBuilder::submit(store, destination, &bundle).await?;
        Ok(TransferOutcome {
            submitted: bundle.entry.len(),
            denied: decisions.denials.len(),
            response,
        })
    }
}

/// Result of a submitted transfer.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferOutcome {
    pub submitted: usize,
    pub denied: usize,
    pub response: Value,
}

/// Consent resources present in a fetched record.
fn consents_in_record(index: &ResourceIndex) -> Vec<Consent> {
    index
        .of_type(&ResourceType::Consent)
        .into_iter()
        .filter_map(
            |entry| match Consent::from_value(entry.resource.payload().clone()) {
                Ok(consent) => Some(consent),
                Err(e) => {
                    tracing::warn!("skipping unreadable consent in record: {e}");
                    None
                }
            },
        )
        .collect()
}
