//! # Consent Core
//!
//! Consent-driven labeling, decision and redaction engine.
//!
//! Given a patient's clinical resources and the consents that govern them, this crate:
//! - indexes the record by type, identity key and origin reference ([`ResourceIndex`])
//! - obtains sensitivity labels from an external labeling service ([`LabelingService`])
//! - picks the operative consent ([`selector`]) and computes denial sets ([`DecisionEngine`])
//! - memoises denial sets per session ([`DecisionCache`])
//! - produces redacted views and bundles ([`RedactionEngine`]) and transfer bundles
//!   ([`TransferBuilder`])
//!
//! **No API concerns**: HTTP servers and command-line handling belong in `api-rest` and `cli`.
//! Runtime settings are resolved once into a [`CoreConfig`] and passed in.

pub mod cache;
pub mod config;
pub mod constants;
pub mod decision;
mod error;
pub mod index;
pub mod labeling;
pub mod redaction;
pub mod selector;
pub mod session;
pub mod store;
pub mod transfer;

pub use cache::{DecisionCache, DecisionKey, OnceMap};
pub use config::CoreConfig;
pub use decision::{DecisionEngine, DenialSet, Polarity, SharingDecision, SharingPolicy};
pub use error::{ConsentError, ConsentResult};
pub use index::{IndexedResource, ResourceIndex};
pub use labeling::{HttpLabelingClient, LabelingResult, LabelingService};
pub use redaction::{
    DisplayFilters, FilteredView, LabelFilter, RedactionEngine, SharingFilter, ViewGroup, ViewItem,
};
pub use selector::{ConsentChoice, Purpose};
pub use session::{PatientSession, SessionDecisions, SessionSettings, TransferOutcome};
pub use store::{FhirStore, HttpFhirStore};
pub use transfer::TransferBuilder;

pub use consent_types::ConfidenceThreshold;
