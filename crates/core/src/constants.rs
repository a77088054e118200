//! Constants used throughout the consent core crate.
//!
//! Wire codes, header names and configuration defaults live here so the HTTP adapters, the
//! selector and the configuration layer agree on them.

/// Default labeling confidence threshold, in hundredths (`0.50`).
pub const DEFAULT_THRESHOLD_HUNDREDTHS: u16 = 50;

/// Default timeout for outbound HTTP requests, in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default `_count` used when searching consents.
pub const DEFAULT_CONSENT_PAGE_SIZE: u32 = 50;

/// Default prefix given to purely numeric ids before transfer.
pub const DEFAULT_TRANSFER_ID_PREFIX: &str = "xfer-";

/// Default address the REST server binds to.
pub const DEFAULT_REST_ADDR: &str = "0.0.0.0:3000";

/// Header carrying the confidence threshold on labeling requests.
pub const CONFIDENCE_THRESHOLD_HEADER: &str = "CDS-Confidence-Threshold";

/// Hook name sent with labeling requests.
pub const LABELING_HOOK: &str = "patient-consent-consult";

/// Purpose-of-use code for treatment.
pub const PURPOSE_TREATMENT: &str = "TREAT";

/// Purpose-of-use code for research.
pub const PURPOSE_RESEARCH: &str = "HRESCH";

/// Upper bound on followed `next` links for one record fetch.
pub const MAX_RECORD_PAGES: usize = 1_000;

/// FHIR JSON media type.
pub const FHIR_JSON: &str = "application/fhir+json";
