//! Core runtime configuration.
//!
//! This module defines configuration that should be resolved once at process startup and then
//! passed into core services. Request handling never reads process-wide environment variables;
//! binaries call [`CoreConfig::from_lookup`] with `std::env::var` once, tests pass a closure.

use crate::constants::{
    DEFAULT_CONSENT_PAGE_SIZE, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_THRESHOLD_HUNDREDTHS,
    DEFAULT_TRANSFER_ID_PREFIX,
};
use crate::{ConsentError, ConsentResult};
use consent_types::ConfidenceThreshold;
use std::time::Duration;

/// Environment variable naming the patient-record store base URL.
pub const ENV_FHIR_BASE_URL: &str = "CONSENT_FHIR_BASE_URL";
/// Environment variable naming the labeling service endpoint.
pub const ENV_LABELING_URL: &str = "CONSENT_LABELING_URL";
pub const ENV_DEFAULT_THRESHOLD: &str = "CONSENT_DEFAULT_THRESHOLD";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "CONSENT_HTTP_TIMEOUT_SECS";
pub const ENV_CONSENT_PAGE_SIZE: &str = "CONSENT_CONSENT_PAGE_SIZE";
pub const ENV_TRANSFER_ID_PREFIX: &str = "CONSENT_TRANSFER_ID_PREFIX";

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    fhir_base_url: String,
    labeling_url: String,
    default_threshold: ConfidenceThreshold,
    http_timeout: Duration,
    consent_page_size: u32,
    transfer_id_prefix: String,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::InvalidInput`] if either URL is not `http(s)`, the page size is
    /// zero, or the transfer prefix would not produce a valid non-numeric FHIR id.
    pub fn new(
        fhir_base_url: impl Into<String>,
        labeling_url: impl Into<String>,
        default_threshold: ConfidenceThreshold,
        http_timeout: Duration,
        consent_page_size: u32,
        transfer_id_prefix: impl Into<String>,
    ) -> ConsentResult<Self> {
        let fhir_base_url = validate_url(ENV_FHIR_BASE_URL, fhir_base_url.into())?;
        let labeling_url = validate_url(ENV_LABELING_URL, labeling_url.into())?;

        if consent_page_size == 0 {
            return Err(ConsentError::InvalidInput(
                "consent page size must be greater than zero".into(),
            ));
        }

        let transfer_id_prefix = transfer_id_prefix.into();
        validate_id_prefix(&transfer_id_prefix)?;

        Ok(Self {
            fhir_base_url,
            labeling_url,
            default_threshold,
            http_timeout,
            consent_page_size,
            transfer_id_prefix,
        })
    }

    /// Resolve configuration from a variable lookup such as `|k| std::env::var(k).ok()`.
    ///
    /// Both URLs are required; every other value falls back to its default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConsentResult<Self> {
        let fhir_base_url = required(ENV_FHIR_BASE_URL, lookup(ENV_FHIR_BASE_URL))?;
        let labeling_url = required(ENV_LABELING_URL, lookup(ENV_LABELING_URL))?;

        Self::new(
            fhir_base_url,
            labeling_url,
            threshold_from_env_value(lookup(ENV_DEFAULT_THRESHOLD))?,
            timeout_from_env_value(lookup(ENV_HTTP_TIMEOUT_SECS))?,
            page_size_from_env_value(lookup(ENV_CONSENT_PAGE_SIZE))?,
            lookup(ENV_TRANSFER_ID_PREFIX)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_TRANSFER_ID_PREFIX.to_string()),
        )
    }

    /// Base URL of the patient-record store, without a trailing slash.
    pub fn fhir_base_url(&self) -> &str {
        &self.fhir_base_url
    }

    pub fn labeling_url(&self) -> &str {
        &self.labeling_url
    }

    pub fn default_threshold(&self) -> ConfidenceThreshold {
        self.default_threshold
    }

    pub fn http_timeout(&self) -> Duration {
        self.http_timeout
    }

    pub fn consent_page_size(&self) -> u32 {
        self.consent_page_size
    }

    pub fn transfer_id_prefix(&self) -> &str {
        &self.transfer_id_prefix
    }
}

/// Parse the default confidence threshold from an optional string value.
///
/// If `value` is `None` or empty/whitespace, returns `0.50`.
pub fn threshold_from_env_value(value: Option<String>) -> ConsentResult<ConfidenceThreshold> {
    match non_blank(value) {
        Some(v) => Ok(v.parse::<ConfidenceThreshold>()?),
        None => Ok(ConfidenceThreshold::from_hundredths(
            DEFAULT_THRESHOLD_HUNDREDTHS,
        )?),
    }
}

/// Parse the HTTP timeout (whole seconds) from an optional string value.
pub fn timeout_from_env_value(value: Option<String>) -> ConsentResult<Duration> {
    let secs = match non_blank(value) {
        Some(v) => v.parse::<u64>().map_err(|_| {
            ConsentError::InvalidInput(format!("{ENV_HTTP_TIMEOUT_SECS} must be whole seconds"))
        })?,
        None => DEFAULT_HTTP_TIMEOUT_SECS,
    };
    if secs == 0 {
        return Err(ConsentError::InvalidInput(format!(
            "{ENV_HTTP_TIMEOUT_SECS} must be greater than zero"
        )));
    }
    Ok(Duration::from_secs(secs))
}

/// Parse the consent search page size from an optional string value.
pub fn page_size_from_env_value(value: Option<String>) -> ConsentResult<u32> {
    match non_blank(value) {
        Some(v) => v.parse::<u32>().map_err(|_| {
            ConsentError::InvalidInput(format!("{ENV_CONSENT_PAGE_SIZE} must be a number"))
        }),
        None => Ok(DEFAULT_CONSENT_PAGE_SIZE),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(name: &str, value: Option<String>) -> ConsentResult<String> {
    non_blank(value).ok_or_else(|| ConsentError::InvalidInput(format!("{name} must be set")))
}

fn validate_url(name: &str, url: String) -> ConsentResult<String> {
    let url = url.trim().trim_end_matches('/').to_string();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConsentError::InvalidInput(format!(
            "{name} must be an http(s) URL, got '{url}'"
        )));
    }
    Ok(url)
}

fn validate_id_prefix(prefix: &str) -> ConsentResult<()> {
    let valid_chars = prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    let has_non_digit = prefix.chars().any(|c| !c.is_ascii_digit());
    if prefix.is_empty() || !valid_chars || !has_non_digit {
        return Err(ConsentError::InvalidInput(format!(
            "{ENV_TRANSFER_ID_PREFIX} must be a non-numeric FHIR id fragment, got '{prefix}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn resolves_defaults_from_required_urls() {
        let cfg = CoreConfig::from_lookup(lookup_from(&[
            (ENV_FHIR_BASE_URL, "http://fhir.local/fhir/"),
            (ENV_LABELING_URL, "http://sls.local/cds-services/sls"),
        ]))
        .expect("config should resolve");

        assert_eq!(cfg.fhir_base_url(), "http://fhir.local/fhir");
        assert_eq!(cfg.default_threshold().to_string(), "0.50");
        assert_eq!(cfg.http_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.consent_page_size(), 50);
        assert_eq!(cfg.transfer_id_prefix(), "xfer-");
    }

    #[test]
    fn reads_overrides() {
        let cfg = CoreConfig::from_lookup(lookup_from(&[
            (ENV_FHIR_BASE_URL, "https://fhir.local"),
            (ENV_LABELING_URL, "https://sls.local"),
            (ENV_DEFAULT_THRESHOLD, "0.8"),
            (ENV_HTTP_TIMEOUT_SECS, "5"),
            (ENV_CONSENT_PAGE_SIZE, "10"),
            (ENV_TRANSFER_ID_PREFIX, "dst-"),
        ]))
        .expect("config should resolve");

        assert_eq!(cfg.default_threshold().hundredths(), 80);
        assert_eq!(cfg.http_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.consent_page_size(), 10);
        assert_eq!(cfg.transfer_id_prefix(), "dst-");
    }

    #[test]
    fn missing_url_is_rejected() {
        let err = CoreConfig::from_lookup(lookup_from(&[(ENV_LABELING_URL, "http://sls")]))
            .expect_err("should fail");
        match err {
            ConsentError::InvalidInput(msg) => assert!(msg.contains(ENV_FHIR_BASE_URL)),
            other => panic!("expected InvalidInput error, got {other:?}"),
        }
    }

    #[test]
    fn non_http_url_is_rejected() {
        assert!(CoreConfig::from_lookup(lookup_from(&[
            (ENV_FHIR_BASE_URL, "ftp://fhir"),
            (ENV_LABELING_URL, "http://sls"),
        ]))
        .is_err());
    }

    #[test]
    fn numeric_prefix_is_rejected() {
        assert!(CoreConfig::new(
            "http://fhir",
            "http://sls",
            ConfidenceThreshold::MIN,
            Duration::from_secs(1),
            1,
            "123",
        )
        .is_err());
        assert!(CoreConfig::new(
            "http://fhir",
            "http://sls",
            ConfidenceThreshold::MIN,
            Duration::from_secs(1),
            1,
            "a/b",
        )
        .is_err());
    }

    #[test]
    fn zero_timeout_and_bad_threshold_are_rejected() {
        assert!(timeout_from_env_value(Some("0".into())).is_err());
        assert!(threshold_from_env_value(Some("1.7".into())).is_err());
        assert_eq!(
            threshold_from_env_value(Some("   ".into()))
                .unwrap()
                .hundredths(),
            50
        );
    }
}
