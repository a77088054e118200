//! Patient-record store boundary.
//!
//! [`FhirStore`] exposes the two raw calls the engine needs (fetch one bundle page, submit a
//! transaction) and builds the paginated record fetch and consent search on top of them:
//! - record fetch starts at `Patient/{id}/$everything` and follows `next` links until absent
//! - any failed page aborts the whole load with [`ConsentError::PaginationFailed`]
//! - consent search follows `next` links too and keeps only the patient's consents

use crate::constants::{FHIR_JSON, MAX_RECORD_PAGES};
use crate::{ConsentError, ConsentResult, CoreConfig};
use fhir::{Bundle, BundleType, Consent};
use serde_json::Value;
use std::collections::HashSet;

/// Patient-record store.
#[async_trait::async_trait]
pub trait FhirStore: Send + Sync {
    /// Base URL of the store, without a trailing slash.
    fn base_url(&self) -> &str;

    /// Fetch one bundle page by absolute URL.
    async fn fetch_page(&self, url: &str) -> ConsentResult<Bundle>;

    /// POST a transaction bundle to `destination` and return the response body.
    async fn submit_transaction(&self, destination: &str, bundle: &Bundle) -> ConsentResult<Value>;

    /// Fetch a patient's complete record, following every `next` link.
    ///
    /// Pages are merged in link order into one `searchset` bundle without links. Duplicates are
    /// left for the index to drop.
    async fn fetch_record(&self, patient_id: &str) -> ConsentResult<Bundle> {
        validate_id("patient id", patient_id)?;
        let first = format!("{}/Patient/{patient_id}/$everything", self.base_url());
        let record = fetch_all_pages(self, first, |page, err| ConsentError::PaginationFailed {
            page,
            message: err.to_string(),
        })
        .await?;
        tracing::info!(
            patient = patient_id,
            entries = record.entry.len(),
            "fetched patient record"
        );
        Ok(record)
    }

    /// Search active consents controlled by `organization` and keep those about `patient_id`.
    ///
    /// Results keep the server's `-_lastUpdated` order. Entries that are not parseable consents
    /// are skipped with a warning.
    async fn search_consents(
        &self,
        organization: &str,
        patient_id: &str,
        page_size: u32,
    ) -> ConsentResult<Vec<Consent>> {
        validate_id("organization", organization)?;
        let first = format!(
            "{}/Consent?controller=Organization/{organization}&status=active&_sort=-_lastUpdated&_count={page_size}",
            self.base_url()
        );
        let results = fetch_all_pages(self, first, |page, err| {
            ConsentError::ConsentSearchFailed(format!("page {page}: {err}"))
        })
        .await?;

        let mut consents = Vec::new();
        for entry in results.entry {
            let Some(resource) = entry.resource else {
                continue;
            };
            if resource.get("resourceType").and_then(Value::as_str) != Some("Consent") {
                continue;
            }
            match Consent::from_value(resource) {
                Ok(consent) if consent.subject_patient_id.as_deref() == Some(patient_id) => {
                    consents.push(consent)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("skipping unreadable consent in search results: {e}"),
            }
        }

        tracing::info!(
            organization,
            patient = patient_id,
            consents = consents.len(),
            "found candidate consents"
        );
        Ok(consents)
    }
}

async fn fetch_all_pages<S, F>(store: &S, first: String, on_error: F) -> ConsentResult<Bundle>
where
    S: FhirStore + ?Sized,
    F: Fn(usize, ConsentError) -> ConsentError,
{
    let mut merged = Bundle::new(BundleType::Searchset);
    let mut visited = HashSet::new();
    let mut next = Some(first);
    let mut page = 0usize;

    while let Some(url) = next.take() {
        page += 1;
        if page > MAX_RECORD_PAGES {
            return Err(on_error(
                page,
                ConsentError::InvalidInput(format!("more than {MAX_RECORD_PAGES} pages")),
            ));
        }
        if !visited.insert(url.clone()) {
            return Err(on_error(
                page,
                ConsentError::InvalidInput(format!("next link loops back to {url}")),
            ));
        }

        let bundle = store.fetch_page(&url).await.map_err(|e| on_error(page, e))?;
        tracing::debug!(page, entries = bundle.entry.len(), "fetched bundle page");
        next = bundle.next_link().map(str::to_string);
        merged.extend_entries(bundle);
    }

    merged.total = Some(merged.entry.len() as u64);
    Ok(merged)
}

fn validate_id(what: &str, id: &str) -> ConsentResult<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid {
        return Err(ConsentError::InvalidInput(format!(
            "{what} '{id}' is not a valid resource id"
        )));
    }
    Ok(())
}

// ============================================================================
// HTTP store
// ============================================================================

/// [`FhirStore`] over HTTP.
#[derive(Clone, Debug)]
pub struct HttpFhirStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFhirStore {
    /// Create a store rooted at `cfg.fhir_base_url()`.
    pub fn new(cfg: &CoreConfig) -> ConsentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.http_timeout())
            .build()
            .map_err(ConsentError::HttpClient)?;
        Ok(Self::with_client(client, cfg.fhir_base_url()))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

fn upstream(url: &str, message: impl ToString) -> ConsentError {
    ConsentError::Upstream {
        url: url.to_string(),
        message: message.to_string(),
    }
}

#[async_trait::async_trait]
impl FhirStore for HttpFhirStore {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_page(&self, url: &str) -> ConsentResult<Bundle> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, FHIR_JSON)
            .send()
            .await
            .map_err(|e| upstream(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(upstream(url, format!("status {status}")));
        }

        let body = response.text().await.map_err(|e| upstream(url, e))?;
        Ok(Bundle::parse_json(&body)?)
    }

    async fn submit_transaction(&self, destination: &str, bundle: &Bundle) -> ConsentResult<Value> {
        let destination = destination.trim().trim_end_matches('/');
        if !(destination.starts_with("http://") || destination.starts_with("https://")) {
            return Err(ConsentError::InvalidInput(format!(
                "destination must be an http(s) URL, got '{destination}'"
            )));
        }

        let body =
            serde_json::to_vec(bundle).map_err(|e| ConsentError::TransferFailed(e.to_string()))?;
        let response = self
            .client
            .post(destination)
            .header(reqwest::header::CONTENT_TYPE, FHIR_JSON)
            .header(reqwest::header::ACCEPT, FHIR_JSON)
            .body(body)
            .send()
            .await
            .map_err(|e| ConsentError::TransferFailed(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ConsentError::TransferFailed(e.to_string()))?;
        if !status.is_success() {
            return Err(ConsentError::TransferFailed(format!(
                "destination returned {status}: {text}"
            )));
        }

        tracing::info!(
            destination,
            entries = bundle.entry.len(),
            "submitted transaction bundle"
        );
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            ConsentError::TransferFailed(format!("invalid transaction response: {e}"))
        })
    }
}
