//! Command implementations.
//!
//! Offline commands work on bundle and consent files (JSON, or YAML when the extension is
//! `.yaml`/`.yml`). Resources are taken as already labeled: their `meta.security` codes are used
//! as-is. Each command returns the text it prints so it can be tested without a terminal.

use anyhow::{bail, Context};
use consent_core::{
    selector, ConfidenceThreshold, ConsentChoice, CoreConfig, DecisionEngine, DenialSet,
    DisplayFilters, HttpFhirStore, HttpLabelingClient, LabelFilter, PatientSession,
    RedactionEngine, ResourceIndex, SessionSettings, SharingFilter, TransferBuilder,
};
use fhir::{Bundle, Consent};
use serde_json::Value;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn read_value(path: &Path) -> anyhow::Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value = if is_yaml(path) {
        serde_yaml::from_str(&text)
            .with_context(|| format!("invalid YAML in {}", path.display()))?
    } else {
        serde_json::from_str(&text)
            .with_context(|| format!("invalid JSON in {}", path.display()))?
    };
    Ok(value)
}

/// Load a bundle file.
pub fn load_bundle(path: &Path) -> anyhow::Result<Bundle> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let bundle = if is_yaml(path) {
        Bundle::parse_yaml(&text)
    } else {
        Bundle::parse_json(&text)
    };
    bundle.with_context(|| format!("invalid bundle in {}", path.display()))
}

/// Load consents from files holding either one Consent or a Bundle of them.
pub fn load_consents(paths: &[PathBuf]) -> anyhow::Result<Vec<Consent>> {
    let mut consents = Vec::new();
    for path in paths {
        let value = read_value(path)?;
        match value.get("resourceType").and_then(Value::as_str) {
            Some("Consent") => consents.push(
                Consent::from_value(value)
                    .with_context(|| format!("invalid consent in {}", path.display()))?,
            ),
            Some("Bundle") => {
                let bundle = Bundle::from_value(value)
                    .with_context(|| format!("invalid bundle in {}", path.display()))?;
                for resource in bundle.entry.into_iter().filter_map(|entry| entry.resource) {
                    if resource.get("resourceType").and_then(Value::as_str) == Some("Consent") {
                        consents.push(
                            Consent::from_value(resource)
                                .with_context(|| format!("invalid consent in {}", path.display()))?,
                        );
                    }
                }
            }
            other => bail!(
                "{} holds neither a Consent nor a Bundle (resourceType {:?})",
                path.display(),
                other
            ),
        }
    }
    Ok(consents)
}

/// Summary of an indexed bundle: one line per type, then one line per key.
pub fn index_report(bundle: &Bundle) -> String {
    let index = ResourceIndex::build(bundle);
    let mut out = String::new();
    let _ = writeln!(out, "{} resources", index.len());
    for (resource_type, entries) in index.groups() {
        let _ = writeln!(out, "{resource_type}: {}", entries.len());
        for entry in entries {
            let key = entry
                .key
                .as_ref()
                .map(|key| key.as_str().to_string())
                .unwrap_or_else(|| "(no key)".into());
            let labels: Vec<&str> = entry
                .resource
                .security_labels()
                .iter()
                .map(String::as_str)
                .collect();
            if labels.is_empty() {
                let _ = writeln!(out, "  {key}");
            } else {
                let _ = writeln!(out, "  {key} [{}]", labels.join(", "));
            }
        }
    }
    out
}

/// Id of the operative consent, or an explanation when none applies.
pub fn select_report(consents: &[Consent], choice: &ConsentChoice) -> String {
    match selector::resolve(consents, choice) {
        Some(consent) => format!(
            "{} ({}, {} masked labels)",
            consent.id,
            consent.decision.map(|d| d.as_str()).unwrap_or("no decision"),
            consent.masked_label_count()
        ),
        None if consents.is_empty() => "no candidate consents".into(),
        None => "selected consent not found".into(),
    }
}

fn operative<'a>(consents: &'a [Consent], choice: &ConsentChoice) -> anyhow::Result<&'a Consent> {
    match selector::resolve(consents, choice) {
        Some(consent) => Ok(consent),
        None => bail!("no applicable consent"),
    }
}

/// Denial set for a labeled bundle under the operative consent.
pub fn decide(
    bundle: &Bundle,
    consents: &[Consent],
    choice: &ConsentChoice,
) -> anyhow::Result<DenialSet> {
    let consent = operative(consents, choice)?;
    let index = ResourceIndex::build(bundle);
    Ok(DecisionEngine::decide_for_consent(index.entries(), consent))
}

/// Redacted collection bundle as pretty JSON.
///
/// Only permitted resources are written; `labels` can narrow them further but never brings a
/// denied resource back.
pub fn redact(
    bundle: &Bundle,
    consents: &[Consent],
    choice: &ConsentChoice,
    labels: &LabelFilter,
) -> anyhow::Result<String> {
    let consent = operative(consents, choice)?;
    let index = ResourceIndex::build(bundle);
    let denials = DecisionEngine::decide_for_consent(index.entries(), consent);
    let filters = DisplayFilters {
        labels: labels.clone(),
        sharing: SharingFilter::PermittedOnly,
    };
    let view = RedactionEngine::filter_with(&index, &denials, &filters);
    Ok(view.to_bundle().render_json()?)
}

/// Transaction bundle for a (redacted) bundle, as pretty JSON.
pub fn transfer_bundle(bundle: &Bundle, id_prefix: &str) -> anyhow::Result<String> {
    let index = ResourceIndex::build(bundle);
    let transaction = TransferBuilder::new(id_prefix).build(index.entries());
    Ok(transaction.render_json()?)
}

/// Open a live session against the configured services.
pub async fn open_session(
    cfg: &CoreConfig,
    patient_id: &str,
    organization: Option<&str>,
) -> anyhow::Result<(PatientSession, HttpFhirStore)> {
    let store = HttpFhirStore::new(cfg)?;
    let labeler = Arc::new(HttpLabelingClient::new(cfg)?);
    let session = PatientSession::load(
        &store,
        labeler,
        SessionSettings::from_config(cfg),
        patient_id,
        organization,
    )
    .await?;
    Ok((session, store))
}

/// Filtered view of a live session, one line per shown resource.
pub async fn view_report(
    session: &PatientSession,
    choice: &ConsentChoice,
    threshold: Option<ConfidenceThreshold>,
    filters: &DisplayFilters,
) -> anyhow::Result<String> {
    let decisions = session.decisions(choice, threshold).await?;
    let mut out = String::new();
    if let Some(message) = &decisions.labeling_error {
        let _ = writeln!(out, "warning: labeling failed, resources treated as unlabeled: {message}");
    }
    let Some(view) = decisions.view(filters) else {
        let _ = writeln!(out, "no applicable consent");
        return Ok(out);
    };
    if let Some(consent) = &decisions.consent {
        let _ = writeln!(
            out,
            "consent {} at threshold {}: {} denied",
            consent.id,
            decisions.threshold,
            decisions.denials.len()
        );
    }
    for group in view.groups() {
        let _ = writeln!(out, "{}:", group.resource_type);
        for item in &group.items {
            let key = item
                .entry
                .key
                .as_ref()
                .map(|key| key.as_str())
                .unwrap_or("(no key)");
            let labels: Vec<&str> = item
                .entry
                .resource
                .security_labels()
                .iter()
                .map(String::as_str)
                .collect();
            let _ = writeln!(
                out,
                "  {key} {:?} [{}]",
                item.decision,
                labels.join(", ")
            );
        }
    }
    Ok(out)
}
