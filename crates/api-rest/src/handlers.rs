use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::Json,
};
use consent_core::{PatientSession, SessionSettings};
use consent_types::NonEmptyText;
use serde_json::Value;
use std::sync::Arc;

use crate::dto::{
    ConsentSummary, DecisionReq, ErrorRes, HealthRes, ListConsentsRes, OpenSessionReq,
    OpenSessionRes, TransferReq, TransferRes, ViewReq, ViewRes,
};
use crate::error::ApiError;
use crate::AppState;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the REST API
///
/// Used for monitoring and load balancer health checks.
#[axum::debug_handler]
pub async fn health(State(_state): State<AppState>) -> Json<HealthRes> {
    Json(HealthRes {
        ok: true,
        message: "Consent REST API is alive".into(),
    })
}

#[utoipa::path(
    post,
    path = "/sessions",
    request_body = OpenSessionReq,
    responses(
        (status = 201, description = "Session opened", body = OpenSessionRes),
        (status = 400, description = "Bad request", body = ErrorRes),
        (status = 502, description = "Record store failure", body = ErrorRes)
    )
)]
/// Open a patient-view session
///
/// Fetches the patient's complete record and candidate consents. An existing session for the
/// same patient is replaced, which discards its cached decisions.
///
/// # Errors
/// Returns `502 Bad Gateway` if any record page or the consent search fails; nothing partial is
/// kept.
#[axum::debug_handler]
pub async fn open_session(
    State(state): State<AppState>,
    Json(req): Json<OpenSessionReq>,
) -> Result<(StatusCode, Json<OpenSessionRes>), ApiError> {
    let patient_id = NonEmptyText::new(&req.patient_id)
        .map_err(|e| ApiError::BadRequest(format!("patientId: {e}")))?;
    let organization = req
        .organization
        .as_deref()
        .map(str::trim)
        .filter(|org| !org.is_empty());

    let settings = SessionSettings::from_config(&state.cfg)
        .with_purposes(req.purposes.into_iter().map(Into::into).collect());
    let session = PatientSession::load(
        state.store.as_ref(),
        state.labeler.clone(),
        settings,
        patient_id.as_str(),
        organization,
    )
    .await?;

    let res = OpenSessionRes {
        patient_id: patient_id.to_string(),
        resources: session.index().len(),
        candidates: session.candidates().len(),
        watermark_consent_id: session.watermark().map(|c| c.id.clone()),
    };

    state
        .sessions
        .write()
        .await
        .insert(patient_id.to_string(), Arc::new(session));

    Ok((StatusCode::CREATED, Json(res)))
}

#[utoipa::path(
    delete,
    path = "/sessions/{patient_id}",
    params(("patient_id" = String, Path, description = "Patient id")),
    responses(
        (status = 204, description = "Session closed"),
        (status = 404, description = "No such session", body = ErrorRes)
    )
)]
/// Close a session, dropping its caches.
#[axum::debug_handler]
pub async fn close_session(
    State(state): State<AppState>,
    AxumPath(patient_id): AxumPath<String>,
) -> Result<StatusCode, ApiError> {
    match state.sessions.write().await.remove(&patient_id) {
        Some(_) => {
            tracing::info!(patient = %patient_id, "closed patient session");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(no_session(&patient_id)),
    }
}

#[utoipa::path(
    get,
    path = "/sessions/{patient_id}/consents",
    params(("patient_id" = String, Path, description = "Patient id")),
    responses(
        (status = 200, description = "Candidate consents", body = ListConsentsRes),
        (status = 404, description = "No such session", body = ErrorRes)
    )
)]
/// List candidate consents and the one the watermark rule selects.
#[axum::debug_handler]
pub async fn list_consents(
    State(state): State<AppState>,
    AxumPath(patient_id): AxumPath<String>,
) -> Result<Json<ListConsentsRes>, ApiError> {
    let session = state.session(&patient_id).await?;
    Ok(Json(ListConsentsRes {
        patient_id,
        candidates: session
            .candidates()
            .iter()
            .map(ConsentSummary::from)
            .collect(),
        watermark_consent_id: session.watermark().map(|c| c.id.clone()),
    }))
}

#[utoipa::path(
    post,
    path = "/sessions/{patient_id}/view",
    params(("patient_id" = String, Path, description = "Patient id")),
    request_body = ViewReq,
    responses(
        (status = 200, description = "Filtered view", body = ViewRes),
        (status = 400, description = "Bad request", body = ErrorRes),
        (status = 404, description = "No such session", body = ErrorRes)
    )
)]
/// Filtered view of the patient's record
///
/// Labeling failures do not fail the request: resources are treated as unlabeled and the
/// failure is reported in `labelingError`. An unknown consent id yields `groups: null`.
#[axum::debug_handler]
pub async fn view(
    State(state): State<AppState>,
    AxumPath(patient_id): AxumPath<String>,
    Json(req): Json<ViewReq>,
) -> Result<Json<ViewRes>, ApiError> {
    let session = state.session(&patient_id).await?;
    let threshold = req.decision.threshold()?;
    let decisions = session
        .decisions(&req.decision.choice(), threshold)
        .await?;
    Ok(Json(ViewRes::new(&patient_id, &decisions, &req.filters())))
}

#[utoipa::path(
    post,
    path = "/sessions/{patient_id}/bundle",
    params(("patient_id" = String, Path, description = "Patient id")),
    request_body = DecisionReq,
    responses(
        (status = 200, description = "Redacted collection bundle"),
        (status = 404, description = "No such session or no applicable consent", body = ErrorRes),
        (status = 502, description = "Labeling failure", body = ErrorRes)
    )
)]
/// Deliverable collection bundle of permitted resources
///
/// # Errors
/// Returns `502 Bad Gateway` when labeling failed, since a deliverable must not rely on the
/// unlabeled fallback.
#[axum::debug_handler]
pub async fn redacted_bundle(
    State(state): State<AppState>,
    AxumPath(patient_id): AxumPath<String>,
    Json(req): Json<DecisionReq>,
) -> Result<Json<Value>, ApiError> {
    let session = state.session(&patient_id).await?;
    let decisions = session.decisions(&req.choice(), req.threshold()?).await?;
    if let Some(message) = &decisions.labeling_error {
        return Err(ApiError::Upstream(format!("labeling failed: {message}")));
    }
    let bundle = decisions
        .redacted_bundle()
        .ok_or_else(|| ApiError::NotFound("no applicable consent".into()))?;
    let body = serde_json::to_value(&bundle)
        .map_err(|e| ApiError::Upstream(format!("failed to serialise bundle: {e}")))?;
    Ok(Json(body))
}

#[utoipa::path(
    post,
    path = "/sessions/{patient_id}/transfer",
    params(("patient_id" = String, Path, description = "Patient id")),
    request_body = TransferReq,
    responses(
        (status = 200, description = "Transaction submitted", body = TransferRes),
        (status = 400, description = "Bad request", body = ErrorRes),
        (status = 404, description = "No such session", body = ErrorRes),
        (status = 502, description = "Labeling or destination failure", body = ErrorRes)
    )
)]
/// Submit permitted resources to a destination store as a transaction bundle.
#[axum::debug_handler]
pub async fn transfer(
    State(state): State<AppState>,
    AxumPath(patient_id): AxumPath<String>,
    Json(req): Json<TransferReq>,
) -> Result<Json<TransferRes>, ApiError> {
    let session = state.session(&patient_id).await?;
    let outcome = session
        .transfer(
            state.store.as_ref(),
            &req.destination,
            &req.decision.choice(),
            req.decision.threshold()?,
        )
        .await?;
    Ok(Json(TransferRes {
        submitted: outcome.submitted,
        denied: outcome.denied,
        response: outcome.response,
    }))
}

pub(crate) fn no_session(patient_id: &str) -> ApiError {
    ApiError::NotFound(format!("no session for patient '{patient_id}'"))
}
