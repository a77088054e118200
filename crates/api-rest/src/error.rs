use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use consent_core::ConsentError;

use crate::dto::ErrorRes;

/// Error returned by handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// A dependency (record store, labeling service, destination) failed.
    Upstream(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn message(self) -> String {
        match self {
            Self::BadRequest(msg) | Self::NotFound(msg) | Self::Upstream(msg) => msg,
        }
    }
}

impl From<ConsentError> for ApiError {
    fn from(err: ConsentError) -> Self {
        match err {
            ConsentError::InvalidInput(_) | ConsentError::Types(_) => {
                Self::BadRequest(err.to_string())
            }
            ConsentError::LabelingFailed(_)
            | ConsentError::PaginationFailed { .. }
            | ConsentError::ConsentSearchFailed(_)
            | ConsentError::TransferFailed(_)
            | ConsentError::Upstream { .. }
            | ConsentError::HttpClient(_)
            | ConsentError::Fhir(_) => {
                tracing::error!("upstream error: {err}");
                Self::Upstream(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(ErrorRes { error: self.message() })).into_response()
    }
}
