#[derive(Debug, thiserror::Error)]
pub enum ConsentError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("labeling failed: {0}")]
    LabelingFailed(String),

    #[error("failed to fetch patient record page {page}: {message}")]
    PaginationFailed { page: usize, message: String },

    #[error("consent search failed: {0}")]
    ConsentSearchFailed(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("request to {url} failed: {message}")]
    Upstream { url: String, message: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(reqwest::Error),

    #[error("FHIR error: {0}")]
    Fhir(#[from] fhir::FhirError),

    #[error("invalid value: {0}")]
    Types(#[from] consent_types::TypesError),
}

pub type ConsentResult<T> = std::result::Result<T, ConsentError>;
