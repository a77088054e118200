use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{AppState, router};
use consent_core::{CoreConfig, constants::DEFAULT_REST_ADDR};

/// Main entry point for the consent service
///
/// Resolves configuration once from the environment, then serves the REST API.
///
/// # Environment Variables
/// - `CONSENT_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `CONSENT_FHIR_BASE_URL`: patient-record store base URL (required)
/// - `CONSENT_LABELING_URL`: labeling service endpoint (required)
/// - `CONSENT_DEFAULT_THRESHOLD`: default labeling confidence threshold (default: "0.50")
/// - `CONSENT_HTTP_TIMEOUT_SECS`: outbound HTTP timeout (default: 30)
/// - `CONSENT_CONSENT_PAGE_SIZE`: consent search page size (default: 50)
/// - `CONSENT_TRANSFER_ID_PREFIX`: prefix for rewritten numeric ids (default: "xfer-")
///
/// # Returns
/// * `Ok(())` - If the server starts and runs successfully
/// * `Err(anyhow::Error)` - If configuration is invalid or the server fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("consent_run=info".parse()?)
                .add_directive("consent_core=info".parse()?)
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = CoreConfig::from_lookup(|key: &str| std::env::var(key).ok())?;
    let rest_addr =
        std::env::var("CONSENT_REST_ADDR").unwrap_or_else(|_| DEFAULT_REST_ADDR.into());

    tracing::info!("++ Starting consent REST on {}", rest_addr);
    tracing::info!("++ Record store {}", cfg.fhir_base_url());
    tracing::info!("++ Labeling service {}", cfg.labeling_url());

    let state = AppState::from_config(cfg)?;
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}
