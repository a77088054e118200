mod commands;

use clap::{Args, Parser, Subcommand, ValueEnum};
use consent_core::{
    constants::DEFAULT_TRANSFER_ID_PREFIX, ConfidenceThreshold, ConsentChoice, CoreConfig,
    DisplayFilters, LabelFilter, SharingFilter,
};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "consent")]
#[command(about = "Consent-driven labeling, decision and redaction CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a bundle file and list its resources by type
    Index {
        /// Bundle file (JSON, or YAML by extension)
        bundle: PathBuf,
    },
    /// Select the operative consent among candidate files
    Select {
        /// Consent files, or bundles of consents
        #[arg(required = true)]
        consents: Vec<PathBuf>,
        /// Use this consent id instead of the watermark rule
        #[arg(long)]
        consent_id: Option<String>,
    },
    /// List the resources a consent denies
    Decide {
        /// Labeled bundle file
        bundle: PathBuf,
        #[command(flatten)]
        consent: ConsentArgs,
    },
    /// Write the redacted collection bundle
    Redact {
        /// Labeled bundle file
        bundle: PathBuf,
        #[command(flatten)]
        consent: ConsentArgs,
        #[command(flatten)]
        labels: LabelArgs,
        /// Output file (stdout when omitted)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Build a transaction bundle from a bundle file
    TransferBundle {
        /// Bundle file, usually the output of `redact`
        bundle: PathBuf,
        /// Prefix for numeric ids
        #[arg(long, default_value = DEFAULT_TRANSFER_ID_PREFIX)]
        prefix: String,
    },
    /// Show a patient's filtered record from the configured services
    View {
        /// Patient id
        patient_id: String,
        /// Search this organisation's consents instead of the record's own
        #[arg(long)]
        organization: Option<String>,
        /// Use this consent id instead of the watermark rule
        #[arg(long)]
        consent_id: Option<String>,
        /// Labeling confidence threshold (0.00 to 1.00)
        #[arg(long)]
        threshold: Option<ConfidenceThreshold>,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Submit a patient's permitted resources to a destination store
    Transfer {
        /// Patient id
        patient_id: String,
        /// Destination store base URL
        destination: String,
        #[arg(long)]
        organization: Option<String>,
        #[arg(long)]
        consent_id: Option<String>,
        #[arg(long)]
        threshold: Option<ConfidenceThreshold>,
    },
}

#[derive(Args)]
struct ConsentArgs {
    /// Consent file, or bundle of consents (repeatable)
    #[arg(long = "consent", required = true)]
    consents: Vec<PathBuf>,
    /// Use this consent id instead of the watermark rule
    #[arg(long)]
    consent_id: Option<String>,
}

#[derive(Args)]
struct LabelArgs {
    /// Show only resources carrying one of these labels
    #[arg(long, value_delimiter = ',', conflicts_with = "except")]
    only: Vec<String>,
    /// Hide resources carrying any of these labels
    #[arg(long, value_delimiter = ',')]
    except: Vec<String>,
}

impl LabelArgs {
    fn filter(self) -> LabelFilter {
        if !self.only.is_empty() {
            LabelFilter::OnlyLabeledAs(self.only.into_iter().collect())
        } else if !self.except.is_empty() {
            LabelFilter::ExceptLabeledAs(self.except.into_iter().collect())
        } else {
            LabelFilter::ShowAll
        }
    }
}

#[derive(Args)]
struct FilterArgs {
    #[command(flatten)]
    labels: LabelArgs,
    /// Sharing decisions to show
    #[arg(long, value_enum)]
    sharing: Option<SharingArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SharingArg {
    All,
    Permitted,
    Denied,
}

impl FilterArgs {
    fn filters(self, default_sharing: SharingFilter) -> DisplayFilters {
        let sharing = match self.sharing {
            Some(SharingArg::All) => SharingFilter::All,
            Some(SharingArg::Permitted) => SharingFilter::PermittedOnly,
            Some(SharingArg::Denied) => SharingFilter::DeniedOnly,
            None => default_sharing,
        };
        DisplayFilters {
            labels: self.labels.filter(),
            sharing,
        }
    }
}

fn load_config() -> anyhow::Result<CoreConfig> {
    Ok(CoreConfig::from_lookup(|key: &str| std::env::var(key).ok())?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("consent_core=warn".parse()?))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Index { bundle }) => {
            let bundle = commands::load_bundle(&bundle)?;
            print!("{}", commands::index_report(&bundle));
        }
        Some(Commands::Select {
            consents,
            consent_id,
        }) => {
            let consents = commands::load_consents(&consents)?;
            println!(
                "{}",
                commands::select_report(&consents, &ConsentChoice::from_optional(consent_id))
            );
        }
        Some(Commands::Decide { bundle, consent }) => {
            let bundle = commands::load_bundle(&bundle)?;
            let consents = commands::load_consents(&consent.consents)?;
            let denials = commands::decide(
                &bundle,
                &consents,
                &ConsentChoice::from_optional(consent.consent_id),
            )?;
            if denials.is_empty() {
                println!("Nothing denied.");
            }
            for key in denials.iter() {
                println!("{key}");
            }
        }
        Some(Commands::Redact {
            bundle,
            consent,
            labels,
            output,
        }) => {
            let bundle = commands::load_bundle(&bundle)?;
            let consents = commands::load_consents(&consent.consents)?;
            let json = commands::redact(
                &bundle,
                &consents,
                &ConsentChoice::from_optional(consent.consent_id),
                &labels.filter(),
            )?;
            match output {
                Some(path) => std::fs::write(&path, json)?,
                None => println!("{json}"),
            }
        }
        Some(Commands::TransferBundle { bundle, prefix }) => {
            let bundle = commands::load_bundle(&bundle)?;
            println!("{}", commands::transfer_bundle(&bundle, &prefix)?);
        }
        Some(Commands::View {
            patient_id,
            organization,
            consent_id,
            threshold,
            filters,
        }) => {
            let cfg = load_config()?;
            let (session, _store) =
                commands::open_session(&cfg, &patient_id, organization.as_deref()).await?;
            let report = commands::view_report(
                &session,
                &ConsentChoice::from_optional(consent_id),
                threshold,
                &filters.filters(SharingFilter::All),
            )
            .await?;
            print!("{report}");
        }
        Some(Commands::Transfer {
            patient_id,
            destination,
            organization,
            consent_id,
            threshold,
        }) => {
            let cfg = load_config()?;
            let (session, store) =
                commands::open_session(&cfg, &patient_id, organization.as_deref()).await?;
            let outcome = session
                .transfer(
                    &store,
                    &destination,
                    &ConsentChoice::from_optional(consent_id),
                    threshold,
                )
                .await?;
            println!(
                "Submitted {} resources to {destination} ({} denied).",
                outcome.submitted, outcome.denied
            );
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
