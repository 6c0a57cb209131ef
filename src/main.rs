//! VBMS client command line.
//!
//! Run with: `connect-vbms --env test get-document --document-id '{...}'`

use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate};
use clap::{Parser, Subcommand};
use connect_vbms::{ClaimInput, ClientConfig, DocumentUpload, VbmsClient, VeteranRecord};
use serde::Deserialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{info, Dispatch, Level};
use tracing_subscriber::FmtSubscriber;

/// Client for the VBMS claims and eFolder SOAP services.
///
/// Requests are signed by the configured external signing program and sent
/// over mutual TLS when credentials are configured.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML). Overrides --env.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment name, resolved under $CONNECT_VBMS_ENV_DIR
    #[arg(short, long, default_value = "test")]
    env: String,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a PDF exam into a veteran's eFolder
    Upload {
        #[arg(long)]
        pdf: PathBuf,
        #[arg(long)]
        file_number: String,
        /// Date the VA received the document (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        received_dt: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        middle_name: Option<String>,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        exam_name: String,
    },
    /// Fetch the content of a document version
    GetDocument {
        #[arg(long)]
        document_id: String,
        /// Write the content here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Establish a claim from a YAML file holding `veteran` and `claim`
    EstablishClaim {
        #[arg(long)]
        input: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
struct EstablishClaimInput {
    veteran: VeteranRecord,
    claim: ClaimInput,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let dispatch = build_dispatch(&args.log_level, args.logfile.as_deref())?;
    let _log_guard = tracing::dispatcher::set_default(&dispatch);

    info!("Starting connect-vbms v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            ClientConfig::from_yaml(&content).context("Failed to parse config file")?
        }
        None => ClientConfig::from_env(&args.env)
            .with_context(|| format!("Failed to load environment '{}'", args.env))?,
    };

    let client = VbmsClient::from_config(config).context("Failed to initialize VBMS client")?;

    match args.command {
        Command::Upload {
            pdf,
            file_number,
            received_dt,
            first_name,
            middle_name,
            last_name,
            exam_name,
        } => {
            let content = tokio::fs::read(&pdf)
                .await
                .with_context(|| format!("Failed to read {}", pdf.display()))?;
            let filename = pdf
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("Invalid PDF path {}", pdf.display()))?
                .to_string();

            let upload = DocumentUpload {
                file_number,
                received_at: Some(parse_received_dt(&received_dt)?),
                first_name,
                middle_name,
                last_name,
                subject: exam_name,
                filename,
                content,
                ..Default::default()
            };
            let uploaded = client.upload_document(upload).await?;
            println!("{}", serde_json::to_string_pretty(&uploaded)?);
        }
        Command::GetDocument {
            document_id,
            output,
        } => {
            let document = client.get_document_content(&document_id).await?;
            info!(
                document_id = %document.document_id,
                bytes = document.content.len(),
                "Document retrieved"
            );
            match output {
                Some(path) => tokio::fs::write(&path, &document.content)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&document.content).await?;
                    stdout.flush().await?;
                }
            }
        }
        Command::EstablishClaim { input } => {
            let content = tokio::fs::read_to_string(&input)
                .await
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let input: EstablishClaimInput =
                serde_yaml::from_str(&content).context("Failed to parse claim input")?;
            let claim = client.establish_claim(input.veteran, input.claim).await?;
            println!("{}", serde_json::to_string_pretty(&claim)?);
        }
    }

    Ok(())
}

/// Build the log subscriber. It is installed as the default for this run
/// only, never globally.
fn build_dispatch(log_level: &str, logfile: Option<&Path>) -> Result<Dispatch> {
    let level: Level = log_level.parse().unwrap_or(Level::INFO);
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let dispatch = match logfile {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Dispatch::new(builder.with_ansi(false).with_writer(Mutex::new(file)).finish())
        }
        None => Dispatch::new(builder.with_writer(std::io::stderr).finish()),
    };
    Ok(dispatch)
}

fn parse_received_dt(value: &str) -> Result<DateTime<FixedOffset>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at);
    }
    match NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        Ok(date) => match date.and_hms_opt(0, 0, 0) {
            Some(midnight) => Ok(midnight.and_utc().fixed_offset()),
            None => bail!("Invalid received date '{}'", value),
        },
        Err(e) => bail!("Invalid received date '{}': {}", value, e),
    }
}
