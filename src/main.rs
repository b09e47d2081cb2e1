//! bleepload -- resumable multipart uploads to S3-compatible storage.
//!
//! Ctrl-C stops dispatching new parts and lets in-flight parts finish; the
//! session stays open and the next run of the same upload resumes it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use bleepload::config::{apply_env_overrides, Config};
use bleepload::storage::aws::AwsStore;
use bleepload::storage::backend::MultipartStore;
use bleepload::storage::memory::MemoryStore;
use bleepload::{CancelMode, ResumeStrategy, UploadRequest, Uploader};

/// Command-line arguments for bleepload.
#[derive(Parser, Debug)]
#[command(
    name = "bleepload",
    version,
    about = "Resumable multipart uploads to S3-compatible storage"
)]
struct Cli {
    /// Path to the YAML configuration file.  Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file, resuming an earlier attempt when possible.
    Upload {
        /// Local file to upload.
        file: PathBuf,
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        key: String,
        /// Resume this multipart session id.
        #[arg(long, conflicts_with_all = ["discover", "fresh"])]
        session_id: Option<String>,
        /// Resume the newest open session the server lists for the key.
        #[arg(long, conflicts_with = "fresh")]
        discover: bool,
        /// Ignore earlier attempts and open a new session.
        #[arg(long)]
        fresh: bool,
        /// Stop dispatching new parts after the first failed part.
        #[arg(long)]
        fail_fast: bool,
        /// Content-Type for the stored object.
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Abort an open multipart session.
    Abort {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        session_id: String,
    },
    /// List open multipart sessions.
    List {
        #[arg(long)]
        bucket: String,
        #[arg(long, default_value = "")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => bleepload::config::load_config(path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config.upload, std::env::vars())?;

    init_logging(&config.logging.level, &config.logging.format);
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path.display());
    }

    if let Some(listen) = &config.observability.metrics_listen {
        bleepload::metrics::init_metrics(listen)?;
        info!("Prometheus metrics listening on {}", listen);
    }

    let store: Arc<dyn MultipartStore> = match config.storage.backend.as_str() {
        "aws" => {
            let store = AwsStore::new(&config.storage.aws, config.upload.call_timeout()).await?;
            info!(
                "S3 storage backend initialized: region={} endpoint='{}'",
                config.storage.aws.region, config.storage.aws.endpoint_url
            );
            Arc::new(store)
        }
        "memory" => {
            warn!("Using the in-memory backend; uploaded data is discarded on exit");
            Arc::new(MemoryStore::new())
        }
        other => anyhow::bail!("unknown storage.backend '{other}' (expected 'aws' or 'memory')"),
    };

    let uploader = Uploader::new(store, config.upload.clone())?;

    match cli.command {
        Command::Upload {
            file,
            bucket,
            key,
            session_id,
            discover,
            fresh,
            fail_fast,
            content_type,
        } => {
            let resume = match (session_id, discover, fresh) {
                (Some(id), _, _) => ResumeStrategy::Session(id),
                (None, true, _) => ResumeStrategy::Discover,
                (None, false, true) => ResumeStrategy::Fresh,
                (None, false, false) => ResumeStrategy::Auto,
            };
            let mut request = UploadRequest::new(file, bucket, key).with_resume(resume);
            request.metadata.content_type = content_type;
            if fail_fast {
                request = request.with_fail_fast(true);
            }
            upload(&uploader, request).await
        }
        Command::Abort {
            bucket,
            key,
            session_id,
        } => {
            uploader.abort_session(&bucket, &key, &session_id).await?;
            info!("Aborted session {} for {}/{}", session_id, bucket, key);
            Ok(())
        }
        Command::List { bucket, prefix } => {
            let sessions = uploader.list_sessions(&bucket, &prefix).await?;
            for session in &sessions {
                let initiated = session
                    .initiated
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{}\t{}\t{}", session.upload_id, session.key, initiated);
            }
            info!("{} open session(s) in {}", sessions.len(), bucket);
            Ok(())
        }
    }
}

async fn upload(uploader: &Uploader, request: UploadRequest) -> anyhow::Result<()> {
    let handle = uploader.start(request);

    let canceller = handle.canceller();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Stopping after in-flight parts finish; rerun to resume");
        canceller.cancel(CancelMode::Graceful);
    });

    let mut progress = handle.progress();
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        loop {
            tokio::select! {
                changed = progress.changed() => {
                    if changed.is_none() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let snap = progress.latest();
                    if snap.total_bytes > 0 {
                        info!(
                            "{}/{} bytes, {}/{} parts ({:.1}%)",
                            snap.bytes_completed,
                            snap.total_bytes,
                            snap.parts_completed,
                            snap.total_parts,
                            snap.fraction() * 100.0
                        );
                    }
                }
            }
        }
    });

    let result = handle.wait().await;
    reporter.abort();

    match result {
        Ok(identity) => {
            println!("{}", serde_json::to_string(&identity)?);
            Ok(())
        }
        Err(failure) => {
            if let Some(session_id) = &failure.session_id {
                warn!(
                    "Session {} left open with {}/{} parts; rerun to resume or abort it",
                    session_id, failure.completed_parts, failure.total_parts
                );
            }
            Err(failure.into())
        }
    }
}

fn init_logging(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, cancelling");
        },
        _ = terminate => {
            info!("Received SIGTERM, cancelling");
        },
    }
}
