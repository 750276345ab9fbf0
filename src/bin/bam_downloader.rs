use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bam_ingest::config::{ConfigLoader, DEFAULT_INGEST_PREFIX, WorkerRole};
use bam_ingest::consul::ConsulClient;
use bam_ingest::domain::{AnalysisId, SourceTag};
use bam_ingest::download::{GtDownloadClient, Staging};
use bam_ingest::error::IngestError;
use bam_ingest::metadata::PgMetadataStore;
use bam_ingest::multipart::UploaderOptions;
use bam_ingest::object_store::{ObjectStoreConnector, S3Connector};
use bam_ingest::shutdown;
use bam_ingest::signpost::SignpostHttpClient;
use bam_ingest::supervisor::{Downloader, Environment, WorkerOptions};

#[derive(Parser)]
#[command(name = "bam-downloader")]
#[command(about = "Claim archived BAM/BAI analyses and ingest them into object storage")]
#[command(version)]
struct Cli {
    #[arg(long, help = "Source tag of the files to ingest (e.g. tcga_cghub)")]
    source: String,

    #[arg(long, help = "Re-ingest one analysis, resuming files already uploaded")]
    analysis_id: Option<String>,

    #[arg(long, env = "CONSUL_HTTP_ADDR", default_value = "http://localhost:8500")]
    consul_url: String,

    #[arg(long, default_value = DEFAULT_INGEST_PREFIX, help = "Coordination key prefix holding the worker configuration")]
    prefix: String,

    #[arg(long, help = "Process a single claim and exit")]
    once: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<IngestError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &IngestError) -> u8 {
    error.exit_code()
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let source = SourceTag::new(cli.source);
    let analysis_id = cli
        .analysis_id
        .as_deref()
        .map(str::parse::<AnalysisId>)
        .transpose()?;

    let consul = Arc::new(ConsulClient::new(&cli.consul_url)?);
    let settings = ConfigLoader::load(consul.as_ref(), &cli.prefix, WorkerRole::Ingest)?;
    let bucket = settings.bucket_for(source.as_str())?.to_string();
    let download = settings
        .download
        .clone()
        .ok_or_else(|| IngestError::MissingConfigKey("download/credentials".to_string()))?;

    let runtime = Arc::new(
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("bam-ingest-io")
            .enable_all()
            .build()
            .into_diagnostic()?,
    );
    let cancel = shutdown::install(&runtime);

    let metadata = Arc::new(PgMetadataStore::connect(&settings.pg.connection_string())?);
    let objects: Arc<dyn ObjectStoreConnector> =
        Arc::new(S3Connector::with_runtime(settings.s3.clone(), runtime.clone()));
    let identifiers = SignpostHttpClient::new(&settings.signpost_url)?;

    let mut options = WorkerOptions::new(source, hostname());
    options.analysis_id = analysis_id;
    options.once = cli.once;
    options.uploader = UploaderOptions::from_settings(&settings.multipart);

    let env = Environment {
        metadata,
        coordinator: consul,
        identifiers,
        downloader: GtDownloadClient::new(&download),
        objects,
        staging: Staging::new(settings.staging_root()?.clone()),
        buckets: settings.buckets.clone(),
    };
    info!(
        source = %options.source,
        bucket,
        host = %options.host,
        "downloader starting"
    );
    Downloader::new(env, options, cancel).run()?;
    Ok(())
}
