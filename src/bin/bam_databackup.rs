use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bam_ingest::backup::{BackupDriver, BackupEnvironment, BackupOptions, BackupWorker};
use bam_ingest::config::{ConfigLoader, DEFAULT_BACKUP_PREFIX, WorkerRole};
use bam_ingest::consul::ConsulClient;
use bam_ingest::domain::SourceTag;
use bam_ingest::error::IngestError;
use bam_ingest::metadata::PgMetadataStore;
use bam_ingest::object_store::{ObjectStoreConnector, S3Connector};
use bam_ingest::shutdown;

#[derive(Parser)]
#[command(name = "bam-databackup")]
#[command(about = "Copy ingested BAM/BAI objects to the configured backup stores")]
#[command(version)]
struct Cli {
    #[arg(long, help = "Source tag of the files to back up (e.g. tcga_cghub)")]
    source: String,

    #[arg(long, env = "CONSUL_HTTP_ADDR", default_value = "http://localhost:8500")]
    consul_url: String,

    #[arg(long, default_value = DEFAULT_BACKUP_PREFIX, help = "Coordination key prefix holding the worker configuration")]
    prefix: String,

    #[arg(long, help = "Process a single batch per thread and exit")]
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

    let consul = Arc::new(ConsulClient::new(&cli.consul_url)?);
    let settings = ConfigLoader::load(consul.as_ref(), &cli.prefix, WorkerRole::Backup)?;
    settings.bucket_for(source.as_str())?;

    let runtime = Arc::new(
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("bam-backup-io")
            .enable_all()
            .build()
            .into_diagnostic()?,
    );
    let cancel = shutdown::install(&runtime);

    let metadata = Arc::new(PgMetadataStore::connect(&settings.pg.connection_string())?);
    let primary: Arc<dyn ObjectStoreConnector> =
        Arc::new(S3Connector::with_runtime(settings.s3.clone(), runtime.clone()));
    let drivers = settings
        .backup_drivers
        .iter()
        .map(|(name, s3)| BackupDriver {
            name: name.clone(),
            connector: Arc::new(S3Connector::with_runtime(s3.clone(), runtime.clone())),
        })
        .collect::<Vec<_>>();

    let mut options = BackupOptions::new(source, hostname());
    options.processes = settings.processes;
    options.once = cli.once;
    options.block_size = settings.multipart.block_size;

    info!(
        source = %options.source,
        processes = options.processes,
        drivers = drivers.len(),
        "databackup starting"
    );
    let env = BackupEnvironment {
        metadata,
        coordinator: consul,
        source: primary,
        buckets: settings.buckets.clone(),
        drivers,
    };
    BackupWorker::new(env, options, cancel).run()?;
    Ok(())
}
