use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fod_adapters::{
    load_fixture_bundle, DbCredentials, DestinationStore, FieldMapper, FieldMappingTable,
    MemoryDestinationStore, MySqlDestinationStore, OfflineStore, SqliteOfflineStore,
};
use fod_core::RunId;
use fod_storage::{LocalObjectStore, ObjectStore, S3ObjectStore};
use fod_sync::{
    clear_pending_reservation, identity_entries, migration_error, read_run_brief, ConnectionSettings,
    IdentityEntry, IngestConfig, IngestPipeline, ObjectStoreKind, RunSummary,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fod-cli")]
#[command(about = "Migrate offline FOD inspection runs to the online platform")]
struct Cli {
    /// Optional dotenv file with connection settings.
    #[arg(long, global = true, default_value = "app/.env.prod.txt")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one offline run into the destination database and bucket.
    Ingest {
        #[arg(long)]
        run_id: String,
        /// Destination user owning the report (falls back to FOD_USER_ID).
        #[arg(long)]
        user_id: Option<u64>,
        #[arg(long)]
        bucket_name: Option<String>,
        /// Rehearse against a fixture bundle, an in-memory destination and a local object store.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// YAML field-mapping table replacing the built-in one.
        #[arg(long)]
        field_map: Option<PathBuf>,
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
    /// List offline runs with their image counts.
    Runs,
    /// List the identity entries of a run, flagging unfinished reservations.
    Identities {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        bucket_name: Option<String>,
        /// Delete reservations left behind by a worker that is known to be gone.
        #[arg(long)]
        clear_pending: bool,
    },
    /// Print the brief written for a previous run.
    Report {
        #[arg(long)]
        run_id: String,
        #[arg(long, default_value = "reports")]
        reports_dir: PathBuf,
    },
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let env_loaded = dotenv::from_path(&cli.env_file);

    if let Err(err) = init_tracing("info") {
        eprintln!("{err:#}");
    }
    match env_loaded {
        Ok(()) => info!(path = %cli.env_file.display(), "loaded env file"),
        Err(err) => warn!(path = %cli.env_file.display(), error = %err, "env file not loaded"),
    }

    match run(cli.command).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            let kind = migration_error(&err).map(|e| e.kind()).unwrap_or("fatal");
            error!(kind, error = %format!("{err:#}"), "command failed");
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(command: Commands) -> Result<u8> {
    match command {
        Commands::Ingest {
            run_id,
            user_id,
            bucket_name,
            fixture,
            field_map,
            reports_dir,
        } => {
            let run_id = RunId::parse(&run_id)?;
            let mut config = IngestConfig::from_env();
            if let Some(user_id) = user_id {
                config.user_id = user_id;
            }
            if let Some(bucket_name) = bucket_name {
                config.bucket_name = bucket_name;
            }
            if reports_dir.is_some() {
                config.reports_dir = reports_dir;
            }
            let mapper = match field_map {
                Some(path) => FieldMapper::new(FieldMappingTable::from_yaml_file(&path)?)?,
                None => FieldMapper::default(),
            };

            let settings = ConnectionSettings::from_env()?;
            let pipeline = match fixture {
                Some(bundle) => dry_run_pipeline(config, &settings, &bundle)?,
                None => live_pipeline(config, &settings).await?,
            }
            .with_field_mapper(mapper);

            let summary = pipeline.run_once(&run_id).await?;
            print_summary(&summary);
            Ok(summary.status.exit_code())
        }
        Commands::Runs => {
            let settings = ConnectionSettings::from_env()?;
            let offline = SqliteOfflineStore::connect(&settings.offline_database_url).await?;
            let counts = offline.image_counts().await.context("listing offline runs")?;
            println!("{:<12} {:>8}", "runID", "images");
            for count in counts {
                println!("{:<12} {:>8}", count.run_id, count.images);
            }
            Ok(0)
        }
        Commands::Identities {
            run_id,
            bucket_name,
            clear_pending,
        } => {
            let run_id = RunId::parse(&run_id)?;
            let config = IngestConfig::from_env();
            let bucket = bucket_name.unwrap_or(config.bucket_name);
            let settings = ConnectionSettings::from_env()?;
            let objects = object_store(&settings, bucket).await;

            let entries = identity_entries(objects.as_ref(), &config.backoff, &run_id).await?;
            let mut pending = 0usize;
            for (key, entry) in &entries {
                match entry {
                    IdentityEntry::Assigned {
                        offline_id, online_id, ..
                    } => println!("assigned {offline_id:>8} -> {online_id:<8} {key}"),
                    IdentityEntry::Pending { owner, reserved_at } => {
                        pending += 1;
                        println!("pending  {owner} since {reserved_at} {key}");
                        if clear_pending && clear_pending_reservation(objects.as_ref(), &config.backoff, key).await? {
                            println!("cleared  {key}");
                        }
                    }
                }
            }
            info!(%run_id, entries = entries.len(), pending, "listed identity entries");
            Ok(if pending > 0 && !clear_pending { 2 } else { 0 })
        }
        Commands::Report { run_id, reports_dir } => {
            let run_id = RunId::parse(&run_id)?;
            print!("{}", read_run_brief(&reports_dir, &run_id)?);
            Ok(0)
        }
    }
}

async fn live_pipeline(config: IngestConfig, settings: &ConnectionSettings) -> Result<IngestPipeline> {
    let offline: Arc<dyn OfflineStore> =
        Arc::new(SqliteOfflineStore::connect(&settings.offline_database_url).await?);
    let credentials = DbCredentials::from_env().context("loading destination credentials")?;
    let destination: Arc<dyn DestinationStore> = Arc::new(
        MySqlDestinationStore::connect(&credentials, config.backoff.attempt_timeout).await?,
    );
    let objects = object_store(settings, config.bucket_name.clone()).await;
    Ok(IngestPipeline::new(config, offline, destination, objects))
}

async fn object_store(settings: &ConnectionSettings, bucket: String) -> Arc<dyn ObjectStore> {
    match settings.object_store {
        ObjectStoreKind::S3 => Arc::new(S3ObjectStore::from_env(bucket).await),
        ObjectStoreKind::Local => Arc::new(LocalObjectStore::new(settings.local_object_root.clone(), bucket)),
    }
}

fn dry_run_pipeline(config: IngestConfig, settings: &ConnectionSettings, bundle: &Path) -> Result<IngestPipeline> {
    let offline: Arc<dyn OfflineStore> = Arc::new(load_fixture_bundle(bundle)?);
    let destination: Arc<dyn DestinationStore> = Arc::new(MemoryDestinationStore::new());
    let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(
        settings.local_object_root.clone(),
        config.bucket_name.clone(),
    ));
    info!(bundle = %bundle.display(), root = %settings.local_object_root.display(), "dry run against fixture");
    Ok(IngestPipeline::new(config, offline, destination, objects))
}

fn print_summary(summary: &RunSummary) {
    println!(
        "ingest complete: run_id={} status={:?} report_id={} records={}/{} images uploaded={} skipped={} failed={}",
        summary.run_id,
        summary.status,
        summary.report_id,
        summary.records_succeeded,
        summary.records_total,
        summary.images_uploaded,
        summary.images_skipped,
        summary.images_failed,
    );
    for failure in &summary.failed_records {
        println!("failed record {}: {}", failure.record_id, failure.error);
    }
    for failure in &summary.failed_images {
        println!("failed image {} (record {}): {}", failure.image_name, failure.record_id, failure.error);
    }
    for key in &summary.artifacts {
        println!("artifact {}/{}", summary.bucket, key);
    }
    if let Some(dir) = &summary.reports_dir {
        println!("reports {dir}");
    }
}
