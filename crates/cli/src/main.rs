use crate::{env::EnvManager, error::CliError};
use clap::Parser;
use commands::Commands;
use connectors::registry::{DestinationConnector, SourceConnector};
use engine_activities::context::{FlowContext, QRepContext};
use engine_core::{
    control::ControlHub,
    state::{FlowStateStore, sled_store::SledFlowStateStore},
};
use engine_flows::{cdc::CdcFlow, error::FlowError, qrep::run_qrep_flow};
use model::flow::{FlowConnectionConfigs, QRepConfig};
use monitor::{CatalogMonitor, NoopMonitor, PostgresMonitor};
use serde::Deserialize;
use std::{path::PathBuf, process, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod commands;
mod env;
mod error;
mod shutdown;

#[derive(Parser)]
#[command(name = "sluice", version = "0.1.0", about = "Postgres to warehouse replication")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// A flow config file holds either a CDC mirror or a query-replication job.
#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum FlowSpec {
    Cdc(FlowConnectionConfigs),
    Qrep(QRepConfig),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let exit_code = match run_cli().await {
        Ok(()) => 0,
        Err(CliError::ShutdownRequested) => {
            info!("Worker shut down gracefully");
            shutdown::SHUTDOWN_EXIT_CODE
        }
        Err(e) => {
            tracing::error!("Application error: {}", e);
            1
        }
    };

    process::exit(exit_code);
}

async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    shutdown::install_signal_handling(cancel.clone());

    match cli.command {
        Commands::Worker {
            config,
            env_file,
            state_dir,
        } => {
            let env = load_env(env_file.as_deref())?;
            let state_store = open_state_store(state_dir)?;
            match load_flow_spec(&config).await? {
                FlowSpec::Cdc(config) => {
                    let job = config.flow_job_name.clone();
                    let ctx = build_flow_context(config, &env, cancel.clone()).await?;
                    let control = ControlHub::new().register(&job).await;
                    let flow = CdcFlow::new(ctx, state_store, control);
                    match flow.run().await {
                        Err(err) if err.is_shutdown() => Err(CliError::ShutdownRequested),
                        other => other.map_err(CliError::Flow),
                    }
                }
                FlowSpec::Qrep(config) => {
                    let ctx = build_qrep_context(config, &env, cancel.clone()).await?;
                    match run_qrep_flow(&ctx, state_store).await {
                        Err(err) if err.is_shutdown() => Err(CliError::ShutdownRequested),
                        other => other.map_err(CliError::Flow),
                    }
                }
            }
        }
        Commands::SnapshotWorker {
            config,
            env_file,
            state_dir,
        } => {
            let env = load_env(env_file.as_deref())?;
            let state_store = open_state_store(state_dir)?;
            let FlowSpec::Cdc(config) = load_flow_spec(&config).await? else {
                return Err(CliError::Config(
                    "snapshot-worker expects a CDC flow config".into(),
                ));
            };
            let job = config.flow_job_name.clone();
            let ctx = build_flow_context(config, &env, cancel.clone()).await?;
            let control = ControlHub::new().register(&job).await;
            let flow = CdcFlow::new(ctx, state_store, control);
            flow.run_setup().await.map_err(CliError::Flow)?;
            info!(flow = %job, "setup and initial copy complete");
            Ok(())
        }
        Commands::DropFlow {
            config,
            env_file,
            state_dir,
        } => {
            let env = load_env(env_file.as_deref())?;
            let state_store = open_state_store(state_dir)?;
            match load_flow_spec(&config).await? {
                FlowSpec::Cdc(config) => {
                    let job = config.flow_job_name.clone();
                    let ctx = build_flow_context(config, &env, cancel.clone()).await?;
                    engine_activities::cdc::drop_flow(&ctx)
                        .await
                        .map_err(FlowError::Activity)?;
                    state_store.delete_flow_state(&job).await?;
                    info!(flow = %job, "flow dropped");
                    Ok(())
                }
                FlowSpec::Qrep(config) => {
                    let job = config.flow_job_name.clone();
                    let ctx = build_qrep_context(config, &env, cancel.clone()).await?;
                    engine_activities::qrep::cleanup_qrep_flow(&ctx)
                        .await
                        .map_err(FlowError::Activity)?;
                    state_store.delete_flow_state(&job).await?;
                    info!(flow = %job, "flow dropped");
                    Ok(())
                }
            }
        }
        Commands::Status {
            job,
            state_dir,
            json,
        } => {
            let state_store = open_state_store(state_dir)?;
            show_status(state_store.as_ref(), &job, json).await
        }
    }
}

fn load_env(env_file: Option<&str>) -> Result<EnvManager, CliError> {
    let mut env = EnvManager::new();
    if let Some(path) = env_file {
        info!("Loading environment variables from: {}", path);
        env.load_from_file(path)?;
    }
    Ok(env)
}

async fn load_flow_spec(path: &str) -> Result<FlowSpec, CliError> {
    let source = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&source)?)
}

fn open_state_store(state_dir: Option<String>) -> Result<Arc<dyn FlowStateStore>, CliError> {
    let path = match state_dir {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .ok_or_else(|| CliError::Unexpected("Could not determine home directory".into()))?
            .join(".sluice/state"),
    };
    let store = SledFlowStateStore::open(&path).map_err(|err| {
        CliError::Unexpected(format!(
            "Failed to open state store at {}: {err}",
            path.display()
        ))
    })?;
    Ok(Arc::new(store))
}

async fn build_monitor(env: &EnvManager) -> Result<Arc<dyn CatalogMonitor>, CliError> {
    match env.catalog_dsn() {
        Some(dsn) => Ok(Arc::new(PostgresMonitor::connect(dsn).await?)),
        None => {
            info!("SLUICE_CATALOG_DSN not set, catalog monitoring disabled");
            Ok(Arc::new(NoopMonitor))
        }
    }
}

async fn build_flow_context(
    config: FlowConnectionConfigs,
    env: &EnvManager,
    cancel: CancellationToken,
) -> Result<FlowContext, CliError> {
    let source = Arc::new(SourceConnector::connect(&config.source).await?);
    let destination = Arc::new(DestinationConnector::connect(&config.destination).await?);
    let monitor = build_monitor(env).await?;
    Ok(FlowContext {
        config: Arc::new(config),
        source,
        destination,
        monitor,
        cancel,
    })
}

async fn build_qrep_context(
    config: QRepConfig,
    env: &EnvManager,
    cancel: CancellationToken,
) -> Result<QRepContext, CliError> {
    let source = Arc::new(SourceConnector::connect(&config.source).await?);
    let destination = Arc::new(DestinationConnector::connect(&config.destination).await?);
    let monitor = build_monitor(env).await?;
    Ok(QRepContext {
        config: Arc::new(config),
        source,
        destination,
        monitor,
        cancel,
    })
}

async fn show_status(
    store: &dyn FlowStateStore,
    job: &str,
    as_json: bool,
) -> Result<(), CliError> {
    let cdc = store.load_cdc_state(job).await?;
    let qrep = store.load_qrep_state(job).await?;

    if as_json {
        let payload = serde_json::json!({ "cdc": cdc, "qrep": qrep });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("Status for flow '{job}':");
    println!("-----------------------------");
    match cdc {
        Some(state) => {
            println!("{:<20} {}", "Setup complete", state.setup_complete);
            println!(
                "{:<20} {}",
                "Last offset",
                model::records::record::format_lsn(state.last_offset)
            );
            println!("{:<20} {}", "Sync batch id", state.sync_batch_id);
            println!("{:<20} {}", "Normalize batch id", state.normalize_batch_id);
            println!("{:<20} {}", "Generation", state.iteration);
            println!("{:<20} {}", "Updated at", state.updated_at.to_rfc3339());
        }
        None => println!("No CDC state recorded"),
    }
    match qrep {
        Some(state) => {
            println!(
                "{:<20} {}",
                "Partitions done", state.num_partitions_processed
            );
            println!("{:<20} {:?}", "Last partition", state.last_partition);
        }
        None => println!("No query-replication state recorded"),
    }
    Ok(())
}
