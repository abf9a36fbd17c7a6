//! RKE machine operator - plan and bootstrap channels for CAPI machines

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rke_machine_operator::controller::{
    error_policy, machine_for_service_account, reconcile, Context,
};
use rke_machine_operator::crd::{Machine, RKEBootstrap, RKECluster};
use rke_machine_operator::retry::{retry_with_backoff, RetryConfig};
use rke_machine_operator::{DEFAULT_FIELD_MANAGER, MACHINE_NAME_LABEL};

/// RKE machine operator - provisions plan and bootstrap channels for CAPI machines
#[derive(Parser, Debug)]
#[command(name = "rke-machine-operator", version, about, long_about = None)]
struct Cli {
    /// Print the RKEBootstrap and RKECluster CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Maximum number of machines reconciled concurrently (0 = unbounded)
    #[arg(long, env = "RKE_MACHINE_CONCURRENCY", default_value_t = 16)]
    concurrency: u16,

    /// Field manager used for server-side apply
    #[arg(long, env = "RKE_MACHINE_FIELD_MANAGER", default_value = DEFAULT_FIELD_MANAGER)]
    field_manager: String,

    /// Log output format
    #[arg(long, env = "RKE_MACHINE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let bootstrap = serde_yaml::to_string(&RKEBootstrap::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize RKEBootstrap CRD: {}", e))?;
        let cluster = serde_yaml::to_string(&RKECluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize RKECluster CRD: {}", e))?;
        println!("{bootstrap}---\n{cluster}");
        return Ok(());
    }

    init_tracing(cli.log_format);
    run_controller(cli).await
}

/// Wait until the API server answers, then run the machine controller
async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let version = retry_with_backoff(&RetryConfig::default(), "apiserver_version", || {
        let client = client.clone();
        async move { client.apiserver_version().await }
    })
    .await
    .map_err(|e| anyhow::anyhow!("API server unreachable: {}", e))?;
    tracing::info!(
        version = %format!("{}.{}", version.major, version.minor),
        "Connected to API server"
    );

    let ctx = Arc::new(
        Context::builder(client.clone())
            .field_manager(cli.field_manager.clone())
            .build(),
    );

    let machines: Api<Machine> = Api::all(client.clone());
    let service_accounts: Api<ServiceAccount> = Api::all(client);

    tracing::info!(
        concurrency = cli.concurrency,
        field_manager = %cli.field_manager,
        "Starting machine controller"
    );

    Controller::new(machines, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(cli.concurrency))
        .watches(
            service_accounts,
            WatcherConfig::default().labels(MACHINE_NAME_LABEL),
            |sa| machine_for_service_account(&sa),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((machine, action)) => {
                    tracing::debug!(machine = %machine, ?action, "Machine reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Machine reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Machine controller stopped");
    Ok(())
}
