mod controller;
mod deadline;
mod event;
mod finalizer;
mod kube_ext;
mod reconciler;

use std::{path::PathBuf, sync::Arc, time::Duration};

use artifact_storage::LocalStorage;
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::stream::StreamExt;
use git_client::Git2Engine;
use kube::{
    runtime::{events::Reporter, reflector, watcher, Controller, WatchStreamExt},
    Api, Client, CustomResourceExt,
};
use source_controller_crd::{GitRepository, APP_NAME};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{
    controller::ContextData,
    kube_ext::{KubeSecrets, KubeStatus},
    reconciler::Reconciler,
};

const LOG_ENV: &str = "SOURCE_CONTROLLER_LOG";

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Parser)]
#[clap(about, author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the GitRepository CustomResourceDefinition as YAML
    Crd,
    /// Run the controller
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Directory artifacts are stored in
    #[arg(long, env = "SOURCE_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    /// Host (and port) artifacts are advertised under
    #[arg(long, env = "SOURCE_STORAGE_ADV_ADDR", default_value = "localhost:9090")]
    storage_adv_addr: String,

    /// Wall-clock budget of a single reconciliation
    #[arg(long, env = "SOURCE_RECONCILE_TIMEOUT", default_value = "15s", value_parser = humantime::parse_duration)]
    reconcile_timeout: Duration,

    /// Only watch GitRepositories in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    #[arg(long, env = "SOURCE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
    Logfmt,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => print!("{}", serde_yaml::to_string(&GitRepository::crd())?),
        Command::Run(args) => run(args).await?,
    }

    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(args.log_format);
    info!(
        "Starting {} {} ({}), built for {} at {}",
        built_info::PKG_NAME,
        built_info::PKG_VERSION,
        built_info::GIT_VERSION.unwrap_or("unknown revision"),
        built_info::TARGET,
        built_info::BUILT_TIME_UTC,
    );

    let storage_path = args
        .storage_path
        .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME));
    info!("Store artifacts in {:?}", storage_path);
    if !storage_path.exists() {
        info!("Create storage dir: {:?}", storage_path);
        std::fs::create_dir_all(&storage_path)?;
    }
    let storage = LocalStorage::new(storage_path, &args.storage_adv_addr)?;

    git_client::set_network_timeout(args.reconcile_timeout)?;

    let client = Client::try_default().await?;
    let api: Api<GitRepository> = match &args.watch_namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    let reconciler = Reconciler::new(
        Arc::new(storage),
        Arc::new(Git2Engine),
        Arc::new(KubeSecrets::new(client.clone())),
        Arc::new(KubeStatus::new(client.clone())),
        args.reconcile_timeout,
    );
    let reporter = Reporter {
        controller: APP_NAME.to_string(),
        instance: std::env::var("POD_NAME").ok(),
    };

    let (reader, writer) = reflector::store();
    let repositories = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(controller::source_changed);

    Controller::for_stream(repositories, reader)
        .shutdown_on_signal()
        .run(
            controller::reconcile,
            controller::error_policy,
            Arc::new(ContextData::new(client, reporter, reconciler)),
        )
        .for_each(|result| async move {
            match result {
                Ok((repo, _)) => debug!("Reconciled {}", repo),
                Err(error) => warn!("Reconcile failed: {}", error),
            }
        })
        .await;

    info!("Controller stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Logfmt => registry.with(tracing_logfmt::layer()).init(),
    }
}
