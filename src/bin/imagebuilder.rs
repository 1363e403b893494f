//! imagebuilder - container snapshot controller
//!
//! ## Usage
//!
//! ```sh
//! imagebuilder controller --mode delegated --job-image <image>
//! imagebuilder controller --mode direct --node "$NODE_NAME"
//! imagebuilder job --name <request> --namespace <ns> --container-id <id>
//! imagebuilder crd > crd.yaml
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use imagebuilder::config::{ControllerConfig, EngineOptions, ExecutionMode, JobArgs, JobSettings};
use imagebuilder::constants::{
    CONTAINERD_NAMESPACE, CONTAINERD_SOCKET, DEFAULT_JOB_IMAGE, DEFAULT_JOB_NAMESPACE,
    DEFAULT_JOB_SERVICE_ACCOUNT, DEFAULT_MAX_CONCURRENT_RECONCILES, DOCKER_SOCKET,
    JOB_BACKOFF_LIMIT, JOB_CPU_LIMIT, JOB_MEMORY_LIMIT,
};
use imagebuilder::logging::{self, LogFormat};
use imagebuilder::{controller, pipeline, selector, Error, ImageBuilder, KubeCluster, Result};
use kube::CustomResourceExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "imagebuilder")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log line format.
    #[arg(long, value_enum, default_value_t = LogFormatArg::Text, global = true)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch ImageBuilder requests and drive them to completion.
    Controller(ControllerArgs),
    /// Commit and publish one container (run inside a delegated job).
    Job(JobCommandArgs),
    /// Print the CustomResourceDefinition as YAML.
    Crd,
}

#[derive(Debug, Args)]
struct ControllerArgs {
    /// Where commit/push runs.
    #[arg(long, value_enum, env = "IMAGEBUILDER_MODE", default_value_t = ModeArg::Delegated)]
    mode: ModeArg,

    /// Node this controller runs on (direct mode).
    #[arg(long = "node", env = "NODE_NAME")]
    node_name: Option<String>,

    /// Only watch requests in this namespace.
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Requests reconciled concurrently.
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_RECONCILES)]
    workers: u16,

    /// Seconds between job status checks.
    #[arg(long, default_value_t = 10)]
    poll_interval_secs: u64,

    /// Seconds a job may run before the request is failed.
    #[arg(long, default_value_t = 3600)]
    poll_deadline_secs: u64,

    #[command(flatten)]
    job: JobTemplateArgs,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Args)]
struct JobTemplateArgs {
    /// Namespace delegated jobs are created in.
    #[arg(long, env = "IMAGEBUILDER_JOB_NAMESPACE", default_value = DEFAULT_JOB_NAMESPACE)]
    job_namespace: String,

    /// Image running the `job` subcommand.
    #[arg(long, env = "IMAGEBUILDER_JOB_IMAGE", default_value = DEFAULT_JOB_IMAGE)]
    job_image: String,

    /// Service account of delegated jobs.
    #[arg(long, env = "IMAGEBUILDER_JOB_SERVICE_ACCOUNT", default_value = DEFAULT_JOB_SERVICE_ACCOUNT)]
    job_service_account: String,

    #[arg(long, default_value = "IfNotPresent")]
    job_image_pull_policy: String,

    #[arg(long, default_value_t = JOB_BACKOFF_LIMIT)]
    job_backoff_limit: i32,

    #[arg(long, default_value = JOB_CPU_LIMIT)]
    job_cpu_limit: String,

    #[arg(long, default_value = JOB_MEMORY_LIMIT)]
    job_memory_limit: String,

    /// Secret holding the signing key, mounted into jobs when signing is on.
    #[arg(long, env = "IMAGEBUILDER_JOB_SIGNING_KEY_SECRET")]
    job_signing_key_secret: Option<String>,
}

#[derive(Debug, Args)]
struct EngineArgs {
    #[arg(long, env = "DOCKER_SOCKET", default_value = DOCKER_SOCKET)]
    docker_socket: String,

    #[arg(long, env = "CONTAINERD_SOCKET", default_value = CONTAINERD_SOCKET)]
    containerd_socket: String,

    #[arg(long, default_value = CONTAINERD_NAMESPACE)]
    containerd_namespace: String,

    /// Verify registry TLS certificates.
    #[arg(long)]
    verify_registry_tls: bool,

    /// Registry (host[:port]) reached over plain HTTP. Repeatable.
    #[arg(long = "plain-http-registry")]
    plain_http_registries: Vec<String>,

    /// Cosign key; pushed images are signed when set.
    #[arg(long, env = "IMAGEBUILDER_SIGNING_KEY")]
    signing_key: Option<PathBuf>,

    #[arg(long, default_value = "cosign")]
    cosign_binary: PathBuf,
}

#[derive(Debug, Args)]
struct JobCommandArgs {
    /// Request name.
    #[arg(long)]
    name: String,

    /// Request namespace.
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Runtime-local id of the container to commit.
    #[arg(long)]
    container_id: String,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Direct,
    Delegated,
}

impl From<ModeArg> for ExecutionMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Direct => Self::Direct,
            ModeArg::Delegated => Self::Delegated,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => Self::Text,
            LogFormatArg::Json => Self::Json,
        }
    }
}

impl From<EngineArgs> for EngineOptions {
    fn from(args: EngineArgs) -> Self {
        Self {
            docker_socket: args.docker_socket,
            containerd_socket: args.containerd_socket,
            containerd_namespace: args.containerd_namespace,
            insecure_registry: !args.verify_registry_tls,
            plain_http_registries: args.plain_http_registries,
            signing_key: args.signing_key,
            cosign_binary: args.cosign_binary,
        }
    }
}

impl From<ControllerArgs> for ControllerConfig {
    fn from(args: ControllerArgs) -> Self {
        Self {
            mode: args.mode.into(),
            node_name: args.node_name,
            watch_namespace: args.watch_namespace,
            max_concurrent_reconciles: args.workers,
            poll_interval: Duration::from_secs(args.poll_interval_secs),
            poll_deadline: Duration::from_secs(args.poll_deadline_secs),
            job: JobSettings {
                namespace: args.job.job_namespace,
                image: args.job.job_image,
                service_account: args.job.job_service_account,
                image_pull_policy: args.job.job_image_pull_policy,
                backoff_limit: args.job.job_backoff_limit,
                cpu_limit: args.job.job_cpu_limit,
                memory_limit: args.job.job_memory_limit,
                signing_key_secret: args.job.job_signing_key_secret,
            },
            engine: args.engine.into(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log_format.into());

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "imagebuilder failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Crd => {
            let yaml = serde_yaml::to_string(&ImageBuilder::crd())
                .map_err(|e| Error::Serialization(e.to_string()))?;
            print!("{}", yaml);
            Ok(())
        }
        Command::Controller(args) => {
            let config = ControllerConfig::from(args);
            let cluster = KubeCluster::try_default().await?;
            let shutdown = shutdown_token();
            controller::run(cluster, config, shutdown).await
        }
        Command::Job(args) => {
            let options = EngineOptions::from(args.engine);
            let job_args = JobArgs {
                name: args.name,
                namespace: args.namespace,
                container_id: args.container_id,
            };
            let cluster = KubeCluster::try_default().await?;
            let shutdown = shutdown_token();
            pipeline::run_job(
                &cluster,
                &job_args,
                |identifier| async move { selector::select(&identifier, &options).await },
                &shutdown,
            )
            .await?;
            info!(request = %job_args.name, "job finished");
            Ok(())
        }
    }
}

/// Token cancelled on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
