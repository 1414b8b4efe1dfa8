//! e-SAN CSI plugin.
//!
//! Usage:
//!   esan-csi [--config FILE] [--mode controller|node|all] [--endpoint unix:///path]
//!
//! Loads the driver configuration (file, then `ESAN_CSI_*` environment, then
//! flags), connects to the array when the controller runs, reloads persisted
//! volume records and serves the CSI socket until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use libesan::backend::esan::EsanClient;
use libesan::config::DriverConfig;
use libesan::context::DriverContext;
use libesan::node::LinuxHost;
use libesan::transport::server::{CsiServer, Services};
use libesan::{ControllerService, IdentityService, NodeService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Identity and controller services.
    Controller,
    /// Identity and node services.
    Node,
    /// Everything in one process.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "esan-csi", version, about = "e-SAN CSI plugin")]
struct Args {
    /// YAML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Which services to run.
    #[arg(long, value_enum, default_value = "all")]
    mode: Mode,

    /// Socket endpoint, overriding the configuration.
    #[arg(long)]
    endpoint: Option<String>,

    /// Node id reported by NodeGetInfo, overriding the configuration.
    #[arg(long)]
    node_id: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(format: LogFormat, level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(args: &Args) -> anyhow::Result<DriverConfig> {
    let mut config = match &args.config {
        Some(path) => DriverConfig::from_file(path)?,
        None => DriverConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(node_id) = &args.node_id {
        config.node_id = node_id.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = term.recv() => info!("received SIGTERM"),
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot watch SIGTERM; waiting for SIGINT only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot watch SIGINT either");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format, &args.log_level);

    let config = load_config(&args).context("load configuration")?;
    let socket_path = config.socket_path()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        driver = %config.driver_name,
        node_id = %config.node_id,
        mode = ?args.mode,
        "esan-csi starting"
    );

    let runs_controller = matches!(args.mode, Mode::Controller | Mode::All);
    let runs_node = matches!(args.mode, Mode::Node | Mode::All);

    let services = if runs_controller {
        let backend = Arc::new(
            EsanClient::connect(&config.backend)
                .await
                .context("connect to e-SAN array")?,
        );
        let ctx = DriverContext::recover(config)
            .await
            .context("recover volume registry")?;
        info!(
            volumes = ctx.registry.volume_count(),
            "volume registry recovered"
        );
        let services = Services::new(Arc::new(IdentityService::with_controller(
            Arc::clone(&ctx),
            backend.clone(),
        )))
        .with_controller(Arc::new(ControllerService::new(backend, Arc::clone(&ctx))));
        if runs_node {
            services.with_node(Arc::new(NodeService::new(
                Arc::new(LinuxHost::default()),
                ctx,
            )))
        } else {
            services
        }
    } else {
        let ctx = DriverContext::new(config);
        Services::new(Arc::new(IdentityService::node_only(Arc::clone(&ctx)))).with_node(Arc::new(
            NodeService::new(Arc::new(LinuxHost::default()), ctx),
        ))
    };

    let server = CsiServer::bind(&socket_path, services)
        .await
        .with_context(|| format!("bind {}", socket_path.display()))?;
    server.serve_until(shutdown_signal()).await?;
    info!("esan-csi stopped");
    Ok(())
}
