//! `vmgate serve` command.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use url::Url;
use vmgate_host::{ControlMessage, Gateway, GatewayConfig};

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address the gateway listens on (env: VMGATE_BIND)
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Origin that pass-through requests are forwarded to (env: VMGATE_UPSTREAM)
    #[arg(long)]
    pub upstream: Option<Url>,

    /// Scope path the route prefix is built on (env: VMGATE_SCOPE)
    #[arg(long)]
    pub scope: Option<String>,

    /// Path of the VM module, resolved against the module origin (env: VMGATE_MODULE)
    #[arg(long)]
    pub module: Option<String>,

    /// Origin the module is fetched from (env: VMGATE_MODULE_ORIGIN)
    #[arg(long)]
    pub module_origin: Option<Url>,

    /// Base path joined onto the scope to form the route prefix (env: VMGATE_BASE)
    #[arg(long)]
    pub base: Option<String>,

    /// Namespace for the compiled-module disk cache (env: VMGATE_CACHE_KEY)
    #[arg(long)]
    pub cache_key: Option<String>,

    /// Extra argument passed to the module after its path (repeatable)
    #[arg(long = "arg")]
    pub args: Vec<String>,

    /// Control socket path (env: VMGATE_CONTROL_SOCKET)
    #[arg(long)]
    pub control_socket: Option<PathBuf>,

    /// Directory for serialized compiled modules (env: VMGATE_CACHE_DIR)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Accept module responses of any content type
    #[arg(long)]
    pub allow_any_mime: bool,

    /// Launch the module once at startup instead of waiting for a control message
    #[arg(long)]
    pub launch_on_start: bool,
}

impl ServeArgs {
    /// Layer the flags over the environment-derived config.
    pub fn apply(&self, mut config: GatewayConfig) -> GatewayConfig {
        if let Some(bind) = self.bind {
            config.http.bind = bind;
        }
        if let Some(upstream) = &self.upstream {
            config.http.upstream = upstream.clone();
        }
        if let Some(scope) = &self.scope {
            config.scope_path = scope.clone();
        }
        if let Some(module) = &self.module {
            config.launch.module_path = module.clone();
        }
        if let Some(origin) = &self.module_origin {
            config.vm.module_origin = origin.clone();
        }
        if let Some(base) = &self.base {
            config.launch.base_path = base.clone();
        }
        if self.cache_key.is_some() {
            config.launch.cache_key = self.cache_key.clone();
        }
        if !self.args.is_empty() {
            config.launch.args = self.args.clone();
        }
        if let Some(socket) = &self.control_socket {
            config.control_socket = socket.clone();
        }
        if self.cache_dir.is_some() {
            config.vm.cache_dir = self.cache_dir.clone();
        }
        if self.allow_any_mime {
            config.vm.require_wasm_mime = false;
        }
        config
    }
}

pub async fn cmd_serve(args: &ServeArgs) -> Result<()> {
    setup_logging();

    let config = args.apply(GatewayConfig::from_env()?);
    tracing::info!(
        scope = %config.scope_path,
        module = %config.launch.module_path,
        base = %config.launch.base_path,
        "starting gateway"
    );
    let gateway = Gateway::from_config(config).context("build gateway")?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down...");
            }
            _ = async {
                if let Some(ref mut t) = term { t.recv().await; }
            } => {
                tracing::info!("SIGTERM received, shutting down...");
            }
        }
        let _ = shutdown_tx_clone.send(());
    });

    if args.launch_on_start {
        launch_on_start(&gateway);
    }

    gateway.run(shutdown_tx).await?;
    Ok(())
}

/// Launch through a local client whose status messages go to the log.
fn launch_on_start(gateway: &Gateway) {
    let (client, mut outbox) = gateway.scope().clients().register();
    let control = gateway.control().clone();
    tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            tracing::info!("startup launch: {message}");
        }
    });
    tokio::spawn(async move {
        control
            .handle_message(ControlMessage::new(client.id(), "launch"))
            .await;
    });
}

/// Set up tracing subscriber for gateway logging.
fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();
}
