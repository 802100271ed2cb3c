use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::HostError;

const DEFAULT_MODULE_PATH: &str = "/vm.wasm";
const DEFAULT_BASE_PATH: &str = "/vm";
const DEFAULT_ORIGIN: &str = "http://127.0.0.1:8080/";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Path of the background context's scope; the route prefix is built on it.
    pub scope_path: String,
    /// Launch parameters used for every `launch` control message.
    pub launch: LaunchConfig,
    pub vm: VmConfig,
    pub http: HttpServerConfig,
    pub control_socket: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            scope_path: "/".into(),
            launch: LaunchConfig::default(),
            vm: VmConfig::default(),
            http: HttpServerConfig::default(),
            control_socket: PathBuf::from("vmgate.sock"),
        }
    }
}

impl GatewayConfig {
    /// Build config from `VMGATE_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, HostError> {
        let mut cfg = Self::default();
        if let Some(scope) = env_var("VMGATE_SCOPE") {
            cfg.scope_path = scope;
        }
        if let Some(path) = env_var("VMGATE_MODULE") {
            cfg.launch.module_path = path;
        }
        if let Some(base) = env_var("VMGATE_BASE") {
            cfg.launch.base_path = base;
        }
        cfg.launch.cache_key = env_var("VMGATE_CACHE_KEY");
        if let Some(origin) = env_var("VMGATE_MODULE_ORIGIN") {
            cfg.vm.module_origin = parse_url("VMGATE_MODULE_ORIGIN", &origin)?;
        }
        if let Some(dir) = env_var("VMGATE_CACHE_DIR") {
            cfg.vm.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(bind) = env_var("VMGATE_BIND") {
            cfg.http.bind = bind
                .parse()
                .map_err(|e| HostError::Config(format!("invalid VMGATE_BIND '{bind}': {e}")))?;
        }
        if let Some(upstream) = env_var("VMGATE_UPSTREAM") {
            cfg.http.upstream = parse_url("VMGATE_UPSTREAM", &upstream)?;
        }
        if let Some(socket) = env_var("VMGATE_CONTROL_SOCKET") {
            cfg.control_socket = PathBuf::from(socket);
        }
        Ok(cfg)
    }
}

/// Parameters of one launch. Immutable once handed to the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub module_path: String,
    pub base_path: String,
    /// Namespace for the on-disk compiled-module cache.
    pub cache_key: Option<String>,
    pub args: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MODULE_PATH, DEFAULT_BASE_PATH)
    }
}

impl LaunchConfig {
    pub fn new(module_path: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            module_path: module_path.into(),
            base_path: base_path.into(),
            cache_key: None,
            args: Vec::new(),
        }
    }

    /// The module's argv: the module path followed by the configured args.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.module_path.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Configuration for fetching and running VM modules.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Origin the module path is resolved against.
    pub module_origin: Url,
    pub connect_timeout: Duration,
    /// Reject module responses whose content type is not `application/wasm`.
    pub require_wasm_mime: bool,
    /// Directory for serialized compiled modules; `None` keeps the cache in memory only.
    pub cache_dir: Option<PathBuf>,
    /// Maximum request body forwarded to the module handler.
    pub max_body_size: usize,
    /// Capacity of the per-instance request queue.
    pub command_buffer: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            module_origin: default_origin(),
            connect_timeout: Duration::from_secs(30),
            require_wasm_mime: true,
            cache_dir: None,
            max_body_size: 10 * 1024 * 1024, // 10MB
            command_buffer: 64,
        }
    }
}

/// Configuration for the intercepting HTTP server.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind: SocketAddr,
    /// Where pass-through traffic is forwarded.
    pub upstream: Url,
    pub upstream_timeout: Duration,
    pub max_body_size: usize,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7780)),
            upstream: default_origin(),
            upstream_timeout: Duration::from_secs(60),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

fn default_origin() -> Url {
    Url::parse(DEFAULT_ORIGIN).expect("default origin is a valid url")
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_url(name: &str, value: &str) -> Result<Url, HostError> {
    Url::parse(value).map_err(|e| HostError::Config(format!("invalid {name} '{value}': {e}")))
}
