//! Boot sequence for VM modules: fetch → instantiate → run → await handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use vmgate_wasm::VmRuntime;

use crate::clients::Client;
use crate::config::{LaunchConfig, VmConfig};
use crate::error::{HostError, LaunchError};
use crate::fetch::ModuleFetcher;
use crate::progress::{FetchedResponse, Progress, with_progress};
use crate::routes::{RouteEntry, route_prefix};
use crate::scope::Scope;
use crate::status::StatusReporter;
use crate::vm::{self, StartedVm, VmHandle, WasmHandler};

const WASM_MIME: &str = "application/wasm";

pub struct Launcher {
    scope: Arc<Scope>,
    fetcher: Arc<dyn ModuleFetcher>,
    runtime: Arc<VmRuntime>,
    config: VmConfig,
    current: Arc<Mutex<Option<VmHandle>>>,
    launches: AtomicU64,
}

impl Launcher {
    pub fn new(
        scope: Arc<Scope>,
        fetcher: Arc<dyn ModuleFetcher>,
        config: VmConfig,
    ) -> Result<Self, HostError> {
        let runtime = VmRuntime::new_with_disk_cache(config.cache_dir.clone())
            .map_err(|e| HostError::Runtime(format!("{e:#}")))?;
        Ok(Self::with_runtime(scope, fetcher, Arc::new(runtime), config))
    }

    pub fn with_runtime(
        scope: Arc<Scope>,
        fetcher: Arc<dyn ModuleFetcher>,
        runtime: Arc<VmRuntime>,
        config: VmConfig,
    ) -> Self {
        Self {
            scope,
            fetcher,
            runtime,
            config,
            current: Arc::new(Mutex::new(None)),
            launches: AtomicU64::new(0),
        }
    }

    /// The most recently started instance, if it is still alive.
    pub fn current(&self) -> Option<VmHandle> {
        self.current
            .lock()
            .expect("current vm poisoned")
            .clone()
            .filter(|vm| !vm.is_closed())
    }

    /// Run one launch sequence, reporting status to `client`.
    ///
    /// Returns once the module has been instantiated and started, or the launch
    /// failed. Failures are reported as `Errored` and never returned.
    pub async fn launch(&self, config: &LaunchConfig, client: Client) {
        let launch_id = self.launches.fetch_add(1, Ordering::Relaxed) + 1;
        let reporter = Arc::new(StatusReporter::new(client, launch_id));
        reporter.launching();

        if let Err(err) = self.try_launch(config, &reporter).await {
            tracing::warn!(launch = launch_id, "launch failed: {err}");
            reporter.errored(err.to_string());
        }
    }

    async fn try_launch(
        &self,
        config: &LaunchConfig,
        reporter: &Arc<StatusReporter>,
    ) -> Result<(), LaunchError> {
        self.scope.clients().claim();

        let prefix = route_prefix(self.scope.path(), &config.base_path);
        tracing::info!(launch = reporter.launch_id(), %prefix, "using route prefix");

        let response = self.fetcher.fetch(&config.module_path).await?;
        let module_path = config.module_path.clone();
        let source = with_progress(response, move |progress: Progress| {
            tracing::debug!("{module_path} loading progress: {progress}");
        });
        let wasm = self.read_module(source).await?;

        let booted = vm::boot(
            self.runtime.clone(),
            wasm,
            config.argv(),
            config.cache_key.clone(),
            self.config.command_buffer,
        )
        .await?;
        tracing::info!(
            launch = reporter.launch_id(),
            vm = booted.handle().id(),
            argv = ?config.argv(),
            "instantiated vm module"
        );

        reporter.running();
        let started = booted.start();
        self.supervise(started, prefix, reporter.clone());
        Ok(())
    }

    /// Stream-consume the module body, enforcing what the engine expects.
    async fn read_module(&self, response: FetchedResponse) -> Result<Bytes, LaunchError> {
        if !response.status.is_success() {
            return Err(LaunchError::Status {
                status: response.status.as_u16(),
                status_text: response.status_text.clone(),
            });
        }
        if self.config.require_wasm_mime {
            let essence = response
                .content_type()
                .and_then(|ct| ct.split(';').next())
                .map(|ct| ct.trim().to_ascii_lowercase())
                .unwrap_or_default();
            if essence != WASM_MIME {
                return Err(LaunchError::MimeType { found: essence });
            }
        }
        response
            .bytes()
            .await
            .map_err(|e| LaunchError::Body(e.to_string()))
    }

    fn supervise(&self, started: StartedVm, prefix: String, reporter: Arc<StatusReporter>) {
        let StartedVm {
            handle,
            registration,
            completion,
        } = started;
        let vm_id = handle.id();
        // Only `current` and the route keep handles. Once both let go the
        // command channel closes and the vm thread exits.
        *self.current.lock().expect("current vm poisoned") = Some(handle);

        let scope = self.scope.clone();
        let current = self.current.clone();
        let max_body_size = self.config.max_body_size;
        tokio::spawn(async move {
            match registration.await {
                Ok(export) => {
                    // Held across the write so terminate cannot interleave.
                    let current = current.lock().expect("current vm poisoned");
                    let Some(vm) = current.as_ref().filter(|vm| vm.id() == vm_id) else {
                        tracing::info!(vm = vm_id, "ignoring handler from a retired vm instance");
                        return;
                    };
                    tracing::info!(vm = vm_id, %export, "intercept has been set");
                    let handler = Arc::new(WasmHandler::new(vm.clone(), max_body_size));
                    scope.routes().set(RouteEntry::new(prefix, handler));
                }
                Err(_) => {
                    tracing::debug!(vm = vm_id, "vm stopped without registering a handler");
                }
            }
        });

        let current = self.current.clone();
        tokio::spawn(async move {
            match completion.await {
                Ok(Ok(())) => tracing::info!(vm = vm_id, "vm exited"),
                Ok(Err(message)) => {
                    tracing::error!(vm = vm_id, "vm failed: {message}");
                    reporter.errored(message);
                }
                Err(_) => tracing::error!(vm = vm_id, "vm thread died without reporting"),
            }
            let mut current = current.lock().expect("current vm poisoned");
            if current.as_ref().is_some_and(|vm| vm.id() == vm_id) {
                *current = None;
            }
        });
    }

    /// Stop the current instance through its teardown hook and drop its route.
    pub async fn terminate(&self) {
        let current = self.current.lock().expect("current vm poisoned").take();
        match current {
            Some(vm) => {
                let hook = vm.terminate().await;
                tracing::info!(vm = vm.id(), hook, "terminated vm instance");
            }
            None => tracing::debug!("terminate requested with no running vm instance"),
        }
        if let Some(route) = self.scope.routes().clear() {
            tracing::info!(prefix = %route.path_prefix, "cleared intercept route");
        }
    }
}
