use std::sync::Arc;

use axum::Router;
use tokio::sync::broadcast;

use crate::config::GatewayConfig;
use crate::control::{ControlHandler, ControlServer};
use crate::error::HostError;
use crate::fetch::{HttpFetcher, ModuleFetcher};
use crate::http::upstream::Upstream;
use crate::http::{self, GatewayState};
use crate::interceptor::Interceptor;
use crate::launcher::Launcher;
use crate::scope::Scope;

/// One background execution context with everything wired to it.
pub struct Gateway {
    config: GatewayConfig,
    scope: Arc<Scope>,
    control: Arc<ControlHandler>,
    state: GatewayState,
}

impl Gateway {
    pub fn from_config(config: GatewayConfig) -> Result<Self, HostError> {
        let fetcher = HttpFetcher::new(config.vm.module_origin.clone(), config.vm.connect_timeout)?;
        Self::with_fetcher(config, Arc::new(fetcher))
    }

    pub fn with_fetcher(
        config: GatewayConfig,
        fetcher: Arc<dyn ModuleFetcher>,
    ) -> Result<Self, HostError> {
        let scope = Arc::new(Scope::new(config.scope_path.clone()));
        let launcher = Arc::new(Launcher::new(scope.clone(), fetcher, config.vm.clone())?);
        let control = Arc::new(ControlHandler::new(
            scope.clone(),
            launcher,
            config.launch.clone(),
        ));
        let state = GatewayState {
            interceptor: Arc::new(Interceptor::new(scope.clone())),
            upstream: Arc::new(Upstream::from_config(&config.http)?),
        };
        Ok(Self {
            config,
            scope,
            control,
            state,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn control(&self) -> &Arc<ControlHandler> {
        &self.control
    }

    pub fn router(&self) -> Router {
        http::router(self.state.clone())
    }

    /// Serve HTTP and control traffic until `shutdown_tx` fires.
    pub async fn run(self, shutdown_tx: broadcast::Sender<()>) -> Result<(), HostError> {
        self.control.activate();

        let server = ControlServer::new(
            self.config.control_socket.clone(),
            self.control.clone(),
            self.scope.clone(),
            &shutdown_tx,
        );
        let control_handle = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("control server error: {e}");
            }
        });
        let http_handle =
            http::spawn_http_server(self.config.http.clone(), self.state.clone(), shutdown_tx);

        let (control, http) = tokio::join!(control_handle, http_handle);
        control.map_err(|e| HostError::Control(e.to_string()))?;
        http.map_err(|e| HostError::Http(e.to_string()))?;

        if let Some(vm) = self.control.launcher().current() {
            tracing::info!(vm = vm.id(), "stopping vm on shutdown");
            self.control.launcher().terminate().await;
        }
        Ok(())
    }
}
