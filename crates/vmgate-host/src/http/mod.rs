pub mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::response::Response;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::HttpServerConfig;
use crate::error::HostError;
use crate::interceptor::{Intercept, Interceptor};
use upstream::Upstream;

#[derive(Clone)]
pub struct GatewayState {
    pub interceptor: Arc<Interceptor>,
    pub upstream: Arc<Upstream>,
}

/// Router that sends every request through the interceptor.
pub fn router(state: GatewayState) -> Router {
    Router::new().fallback(intercept).with_state(state)
}

async fn intercept(State(state): State<GatewayState>, request: Request) -> Response {
    match state.interceptor.intercept(request) {
        Intercept::Respond(response) => response.await,
        Intercept::PassThrough(request) => state.upstream.forward(request).await,
    }
}

pub fn spawn_http_server(
    config: HttpServerConfig,
    state: GatewayState,
    shutdown_tx: broadcast::Sender<()>,
) -> JoinHandle<()> {
    let app = router(state);
    tokio::spawn(async move {
        if let Err(err) = serve(config.bind, app, shutdown_tx).await {
            tracing::error!("http server error: {err}");
        }
    })
}

async fn serve(
    addr: SocketAddr,
    app: Router,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), HostError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| HostError::Http(format!("bind {addr}: {e}")))?;
    tracing::info!("gateway listening on http://{}", addr);
    let mut shutdown_rx = shutdown_tx.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .map_err(|e| HostError::Http(format!("serve {addr}: {e}")))
}
