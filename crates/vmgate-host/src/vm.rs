//! VM instances running on their own threads, and the handler that talks to them.
//!
//! Each instance owns its wasmtime store on a dedicated OS thread. Requests
//! reach it through a bounded command channel, so calls into one module are
//! strictly serialized. The thread exits on `Terminate`, when the entry point
//! fails, or once every `VmHandle` is gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use vmgate_wasm::VmRuntime;
use vmgate_wasm_abi::{HttpRequest, HttpResponse};

use crate::error::LaunchError;
use crate::routes::RequestHandler;

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

pub enum VmCommand {
    Handle {
        request: HttpRequest,
        resp: oneshot::Sender<Result<HttpResponse, String>>,
    },
    Terminate {
        resp: oneshot::Sender<bool>,
    },
}

#[derive(Debug, Error)]
pub enum VmCallError {
    #[error("vm instance is not running")]
    Gone,
    #[error("vm handler failed: {0}")]
    Handler(String),
}

/// Cheap, clonable reference to a running instance.
#[derive(Clone, Debug)]
pub struct VmHandle {
    id: u64,
    commands: mpsc::Sender<VmCommand>,
}

impl VmHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn call(&self, request: HttpRequest) -> Result<HttpResponse, VmCallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(VmCommand::Handle { request, resp: tx })
            .await
            .map_err(|_| VmCallError::Gone)?;
        rx.await
            .map_err(|_| VmCallError::Gone)?
            .map_err(VmCallError::Handler)
    }

    /// Stop the instance, running the module's own teardown hook first.
    ///
    /// Returns whether the module exported a hook; `false` too if it was
    /// already gone.
    pub async fn terminate(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(VmCommand::Terminate { resp: tx })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

/// An instantiated module waiting for `start`.
pub struct BootedVm {
    handle: VmHandle,
    start: oneshot::Sender<()>,
    registration: oneshot::Receiver<String>,
    completion: oneshot::Receiver<Result<(), String>>,
}

/// A started instance: its handle, the one-shot handler registration, and the
/// outcome of its run.
pub struct StartedVm {
    pub handle: VmHandle,
    pub registration: oneshot::Receiver<String>,
    pub completion: oneshot::Receiver<Result<(), String>>,
}

impl BootedVm {
    pub fn handle(&self) -> &VmHandle {
        &self.handle
    }

    /// Let the instance run its entry point. Does not wait for it.
    pub fn start(self) -> StartedVm {
        if self.start.send(()).is_err() {
            tracing::warn!(vm = self.handle.id, "vm thread exited before start");
        }
        StartedVm {
            handle: self.handle,
            registration: self.registration,
            completion: self.completion,
        }
    }
}

/// Compile and instantiate `wasm` on a fresh VM thread.
///
/// The registration hook is installed before the entry point can run, so the
/// module's setter call is never missed. Resolves once instantiation has
/// succeeded or failed.
pub async fn boot(
    runtime: Arc<VmRuntime>,
    wasm: Bytes,
    argv: Vec<String>,
    cache_key: Option<String>,
    command_buffer: usize,
) -> Result<BootedVm, LaunchError> {
    let id = NEXT_VM_ID.fetch_add(1, Ordering::Relaxed);
    let (commands_tx, commands_rx) = mpsc::channel(command_buffer.max(1));
    let (ready_tx, ready_rx) = oneshot::channel();
    let (start_tx, start_rx) = oneshot::channel();
    let (registration_tx, registration_rx) = oneshot::channel();
    let (completion_tx, completion_rx) = oneshot::channel();

    let thread = VmThread {
        id,
        runtime,
        wasm,
        argv,
        cache_key,
        commands: commands_rx,
        ready: ready_tx,
        start: start_rx,
        registration: registration_tx,
        completion: completion_tx,
    };
    std::thread::Builder::new()
        .name(format!("vmgate-vm-{id}"))
        .spawn(move || thread.run())
        .map_err(|e| LaunchError::Instantiate(format!("spawn vm thread: {e}")))?;

    match ready_rx.await {
        Ok(Ok(())) => Ok(BootedVm {
            handle: VmHandle {
                id,
                commands: commands_tx,
            },
            start: start_tx,
            registration: registration_rx,
            completion: completion_rx,
        }),
        Ok(Err(message)) => Err(LaunchError::Instantiate(message)),
        Err(_) => Err(LaunchError::VmGone),
    }
}

struct VmThread {
    id: u64,
    runtime: Arc<VmRuntime>,
    wasm: Bytes,
    argv: Vec<String>,
    cache_key: Option<String>,
    commands: mpsc::Receiver<VmCommand>,
    ready: oneshot::Sender<Result<(), String>>,
    start: oneshot::Receiver<()>,
    registration: oneshot::Sender<String>,
    completion: oneshot::Sender<Result<(), String>>,
}

impl VmThread {
    fn run(self) {
        let VmThread {
            id,
            runtime,
            wasm,
            argv,
            cache_key,
            mut commands,
            ready,
            start,
            registration,
            completion,
        } = self;

        let instantiated = runtime
            .cached_module(&wasm, cache_key.as_deref())
            .and_then(|module| runtime.instantiate(&module, argv));
        let mut instance = match instantiated {
            Ok(instance) => instance,
            Err(err) => {
                let _ = ready.send(Err(format!("{err:#}")));
                return;
            }
        };
        drop(wasm);
        instance.on_register(move |export| {
            let _ = registration.send(export);
        });
        if ready.send(Ok(())).is_err() || start.blocking_recv().is_err() {
            tracing::debug!(vm = id, "vm abandoned before start");
            return;
        }

        tracing::info!(vm = id, "running vm entry point");
        if let Err(err) = instance.run_entry() {
            let _ = completion.send(Err(format!("{err:#}")));
            return;
        }

        let mut outcome = Ok(());
        while let Some(command) = commands.blocking_recv() {
            match command {
                VmCommand::Handle { request, resp } => {
                    let result = instance.handle(&request).map_err(|e| format!("{e:#}"));
                    if let Err(err) = &result {
                        tracing::warn!(vm = id, uri = %request.uri, "vm handler failed: {err}");
                    }
                    let _ = resp.send(result);
                }
                VmCommand::Terminate { resp } => {
                    let hook = match instance.terminate() {
                        Ok(hook) => hook,
                        Err(err) => {
                            outcome = Err(format!("terminate hook failed: {err:#}"));
                            true
                        }
                    };
                    let _ = resp.send(hook);
                    break;
                }
            }
        }
        tracing::info!(vm = id, "vm instance stopped");
        let _ = completion.send(outcome);
    }
}

/// `RequestHandler` backed by a VM instance.
pub struct WasmHandler {
    vm: VmHandle,
    max_body_size: usize,
}

impl WasmHandler {
    pub fn new(vm: VmHandle, max_body_size: usize) -> Self {
        Self { vm, max_body_size }
    }
}

#[async_trait]
impl RequestHandler for WasmHandler {
    async fn handle(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let body = match axum::body::to_bytes(body, self.max_body_size).await {
            Ok(body) => body,
            Err(err) => {
                return (StatusCode::PAYLOAD_TOO_LARGE, format!("read request body: {err}"))
                    .into_response();
            }
        };

        let uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());
        let mut envelope = HttpRequest::new(parts.method.as_str(), uri);
        envelope.headers = parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        envelope.body = body.to_vec();

        match self.vm.call(envelope).await {
            Ok(response) => into_response(response),
            Err(err @ VmCallError::Gone) => {
                (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
            }
            Err(err @ VmCallError::Handler(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

fn into_response(envelope: HttpResponse) -> Response {
    let status = match StatusCode::from_u16(envelope.status) {
        Ok(status) => status,
        Err(_) => {
            return (
                StatusCode::BAD_GATEWAY,
                format!("vm returned invalid status {}", envelope.status),
            )
                .into_response();
        }
    };
    let mut response = Response::new(Body::from(envelope.body));
    *response.status_mut() = status;
    for (name, value) in envelope.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => tracing::warn!("dropping invalid header '{name}' from vm response"),
        }
    }
    response
}
