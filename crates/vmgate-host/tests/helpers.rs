#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use futures_util::stream;
use tokio::sync::mpsc;
use vmgate_host::config::VmConfig;
use vmgate_host::fetch::ModuleFetcher;
use vmgate_host::progress::FetchedResponse;
use vmgate_host::{LaunchError, Launcher, Scope, StatusMessage, VmStatus};
use vmgate_wasm::VmRuntime;
use vmgate_wasm_abi::HttpResponse;

pub const SCOPE: &str = "/sw/";
pub const BASE: &str = "/metrics";
pub const PREFIX: &str = "/sw/metrics";

fn data_literal(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{:02x}", b)).collect()
}

/// Module that registers `serve` from `_start` and answers every request with
/// `response`.
pub fn http_module(response: &HttpResponse) -> Vec<u8> {
    let bytes = response.encode().unwrap();
    let wat = format!(
        r#"(module
  (import "vmgate" "register_handler" (func $register (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 8192))
  (data (i32.const 0) "serve")
  (data (i32.const 64) "{data}")
  (func (export "alloc") (param i32) (result i32)
    (local $old i32)
    global.get $heap
    local.tee $old
    local.get 0
    i32.add
    global.set $heap
    local.get $old)
  (func (export "_start")
    (drop (call $register (i32.const 0) (i32.const 5))))
  (func (export "serve") (param i32 i32) (result i32 i32)
    (i32.const 64)
    (i32.const {len}))
  (func (export "terminate"))
)"#,
        data = data_literal(&bytes),
        len = bytes.len()
    );
    wat::parse_str(&wat).unwrap()
}

pub fn hello_module() -> Vec<u8> {
    http_module(
        &HttpResponse::new(200, b"hello from vm".to_vec()).with_header("content-type", "text/plain"),
    )
}

/// Module that runs but never publishes a handler.
pub fn silent_module() -> Vec<u8> {
    wat::parse_str(r#"(module (memory (export "memory") 1) (func (export "_start")))"#).unwrap()
}

/// Module whose entry point traps before registering.
pub fn trapping_module() -> Vec<u8> {
    wat::parse_str(r#"(module (memory (export "memory") 1) (func (export "_start") unreachable))"#)
        .unwrap()
}

/// Module that spins for `spins` iterations in `_start` before registering
/// `serve`, so its registration lands well after the launch returned.
pub fn delayed_module(spins: u32) -> Vec<u8> {
    let wat = format!(
        r#"(module
  (import "vmgate" "register_handler" (func $register (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "serve")
  (func (export "alloc") (param i32) (result i32) (i32.const 4096))
  (func (export "_start")
    (local $n i32)
    (local.set $n (i32.const {spins}))
    (block $done
      (loop $spin
        (br_if $done (i32.eqz (local.get $n)))
        (local.set $n (i32.sub (local.get $n) (i32.const 1)))
        (br $spin)))
    (drop (call $register (i32.const 0) (i32.const 5))))
  (func (export "serve") (param i32 i32) (result i32 i32)
    (i32.const 0)
    (i32.const 0))
)"#
    );
    wat::parse_str(&wat).unwrap()
}

/// Serves fixed module bytes in small chunks.
pub struct StubFetcher {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub calls: AtomicUsize,
}

impl StubFetcher {
    pub fn wasm(body: Vec<u8>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/wasm",
            body,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModuleFetcher for StubFetcher {
    async fn fetch(&self, _module_path: &str) -> Result<FetchedResponse, LaunchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(self.content_type));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        let chunks: Vec<Result<Bytes, std::io::Error>> = self
            .body
            .chunks(64)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(FetchedResponse::new(
            self.status,
            headers,
            Box::pin(stream::iter(chunks)),
        ))
    }
}

/// Fails like a refused connection.
pub struct FailingFetcher(pub &'static str);

#[async_trait]
impl ModuleFetcher for FailingFetcher {
    async fn fetch(&self, _module_path: &str) -> Result<FetchedResponse, LaunchError> {
        Err(LaunchError::Fetch(self.0.to_string()))
    }
}

/// Serves a different module per path.
pub struct ModuleSet(pub Vec<(&'static str, StubFetcher)>);

#[async_trait]
impl ModuleFetcher for ModuleSet {
    async fn fetch(&self, module_path: &str) -> Result<FetchedResponse, LaunchError> {
        match self.0.iter().find(|(path, _)| *path == module_path) {
            Some((_, fetcher)) => fetcher.fetch(module_path).await,
            None => Err(LaunchError::Fetch(format!("no module at {module_path}"))),
        }
    }
}

pub fn launcher_with(fetcher: Arc<dyn ModuleFetcher>) -> (Arc<Scope>, Arc<Launcher>) {
    let scope = Arc::new(Scope::new(SCOPE));
    let runtime = Arc::new(VmRuntime::new().unwrap());
    let launcher = Launcher::with_runtime(scope.clone(), fetcher, runtime, VmConfig::default());
    (scope, Arc::new(launcher))
}

pub async fn next_status(outbox: &mut mpsc::UnboundedReceiver<String>) -> VmStatus {
    loop {
        let raw = tokio::time::timeout(Duration::from_secs(5), outbox.recv())
            .await
            .expect("timed out waiting for status")
            .expect("client channel closed");
        // Control connections also receive a hello line.
        if let Ok(message) = serde_json::from_str::<StatusMessage>(&raw) {
            if message.kind == "status" {
                return message.vm_status().expect("known status");
            }
        }
    }
}

/// Drain whatever statuses were already posted.
pub fn posted_statuses(outbox: &mut mpsc::UnboundedReceiver<String>) -> Vec<VmStatus> {
    std::iter::from_fn(|| outbox.try_recv().ok())
        .filter_map(|raw| serde_json::from_str::<StatusMessage>(&raw).ok())
        .filter_map(|m| m.vm_status())
        .collect()
}

pub async fn wait_for_route(scope: &Scope) {
    for _ in 0..200 {
        if scope.routes().is_set() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("route was never registered");
}

/// Let background tasks run for a moment.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Whether the OS thread of vm `id` is still alive; `None` where thread names
/// cannot be read from procfs.
pub fn vm_thread_alive(id: u64) -> Option<bool> {
    let name = format!("vmgate-vm-{id}");
    let tasks = std::fs::read_dir("/proc/self/task").ok()?;
    Some(tasks.filter_map(Result::ok).any(|task| {
        std::fs::read_to_string(task.path().join("comm"))
            .is_ok_and(|comm| comm.trim_end() == name)
    }))
}

/// Wait up to ten seconds for the thread of vm `id` to exit.
pub async fn wait_for_vm_exit(id: u64) -> bool {
    for _ in 0..1000 {
        if vm_thread_alive(id) != Some(true) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
