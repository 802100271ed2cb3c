//! The single active route: which path prefix goes to which handler.

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;

/// Produces a response for an intercepted request.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

#[derive(Clone)]
pub struct RouteEntry {
    pub path_prefix: String,
    pub handler: Arc<dyn RequestHandler>,
}

impl RouteEntry {
    pub fn new(path_prefix: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            handler,
        }
    }

    /// Literal string prefix match; `/metrics` also matches `/metricsX`.
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.path_prefix)
    }
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("path_prefix", &self.path_prefix)
            .finish_non_exhaustive()
    }
}

/// Single-slot route store. Every `set` replaces the previous entry.
#[derive(Default)]
pub struct RouteRegistry {
    slot: RwLock<Option<RouteEntry>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, entry: RouteEntry) {
        tracing::info!(prefix = %entry.path_prefix, "intercept route set");
        let previous = self
            .slot
            .write()
            .expect("route registry poisoned")
            .replace(entry);
        if let Some(previous) = previous {
            tracing::debug!(prefix = %previous.path_prefix, "superseded previous route");
        }
    }

    /// Current route, or `None` before the first registration.
    pub fn get(&self) -> Option<RouteEntry> {
        self.slot.read().expect("route registry poisoned").clone()
    }

    pub fn clear(&self) -> Option<RouteEntry> {
        self.slot.write().expect("route registry poisoned").take()
    }

    pub fn is_set(&self) -> bool {
        self.slot.read().expect("route registry poisoned").is_some()
    }
}

/// Effective route prefix for a scope path and a launch base path.
///
/// Separators at the join point are trimmed rather than path-joined:
/// `("/sw/", "/metrics")` gives `/sw/metrics`. An empty base keeps the scope
/// path as is.
pub fn route_prefix(scope_path: &str, base_path: &str) -> String {
    if base_path.is_empty() {
        return scope_path.to_string();
    }
    format!(
        "{}/{}",
        scope_path.trim_end_matches('/'),
        base_path.trim_start_matches('/')
    )
}
