//! Per-request routing decision.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::Request;
use axum::response::Response;

use crate::scope::Scope;

pub type ResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Outcome of intercepting one request.
pub enum Intercept {
    /// The active route's handler produces the response.
    Respond(ResponseFuture),
    /// Not ours; the request continues to its normal destination untouched.
    PassThrough(Request),
}

impl Intercept {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, Intercept::PassThrough(_))
    }
}

pub struct Interceptor {
    scope: Arc<Scope>,
}

impl Interceptor {
    pub fn new(scope: Arc<Scope>) -> Self {
        Self { scope }
    }

    /// Decide synchronously whether `request` goes to the VM handler.
    ///
    /// With no route registered yet every request passes through.
    pub fn intercept(&self, request: Request) -> Intercept {
        let Some(route) = self.scope.routes().get() else {
            tracing::trace!(path = %request.uri().path(), "no route set; passing through");
            return Intercept::PassThrough(request);
        };
        if !route.matches(request.uri().path()) {
            return Intercept::PassThrough(request);
        }

        tracing::debug!(
            path = %request.uri().path(),
            prefix = %route.path_prefix,
            "routing request to vm handler"
        );
        let handler = route.handler;
        Intercept::Respond(Box::pin(async move { handler.handle(request).await }))
    }
}
