use crate::clients::Clients;
use crate::routes::RouteRegistry;

/// State owned by one background execution context: its scope path, the
/// clients it can control, and the active route.
///
/// One `Scope` is built per context and shared by reference with the launcher,
/// the interceptor and the control handler.
pub struct Scope {
    path: String,
    clients: Clients,
    routes: RouteRegistry,
}

impl Scope {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            clients: Clients::new(),
            routes: RouteRegistry::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    pub fn routes(&self) -> &RouteRegistry {
        &self.routes
    }
}
