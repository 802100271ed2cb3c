pub mod clients;
pub mod config;
pub mod control;
pub mod error;
pub mod fetch;
pub mod gateway;
pub mod http;
pub mod interceptor;
pub mod launcher;
pub mod progress;
pub mod routes;
pub mod scope;
pub mod status;
pub mod vm;

pub use clients::{Client, ClientId, Clients};
pub use config::{GatewayConfig, LaunchConfig, VmConfig};
pub use control::{ControlHandler, ControlMessage, ControlServer};
pub use error::{HostError, LaunchError};
pub use gateway::Gateway;
pub use interceptor::{Intercept, Interceptor};
pub use launcher::Launcher;
pub use routes::{RequestHandler, RouteEntry, RouteRegistry};
pub use scope::Scope;
pub use status::{StatusMessage, VmStatus};
