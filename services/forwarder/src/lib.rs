pub mod config;
pub mod discovery;
pub mod error;
pub mod listener;
pub mod pipe;
pub mod reconciler;
pub mod rules;
pub mod telemetry;
pub mod watch;

pub use discovery::{RegistryClient, Resolver, StaticResolver};
pub use error::{DiscoveryError, RulesError};
pub use listener::{bind_listener, ManagedListener, BIND_RETRIES, ENDPOINT_REFRESH_INTERVAL};
pub use pipe::{Pipe, PipeId, PipeState};
pub use reconciler::Reconciler;
pub use rules::{Definition, EndpointSet, Mode};
pub use telemetry::TelemetrySink;
