//! sqlbridge host
//!
//! Serves database tooling to an editor over JSON-RPC. Layers, bottom up:
//!
//! - [`transport`]: `Content-Length` framing over any byte stream
//! - [`dispatcher`]: method table, request contexts, server → client requests
//! - [`provider`]: service registration and ordered shutdown
//! - [`session`]: the per-feature session map and its task bookkeeping
//! - [`services`]: connection, object explorer, schema designer, query,
//!   edit data and chat
//! - [`server`]: the per-client loop, stdio and loopback TCP listeners
//!
//! Handlers never block on the database. Anything slow runs on a task
//! thread and reports back through notifications.

pub mod dispatcher;
pub mod error;
pub mod provider;
pub mod server;
pub mod services;
pub mod session;
pub mod task;
pub mod transport;

#[cfg(test)]
mod testing;

pub use dispatcher::{DispatchError, Dispatcher, DispatcherBuilder, Outbound, RequestContext};
pub use error::{HostError, SessionError};
pub use provider::{ProviderError, Service, ServiceProvider, ShutdownHandle};
pub use server::{serve_stdio, Host, TcpHost};
pub use services::connection::ConnectorRegistry;
pub use transport::{FrameReader, FrameWriter, FramingError};
