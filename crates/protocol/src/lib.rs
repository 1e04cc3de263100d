//! sqlbridge wire protocol
//!
//! Canonical message types for editor ↔ host communication. Messages are
//! JSON-RPC 2.0 envelopes framed with a `Content-Length` header (see the
//! host's transport module). Every structured params/result field is
//! camelCase on the wire.
//!
//! # Usage
//!
//! ```ignore
//! use sqlbridge_protocol::{methods, Message, Request, RequestId};
//! use sqlbridge_protocol::connection::ConnectParams;
//!
//! let req = Request::new(RequestId::Number(1), methods::CONNECTION_CONNECT, Some(params_json));
//! let bytes = Message::Request(req).to_vec()?;
//!
//! let incoming = Message::from_slice(&body).map_err(|f| f.error)?;
//! ```

pub mod chat;
pub mod connection;
pub mod edit_data;
pub mod jsonrpc;
pub mod methods;
pub mod object_explorer;
pub mod query;
pub mod schema_designer;

pub use jsonrpc::{
    DecodeFailure, EmptyResult, Message, Notification, Request, RequestId, Response, RpcError,
    JSONRPC_VERSION,
};
