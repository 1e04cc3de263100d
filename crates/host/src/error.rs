//! Host error types and their wire mapping.
//!
//! Everything that can reach a client goes through [`HostError::to_rpc_error`]
//! (or [`SessionError::to_rpc_error`]), so each failure has exactly one code.

use serde_json::json;
use thiserror::Error;

use sqlbridge_engine::edit::EditError;
use sqlbridge_engine::DriverError;
use sqlbridge_protocol::jsonrpc::{
    CONNECTION_NOT_FOUND, DRIVER_ERROR, EDIT_REJECTED, INTERNAL_ERROR, INVALID_PARAMS,
    OPERATION_IN_PROGRESS, REQUEST_CANCELLED, SESSION_ALREADY_EXISTS, SESSION_NOT_FOUND,
    SESSION_NOT_READY,
};
use sqlbridge_protocol::RpcError;

use crate::dispatcher::DispatchError;
use crate::provider::ProviderError;
use crate::transport::FramingError;

/// Session-map failures. None of them mutate the map.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("session '{0}' already exists")]
    AlreadyExists(String),

    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("a '{kind}' operation is already running for session '{key}'")]
    OperationInProgress { key: String, kind: String },

    #[error("session '{0}' is not ready")]
    NotReady(String),

    #[error("edit rejected: {0}")]
    EditRejected(EditError),
}

impl SessionError {
    pub fn code(&self) -> i64 {
        match self {
            SessionError::AlreadyExists(_) => SESSION_ALREADY_EXISTS,
            SessionError::NotFound(_) => SESSION_NOT_FOUND,
            SessionError::OperationInProgress { .. } => OPERATION_IN_PROGRESS,
            SessionError::NotReady(_) => SESSION_NOT_READY,
            SessionError::EditRejected(_) => EDIT_REJECTED,
        }
    }

    pub fn to_rpc_error(&self) -> RpcError {
        let err = RpcError::new(self.code(), self.to_string());
        match self {
            SessionError::AlreadyExists(key) | SessionError::NotFound(key) | SessionError::NotReady(key) => {
                err.with_data(json!({ "sessionId": key }))
            }
            SessionError::OperationInProgress { key, kind } => {
                err.with_data(json!({ "sessionId": key, "operation": kind }))
            }
            SessionError::EditRejected(_) => err,
        }
    }
}

impl From<SessionError> for RpcError {
    fn from(err: SessionError) -> Self {
        err.to_rpc_error()
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{0}")]
    Driver(DriverError),

    #[error("{0}")]
    Edit(EditError),

    #[error("no connection for '{0}'")]
    ConnectionNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl From<DriverError> for HostError {
    fn from(err: DriverError) -> Self {
        HostError::Driver(err)
    }
}

/// Pending-edit conflicts are session errors; everything else the edit
/// engine rejects is a bad argument.
impl From<EditError> for HostError {
    fn from(err: EditError) -> Self {
        match err {
            EditError::RowDeleted(_) | EditError::PendingEdit(_) => {
                HostError::Session(SessionError::EditRejected(err))
            }
            other => HostError::Edit(other),
        }
    }
}

impl HostError {
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            HostError::Session(err) => err.to_rpc_error(),
            HostError::Driver(DriverError::Cancelled) => RpcError::new(REQUEST_CANCELLED, self.to_string()),
            HostError::Driver(err) => RpcError::new(DRIVER_ERROR, err.to_string()),
            HostError::Edit(err) => RpcError::new(INVALID_PARAMS, err.to_string()),
            HostError::ConnectionNotFound(owner) => {
                RpcError::new(CONNECTION_NOT_FOUND, self.to_string()).with_data(json!({ "ownerUri": owner }))
            }
            HostError::InvalidParams(detail) => RpcError::invalid_params(detail),
            HostError::Dispatch(DispatchError::Remote(err)) => err.clone(),
            _ => RpcError::new(INTERNAL_ERROR, self.to_string()),
        }
    }
}

impl From<HostError> for RpcError {
    fn from(err: HostError) -> Self {
        err.to_rpc_error()
    }
}
