//! Method dispatch.
//!
//! Handlers are registered by method name on a [`DispatcherBuilder`] at
//! startup; [`DispatcherBuilder::build`] freezes the table. Each handler
//! declares its params type and gets them decoded before it runs.
//!
//! Request handlers receive a [`RequestContext`]. It is consumed by
//! `send_result`/`send_error` and answers with an internal error if it is
//! dropped unanswered, so every request gets exactly one response whether
//! the handler answers inline, hands the context to a background task, or
//! panics.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use sqlbridge_protocol::{Message, Notification, Request, RequestId, Response, RpcError};

use crate::task::panic_message;
use crate::transport::FrameWriter;

/// Default wait for the client to answer a server → client request.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("a handler for '{0}' is already registered")]
    DuplicateMethod(String),

    #[error("client did not answer '{method}' within {secs}s")]
    Timeout { method: String, secs: u64 },

    #[error("connection closed before '{0}' was answered")]
    Disconnected(String),

    #[error("client answered with an error: {0}")]
    Remote(RpcError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write message: {0}")]
    Write(#[from] std::io::Error),
}

// =============================================================================
// Outbound
// =============================================================================

struct OutboundInner {
    writer: FrameWriter,
    pending: Mutex<HashMap<RequestId, SyncSender<Response>>>,
    next_id: AtomicI64,
    client_timeout: Duration,
}

/// Everything the host sends to the client goes through here. Cheap to
/// clone; background tasks keep their own copy.
#[derive(Clone)]
pub struct Outbound {
    inner: Arc<OutboundInner>,
}

impl Outbound {
    pub fn new(writer: FrameWriter) -> Self {
        Self::with_timeout(writer, DEFAULT_CLIENT_TIMEOUT)
    }

    pub fn with_timeout(writer: FrameWriter, client_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(OutboundInner {
                writer,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                client_timeout,
            }),
        }
    }

    fn send(&self, message: &Message) -> Result<(), DispatchError> {
        let body = message.to_vec()?;
        self.inner.writer.write_message(&body)?;
        Ok(())
    }

    pub fn send_response(&self, response: Response) -> Result<(), DispatchError> {
        self.send(&Message::Response(response))
    }

    pub fn send_notification<P: Serialize>(&self, method: &str, params: &P) -> Result<(), DispatchError> {
        let params = serde_json::to_value(params)?;
        self.send(&Message::Notification(Notification::new(method, Some(params))))
    }

    /// Notification whose delivery failure only gets logged.
    pub fn notify<P: Serialize>(&self, method: &str, params: &P) {
        if let Err(e) = self.send_notification(method, params) {
            log::warn!("Failed to send '{}' notification: {}", method, e);
        }
    }

    /// Send a request to the client and block until it answers or the
    /// configured timeout passes. Never call this on the intake thread: the
    /// answer arrives through it.
    pub fn send_request<P, R>(&self, method: &str, params: &P) -> Result<R, DispatchError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let params = serde_json::to_value(params)?;
        let (tx, rx) = mpsc::sync_channel(1);
        self.inner.pending.lock().insert(id.clone(), tx);

        if let Err(e) = self.send(&Message::Request(Request::new(id.clone(), method, Some(params)))) {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        let response = match rx.recv_timeout(self.inner.client_timeout) {
            Ok(response) => response,
            Err(RecvTimeoutError::Timeout) => {
                self.inner.pending.lock().remove(&id);
                return Err(DispatchError::Timeout {
                    method: method.to_string(),
                    secs: self.inner.client_timeout.as_secs(),
                });
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(DispatchError::Disconnected(method.to_string()))
            }
        };

        let value = response.into_result().map_err(DispatchError::Remote)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Route a client response to the waiting request. Returns `false` if
    /// nothing was waiting for that id.
    fn complete(&self, response: Response) -> bool {
        let waiter = match &response.id {
            Some(id) => self.inner.pending.lock().remove(id),
            None => None,
        };
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Wake every waiting server → client request with a disconnect.
    pub fn fail_pending(&self) {
        let drained: Vec<_> = self.inner.pending.lock().drain().collect();
        if !drained.is_empty() {
            log::debug!("Abandoning {} pending client request(s)", drained.len());
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

// =============================================================================
// RequestContext
// =============================================================================

/// Handle for answering one request.
pub struct RequestContext {
    id: RequestId,
    method: String,
    outbound: Outbound,
    answered: bool,
}

impl RequestContext {
    pub fn new(id: RequestId, method: impl Into<String>, outbound: Outbound) -> Self {
        Self {
            id,
            method: method.into(),
            outbound,
            answered: false,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn send_notification<P: Serialize>(&self, method: &str, params: &P) {
        self.outbound.notify(method, params);
    }

    pub fn send_result<T: Serialize>(mut self, result: T) {
        let response = match serde_json::to_value(result) {
            Ok(value) => Response::success(self.id.clone(), value),
            Err(e) => Response::failure(Some(self.id.clone()), RpcError::internal(e)),
        };
        self.finish(response);
    }

    pub fn send_error(mut self, error: impl Into<RpcError>) {
        let response = Response::failure(Some(self.id.clone()), error.into());
        self.finish(response);
    }

    pub fn respond<T: Serialize, E: Into<RpcError>>(self, result: Result<T, E>) {
        match result {
            Ok(value) => self.send_result(value),
            Err(e) => self.send_error(e),
        }
    }

    fn finish(&mut self, response: Response) {
        self.answered = true;
        if let Err(e) = self.outbound.send_response(response) {
            log::warn!("Failed to answer '{}' (id {}): {}", self.method, self.id, e);
        }
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if !self.answered {
            log::error!("Request '{}' (id {}) finished without a response", self.method, self.id);
            let response = Response::failure(
                Some(self.id.clone()),
                RpcError::internal(format!("'{}' finished without a response", self.method)),
            );
            self.finish(response);
        }
    }
}

// =============================================================================
// Dispatch table
// =============================================================================

type RequestHandler = Box<dyn Fn(RequestContext, Option<Value>) + Send + Sync>;
type NotificationHandler = Box<dyn Fn(&Outbound, Option<Value>) + Send + Sync>;

fn decode_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, serde_json::Error> {
    serde_json::from_value(params.unwrap_or(Value::Null))
}

#[derive(Default)]
pub struct DispatcherBuilder {
    requests: HashMap<String, RequestHandler>,
    notifications: HashMap<String, NotificationHandler>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request<P, F>(&mut self, method: &str, handler: F) -> Result<(), DispatchError>
    where
        P: DeserializeOwned + 'static,
        F: Fn(RequestContext, P) + Send + Sync + 'static,
    {
        if self.requests.contains_key(method) || self.notifications.contains_key(method) {
            return Err(DispatchError::DuplicateMethod(method.to_string()));
        }
        self.requests.insert(
            method.to_string(),
            Box::new(move |ctx, params| match decode_params::<P>(params) {
                Ok(params) => handler(ctx, params),
                Err(e) => ctx.send_error(RpcError::invalid_params(e)),
            }),
        );
        Ok(())
    }

    pub fn on_notification<P, F>(&mut self, method: &str, handler: F) -> Result<(), DispatchError>
    where
        P: DeserializeOwned + 'static,
        F: Fn(&Outbound, P) + Send + Sync + 'static,
    {
        if self.requests.contains_key(method) || self.notifications.contains_key(method) {
            return Err(DispatchError::DuplicateMethod(method.to_string()));
        }
        let name = method.to_string();
        self.notifications.insert(
            method.to_string(),
            Box::new(move |outbound, params| match decode_params::<P>(params) {
                Ok(params) => handler(outbound, params),
                Err(e) => log::warn!("Dropping '{}' notification with bad params: {}", name, e),
            }),
        );
        Ok(())
    }

    pub fn build(self, outbound: Outbound) -> Dispatcher {
        Dispatcher {
            requests: self.requests,
            notifications: self.notifications,
            outbound,
        }
    }
}

/// Frozen dispatch table.
pub struct Dispatcher {
    requests: HashMap<String, RequestHandler>,
    notifications: HashMap<String, NotificationHandler>,
    outbound: Outbound,
}

impl Dispatcher {
    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn handles(&self, method: &str) -> bool {
        self.requests.contains_key(method) || self.notifications.contains_key(method)
    }

    /// Decode one message body and dispatch it. Undecodable bodies are
    /// answered with an error addressed to whatever id could be recovered.
    pub fn dispatch_bytes(&self, body: &[u8]) {
        match Message::from_slice(body) {
            Ok(message) => self.dispatch(message),
            Err(failure) => {
                log::debug!("Rejecting undecodable message: {}", failure.error);
                if let Err(e) = self
                    .outbound
                    .send_response(Response::failure(failure.id, failure.error))
                {
                    log::warn!("Failed to send error response: {}", e);
                }
            }
        }
    }

    pub fn dispatch(&self, message: Message) {
        match message {
            Message::Request(request) => self.dispatch_request(request),
            Message::Notification(notification) => self.dispatch_notification(notification),
            Message::Response(response) => {
                let id = response.id.clone();
                if !self.outbound.complete(response) {
                    log::warn!(
                        "Dropping response for unknown request id {}",
                        id.map(|id| id.to_string()).unwrap_or_else(|| "null".to_string())
                    );
                }
            }
        }
    }

    fn dispatch_request(&self, request: Request) {
        let Request { id, method, params, .. } = request;
        let handler = match self.requests.get(&method) {
            Some(handler) => handler,
            None => {
                log::debug!("Unknown method '{}'", method);
                let response = Response::failure(Some(id), RpcError::method_not_found(&method));
                if let Err(e) = self.outbound.send_response(response) {
                    log::warn!("Failed to send error response: {}", e);
                }
                return;
            }
        };

        let ctx = RequestContext::new(id, method.clone(), self.outbound.clone());
        // The context is dropped while unwinding, which sends the internal error.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, params))) {
            log::error!("Handler for '{}' panicked: {}", method, panic_message(payload.as_ref()));
        }
    }

    fn dispatch_notification(&self, notification: Notification) {
        let Notification { method, params, .. } = notification;
        match self.notifications.get(&method) {
            Some(handler) => {
                if let Err(payload) =
                    panic::catch_unwind(AssertUnwindSafe(|| handler(&self.outbound, params)))
                {
                    log::error!(
                        "Notification handler for '{}' panicked: {}",
                        method,
                        panic_message(payload.as_ref())
                    );
                }
            }
            None => log::debug!("Ignoring notification '{}' (no handler)", method),
        }
    }
}
