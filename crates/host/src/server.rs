//! Host loop and listeners.
//!
//! A [`Host`] serves exactly one client: it owns that client's service
//! provider and dispatcher and reads frames until EOF or `exit`. Stdio mode
//! runs one host over stdin/stdout; [`TcpHost`] accepts loopback clients one
//! at a time and builds a fresh host for each.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use sqlbridge_config::Settings;
use sqlbridge_protocol::methods;

use crate::dispatcher::{Dispatcher, Outbound};
use crate::error::HostError;
use crate::provider::{ProviderError, Service, ServiceProvider, ShutdownHandle};
use crate::services::{self, connection::ConnectorRegistry};
use crate::transport::{FrameReader, FrameWriter};

pub const LIFECYCLE_SERVICE: &str = "lifecycle";

/// Poll interval of the non-blocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// `shutdown` and `exit`.
pub struct LifecycleService {
    handle: OnceLock<ShutdownHandle>,
    exit: Arc<AtomicBool>,
}

impl LifecycleService {
    pub fn new(exit: Arc<AtomicBool>) -> Self {
        Self {
            handle: OnceLock::new(),
            exit,
        }
    }
}

impl Service for LifecycleService {
    fn name(&self) -> &'static str {
        LIFECYCLE_SERVICE
    }

    fn register(self: Arc<Self>, provider: &mut ServiceProvider) -> Result<(), ProviderError> {
        let _ = self.handle.set(provider.shutdown_handle());

        let service = self.clone();
        provider.routes()?.on_request(methods::SHUTDOWN, move |ctx, _: Value| {
            log::info!("Shutdown requested");
            if let Some(handle) = service.handle.get() {
                handle.shutdown();
            }
            ctx.send_result(Value::Null);
        })?;

        let exit = self.exit.clone();
        provider.routes()?.on_notification(methods::EXIT, move |_, _: Value| {
            exit.store(true, Ordering::SeqCst);
        })?;
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

pub struct Host {
    provider: ServiceProvider,
    dispatcher: Dispatcher,
    exit: Arc<AtomicBool>,
    max_message_bytes: usize,
}

impl Host {
    /// Build a host whose messages go to `writer`.
    pub fn new(
        settings: &Settings,
        connectors: ConnectorRegistry,
        writer: impl Write + Send + 'static,
    ) -> Result<Self, HostError> {
        let outbound = Outbound::with_timeout(
            FrameWriter::new(writer),
            Duration::from_secs(settings.server.client_request_timeout_secs),
        );
        let mut provider = ServiceProvider::new(outbound);
        let exit = Arc::new(AtomicBool::new(false));
        provider.register(Arc::new(LifecycleService::new(exit.clone())))?;
        services::register_all(&mut provider, settings, connectors)?;
        let dispatcher = provider.take_dispatcher()?;
        log::debug!("Services: {}", provider.service_names().join(", "));

        Ok(Self {
            provider,
            dispatcher,
            exit,
            max_message_bytes: settings.server.max_message_bytes,
        })
    }

    /// Read and dispatch frames until EOF, `exit`, or a framing error.
    /// Provider shutdown runs exactly once on the way out.
    pub fn run(self, reader: impl BufRead) -> Result<(), HostError> {
        let mut frames = FrameReader::with_max_size(reader, self.max_message_bytes);
        let result = loop {
            match frames.read_message() {
                Ok(Some(body)) => {
                    self.dispatcher.dispatch_bytes(&body);
                    if self.exit.load(Ordering::SeqCst) {
                        log::info!("Exit received");
                        break Ok(());
                    }
                }
                Ok(None) => {
                    log::info!("Client closed the stream");
                    break Ok(());
                }
                Err(e) => {
                    log::error!("Framing error: {}", e);
                    break Err(HostError::from(e));
                }
            }
        };
        self.provider.shutdown();
        result
    }
}

/// Serve one client over stdin/stdout.
pub fn serve_stdio(settings: &Settings, connectors: ConnectorRegistry) -> Result<(), HostError> {
    log::info!("Serving on stdio");
    let host = Host::new(settings, connectors, io::stdout())?;
    host.run(io::stdin().lock())
}

fn serve_stream(stream: TcpStream, settings: &Settings, connectors: ConnectorRegistry) -> Result<(), HostError> {
    stream.set_nonblocking(false)?;
    let writer = stream.try_clone()?;
    let host = Host::new(settings, connectors, writer)?;
    host.run(BufReader::new(stream))
}

/// Loopback TCP listener. One client at a time, each with its own host.
pub struct TcpHost {
    bound_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    current: Arc<Mutex<Option<TcpStream>>>,
    listener_handle: Option<JoinHandle<()>>,
}

impl TcpHost {
    pub fn start(addr: &str, settings: Settings, connectors: ConnectorRegistry) -> Result<Self, HostError> {
        let bind_err = |source| HostError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).map_err(bind_err)?;
        let bound_addr = listener.local_addr().map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let current = Arc::new(Mutex::new(None));
        let listener_shutdown = shutdown.clone();
        let listener_current = current.clone();
        let listener_handle = thread::Builder::new()
            .name("listener".to_string())
            .spawn(move || run_listener(listener, listener_shutdown, listener_current, settings, connectors))?;

        log::info!("Listening on {}", bound_addr);
        Ok(Self {
            bound_addr,
            shutdown,
            current,
            listener_handle: Some(listener_handle),
        })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn is_running(&self) -> bool {
        self.listener_handle.is_some() && !self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop accepting, close the current client and wait for the listener.
    pub fn stop(&mut self) {
        let Some(handle) = self.listener_handle.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(stream) = self.current.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let _ = handle.join();
        log::info!("Listener on {} stopped", self.bound_addr);
    }

    /// Block until the listener ends on its own (accept failure).
    pub fn join(mut self) {
        if let Some(handle) = self.listener_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TcpHost {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_listener(
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    current: Arc<Mutex<Option<TcpStream>>>,
    settings: Settings,
    connectors: ConnectorRegistry,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                log::info!("Accepted connection from {}", addr);
                match stream.try_clone() {
                    Ok(handle) => *current.lock() = Some(handle),
                    Err(e) => log::warn!("Cannot track connection from {}: {}", addr, e),
                }
                if let Err(e) = serve_stream(stream, &settings, connectors.clone()) {
                    log::warn!("Connection error from {}: {}", addr, e);
                }
                current.lock().take();
                log::info!("Connection from {} closed", addr);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log::error!("Accept error: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SharedBuf;
    use serde_json::json;
    use sqlbridge_protocol::jsonrpc::METHOD_NOT_FOUND;
    use std::io::Cursor;

    fn frame(message: &Value) -> Vec<u8> {
        let body = serde_json::to_vec(message).unwrap();
        let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        out.extend(body);
        out
    }

    fn input(messages: &[Value]) -> Cursor<Vec<u8>> {
        Cursor::new(messages.iter().flat_map(frame).collect())
    }

    #[test]
    fn test_shutdown_then_exit_ends_loop() {
        let out = SharedBuf::new();
        let host = Host::new(&Settings::default(), ConnectorRegistry::with_defaults(), out.clone()).unwrap();
        let reader = input(&[
            json!({ "jsonrpc": "2.0", "id": 1, "method": "nope/missing" }),
            json!({ "jsonrpc": "2.0", "id": 2, "method": "shutdown" }),
            json!({ "jsonrpc": "2.0", "method": "exit" }),
            json!({ "jsonrpc": "2.0", "id": 3, "method": "shutdown" }),
        ]);

        host.run(reader).unwrap();

        let frames = out.frames();
        assert_eq!(frames.len(), 2, "{:?}", frames);
        assert_eq!(frames[0]["id"], 1);
        assert_eq!(frames[0]["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(frames[1]["id"], 2);
        assert_eq!(frames[1]["result"], Value::Null);
    }

    #[test]
    fn test_eof_ends_loop_cleanly() {
        let out = SharedBuf::new();
        let host = Host::new(&Settings::default(), ConnectorRegistry::with_defaults(), out.clone()).unwrap();
        host.run(Cursor::new(Vec::new())).unwrap();
        assert!(out.frames().is_empty());
    }

    #[test]
    fn test_framing_error_is_fatal() {
        let out = SharedBuf::new();
        let host = Host::new(&Settings::default(), ConnectorRegistry::with_defaults(), out.clone()).unwrap();
        let mut bytes = frame(&json!({ "jsonrpc": "2.0", "id": 1, "method": "shutdown" }));
        bytes.extend_from_slice(b"Content-Length: 50\r\n\r\n{\"jsonrpc\"");

        let err = host.run(Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, HostError::Framing(_)), "{:?}", err);
        assert_eq!(out.frames().len(), 1);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut settings = Settings::default();
        settings.server.max_message_bytes = 16;
        let host = Host::new(&settings, ConnectorRegistry::with_defaults(), SharedBuf::new()).unwrap();
        let err = host
            .run(input(&[json!({ "jsonrpc": "2.0", "id": 1, "method": "shutdown" })]))
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{}", err);
    }

    #[test]
    fn test_bind_failure_names_address() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let err = TcpHost::start(&addr, Settings::default(), ConnectorRegistry::with_defaults())
            .err()
            .unwrap();
        assert!(matches!(err, HostError::Bind { .. }));
        assert!(err.to_string().contains(&addr));
    }
}
