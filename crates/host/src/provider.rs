//! Service composition.
//!
//! One [`ServiceProvider`] is built per client connection. Services are
//! registered in dependency order; each registers its method handlers and
//! may look up services registered before it. Once every service is in,
//! [`ServiceProvider::take_dispatcher`] freezes the method table.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::dispatcher::{DispatchError, Dispatcher, DispatcherBuilder, Outbound};
use crate::error::HostError;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("service '{0}' is already registered")]
    DuplicateService(String),

    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    #[error("services are frozen; '{0}' registered too late")]
    Frozen(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Register method handlers and resolve dependencies.
    fn register(self: Arc<Self>, provider: &mut ServiceProvider) -> Result<(), ProviderError>;

    /// Release sessions and connections. Called once, in reverse
    /// registration order.
    fn shutdown(&self) -> Result<(), HostError> {
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct Registry {
    services: RwLock<Vec<Arc<dyn Service>>>,
    shut_down: AtomicBool,
    outbound: Outbound,
}

impl Registry {
    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let services: Vec<Arc<dyn Service>> = self.services.read().clone();
        for service in services.iter().rev() {
            log::debug!("Shutting down service '{}'", service.name());
            if let Err(e) = service.shutdown() {
                log::warn!("Service '{}' failed to shut down: {}", service.name(), e);
            }
        }
        self.outbound.fail_pending();
    }
}

/// Runs provider shutdown from a method handler (the `shutdown` request).
#[derive(Clone)]
pub struct ShutdownHandle {
    registry: Arc<Registry>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.registry.shut_down.load(Ordering::SeqCst)
    }
}

pub struct ServiceProvider {
    registry: Arc<Registry>,
    routes: Option<DispatcherBuilder>,
}

impl ServiceProvider {
    pub fn new(outbound: Outbound) -> Self {
        Self {
            registry: Arc::new(Registry {
                services: RwLock::new(Vec::new()),
                shut_down: AtomicBool::new(false),
                outbound,
            }),
            routes: Some(DispatcherBuilder::new()),
        }
    }

    pub fn outbound(&self) -> &Outbound {
        &self.registry.outbound
    }

    /// Method table under construction. Fails once frozen.
    pub fn routes(&mut self) -> Result<&mut DispatcherBuilder, ProviderError> {
        self.routes
            .as_mut()
            .ok_or_else(|| ProviderError::Frozen("routes".to_string()))
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            registry: self.registry.clone(),
        }
    }

    pub fn register<S: Service>(&mut self, service: Arc<S>) -> Result<(), ProviderError> {
        let name = service.name();
        if self.routes.is_none() {
            return Err(ProviderError::Frozen(name.to_string()));
        }
        if self.registry.services.read().iter().any(|s| s.name() == name) {
            return Err(ProviderError::DuplicateService(name.to_string()));
        }
        self.registry.services.write().push(service.clone());
        service.register(self)?;
        log::debug!("Registered service '{}'", name);
        Ok(())
    }

    /// Typed lookup. A service registered under `name` with another type is
    /// reported as not found.
    pub fn get<T: Service>(&self, name: &str) -> Result<Arc<T>, ProviderError> {
        let service = self
            .registry
            .services
            .read()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| ProviderError::ServiceNotFound(name.to_string()))?;
        service
            .as_any()
            .downcast::<T>()
            .map_err(|_| ProviderError::ServiceNotFound(name.to_string()))
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        self.registry.services.read().iter().map(|s| s.name()).collect()
    }

    /// Freeze the method table. Later registrations fail.
    pub fn take_dispatcher(&mut self) -> Result<Dispatcher, ProviderError> {
        let routes = self
            .routes
            .take()
            .ok_or_else(|| ProviderError::Frozen("dispatcher".to_string()))?;
        Ok(routes.build(self.registry.outbound.clone()))
    }

    /// Run every shutdown hook in reverse registration order. Idempotent.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SharedBuf;
    use crate::transport::FrameWriter;
    use parking_lot::Mutex;
    use serde_json::Value;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl Service for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn register(self: Arc<Self>, provider: &mut ServiceProvider) -> Result<(), ProviderError> {
            let name = self.name;
            provider
                .routes()?
                .on_request(&format!("{}/ping", name), move |ctx, _: Value| ctx.send_result(name))?;
            Ok(())
        }

        fn shutdown(&self) -> Result<(), HostError> {
            self.log.lock().push(self.name.to_string());
            if self.fail {
                return Err(HostError::Internal("stuck".into()));
            }
            Ok(())
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct Other;

    impl Service for Other {
        fn name(&self) -> &'static str {
            "other"
        }

        fn register(self: Arc<Self>, _provider: &mut ServiceProvider) -> Result<(), ProviderError> {
            Ok(())
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn provider() -> ServiceProvider {
        ServiceProvider::new(Outbound::new(FrameWriter::new(SharedBuf::new())))
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> Arc<Recorder> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            fail,
        })
    }

    #[test]
    fn test_shutdown_reverse_order_continues_past_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut provider = provider();
        provider.register(recorder("a", &log, false)).unwrap();
        provider.register(recorder("b", &log, true)).unwrap();
        provider.register(recorder("c", &log, false)).unwrap();

        provider.shutdown();
        assert_eq!(*log.lock(), vec!["c", "b", "a"]);

        provider.shutdown();
        assert_eq!(log.lock().len(), 3);
    }

    #[test]
    fn test_get_typed_service() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut provider = provider();
        provider.register(recorder("a", &log, false)).unwrap();
        provider.register(Arc::new(Other)).unwrap();

        assert_eq!(provider.get::<Recorder>("a").unwrap().name, "a");
        assert!(matches!(
            provider.get::<Recorder>("other"),
            Err(ProviderError::ServiceNotFound(_))
        ));
        assert!(matches!(
            provider.get::<Other>("missing"),
            Err(ProviderError::ServiceNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_and_frozen() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut provider = provider();
        provider.register(recorder("a", &log, false)).unwrap();
        assert!(matches!(
            provider.register(recorder("a", &log, false)),
            Err(ProviderError::DuplicateService(_))
        ));

        let dispatcher = provider.take_dispatcher().unwrap();
        assert!(dispatcher.handles("a/ping"));
        assert!(matches!(
            provider.register(recorder("late", &log, false)),
            Err(ProviderError::Frozen(_))
        ));
        assert_eq!(provider.service_names(), vec!["a"]);
    }
}
