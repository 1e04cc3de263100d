//! Feature services. Each owns its sessions and registers its own methods.

pub mod chat;
pub mod connection;
pub mod edit_data;
pub mod object_explorer;
pub mod query;
pub mod schema_designer;

use std::sync::{Arc, OnceLock};

use sqlbridge_config::Settings;

use crate::error::HostError;
use crate::provider::{ProviderError, ServiceProvider};

use self::connection::{ConnectionService, ConnectorRegistry};

/// A dependency resolved at registration time.
pub(crate) fn resolve<T>(cell: &OnceLock<Arc<T>>) -> Result<&Arc<T>, HostError> {
    cell.get()
        .ok_or_else(|| HostError::Internal("service dependency was not resolved".into()))
}

/// Register every feature service. Connection goes first; the others look
/// it up while registering.
pub fn register_all(
    provider: &mut ServiceProvider,
    settings: &Settings,
    connectors: ConnectorRegistry,
) -> Result<(), ProviderError> {
    provider.register(Arc::new(ConnectionService::new(
        connectors,
        settings.server.default_provider.clone(),
    )))?;
    provider.register(Arc::new(object_explorer::ObjectExplorerService::new()))?;
    provider.register(Arc::new(schema_designer::SchemaDesignerService::new()))?;
    provider.register(Arc::new(query::QueryService::new(settings.query.max_rows)))?;
    provider.register(Arc::new(edit_data::EditDataService::new(settings.edit.row_limit)))?;
    provider.register(Arc::new(chat::ChatService::from_settings(&settings.chat)))?;
    Ok(())
}
