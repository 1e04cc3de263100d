//! Connection service (`connection/*`).
//!
//! Connections are owned here and keyed by owner URI and purpose. Other
//! services hold only the owner key and call
//! [`ConnectionService::get_connection`] from their background tasks on
//! every use.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde_json::Value;

use sqlbridge_engine::sqlite::SqliteConnector;
use sqlbridge_engine::{ConnectionTarget, Connector, Driver, DriverError};
use sqlbridge_protocol::connection::{
    ConnectParams, ConnectionCompleteParams, ConnectionDetails, ConnectionPurpose, DisconnectParams,
    FetchAzureTokenParams, FetchAzureTokenResult, ListDatabasesParams, ListDatabasesResult, ServerInfo,
    TransferParams,
};
use sqlbridge_protocol::methods;

use crate::dispatcher::{Outbound, RequestContext};
use crate::error::HostError;
use crate::provider::{ProviderError, Service, ServiceProvider};
use crate::session::SessionMap;
use crate::task::spawn_task;

pub const SERVICE_NAME: &str = "connection";

/// Authentication type that needs an access token from the client.
const AZURE_MFA: &str = "AzureMFA";
const AZURE_SQL_RESOURCE: &str = "https://database.windows.net/";

// =============================================================================
// Connector registry
// =============================================================================

/// Connectors by provider name.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in drivers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SqliteConnector));
        registry
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.provider().to_string(), connector);
    }

    pub fn get(&self, provider: &str) -> Result<Arc<dyn Connector>, DriverError> {
        self.connectors
            .get(provider)
            .cloned()
            .ok_or_else(|| DriverError::UnknownProvider(provider.to_string()))
    }

    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.keys().cloned().collect();
        names.sort();
        names
    }
}

// =============================================================================
// Owners
// =============================================================================

/// One open connection.
#[derive(Clone)]
pub struct LiveConnection {
    pub id: String,
    pub provider: String,
    pub driver: Arc<dyn Driver>,
    pub opened_at: DateTime<Utc>,
}

impl LiveConnection {
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            provider: self.provider.clone(),
            server_version: self.driver.server_version(),
            dialect: self.driver.dialect().as_str().to_string(),
        }
    }
}

/// Everything known about one owner URI.
pub struct ConnectionOwner {
    pub details: ConnectionDetails,
    pub connections: HashMap<ConnectionPurpose, LiveConnection>,
}

impl ConnectionOwner {
    fn new(details: ConnectionDetails) -> Self {
        Self {
            details,
            connections: HashMap::new(),
        }
    }
}

fn connect_task(purpose: ConnectionPurpose) -> String {
    format!("connect:{}", purpose.as_str())
}

fn option_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// =============================================================================
// Service
// =============================================================================

pub struct ConnectionService {
    connectors: ConnectorRegistry,
    default_provider: String,
    owners: SessionMap<ConnectionOwner>,
    outbound: OnceLock<Outbound>,
}

impl ConnectionService {
    pub fn new(connectors: ConnectorRegistry, default_provider: impl Into<String>) -> Self {
        Self {
            connectors,
            default_provider: default_provider.into(),
            owners: SessionMap::new(SERVICE_NAME),
            outbound: OnceLock::new(),
        }
    }

    fn provider_name(&self, details: &ConnectionDetails) -> String {
        details
            .provider
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.default_provider.clone())
    }

    /// Ask the client for an access token. Runs on a background task; the
    /// answer arrives through the intake thread.
    fn fetch_token(&self, details: &ConnectionDetails) -> Result<String, HostError> {
        let outbound = self
            .outbound
            .get()
            .ok_or_else(|| HostError::Internal("connection service is not registered".into()))?;
        let params = FetchAzureTokenParams {
            account_id: details.options.get("accountId").map(option_text),
            server_name: details.server_name.clone(),
            resource: AZURE_SQL_RESOURCE.to_string(),
        };
        let result: FetchAzureTokenResult =
            outbound.send_request(methods::CONNECTION_FETCH_AZURE_TOKEN, &params)?;
        Ok(result.token)
    }

    fn target(&self, details: &ConnectionDetails) -> Result<ConnectionTarget, HostError> {
        let mut access_token = details.azure_account_token.clone();
        if access_token.is_none() && details.authentication_type.as_deref() == Some(AZURE_MFA) {
            access_token = Some(self.fetch_token(details)?);
        }
        Ok(ConnectionTarget {
            server: details.server_name.clone(),
            port: details.port,
            database: details.database_name.clone(),
            user: details.user_name.clone(),
            password: details.password.clone(),
            access_token,
            options: details
                .options
                .iter()
                .map(|(k, v)| (k.clone(), option_text(v)))
                .collect::<BTreeMap<_, _>>(),
        })
    }

    /// Open a new connection. Blocking; background tasks only.
    pub fn open(&self, details: &ConnectionDetails) -> Result<LiveConnection, HostError> {
        let provider = self.provider_name(details);
        let connector = self.connectors.get(&provider)?;
        let target = self.target(details)?;
        let driver = connector.open(&target)?;
        Ok(LiveConnection {
            id: uuid::Uuid::new_v4().to_string(),
            provider,
            driver,
            opened_at: Utc::now(),
        })
    }

    /// Open a connection for `owner`/`purpose` from explicit details and
    /// record it, replacing any connection of that purpose.
    pub fn open_for(
        &self,
        owner: &str,
        details: &ConnectionDetails,
        purpose: ConnectionPurpose,
    ) -> Result<LiveConnection, HostError> {
        let live = self.open(details)?;
        self.owners.ensure(owner, || ConnectionOwner::new(details.clone()));
        self.owners.with_mut(owner, |o| {
            o.details = details.clone();
            o.connections.insert(purpose, live.clone());
        })?;
        Ok(live)
    }

    /// Live connection of `purpose`, opened from the owner's stored details
    /// when there is none yet.
    pub fn get_connection(&self, owner: &str, purpose: ConnectionPurpose) -> Result<Arc<dyn Driver>, HostError> {
        let (existing, details) = self
            .owners
            .with(owner, |o| (o.connections.get(&purpose).cloned(), o.details.clone()))
            .map_err(|_| HostError::ConnectionNotFound(owner.to_string()))?;
        if let Some(live) = existing {
            return Ok(live.driver);
        }

        let live = self.open(&details)?;
        // Another task may have opened one meanwhile; keep the first.
        let kept = self
            .owners
            .with_mut(owner, |o| o.connections.entry(purpose).or_insert(live).driver.clone())
            .map_err(|_| HostError::ConnectionNotFound(owner.to_string()))?;
        Ok(kept)
    }

    /// The connection of `purpose` if one is open. Never opens.
    pub fn existing(&self, owner: &str, purpose: ConnectionPurpose) -> Option<Arc<dyn Driver>> {
        self.owners
            .with(owner, |o| o.connections.get(&purpose).map(|c| c.driver.clone()))
            .ok()
            .flatten()
    }

    pub fn details(&self, owner: &str) -> Result<ConnectionDetails, HostError> {
        self.owners
            .with(owner, |o| o.details.clone())
            .map_err(|_| HostError::ConnectionNotFound(owner.to_string()))
    }

    /// Drop one purpose, or the whole owner when `purpose` is `None`.
    pub fn disconnect(&self, owner: &str, purpose: Option<ConnectionPurpose>) -> bool {
        match purpose {
            None => self.owners.remove(owner).is_ok(),
            Some(purpose) => self
                .owners
                .with_mut(owner, |o| o.connections.remove(&purpose).is_some())
                .unwrap_or(false),
        }
    }

    /// Move every connection of `old` to `new`, replacing whatever `new` had.
    pub fn transfer(&self, old: &str, new: &str) -> bool {
        match self.owners.remove(old) {
            Ok(owner) => {
                self.owners.insert_ready(new, owner);
                true
            }
            Err(_) => false,
        }
    }

    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    // -------------------------------------------------------------------------
    // Handlers
    // -------------------------------------------------------------------------

    fn handle_connect(self: &Arc<Self>, ctx: RequestContext, params: ConnectParams) {
        let ConnectParams {
            owner_uri,
            connection,
            purpose,
        } = params;

        self.owners
            .ensure(&owner_uri, || ConnectionOwner::new(connection.clone()));
        let ticket = match self.owners.begin_task(&owner_uri, &connect_task(purpose)) {
            Ok(ticket) => ticket,
            Err(e) => return ctx.send_error(e),
        };
        let outbound = ctx.outbound().clone();
        ctx.send_result(true);

        let token = ticket.token.clone();
        let service = self.clone();
        let fault_outbound = outbound.clone();
        let fault_owner = owner_uri.clone();
        let fault_ticket = ticket.clone();
        let fault_service = self.clone();
        // A task that cannot start is reported through its fault handler.
        let _ = spawn_task(
            "connection/connect",
            token,
            move |_token| {
                let outcome = service.open(&connection);
                let mut complete = ConnectionCompleteParams {
                    owner_uri: owner_uri.clone(),
                    purpose,
                    connection_id: None,
                    server_info: None,
                    error_message: None,
                };
                match outcome {
                    Ok(live) => {
                        complete.connection_id = Some(live.id.clone());
                        complete.server_info = Some(live.server_info());
                        let recorded = service.owners.finish_task(&ticket, |o| {
                            o.details = connection.clone();
                            o.connections.insert(purpose, live);
                        });
                        if !recorded {
                            complete.connection_id = None;
                            complete.server_info = None;
                            complete.error_message = Some("connection was closed while opening".into());
                        } else {
                            log::info!("Connected '{}' ({})", owner_uri, purpose.as_str());
                        }
                    }
                    Err(e) => {
                        service.owners.finish_task(&ticket, |_| {});
                        log::warn!("Connect failed for '{}': {}", owner_uri, e);
                        complete.error_message = Some(e.to_string());
                    }
                }
                outbound.notify(methods::CONNECTION_COMPLETE, &complete);
            },
            move |message| {
                fault_service.owners.finish_task(&fault_ticket, |_| {});
                fault_outbound.notify(
                    methods::CONNECTION_COMPLETE,
                    &ConnectionCompleteParams {
                        owner_uri: fault_owner,
                        purpose,
                        connection_id: None,
                        server_info: None,
                        error_message: Some(format!("internal error: {}", message)),
                    },
                );
            },
        );
    }

    fn handle_list_databases(self: &Arc<Self>, ctx: RequestContext, params: ListDatabasesParams) {
        let service = self.clone();
        // If the task never runs, dropping `ctx` answers the request with an error.
        let _ = spawn_task(
            "connection/listDatabases",
            Default::default(),
            move |_token| {
                let result = service
                    .get_connection(&params.owner_uri, ConnectionPurpose::Default)
                    .and_then(|driver| Ok(driver.catalog().list_databases()?))
                    .map(|database_names| ListDatabasesResult { database_names });
                ctx.respond(result);
            },
            |_| {},
        );
    }
}

impl Service for ConnectionService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn register(self: Arc<Self>, provider: &mut ServiceProvider) -> Result<(), ProviderError> {
        let _ = self.outbound.set(provider.outbound().clone());
        let routes = provider.routes()?;

        let service = self.clone();
        routes.on_request(methods::CONNECTION_CONNECT, move |ctx, params: ConnectParams| {
            service.handle_connect(ctx, params)
        })?;

        let service = self.clone();
        routes.on_request(methods::CONNECTION_DISCONNECT, move |ctx, params: DisconnectParams| {
            ctx.send_result(service.disconnect(&params.owner_uri, params.purpose))
        })?;

        let service = self.clone();
        routes.on_request(methods::CONNECTION_TRANSFER, move |ctx, params: TransferParams| {
            ctx.send_result(service.transfer(&params.old_owner_uri, &params.new_owner_uri))
        })?;

        let service = self.clone();
        routes.on_request(
            methods::CONNECTION_LIST_DATABASES,
            move |ctx, params: ListDatabasesParams| service.handle_list_databases(ctx, params),
        )?;

        Ok(())
    }

    fn shutdown(&self) -> Result<(), HostError> {
        let owners = self.owners.drain();
        if !owners.is_empty() {
            log::info!("Closed connections for {} owner(s)", owners.len());
        }
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{db_path, users_db, Harness};
    use serde_json::json;
    use sqlbridge_protocol::jsonrpc::{CONNECTION_NOT_FOUND, DRIVER_ERROR};

    fn harness() -> (Harness, Arc<ConnectionService>) {
        let service = Arc::new(ConnectionService::new(ConnectorRegistry::with_defaults(), "sqlite"));
        let registered = service.clone();
        let h = Harness::new(move |p| p.register(registered).unwrap());
        (h, service)
    }

    fn connect(h: &Harness, id: i64, owner: &str, database: &str, purpose: &str) -> Value {
        h.call(
            id,
            methods::CONNECTION_CONNECT,
            json!({
                "ownerUri": owner,
                "connection": { "databaseName": database },
                "type": purpose,
            }),
        )
    }

    #[test]
    fn test_connect_acks_then_completes() {
        let db = users_db();
        let (h, service) = harness();

        let ack = connect(&h, 1, "file:///q.sql", &db_path(&db), "query");
        assert_eq!(ack["result"], true);

        let done = h.notification(methods::CONNECTION_COMPLETE, |p| p["ownerUri"] == "file:///q.sql");
        assert_eq!(done["type"], "query");
        assert_eq!(done["serverInfo"]["provider"], "sqlite");
        assert_eq!(done["serverInfo"]["dialect"], "sqlite");
        assert!(done["connectionId"].is_string());
        assert!(done.get("errorMessage").is_none());
        assert!(service.existing("file:///q.sql", ConnectionPurpose::Query).is_some());
    }

    #[test]
    fn test_connect_failure_reported_in_completion() {
        let (h, _service) = harness();
        let ack = h.call(
            1,
            methods::CONNECTION_CONNECT,
            json!({
                "ownerUri": "o",
                "connection": { "provider": "oracle", "databaseName": "x" },
            }),
        );
        assert_eq!(ack["result"], true);

        let done = h.notification(methods::CONNECTION_COMPLETE, |_| true);
        assert!(done["errorMessage"].as_str().unwrap().contains("oracle"));
    }

    #[test]
    fn test_get_connection_reopens_per_purpose() {
        let db = users_db();
        let (h, service) = harness();
        connect(&h, 1, "owner", &db_path(&db), "default");
        h.notification(methods::CONNECTION_COMPLETE, |_| true);

        assert!(service.existing("owner", ConnectionPurpose::Edit).is_none());
        let driver = service.get_connection("owner", ConnectionPurpose::Edit).unwrap();
        assert_eq!(driver.dialect().as_str(), "sqlite");
        assert!(service.existing("owner", ConnectionPurpose::Edit).is_some());

        let err = service
            .get_connection("missing", ConnectionPurpose::Edit)
            .err()
            .unwrap();
        assert_eq!(err.to_rpc_error().code, CONNECTION_NOT_FOUND);
    }

    #[test]
    fn test_disconnect_and_transfer() {
        let db = users_db();
        let (h, service) = harness();
        connect(&h, 1, "old", &db_path(&db), "query");
        h.notification(methods::CONNECTION_COMPLETE, |_| true);

        let moved = h.call(2, methods::CONNECTION_TRANSFER, json!({ "oldOwnerUri": "old", "newOwnerUri": "new" }));
        assert_eq!(moved["result"], true);
        assert!(service.existing("new", ConnectionPurpose::Query).is_some());
        assert!(service.existing("old", ConnectionPurpose::Query).is_none());

        let again = h.call(3, methods::CONNECTION_TRANSFER, json!({ "oldOwnerUri": "old", "newOwnerUri": "x" }));
        assert_eq!(again["result"], false);

        let dropped = h.call(4, methods::CONNECTION_DISCONNECT, json!({ "ownerUri": "new", "type": "query" }));
        assert_eq!(dropped["result"], true);
        let all = h.call(5, methods::CONNECTION_DISCONNECT, json!({ "ownerUri": "new" }));
        assert_eq!(all["result"], true);
        assert_eq!(service.owner_count(), 0);
    }

    #[test]
    fn test_list_databases() {
        let db = users_db();
        let (h, _service) = harness();
        connect(&h, 1, "owner", &db_path(&db), "default");
        h.notification(methods::CONNECTION_COMPLETE, |_| true);

        let resp = h.call(2, methods::CONNECTION_LIST_DATABASES, json!({ "ownerUri": "owner" }));
        assert_eq!(resp["result"]["databaseNames"][0], "main");

        let missing = h.call(3, methods::CONNECTION_LIST_DATABASES, json!({ "ownerUri": "nobody" }));
        assert_eq!(missing["error"]["code"], CONNECTION_NOT_FOUND);
    }

    #[test]
    fn test_azure_mfa_asks_client_for_token() {
        use sqlbridge_protocol::{Message, RequestId, Response};
        use std::thread;

        let (h, service) = harness();
        let details = ConnectionDetails {
            provider: Some("sqlite".into()),
            server_name: "srv.database.windows.net".into(),
            database_name: ":memory:".into(),
            authentication_type: Some(AZURE_MFA.into()),
            ..Default::default()
        };

        let opener = {
            let service = service.clone();
            thread::spawn(move || service.open(&details).map(|live| live.provider))
        };

        let request = h.wait_for(|m| m["method"] == methods::CONNECTION_FETCH_AZURE_TOKEN);
        assert_eq!(request["params"]["serverName"], "srv.database.windows.net");
        assert_eq!(request["params"]["resource"], AZURE_SQL_RESOURCE);
        let id: RequestId = serde_json::from_value(request["id"].clone()).unwrap();
        h.dispatcher
            .dispatch(Message::Response(Response::success(id, json!({ "token": "tok" }))));

        assert_eq!(opener.join().unwrap().unwrap(), "sqlite");
    }

    #[test]
    fn test_execution_errors_map_to_driver_error() {
        let err: HostError = DriverError::Connection("unable to open database file".into()).into();
        assert_eq!(err.to_rpc_error().code, DRIVER_ERROR);
    }
}
