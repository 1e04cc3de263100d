//! Schema designer (`schemaDesigner/*`).
//!
//! A session loads the table model of one database once and caches it.
//! Scripts are rendered from a client-supplied model with the session's
//! dialect, so designing never touches the live schema.

use std::sync::{Arc, OnceLock};

use sqlbridge_engine::ddl;
use sqlbridge_engine::{ColumnMeta, Dialect, ForeignKeyInfo, ObjectKind, ObjectRef, TableInfo};
use sqlbridge_protocol::connection::ConnectionPurpose;
use sqlbridge_protocol::methods;
use sqlbridge_protocol::schema_designer::{
    ColumnModel, CreateSessionParams, CreateSessionResult, ForeignKeyModel, GenerateScriptParams,
    GenerateScriptResult, GetSchemaModelResult, SchemaModel, SchemaModelParams, SessionCreatedParams,
    SessionParams, TableModel,
};

use crate::dispatcher::{Outbound, RequestContext};
use crate::error::{HostError, SessionError};
use crate::provider::{ProviderError, Service, ServiceProvider};
use crate::services::connection::{self, ConnectionService};
use crate::services::resolve;
use crate::session::{InitFailurePolicy, Retrieval, SessionMap, TaskTicket};
use crate::task::spawn_task;

pub const SERVICE_NAME: &str = "schemaDesigner";

const GET_MODEL_TASK: &str = "getSchemaModel";

pub struct DesignerSession {
    dialect: Option<Dialect>,
    model: Option<SchemaModel>,
}

/// `schemadesigner://<ownerUri>/<database>`
pub fn session_id(owner_uri: &str, database_name: Option<&str>) -> String {
    format!("schemadesigner://{}/{}", owner_uri, database_name.unwrap_or(""))
}

pub fn table_model(info: &TableInfo) -> TableModel {
    TableModel {
        id: info.object.qualified(),
        schema: info.object.schema.clone(),
        name: info.object.name.clone(),
        columns: info
            .columns
            .iter()
            .map(|c| ColumnModel {
                name: c.name.clone(),
                data_type: c.data_type.clone(),
                is_nullable: c.is_nullable,
                is_primary_key: c.is_key,
                is_identity: c.is_identity,
                default_value: c.default_value.clone(),
            })
            .collect(),
        foreign_keys: info
            .foreign_keys
            .iter()
            .map(|fk| ForeignKeyModel {
                name: fk.name.clone(),
                columns: fk.columns.clone(),
                referenced_schema: fk.referenced.schema.clone(),
                referenced_table: fk.referenced.name.clone(),
                referenced_columns: fk.referenced_columns.clone(),
            })
            .collect(),
    }
}

pub fn table_info(model: &TableModel) -> TableInfo {
    TableInfo {
        object: ObjectRef::new(model.schema.clone(), model.name.clone()),
        kind: ObjectKind::Table,
        columns: model
            .columns
            .iter()
            .enumerate()
            .map(|(ordinal, c)| ColumnMeta {
                name: c.name.clone(),
                data_type: c.data_type.clone(),
                ordinal,
                is_key: c.is_primary_key,
                is_identity: c.is_identity,
                is_nullable: c.is_nullable,
                default_value: c.default_value.clone(),
            })
            .collect(),
        foreign_keys: model
            .foreign_keys
            .iter()
            .map(|fk| ForeignKeyInfo {
                name: fk.name.clone(),
                columns: fk.columns.clone(),
                referenced: ObjectRef::new(fk.referenced_schema.clone(), fk.referenced_table.clone()),
                referenced_columns: fk.referenced_columns.clone(),
            })
            .collect(),
    }
}

pub struct SchemaDesignerService {
    sessions: SessionMap<DesignerSession>,
    connections: OnceLock<Arc<ConnectionService>>,
}

impl Default for SchemaDesignerService {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaDesignerService {
    pub fn new() -> Self {
        Self {
            sessions: SessionMap::new(SERVICE_NAME),
            connections: OnceLock::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn handle_create(self: &Arc<Self>, ctx: RequestContext, params: CreateSessionParams) {
        let id = session_id(&params.owner_uri, params.database_name.as_deref());
        let ticket = match self.sessions.create(
            &id,
            DesignerSession {
                dialect: None,
                model: None,
            },
        ) {
            Ok(ticket) => ticket,
            Err(e) => return ctx.send_error(e),
        };
        let outbound = ctx.outbound().clone();
        ctx.send_result(CreateSessionResult { session_id: id.clone() });

        let service = self.clone();
        let token = ticket.token.clone();
        let (fault_service, fault_ticket, fault_outbound) = (self.clone(), ticket.clone(), outbound.clone());
        // A task that cannot start is reported through its fault handler.
        let _ = spawn_task(
            "schemaDesigner/createSession",
            token,
            move |_token| {
                let opened = resolve(&service.connections).and_then(|connections| {
                    let mut details = connections.details(&params.owner_uri)?;
                    if let Some(database) = params.database_name.clone() {
                        details.database_name = database;
                    }
                    let live = connections.open_for(&id, &details, ConnectionPurpose::SchemaDesigner)?;
                    Ok(live.driver.dialect())
                });
                match opened {
                    Ok(dialect) => {
                        if service.sessions.complete_init(&ticket, |s| s.dialect = Some(dialect)) {
                            outbound.notify(
                                methods::SCHEMA_DESIGNER_SESSION_CREATED,
                                &SessionCreatedParams {
                                    session_id: id,
                                    success: true,
                                    error_message: None,
                                },
                            );
                        }
                    }
                    Err(e) => service.fail(&ticket, &outbound, e.to_string()),
                }
            },
            move |message| fault_service.fail(&fault_ticket, &fault_outbound, message),
        );
    }

    fn fail(&self, ticket: &TaskTicket, outbound: &Outbound, message: String) {
        if !self.sessions.fail_init(ticket, InitFailurePolicy::Close) {
            return;
        }
        if let Ok(connections) = resolve(&self.connections) {
            connections.disconnect(&ticket.key, None);
        }
        log::warn!("Schema designer session '{}' failed: {}", ticket.key, message);
        outbound.notify(
            methods::SCHEMA_DESIGNER_SESSION_CREATED,
            &SessionCreatedParams {
                session_id: ticket.key.clone(),
                success: false,
                error_message: Some(message),
            },
        );
    }

    fn handle_get_model(self: &Arc<Self>, ctx: RequestContext, params: SessionParams) {
        let session_id = params.session_id;
        let retrieval = self
            .sessions
            .retrieve(&session_id, GET_MODEL_TASK, |s| s.model.clone());
        let ticket = match retrieval {
            Ok(Retrieval::Cached(schema)) => {
                ctx.send_notification(
                    methods::SCHEMA_DESIGNER_SCHEMA_MODEL,
                    &SchemaModelParams {
                        session_id: session_id.clone(),
                        schema: Some(schema.clone()),
                        error_message: None,
                    },
                );
                return ctx.send_result(GetSchemaModelResult { session_id, schema });
            }
            Ok(Retrieval::Started(ticket)) => ticket,
            Err(e) => return ctx.send_error(e),
        };

        let service = self.clone();
        let token = ticket.token.clone();
        let (fault_service, fault_ticket) = (self.clone(), ticket.clone());
        // A task that cannot start is reported through its fault handler.
        let _ = spawn_task(
            "schemaDesigner/getSchemaModel",
            token,
            move |_token| {
                let loaded = resolve(&service.connections).and_then(|connections| {
                    let driver = connections.get_connection(&session_id, ConnectionPurpose::SchemaDesigner)?;
                    let tables = driver.catalog().schema_model()?;
                    Ok(SchemaModel {
                        tables: tables.iter().map(table_model).collect(),
                    })
                });
                let cache = loaded.as_ref().ok().cloned();
                let current = service.sessions.finish_task(&ticket, |s| {
                    if cache.is_some() {
                        s.model = cache;
                    }
                });
                if !current {
                    return ctx.send_error(SessionError::NotFound(session_id));
                }

                let (schema, error_message) = match &loaded {
                    Ok(schema) => (Some(schema.clone()), None),
                    Err(e) => (None, Some(e.to_string())),
                };
                ctx.send_notification(
                    methods::SCHEMA_DESIGNER_SCHEMA_MODEL,
                    &SchemaModelParams {
                        session_id: session_id.clone(),
                        schema,
                        error_message,
                    },
                );
                ctx.respond(loaded.map(|schema| GetSchemaModelResult { session_id, schema }));
            },
            move |_| {
                fault_service.sessions.finish_task(&fault_ticket, |_| {});
            },
        );
    }

    fn generate_script(&self, params: &GenerateScriptParams) -> Result<GenerateScriptResult, HostError> {
        let dialect = self
            .sessions
            .with(&params.session_id, |s| s.dialect)?
            .ok_or_else(|| SessionError::NotReady(params.session_id.clone()))?;
        let tables: Vec<TableInfo> = params.schema.tables.iter().map(table_info).collect();
        Ok(GenerateScriptResult {
            script: ddl::create_script(&tables, dialect.templater()),
        })
    }

    fn close(&self, session_id: &str) -> Result<bool, SessionError> {
        self.sessions.remove(session_id)?;
        if let Ok(connections) = resolve(&self.connections) {
            connections.disconnect(session_id, None);
        }
        Ok(true)
    }
}

impl Service for SchemaDesignerService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn register(self: Arc<Self>, provider: &mut ServiceProvider) -> Result<(), ProviderError> {
        let connections = provider.get::<ConnectionService>(connection::SERVICE_NAME)?;
        let _ = self.connections.set(connections);
        let routes = provider.routes()?;

        let service = self.clone();
        routes.on_request(
            methods::SCHEMA_DESIGNER_CREATE_SESSION,
            move |ctx, params: CreateSessionParams| service.handle_create(ctx, params),
        )?;

        let service = self.clone();
        routes.on_request(
            methods::SCHEMA_DESIGNER_GET_SCHEMA_MODEL,
            move |ctx, params: SessionParams| service.handle_get_model(ctx, params),
        )?;

        let service = self.clone();
        routes.on_request(
            methods::SCHEMA_DESIGNER_GENERATE_SCRIPT,
            move |ctx, params: GenerateScriptParams| ctx.respond(service.generate_script(&params)),
        )?;

        let service = self.clone();
        routes.on_request(
            methods::SCHEMA_DESIGNER_CLOSE_SESSION,
            move |ctx, params: SessionParams| ctx.respond(service.close(&params.session_id)),
        )?;

        Ok(())
    }

    fn shutdown(&self) -> Result<(), HostError> {
        self.sessions.drain();
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}
