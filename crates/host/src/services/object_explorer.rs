//! Object explorer (`objectexplorer/*`): a lazily expanded catalog tree.
//!
//! Paths are slash-separated from the root `/`:
//!
//! ```text
//! /                               database
//! /Tables                         folder
//! /Tables/main.users              table
//! /Tables/main.users/Columns      folder
//! /Tables/main.users/Columns/id   column
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use sqlbridge_engine::{Driver, ObjectKind, ObjectRef};
use sqlbridge_protocol::connection::{ConnectionDetails, ConnectionPurpose};
use sqlbridge_protocol::methods;
use sqlbridge_protocol::object_explorer::{
    CloseSessionParams, CloseSessionResult, CreateSessionResult, ExpandCompletedParams, ExpandParams,
    NodeInfo, NodeType, ObjectMetadata, SessionCreatedParams,
};

use crate::dispatcher::{Outbound, RequestContext};
use crate::error::HostError;
use crate::provider::{ProviderError, Service, ServiceProvider};
use crate::services::connection::{self, ConnectionService};
use crate::services::resolve;
use crate::session::{InitFailurePolicy, Retrieval, SessionMap, TaskTicket};
use crate::task::spawn_task;

pub const SERVICE_NAME: &str = "objectExplorer";

const ROOT: &str = "/";
const TABLES: &str = "Tables";
const VIEWS: &str = "Views";
const COLUMNS: &str = "Columns";

pub struct ExplorerSession {
    root: Option<NodeInfo>,
    children: HashMap<String, Vec<NodeInfo>>,
}

/// `objectexplorer://<user>@<server>:<port>/<database>`
pub fn session_id(details: &ConnectionDetails) -> String {
    format!(
        "objectexplorer://{}@{}:{}/{}",
        details.user_name,
        details.server_name,
        details.port.map(|p| p.to_string()).unwrap_or_default(),
        details.database_name
    )
}

fn expand_task(path: &str) -> String {
    format!("expand:{}", path)
}

fn child_path(parent: &str, segment: &str) -> String {
    if parent == ROOT {
        format!("/{}", segment)
    } else {
        format!("{}/{}", parent, segment)
    }
}

fn folder(parent: &str, label: &str) -> NodeInfo {
    NodeInfo {
        node_path: child_path(parent, label),
        node_type: NodeType::Folder,
        label: label.to_string(),
        is_leaf: false,
        metadata: None,
    }
}

fn root_node(details: &ConnectionDetails, database: &str) -> NodeInfo {
    let label = if details.database_name.is_empty() {
        database.to_string()
    } else {
        details.database_name.clone()
    };
    NodeInfo {
        node_path: ROOT.to_string(),
        node_type: NodeType::Database,
        label,
        is_leaf: false,
        metadata: None,
    }
}

fn parse_object(segment: &str) -> ObjectRef {
    match segment.split_once('.') {
        Some((schema, name)) => ObjectRef::new(schema, name),
        None => ObjectRef::new("", segment),
    }
}

/// Children of `path`, read from the catalog.
fn expand_path(driver: &dyn Driver, path: &str) -> Result<Vec<NodeInfo>, HostError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [] => Ok(vec![folder(ROOT, TABLES), folder(ROOT, VIEWS)]),
        [group] if *group == TABLES || *group == VIEWS => {
            let (kind, node_type) = if *group == TABLES {
                (ObjectKind::Table, NodeType::Table)
            } else {
                (ObjectKind::View, NodeType::View)
            };
            let nodes = driver
                .catalog()
                .list_objects()?
                .into_iter()
                .filter(|o| o.kind == kind)
                .map(|o| NodeInfo {
                    node_path: child_path(path, &o.object.qualified()),
                    node_type,
                    label: o.object.qualified(),
                    is_leaf: false,
                    metadata: Some(ObjectMetadata {
                        schema: o.object.schema.clone(),
                        name: o.object.name.clone(),
                        object_type: kind.as_str().to_string(),
                    }),
                })
                .collect();
            Ok(nodes)
        }
        [group, _object] if *group == TABLES || *group == VIEWS => Ok(vec![folder(path, COLUMNS)]),
        [group, object, columns] if (*group == TABLES || *group == VIEWS) && *columns == COLUMNS => {
            let info = driver.catalog().describe(&parse_object(object))?;
            let nodes = info
                .columns
                .iter()
                .map(|c| NodeInfo {
                    node_path: child_path(path, &c.name),
                    node_type: NodeType::Column,
                    label: format!(
                        "{} ({}{})",
                        c.name,
                        if c.data_type.is_empty() { "ANY" } else { c.data_type.as_str() },
                        if c.is_nullable { ", null" } else { ", not null" }
                    ),
                    is_leaf: true,
                    metadata: None,
                })
                .collect();
            Ok(nodes)
        }
        _ => Err(HostError::InvalidParams(format!("unknown node path '{}'", path))),
    }
}

pub struct ObjectExplorerService {
    sessions: SessionMap<ExplorerSession>,
    connections: OnceLock<Arc<ConnectionService>>,
}

impl Default for ObjectExplorerService {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectExplorerService {
    pub fn new() -> Self {
        Self {
            sessions: SessionMap::new(SERVICE_NAME),
            connections: OnceLock::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn handle_create(self: &Arc<Self>, ctx: RequestContext, details: ConnectionDetails) {
        let id = session_id(&details);
        let ticket = match self.sessions.create(
            &id,
            ExplorerSession {
                root: None,
                children: HashMap::new(),
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
            "objectexplorer/createsession",
            token,
            move |_token| {
                let opened = resolve(&service.connections).and_then(|connections| {
                    let live = connections.open_for(&id, &details, ConnectionPurpose::ObjectExplorer)?;
                    let databases = live.driver.catalog().list_databases()?;
                    Ok(root_node(&details, databases.first().map(String::as_str).unwrap_or("")))
                });
                match opened {
                    Ok(root) => {
                        let stored = root.clone();
                        if service.sessions.complete_init(&ticket, |s| s.root = Some(stored)) {
                            outbound.notify(
                                methods::OBJECT_EXPLORER_SESSION_CREATED,
                                &SessionCreatedParams {
                                    session_id: id,
                                    success: true,
                                    root_node: Some(root),
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
        if !self.sessions.fail_init(ticket, InitFailurePolicy::Remove) {
            return;
        }
        if let Ok(connections) = resolve(&self.connections) {
            connections.disconnect(&ticket.key, None);
        }
        outbound.notify(
            methods::OBJECT_EXPLORER_SESSION_CREATED,
            &SessionCreatedParams {
                session_id: ticket.key.clone(),
                success: false,
                root_node: None,
                error_message: Some(message),
            },
        );
    }

    fn handle_expand(self: &Arc<Self>, ctx: RequestContext, params: ExpandParams, refresh: bool) {
        let ExpandParams { session_id, node_path } = params;
        if refresh {
            let dropped = self.sessions.with_mut(&session_id, |s| {
                let prefix = format!("{}/", node_path.trim_end_matches('/'));
                s.children
                    .retain(|path, _| path != &node_path && !path.starts_with(&prefix));
            });
            if let Err(e) = dropped {
                return ctx.send_error(e);
            }
        }

        let kind = expand_task(&node_path);
        let retrieval = self
            .sessions
            .retrieve(&session_id, &kind, |s| s.children.get(&node_path).cloned());
        let outbound = ctx.outbound().clone();
        let ticket = match retrieval {
            Ok(Retrieval::Cached(nodes)) => {
                ctx.send_result(true);
                outbound.notify(
                    methods::OBJECT_EXPLORER_EXPAND_COMPLETED,
                    &ExpandCompletedParams {
                        session_id,
                        node_path,
                        nodes,
                        error_message: None,
                    },
                );
                return;
            }
            Ok(Retrieval::Started(ticket)) => ticket,
            Err(e) => return ctx.send_error(e),
        };
        ctx.send_result(true);

        let service = self.clone();
        let token = ticket.token.clone();
        let (fault_service, fault_ticket, fault_outbound) = (self.clone(), ticket.clone(), outbound.clone());
        let (fault_session, fault_path) = (session_id.clone(), node_path.clone());
        // A task that cannot start is reported through its fault handler.
        let _ = spawn_task(
            "objectexplorer/expand",
            token,
            move |_token| {
                let expanded = resolve(&service.connections).and_then(|connections| {
                    let driver = connections.get_connection(&session_id, ConnectionPurpose::ObjectExplorer)?;
                    expand_path(driver.as_ref(), &node_path)
                });
                let (nodes, error_message) = match expanded {
                    Ok(nodes) => (nodes, None),
                    Err(e) => (Vec::new(), Some(e.to_string())),
                };
                let cache = nodes.clone();
                let path = node_path.clone();
                let current = service.sessions.finish_task(&ticket, |s| {
                    if error_message.is_none() {
                        s.children.insert(path, cache);
                    }
                });
                if current {
                    outbound.notify(
                        methods::OBJECT_EXPLORER_EXPAND_COMPLETED,
                        &ExpandCompletedParams {
                            session_id,
                            node_path,
                            nodes,
                            error_message,
                        },
                    );
                }
            },
            move |message| {
                if fault_service.sessions.finish_task(&fault_ticket, |_| {}) {
                    fault_outbound.notify(
                        methods::OBJECT_EXPLORER_EXPAND_COMPLETED,
                        &ExpandCompletedParams {
                            session_id: fault_session,
                            node_path: fault_path,
                            nodes: Vec::new(),
                            error_message: Some(format!("internal error: {}", message)),
                        },
                    );
                }
            },
        );
    }

    fn handle_close(&self, ctx: RequestContext, params: CloseSessionParams) {
        match self.sessions.remove(&params.session_id) {
            Ok(_) => {
                if let Ok(connections) = resolve(&self.connections) {
                    connections.disconnect(&params.session_id, None);
                }
                ctx.send_result(CloseSessionResult {
                    session_id: params.session_id,
                    success: true,
                })
            }
            Err(e) => ctx.send_error(e),
        }
    }

    pub fn root(&self, id: &str) -> Option<NodeInfo> {
        self.sessions.with(id, |s| s.root.clone()).ok().flatten()
    }
}

impl Service for ObjectExplorerService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn register(self: Arc<Self>, provider: &mut ServiceProvider) -> Result<(), ProviderError> {
        let connections = provider.get::<ConnectionService>(connection::SERVICE_NAME)?;
        let _ = self.connections.set(connections);
        let routes = provider.routes()?;

        let service = self.clone();
        routes.on_request(
            methods::OBJECT_EXPLORER_CREATE_SESSION,
            move |ctx, details: ConnectionDetails| service.handle_create(ctx, details),
        )?;

        let service = self.clone();
        routes.on_request(methods::OBJECT_EXPLORER_EXPAND, move |ctx, params: ExpandParams| {
            service.handle_expand(ctx, params, false)
        })?;

        let service = self.clone();
        routes.on_request(methods::OBJECT_EXPLORER_REFRESH, move |ctx, params: ExpandParams| {
            service.handle_expand(ctx, params, true)
        })?;

        let service = self.clone();
        routes.on_request(
            methods::OBJECT_EXPLORER_CLOSE_SESSION,
            move |ctx, params: CloseSessionParams| service.handle_close(ctx, params),
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
