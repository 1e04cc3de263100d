//! Edit data (`edit/*`): the wire surface of the row-edit engine.
//!
//! One edit session per owner URI. Rows are fetched once on `initialize`;
//! staging calls only touch the in-memory session, and `commit` replays the
//! pending script against the owner's edit connection on a background task.

use std::sync::{Arc, OnceLock};

use serde_json::json;

use sqlbridge_engine::edit::{
    self, CellView, CommittedEdit, EditSession, EditTable, RowState, RowView,
};
use sqlbridge_engine::{DbValue, ObjectRef};
use sqlbridge_protocol::connection::ConnectionPurpose;
use sqlbridge_protocol::edit_data::{
    CellResult, CommitFailureData, CommitProgressParams, CommitResult, CommittedRow, CreateRowResult,
    EditCell, EditKind, EditRow, EditRowState, InitializeParams, OwnerParams, RevertCellParams,
    RowParams, SessionReadyParams, SubsetParams, SubsetResult, UpdateCellParams,
};
use sqlbridge_protocol::jsonrpc::COMMIT_FAILED;
use sqlbridge_protocol::{methods, EmptyResult, RpcError};

use crate::dispatcher::{Outbound, RequestContext};
use crate::error::{HostError, SessionError};
use crate::provider::{ProviderError, Service, ServiceProvider};
use crate::services::connection::{self, ConnectionService};
use crate::services::resolve;
use crate::session::{InitFailurePolicy, SessionMap, TaskTicket};
use crate::task::spawn_task;

pub const SERVICE_NAME: &str = "editData";

const COMMIT_TASK: &str = "commit";

/// Staging is refused while these run.
const STAGING_BLOCKED_BY: &[&str] = &[COMMIT_TASK];

#[derive(Default)]
pub struct EditSlot {
    session: Option<EditSession>,
}

fn row_state(state: RowState) -> EditRowState {
    match state {
        RowState::Clean => EditRowState::Clean,
        RowState::Inserted => EditRowState::DirtyInsert,
        RowState::Updated => EditRowState::DirtyUpdate,
        RowState::Deleted => EditRowState::DirtyDelete,
    }
}

fn edit_kind(kind: edit::EditKind) -> EditKind {
    match kind {
        edit::EditKind::Create => EditKind::Create,
        edit::EditKind::Update => EditKind::Update,
        edit::EditKind::Delete => EditKind::Delete,
    }
}

fn value_cell(value: &DbValue, is_dirty: bool) -> EditCell {
    EditCell {
        display_value: value.display(),
        is_null: value.is_null(),
        is_dirty,
    }
}

fn edit_cell(cell: &CellView) -> EditCell {
    value_cell(&cell.value, cell.is_dirty)
}

fn edit_row(row: &RowView) -> EditRow {
    EditRow {
        id: row.id,
        is_dirty: row.is_dirty(),
        state: row_state(row.state),
        cells: row.cells.iter().map(edit_cell).collect(),
    }
}

fn committed_row(edit: &CommittedEdit) -> CommittedRow {
    CommittedRow {
        row_id: edit.row_id,
        kind: edit_kind(edit.kind),
        cells: edit
            .row
            .as_ref()
            .map(|values| values.iter().map(|v| value_cell(v, false)).collect()),
    }
}

pub struct EditDataService {
    row_limit: u64,
    sessions: SessionMap<EditSlot>,
    connections: OnceLock<Arc<ConnectionService>>,
}

impl EditDataService {
    pub fn new(row_limit: u64) -> Self {
        Self {
            row_limit,
            sessions: SessionMap::new(SERVICE_NAME),
            connections: OnceLock::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Fetch the edit target's metadata and rows.
    fn load(&self, params: &InitializeParams) -> Result<EditTable, HostError> {
        let driver = resolve(&self.connections)?.get_connection(&params.owner_uri, ConnectionPurpose::Edit)?;
        let object = ObjectRef::new(params.schema_name.clone().unwrap_or_default(), params.object_name.clone());
        let info = driver.catalog().describe(&object)?;

        let sql = match params.query_string.as_deref().filter(|q| !q.trim().is_empty()) {
            Some(query) => query.to_string(),
            None => {
                let limit = params
                    .filters
                    .limit_results
                    .or(Some(self.row_limit))
                    .filter(|l| *l > 0);
                let columns: Vec<String> = info.columns.iter().map(|c| c.name.clone()).collect();
                driver
                    .dialect()
                    .templater()
                    .select_template(&info.object, &columns, None, limit)
            }
        };
        let result = driver.execute(&sql, &[])?;

        let shape = EditTable::new(info.object.clone(), info.columns.clone(), Vec::new());
        let rows = result
            .rows
            .iter()
            .map(|row| shape.project(&result.columns, row))
            .collect();
        Ok(EditTable::new(info.object, info.columns, rows))
    }

    fn handle_initialize(self: &Arc<Self>, ctx: RequestContext, params: InitializeParams) {
        let ticket = match self.sessions.create(&params.owner_uri, EditSlot::default()) {
            Ok(ticket) => ticket,
            Err(e) => return ctx.send_error(e),
        };
        let outbound = ctx.outbound().clone();
        ctx.send_result(EmptyResult {});

        let service = self.clone();
        let token = ticket.token.clone();
        let (fault_service, fault_ticket, fault_outbound) = (self.clone(), ticket.clone(), outbound.clone());
        // A task that cannot start is reported through its fault handler.
        let _ = spawn_task(
            "edit/initialize",
            token,
            move |_token| match service.load(&params) {
                Ok(table) => {
                    let rows = table.rows().len();
                    if service
                        .sessions
                        .complete_init(&ticket, |s| s.session = Some(EditSession::new(table)))
                    {
                        log::info!(
                            "Edit session '{}' ready ({}, {} rows)",
                            params.owner_uri,
                            params.object_name,
                            rows
                        );
                        outbound.notify(
                            methods::EDIT_SESSION_READY,
                            &SessionReadyParams {
                                owner_uri: params.owner_uri,
                                success: true,
                                message: None,
                            },
                        );
                    }
                }
                Err(e) => service.fail(&ticket, &outbound, e.to_string()),
            },
            move |message| fault_service.fail(&fault_ticket, &fault_outbound, message),
        );
    }

    fn fail(&self, ticket: &TaskTicket, outbound: &Outbound, message: String) {
        if !self.sessions.fail_init(ticket, InitFailurePolicy::Remove) {
            return;
        }
        outbound.notify(
            methods::EDIT_SESSION_READY,
            &SessionReadyParams {
                owner_uri: ticket.key.clone(),
                success: false,
                message: Some(message),
            },
        );
    }

    /// Run `f` on a ready session, refusing while a commit runs.
    fn with_session<R>(
        &self,
        owner_uri: &str,
        blocked_by: &[&str],
        f: impl FnOnce(&mut EditSession) -> Result<R, HostError>,
    ) -> Result<R, HostError> {
        self.sessions
            .with_ready_mut(owner_uri, blocked_by, |slot| match slot.session.as_mut() {
                Some(session) => f(session),
                None => Err(SessionError::NotReady(owner_uri.to_string()).into()),
            })?
    }

    pub fn subset(&self, params: &SubsetParams) -> Result<SubsetResult, HostError> {
        self.with_session(&params.owner_uri, &[], |session| {
            let rows = session.rows(params.row_start_index as usize, params.row_count as usize);
            Ok(SubsetResult {
                row_count: rows.len() as u64,
                subset: rows.iter().map(edit_row).collect(),
            })
        })
    }

    pub fn create_row(&self, owner_uri: &str) -> Result<CreateRowResult, HostError> {
        self.with_session(owner_uri, STAGING_BLOCKED_BY, |session| {
            let (new_row_id, default_values) = session.create_row()?;
            Ok(CreateRowResult {
                new_row_id,
                default_values,
            })
        })
    }

    pub fn update_cell(&self, params: &UpdateCellParams) -> Result<CellResult, HostError> {
        self.with_session(&params.owner_uri, STAGING_BLOCKED_BY, |session| {
            let (cell, is_row_dirty) = session.update_cell(params.row_id, params.column_id, &params.new_value)?;
            Ok(CellResult {
                cell: edit_cell(&cell),
                is_row_dirty,
            })
        })
    }

    pub fn delete_row(&self, params: &RowParams) -> Result<EmptyResult, HostError> {
        self.with_session(&params.owner_uri, STAGING_BLOCKED_BY, |session| {
            session.delete_row(params.row_id)?;
            Ok(EmptyResult {})
        })
    }

    pub fn revert_row(&self, params: &RowParams) -> Result<EmptyResult, HostError> {
        self.with_session(&params.owner_uri, STAGING_BLOCKED_BY, |session| {
            session.revert_row(params.row_id);
            Ok(EmptyResult {})
        })
    }

    pub fn revert_cell(&self, params: &RevertCellParams) -> Result<CellResult, HostError> {
        self.with_session(&params.owner_uri, STAGING_BLOCKED_BY, |session| {
            let (cell, is_row_dirty) = session.revert_cell(params.row_id, params.column_id)?;
            Ok(CellResult {
                cell: edit_cell(&cell),
                is_row_dirty,
            })
        })
    }

    fn handle_commit(self: &Arc<Self>, ctx: RequestContext, params: OwnerParams) {
        let owner_uri = params.owner_uri;
        let ticket = match self.sessions.begin_task(&owner_uri, COMMIT_TASK) {
            Ok(ticket) => ticket,
            Err(e) => return ctx.send_error(e),
        };
        let plan = match self
            .sessions
            .with(&owner_uri, |s| s.session.as_ref().map(EditSession::commit_plan))
        {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                self.sessions.finish_task(&ticket, |_| {});
                return ctx.send_error(SessionError::NotReady(owner_uri));
            }
            Err(e) => return ctx.send_error(e),
        };
        if plan.edits.is_empty() {
            self.sessions.finish_task(&ticket, |_| {});
            return ctx.send_result(CommitResult { rows: Vec::new() });
        }

        let service = self.clone();
        let token = ticket.token.clone();
        let (fault_service, fault_ticket) = (self.clone(), ticket.clone());
        // A task that cannot start is reported through its fault handler.
        let _ = spawn_task(
            "edit/commit",
            token,
            move |_token| {
                let driver = match resolve(&service.connections)
                    .and_then(|connections| connections.get_connection(&owner_uri, ConnectionPurpose::Edit))
                {
                    Ok(driver) => driver,
                    Err(e) => {
                        service.sessions.finish_task(&ticket, |_| {});
                        return ctx.send_error(e);
                    }
                };

                let total = plan.edits.len();
                let outbound = ctx.outbound().clone();
                let outcome = edit::commit(&plan, driver.as_ref(), |applied| {
                    outbound.notify(
                        methods::EDIT_COMMIT_PROGRESS,
                        &CommitProgressParams {
                            owner_uri: owner_uri.clone(),
                            edit_index: applied.index,
                            row_id: applied.row_id,
                            total,
                        },
                    );
                });

                match outcome {
                    Ok(committed) => {
                        service.sessions.finish_task(&ticket, |s| {
                            if let Some(session) = s.session.as_mut() {
                                session.apply_committed(&committed);
                            }
                        });
                        log::info!("Committed {} edit(s) for '{}'", committed.len(), owner_uri);
                        ctx.send_result(CommitResult {
                            rows: committed.iter().map(committed_row).collect(),
                        });
                    }
                    Err(failure) => {
                        service.sessions.finish_task(&ticket, |s| {
                            if let Some(session) = s.session.as_mut() {
                                session.apply_committed(&failure.applied);
                            }
                        });
                        log::warn!("Commit for '{}' failed: {}", owner_uri, failure);
                        let data = CommitFailureData {
                            edit_index: failure.edit_index,
                            row_id: failure.row_id,
                            statement: failure.statement.clone(),
                            applied: failure.applied.len(),
                        };
                        ctx.send_error(
                            RpcError::new(COMMIT_FAILED, failure.to_string())
                                .with_data(serde_json::to_value(&data).unwrap_or_else(|_| json!({}))),
                        );
                    }
                }
            },
            move |_| {
                fault_service.sessions.finish_task(&fault_ticket, |_| {});
            },
        );
    }

    fn dispose(&self, owner_uri: &str) -> Result<EmptyResult, SessionError> {
        self.sessions.remove(owner_uri)?;
        Ok(EmptyResult {})
    }
}

impl Service for EditDataService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn register(self: Arc<Self>, provider: &mut ServiceProvider) -> Result<(), ProviderError> {
        let connections = provider.get::<ConnectionService>(connection::SERVICE_NAME)?;
        let _ = self.connections.set(connections);
        let routes = provider.routes()?;

        let service = self.clone();
        routes.on_request(methods::EDIT_INITIALIZE, move |ctx, params: InitializeParams| {
            service.handle_initialize(ctx, params)
        })?;

        let service = self.clone();
        routes.on_request(methods::EDIT_SUBSET, move |ctx, params: SubsetParams| {
            ctx.respond(service.subset(&params))
        })?;

        let service = self.clone();
        routes.on_request(methods::EDIT_CREATE_ROW, move |ctx, params: OwnerParams| {
            ctx.respond(service.create_row(&params.owner_uri))
        })?;

        let service = self.clone();
        routes.on_request(methods::EDIT_UPDATE_CELL, move |ctx, params: UpdateCellParams| {
            ctx.respond(service.update_cell(&params))
        })?;

        let service = self.clone();
        routes.on_request(methods::EDIT_DELETE_ROW, move |ctx, params: RowParams| {
            ctx.respond(service.delete_row(&params))
        })?;

        let service = self.clone();
        routes.on_request(methods::EDIT_REVERT_ROW, move |ctx, params: RowParams| {
            ctx.respond(service.revert_row(&params))
        })?;

        let service = self.clone();
        routes.on_request(methods::EDIT_REVERT_CELL, move |ctx, params: RevertCellParams| {
            ctx.respond(service.revert_cell(&params))
        })?;

        let service = self.clone();
        routes.on_request(methods::EDIT_COMMIT, move |ctx, params: OwnerParams| {
            service.handle_commit(ctx, params)
        })?;

        let service = self.clone();
        routes.on_request(methods::EDIT_DISPOSE, move |ctx, params: OwnerParams| {
            ctx.respond(service.dispose(&params.owner_uri))
        })?;

        Ok(())
    }

    fn shutdown(&self) -> Result<(), HostError> {
        let drained = self.sessions.drain();
        let pending = drained
            .iter()
            .filter_map(|(_, slot)| slot.session.as_ref())
            .filter(|s| !s.script().is_empty())
            .count();
        if pending > 0 {
            log::warn!("Discarding uncommitted edits in {} session(s)", pending);
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
    use crate::services::connection::ConnectorRegistry;
    use crate::testing::{db_path, users_db, Harness};
    use serde_json::Value;
    use sqlbridge_protocol::jsonrpc::{EDIT_REJECTED, INVALID_PARAMS, SESSION_ALREADY_EXISTS};

    const OWNER: &str = "edit://users";

    fn harness(row_limit: u64) -> (Harness, Arc<EditDataService>) {
        let service = Arc::new(EditDataService::new(row_limit));
        let registered = service.clone();
        let h = Harness::new(move |p| {
            p.register(Arc::new(ConnectionService::new(ConnectorRegistry::with_defaults(), "sqlite")))
                .unwrap();
            p.register(registered).unwrap();
        });
        (h, service)
    }

    /// Connected and initialized on the `users` table.
    fn ready(db: &tempfile::TempDir, row_limit: u64) -> (Harness, Arc<EditDataService>) {
        let (h, service) = harness(row_limit);
        h.call(
            100,
            methods::CONNECTION_CONNECT,
            json!({ "ownerUri": OWNER, "connection": { "databaseName": db_path(db) } }),
        );
        h.notification(methods::CONNECTION_COMPLETE, |_| true);
        let ack = h.call(101, methods::EDIT_INITIALIZE, json!({ "ownerUri": OWNER, "objectName": "users" }));
        assert_eq!(ack["result"], json!({}));
        let ready = h.notification(methods::EDIT_SESSION_READY, |_| true);
        assert_eq!(ready["success"], true, "{:?}", ready);
        (h, service)
    }

    fn subset(h: &Harness, id: i64) -> Value {
        h.call(
            id,
            methods::EDIT_SUBSET,
            json!({ "ownerUri": OWNER, "rowStartIndex": 0, "rowCount": 100 }),
        )["result"]
            .clone()
    }

    fn update(h: &Harness, id: i64, row: i64, column: usize, value: Value) -> Value {
        h.call(
            id,
            methods::EDIT_UPDATE_CELL,
            json!({ "ownerUri": OWNER, "rowId": row, "columnId": column, "newValue": value }),
        )
    }

    #[test]
    fn test_initialize_and_subset() {
        let db = users_db();
        let (h, _service) = ready(&db, 200);
        let page = subset(&h, 1);
        assert_eq!(page["rowCount"], 2);
        assert_eq!(page["subset"][0]["cells"][1]["displayValue"], "ada");
        assert_eq!(page["subset"][1]["cells"][2]["isNull"], true);
        assert_eq!(page["subset"][1]["state"], "clean");
    }

    #[test]
    fn test_row_limit_applies_without_filter() {
        let db = users_db();
        let (h, _service) = ready(&db, 1);
        assert_eq!(subset(&h, 1)["rowCount"], 1);
    }

    #[test]
    fn test_initialize_failure_removes_session() {
        let db = users_db();
        let (h, service) = harness(200);
        h.call(
            100,
            methods::CONNECTION_CONNECT,
            json!({ "ownerUri": OWNER, "connection": { "databaseName": db_path(&db) } }),
        );
        h.notification(methods::CONNECTION_COMPLETE, |_| true);
        h.call(1, methods::EDIT_INITIALIZE, json!({ "ownerUri": OWNER, "objectName": "missing" }));
        let ready = h.notification(methods::EDIT_SESSION_READY, |_| true);
        assert_eq!(ready["success"], false);
        assert!(ready["message"].as_str().unwrap().contains("missing"));
        assert_eq!(service.session_count(), 0);
    }

    #[test]
    fn test_duplicate_initialize_rejected() {
        let db = users_db();
        let (h, _service) = ready(&db, 200);
        let again = h.call(1, methods::EDIT_INITIALIZE, json!({ "ownerUri": OWNER, "objectName": "users" }));
        assert_eq!(again["error"]["code"], SESSION_ALREADY_EXISTS);
    }

    #[test]
    fn test_staging_errors() {
        let db = users_db();
        let (h, _service) = ready(&db, 200);

        let identity = update(&h, 1, 0, 0, json!(5));
        assert_eq!(identity["error"]["code"], INVALID_PARAMS);

        h.call(2, methods::EDIT_DELETE_ROW, json!({ "ownerUri": OWNER, "rowId": 1 }));
        let over_delete = update(&h, 3, 1, 1, json!("x"));
        assert_eq!(over_delete["error"]["code"], EDIT_REJECTED);

        h.call(4, methods::EDIT_REVERT_ROW, json!({ "ownerUri": OWNER, "rowId": 1 }));
        let ok = update(&h, 5, 1, 1, json!("bobby"));
        assert_eq!(ok["result"]["isRowDirty"], true);
        assert_eq!(ok["result"]["cell"]["displayValue"], "bobby");

        let reverted = h.call(
            6,
            methods::EDIT_REVERT_CELL,
            json!({ "ownerUri": OWNER, "rowId": 1, "columnId": 1 }),
        );
        assert_eq!(reverted["result"]["cell"]["displayValue"], "bob");
        assert_eq!(reverted["result"]["isRowDirty"], false);
    }

    #[test]
    fn test_create_row_commit_reads_back_identity() {
        let db = users_db();
        let (h, _service) = ready(&db, 200);

        let created = h.call(1, methods::EDIT_CREATE_ROW, json!({ "ownerUri": OWNER }));
        assert_eq!(created["result"]["newRowId"], 2);
        update(&h, 2, 2, 1, json!("Alice"));

        let commit = h.call(3, methods::EDIT_COMMIT, json!({ "ownerUri": OWNER }));
        let row = &commit["result"]["rows"][0];
        assert_eq!(row["kind"], "create");
        assert_eq!(row["cells"][0]["displayValue"], "3");
        assert_eq!(row["cells"][1]["displayValue"], "Alice");
        assert_eq!(row["cells"][2]["isNull"], true);

        let progress = h.notifications(methods::EDIT_COMMIT_PROGRESS);
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0]["total"], 1);

        let page = subset(&h, 4);
        assert_eq!(page["rowCount"], 3);
        assert_eq!(page["subset"][2]["state"], "clean");
        assert_eq!(page["subset"][2]["cells"][1]["displayValue"], "Alice");
    }

    #[test]
    fn test_commit_failure_keeps_unapplied_edits() {
        let db = users_db();
        let (h, _service) = ready(&db, 200);

        update(&h, 1, 1, 2, json!("bob@example.com"));
        update(&h, 2, 0, 1, Value::Null);
        let commit = h.call(3, methods::EDIT_COMMIT, json!({ "ownerUri": OWNER }));
        let error = &commit["error"];
        assert_eq!(error["code"], COMMIT_FAILED);
        assert_eq!(error["data"]["editIndex"], 1);
        assert_eq!(error["data"]["rowId"], 0);
        assert_eq!(error["data"]["applied"], 1);
        assert!(error["data"]["statement"].as_str().unwrap().starts_with("UPDATE"));

        let page = subset(&h, 4);
        assert_eq!(page["subset"][1]["state"], "clean");
        assert_eq!(page["subset"][1]["cells"][2]["displayValue"], "bob@example.com");
        assert_eq!(page["subset"][0]["state"], "dirtyUpdate");
    }

    #[test]
    fn test_empty_commit_and_dispose() {
        let db = users_db();
        let (h, service) = ready(&db, 200);
        let commit = h.call(1, methods::EDIT_COMMIT, json!({ "ownerUri": OWNER }));
        assert_eq!(commit["result"]["rows"], json!([]));

        let gone = h.call(2, methods::EDIT_DISPOSE, json!({ "ownerUri": OWNER }));
        assert_eq!(gone["result"], json!({}));
        assert_eq!(service.session_count(), 0);
    }
}
