//! Query execution (`query/*`).
//!
//! One query session per owner URI. `executeString` runs every batch on
//! the owner's query connection in a background task; result rows stay
//! buffered in the session until the next execution or `dispose` and are
//! paged out with `subset`.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};

use sqlbridge_engine::{ColumnMeta, DbValue, Driver, DriverError};
use sqlbridge_protocol::connection::ConnectionPurpose;
use sqlbridge_protocol::methods;
use sqlbridge_protocol::query::{
    BatchSummary, CancelResult, DbCellValue, DbColumnInfo, ExecuteStringParams, OwnerParams,
    QueryCompleteParams, QueryMessageParams, ResultMessage, ResultSetSummary, ResultSubset,
    SubsetParams, SubsetResult,
};
use sqlbridge_protocol::EmptyResult;

use crate::dispatcher::{Outbound, RequestContext};
use crate::error::{HostError, SessionError};
use crate::provider::{ProviderError, Service, ServiceProvider};
use crate::services::connection::{self, ConnectionService};
use crate::services::resolve;
use crate::session::SessionMap;
use crate::task::{spawn_task, CancellationToken};

pub const SERVICE_NAME: &str = "query";

const EXECUTE_TASK: &str = "execute";

/// Batch separator: a line holding only `GO`.
const BATCH_SEPARATOR: &str = "GO";

struct StoredResultSet {
    summary: ResultSetSummary,
    rows: Vec<Vec<DbCellValue>>,
}

struct StoredBatch {
    summary: BatchSummary,
    result_sets: Vec<StoredResultSet>,
}

#[derive(Default)]
pub struct QuerySession {
    batches: Vec<StoredBatch>,
}

/// Split on `GO` lines. Blank batches are dropped.
pub fn split_batches(query: &str) -> Vec<String> {
    let mut batches = Vec::new();
    let mut current = String::new();
    for line in query.lines() {
        if line.trim().eq_ignore_ascii_case(BATCH_SEPARATOR) {
            batches.push(std::mem::take(&mut current));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    batches.push(current);
    batches
        .into_iter()
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .collect()
}

fn column_info(column: &ColumnMeta) -> DbColumnInfo {
    DbColumnInfo {
        column_name: column.name.clone(),
        data_type: column.data_type.clone(),
        column_ordinal: column.ordinal,
        is_key: column.is_key,
        is_identity: column.is_identity,
        allow_null: column.is_nullable,
    }
}

fn cell(value: &DbValue) -> DbCellValue {
    DbCellValue {
        display_value: value.display(),
        is_null: value.is_null(),
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

/// Runs the batches of one execution and reports as it goes.
struct Execution<'a> {
    owner_uri: &'a str,
    outbound: &'a Outbound,
    max_rows: usize,
}

impl Execution<'_> {
    fn message(&self, batch_id: usize, is_error: bool, message: impl Into<String>) {
        self.outbound.notify(
            methods::QUERY_MESSAGE,
            &QueryMessageParams {
                owner_uri: self.owner_uri.to_string(),
                message: ResultMessage {
                    batch_id,
                    is_error,
                    time: timestamp(Utc::now()),
                    message: message.into(),
                },
            },
        );
    }

    fn run_batch(&self, driver: &dyn Driver, id: usize, sql: &str, token: &CancellationToken) -> StoredBatch {
        let started = Utc::now();
        let mut result_sets = Vec::new();
        let mut has_error = false;

        if token.is_cancelled() {
            self.message(id, true, "Query was cancelled");
            has_error = true;
        } else {
            match driver.execute(sql, &[]) {
                Ok(result) if !result.columns.is_empty() => {
                    let total = result.rows.len();
                    let rows: Vec<Vec<DbCellValue>> = result
                        .rows
                        .iter()
                        .take(self.max_rows)
                        .map(|row| row.iter().map(cell).collect())
                        .collect();
                    if total > rows.len() {
                        self.message(
                            id,
                            false,
                            format!("Result truncated to {} of {} rows", rows.len(), total),
                        );
                    }
                    self.message(id, false, format!("({} rows)", total));
                    result_sets.push(StoredResultSet {
                        summary: ResultSetSummary {
                            id: 0,
                            batch_id: id,
                            row_count: rows.len() as u64,
                            column_info: result.columns.iter().map(column_info).collect(),
                        },
                        rows,
                    });
                }
                Ok(result) => {
                    self.message(id, false, format!("({} rows affected)", result.rows_affected));
                }
                Err(DriverError::Cancelled) => {
                    self.message(id, true, "Query was cancelled");
                    has_error = true;
                }
                Err(e) => {
                    self.message(id, true, e.to_string());
                    has_error = true;
                }
            }
        }

        let ended = Utc::now();
        StoredBatch {
            summary: BatchSummary {
                id,
                has_error,
                execution_start: timestamp(started),
                execution_end: timestamp(ended),
                execution_elapsed: (ended - started).num_milliseconds(),
                result_set_summaries: result_sets.iter().map(|r| r.summary.clone()).collect(),
            },
            result_sets,
        }
    }

    fn run(&self, driver: &dyn Driver, query: &str, token: &CancellationToken) -> Vec<StoredBatch> {
        let mut batches = Vec::new();
        for (id, sql) in split_batches(query).iter().enumerate() {
            let batch = self.run_batch(driver, id, sql, token);
            let stop = batch.summary.has_error && token.is_cancelled();
            batches.push(batch);
            if stop {
                break;
            }
        }
        batches
    }

    /// A single failed batch carrying `error`.
    fn failed(&self, error: &HostError) -> Vec<StoredBatch> {
        let now = timestamp(Utc::now());
        self.message(0, true, error.to_string());
        vec![StoredBatch {
            summary: BatchSummary {
                id: 0,
                has_error: true,
                execution_start: now.clone(),
                execution_end: now,
                execution_elapsed: 0,
                result_set_summaries: Vec::new(),
            },
            result_sets: Vec::new(),
        }]
    }
}

pub struct QueryService {
    max_rows: usize,
    sessions: SessionMap<QuerySession>,
    connections: OnceLock<Arc<ConnectionService>>,
}

impl QueryService {
    pub fn new(max_rows: usize) -> Self {
        Self {
            max_rows,
            sessions: SessionMap::new(SERVICE_NAME),
            connections: OnceLock::new(),
        }
    }

    pub fn is_executing(&self, owner_uri: &str) -> bool {
        self.sessions.is_running(owner_uri, EXECUTE_TASK)
    }

    fn handle_execute(self: &Arc<Self>, ctx: RequestContext, params: ExecuteStringParams) {
        let ExecuteStringParams { owner_uri, query } = params;
        self.sessions.ensure(&owner_uri, QuerySession::default);
        let ticket = match self.sessions.begin_task(&owner_uri, EXECUTE_TASK) {
            Ok(ticket) => ticket,
            Err(e) => return ctx.send_error(e),
        };
        let outbound = ctx.outbound().clone();
        ctx.send_result(EmptyResult {});

        let service = self.clone();
        let token = ticket.token.clone();
        let (fault_service, fault_ticket) = (self.clone(), ticket.clone());
        let (fault_outbound, fault_owner) = (outbound.clone(), owner_uri.clone());
        // A task that cannot start is reported through its fault handler.
        let _ = spawn_task(
            "query/executeString",
            token,
            move |token| {
                let execution = Execution {
                    owner_uri: &owner_uri,
                    outbound: &outbound,
                    max_rows: service.max_rows,
                };
                let driver = resolve(&service.connections)
                    .and_then(|connections| connections.get_connection(&owner_uri, ConnectionPurpose::Query));
                let batches = match driver {
                    Ok(driver) => execution.run(driver.as_ref(), &query, token),
                    Err(e) => execution.failed(&e),
                };
                let summaries: Vec<BatchSummary> = batches.iter().map(|b| b.summary.clone()).collect();
                if service.sessions.finish_task(&ticket, |s| s.batches = batches) {
                    outbound.notify(
                        methods::QUERY_COMPLETE,
                        &QueryCompleteParams {
                            owner_uri,
                            batch_summaries: summaries,
                        },
                    );
                }
            },
            move |message| {
                let execution = Execution {
                    owner_uri: &fault_owner,
                    outbound: &fault_outbound,
                    max_rows: fault_service.max_rows,
                };
                let batches = execution.failed(&HostError::Internal(message));
                let summaries: Vec<BatchSummary> = batches.iter().map(|b| b.summary.clone()).collect();
                if fault_service.sessions.finish_task(&fault_ticket, |s| s.batches = batches) {
                    fault_outbound.notify(
                        methods::QUERY_COMPLETE,
                        &QueryCompleteParams {
                            owner_uri: fault_owner.clone(),
                            batch_summaries: summaries,
                        },
                    );
                }
            },
        );
    }

    pub fn subset(&self, params: &SubsetParams) -> Result<SubsetResult, HostError> {
        self.sessions.with(&params.owner_uri, |s| {
            let result_set = s
                .batches
                .get(params.batch_index)
                .and_then(|b| b.result_sets.get(params.result_set_index))
                .ok_or_else(|| {
                    HostError::InvalidParams(format!(
                        "no result set {} in batch {}",
                        params.result_set_index, params.batch_index
                    ))
                })?;
            let total = result_set.rows.len() as u64;
            if params.rows_start_index > total {
                return Err(HostError::InvalidParams(format!(
                    "row {} is past the end of the result set ({} rows)",
                    params.rows_start_index, total
                )));
            }
            let rows: Vec<Vec<DbCellValue>> = result_set
                .rows
                .iter()
                .skip(params.rows_start_index as usize)
                .take(params.rows_count as usize)
                .cloned()
                .collect();
            Ok(SubsetResult {
                result_subset: ResultSubset {
                    row_count: rows.len() as u64,
                    rows,
                },
            })
        })?
    }

    /// Signal the running execution and interrupt its statement.
    pub fn cancel(&self, owner_uri: &str) -> Result<CancelResult, HostError> {
        if !self.sessions.cancel_task(owner_uri, EXECUTE_TASK)? {
            return Ok(CancelResult {
                messages: Some("No query is running".to_string()),
            });
        }
        if let Some(driver) = resolve(&self.connections)?.existing(owner_uri, ConnectionPurpose::Query) {
            driver.cancel();
        }
        log::info!("Cancelled query for '{}'", owner_uri);
        Ok(CancelResult { messages: None })
    }

    fn dispose(&self, owner_uri: &str) -> Result<EmptyResult, SessionError> {
        self.sessions.remove(owner_uri)?;
        Ok(EmptyResult {})
    }
}

impl Service for QueryService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn register(self: Arc<Self>, provider: &mut ServiceProvider) -> Result<(), ProviderError> {
        let connections = provider.get::<ConnectionService>(connection::SERVICE_NAME)?;
        let _ = self.connections.set(connections);
        let routes = provider.routes()?;

        let service = self.clone();
        routes.on_request(methods::QUERY_EXECUTE_STRING, move |ctx, params: ExecuteStringParams| {
            service.handle_execute(ctx, params)
        })?;

        let service = self.clone();
        routes.on_request(methods::QUERY_SUBSET, move |ctx, params: SubsetParams| {
            ctx.respond(service.subset(&params))
        })?;

        let service = self.clone();
        routes.on_request(methods::QUERY_CANCEL, move |ctx, params: OwnerParams| {
            ctx.respond(service.cancel(&params.owner_uri))
        })?;

        let service = self.clone();
        routes.on_request(methods::QUERY_DISPOSE, move |ctx, params: OwnerParams| {
            ctx.respond(service.dispose(&params.owner_uri))
        })?;

        Ok(())
    }

    fn shutdown(&self) -> Result<(), HostError> {
        let drained = self.sessions.drain();
        if let Ok(connections) = resolve(&self.connections) {
            for (owner, _) in &drained {
                if let Some(driver) = connections.existing(owner, ConnectionPurpose::Query) {
                    driver.cancel();
                }
            }
        }
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}
