//! Driver capability: the seam between the host and a concrete database.
//!
//! A [`Connector`] opens connections for one provider name. The resulting
//! [`Driver`] executes parameterized SQL and exposes a [`Catalog`] for
//! metadata. Drivers are shared across threads behind `Arc`; each
//! implementation serializes access to its underlying connection itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::templater::Dialect;
use crate::value::DbValue;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("{0}")]
    Execution(String),

    #[error("statement cancelled")]
    Cancelled,

    #[error("no driver registered for provider '{0}'")]
    UnknownProvider(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),
}

/// Column description. Result-set columns only carry `name`/`ordinal` (and
/// `data_type` when known); catalog columns fill in the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: String,
    pub ordinal: usize,
    pub is_key: bool,
    pub is_identity: bool,
    pub is_nullable: bool,
    pub default_value: Option<String>,
}

impl ColumnMeta {
    pub fn named(name: impl Into<String>, ordinal: usize) -> Self {
        Self {
            name: name.into(),
            data_type: String::new(),
            ordinal,
            is_key: false,
            is_identity: false,
            is_nullable: true,
            default_value: None,
        }
    }

    /// Identity columns are assigned by the server and never written by edits.
    pub fn is_updatable(&self) -> bool {
        !self.is_identity
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<DbValue>>,
    pub rows_affected: u64,
    /// Server-assigned id of the last inserted row, when the driver knows it.
    pub last_insert_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub schema: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// `schema.name`, or `name` when the schema is empty.
    pub fn qualified(&self) -> String {
        if self.schema.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    View,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Table => "table",
            ObjectKind::View => "view",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub object: ObjectRef,
    pub kind: ObjectKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced: ObjectRef,
    pub referenced_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub object: ObjectRef,
    pub kind: ObjectKind,
    pub columns: Vec<ColumnMeta>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
}

/// Metadata queries. The query text is dialect-specific and lives with the
/// driver.
pub trait Catalog: Send + Sync {
    fn list_databases(&self) -> Result<Vec<String>, DriverError>;

    /// Tables and views, ordered by kind then name.
    fn list_objects(&self) -> Result<Vec<ObjectInfo>, DriverError>;

    fn describe(&self, object: &ObjectRef) -> Result<TableInfo, DriverError>;

    /// Every table, fully described.
    fn schema_model(&self) -> Result<Vec<TableInfo>, DriverError> {
        let mut tables = Vec::new();
        for info in self.list_objects()? {
            if info.kind == ObjectKind::Table {
                tables.push(self.describe(&info.object)?);
            }
        }
        Ok(tables)
    }
}

pub trait Driver: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn server_version(&self) -> String;

    fn execute(&self, sql: &str, params: &[DbValue]) -> Result<QueryResult, DriverError>;

    /// Interrupt the statement currently executing, if any. Must not block on
    /// the statement itself.
    fn cancel(&self);

    fn catalog(&self) -> &dyn Catalog;
}

/// Where to connect. Built by the host from client connection details.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionTarget {
    pub server: String,
    pub port: Option<u16>,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub access_token: Option<String>,
    pub options: BTreeMap<String, String>,
}

pub trait Connector: Send + Sync {
    /// Provider name clients put in their connection details.
    fn provider(&self) -> &'static str;

    fn open(&self, target: &ConnectionTarget) -> Result<Arc<dyn Driver>, DriverError>;
}
