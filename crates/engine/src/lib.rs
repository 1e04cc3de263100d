//! Database engine for the sqlbridge host.
//!
//! Everything here is synchronous and free of protocol concerns: drivers
//! execute SQL, templaters render dialect-specific statements, and the
//! edit module stages and commits row edits.

pub mod ddl;
pub mod driver;
pub mod edit;
pub mod sqlite;
pub mod templater;
pub mod value;

pub use driver::{
    Catalog, ColumnMeta, ConnectionTarget, Connector, Driver, DriverError, ForeignKeyInfo,
    ObjectInfo, ObjectKind, ObjectRef, QueryResult, TableInfo,
};
pub use templater::{Dialect, Templater};
pub use value::DbValue;
