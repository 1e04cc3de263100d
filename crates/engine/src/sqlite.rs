//! Bundled SQLite driver (rusqlite).
//!
//! One `Connection` per driver, guarded by a mutex. Cancellation goes through
//! the connection's interrupt handle, which is safe to call from any thread
//! while a statement holds the lock.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, InterruptHandle, Params, Row};

use crate::driver::{
    Catalog, ColumnMeta, ConnectionTarget, Connector, Driver, DriverError, ForeignKeyInfo,
    ObjectInfo, ObjectKind, ObjectRef, QueryResult, TableInfo,
};
use crate::templater::Dialect;
use crate::value::DbValue;

/// SQLite has a single schema namespace per attached database; we only
/// expose the primary one.
pub const MAIN_SCHEMA: &str = "main";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteConnector;

impl Connector for SqliteConnector {
    fn provider(&self) -> &'static str {
        "sqlite"
    }

    fn open(&self, target: &ConnectionTarget) -> Result<Arc<dyn Driver>, DriverError> {
        // Clients that only fill in the server field still get a database.
        let path = if target.database.is_empty() {
            target.server.as_str()
        } else {
            target.database.as_str()
        };
        if path.is_empty() {
            return Err(DriverError::Connection("no database file given".to_string()));
        }
        Ok(Arc::new(SqliteDriver::open(path)?))
    }
}

pub struct SqliteDriver {
    conn: Mutex<Connection>,
    interrupt: InterruptHandle,
}

impl SqliteDriver {
    pub fn open(path: &str) -> Result<Self, DriverError> {
        let conn = Connection::open(path)
            .map_err(|e| DriverError::Connection(format!("{}: {}", path, e)))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, DriverError> {
        Self::open(":memory:")
    }

    fn from_connection(conn: Connection) -> Result<Self, DriverError> {
        let setup = |e: rusqlite::Error| DriverError::Connection(e.to_string());
        conn.busy_timeout(BUSY_TIMEOUT).map_err(setup)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(setup)?;
        let interrupt = conn.get_interrupt_handle();
        Ok(Self {
            conn: Mutex::new(conn),
            interrupt,
        })
    }

    fn query_rows<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>, DriverError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(driver_error)?;
        let rows = stmt.query_map(params, f).map_err(driver_error)?;
        let collected = rows.collect::<Result<Vec<_>, _>>().map_err(driver_error);
        collected
    }
}

fn driver_error(err: rusqlite::Error) -> DriverError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::OperationInterrupted => {
            DriverError::Cancelled
        }
        _ => DriverError::Execution(err.to_string()),
    }
}

fn decode(value: ValueRef<'_>) -> DbValue {
    match value {
        ValueRef::Null => DbValue::Null,
        ValueRef::Integer(i) => DbValue::Integer(i),
        ValueRef::Real(f) => DbValue::Real(f),
        ValueRef::Text(t) => DbValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => DbValue::Blob(b.to_vec()),
    }
}

impl ToSql for DbValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            DbValue::Null => ToSqlOutput::Owned(Value::Null),
            DbValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            DbValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            DbValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            DbValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            DbValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn total_changes(conn: &Connection) -> Result<i64, DriverError> {
    conn.query_row("SELECT total_changes()", [], |row| row.get(0))
        .map_err(driver_error)
}

impl Driver for SqliteDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn server_version(&self) -> String {
        format!("SQLite {}", rusqlite::version())
    }

    fn execute(&self, sql: &str, params: &[DbValue]) -> Result<QueryResult, DriverError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(driver_error)?;
        let mut columns: Vec<ColumnMeta> = stmt
            .column_names()
            .into_iter()
            .enumerate()
            .map(|(i, name)| ColumnMeta::named(name, i))
            .collect();
        let readonly = stmt.readonly();
        let changes_before = if readonly { 0 } else { total_changes(&conn)? };

        let mut out = Vec::new();
        let mut rows = stmt.query(params_from_iter(params.iter())).map_err(driver_error)?;
        while let Some(row) = rows.next().map_err(driver_error)? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(decode(row.get_ref(i).map_err(driver_error)?));
            }
            out.push(values);
        }
        drop(rows);

        // No declared types without a table; report the first non-null storage class.
        for (i, column) in columns.iter_mut().enumerate() {
            if let Some(v) = out.iter().map(|r| &r[i]).find(|v| !v.is_null()) {
                column.data_type = v.type_name().to_string();
            }
        }

        // changes() keeps the count of the last DML statement, so only trust
        // it when this statement moved the running total.
        let (rows_affected, last_insert_id) = if readonly || total_changes(&conn)? == changes_before {
            (0, None)
        } else {
            (conn.changes(), Some(conn.last_insert_rowid()))
        };

        Ok(QueryResult {
            columns,
            rows: out,
            rows_affected,
            last_insert_id,
        })
    }

    fn cancel(&self) {
        self.interrupt.interrupt();
    }

    fn catalog(&self) -> &dyn Catalog {
        self
    }
}

impl Catalog for SqliteDriver {
    fn list_databases(&self) -> Result<Vec<String>, DriverError> {
        self.query_rows("SELECT name FROM pragma_database_list ORDER BY seq", [], |row| {
            row.get::<_, String>(0)
        })
    }

    fn list_objects(&self) -> Result<Vec<ObjectInfo>, DriverError> {
        self.query_rows(
            "SELECT name, type FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY type, name",
            [],
            |row| {
                let name: String = row.get(0)?;
                let kind: String = row.get(1)?;
                Ok(ObjectInfo {
                    object: ObjectRef::new(MAIN_SCHEMA, name),
                    kind: if kind == "view" {
                        ObjectKind::View
                    } else {
                        ObjectKind::Table
                    },
                })
            },
        )
    }

    fn describe(&self, object: &ObjectRef) -> Result<TableInfo, DriverError> {
        let kinds = self.query_rows(
            "SELECT type FROM sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
            params![object.name],
            |row| row.get::<_, String>(0),
        )?;
        let kind = match kinds.first().map(String::as_str) {
            Some("view") => ObjectKind::View,
            Some(_) => ObjectKind::Table,
            None => return Err(DriverError::ObjectNotFound(object.qualified())),
        };

        let raw = self.query_rows(
            "SELECT cid, name, type, \"notnull\", dflt_value, pk \
             FROM pragma_table_info(?1) ORDER BY cid",
            params![object.name],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    row.get::<_, i64>(3)? != 0,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )?;

        // A lone INTEGER PRIMARY KEY aliases the rowid and is server-assigned.
        let pk_count = raw.iter().filter(|c| c.5 > 0).count();
        let columns = raw
            .into_iter()
            .map(|(cid, name, data_type, not_null, default_value, pk)| {
                let is_identity = pk > 0 && pk_count == 1 && data_type.eq_ignore_ascii_case("INTEGER");
                ColumnMeta {
                    name,
                    data_type,
                    ordinal: cid as usize,
                    is_key: pk > 0,
                    is_identity,
                    is_nullable: !not_null && pk == 0,
                    default_value,
                }
            })
            .collect();

        let fk_rows = self.query_rows(
            "SELECT id, \"table\", \"from\", \"to\" \
             FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
            params![object.name],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )?;

        let mut foreign_keys: Vec<(i64, ForeignKeyInfo)> = Vec::new();
        for (id, table, from, to) in fk_rows {
            match foreign_keys.last_mut() {
                Some((last_id, fk)) if *last_id == id => {
                    fk.columns.push(from);
                    fk.referenced_columns.push(to.unwrap_or_default());
                }
                _ => foreign_keys.push((
                    id,
                    ForeignKeyInfo {
                        name: format!("fk_{}_{}", object.name, id),
                        columns: vec![from],
                        referenced: ObjectRef::new(MAIN_SCHEMA, table),
                        referenced_columns: vec![to.unwrap_or_default()],
                    },
                )),
            }
        }

        Ok(TableInfo {
            object: ObjectRef::new(MAIN_SCHEMA, object.name.clone()),
            kind,
            columns,
            foreign_keys: foreign_keys.into_iter().map(|(_, fk)| fk).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn driver_with_users() -> SqliteDriver {
        let driver = SqliteDriver::open_in_memory().unwrap();
        driver
            .execute(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL DEFAULT 0)",
                &[],
            )
            .unwrap();
        driver
    }

    #[test]
    fn test_execute_insert_returning() {
        let driver = driver_with_users();
        let result = driver
            .execute(
                "INSERT INTO users(name) VALUES(?) RETURNING *",
                &[DbValue::Text("Alice".into())],
            )
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][0], DbValue::Integer(1));
        assert_eq!(result.rows[0][1], DbValue::Text("Alice".into()));
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.last_insert_id, Some(1));
        assert_eq!(result.columns[1].name, "name");
    }

    #[test]
    fn test_select_is_readonly() {
        let driver = driver_with_users();
        let result = driver.execute("SELECT * FROM users", &[]).unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(result.rows_affected, 0);
        assert_eq!(result.last_insert_id, None);
        assert_eq!(result.columns.len(), 3);
    }

    #[test]
    fn test_ddl_after_dml_reports_no_rows_affected() {
        let driver = driver_with_users();
        let insert = driver
            .execute("INSERT INTO users(name) VALUES('a'), ('b'), ('c')", &[])
            .unwrap();
        assert_eq!(insert.rows_affected, 3);

        let ddl = driver.execute("CREATE TABLE audit (id INTEGER PRIMARY KEY)", &[]).unwrap();
        assert_eq!(ddl.rows_affected, 0);
        assert_eq!(ddl.last_insert_id, None);

        let update = driver.execute("UPDATE users SET score = 1 WHERE name <> 'a'", &[]).unwrap();
        assert_eq!(update.rows_affected, 2);
    }

    #[test]
    fn test_execution_error_text() {
        let driver = driver_with_users();
        let err = driver.execute("SELECT nope FROM users", &[]).unwrap_err();
        match err {
            DriverError::Execution(msg) => assert!(msg.contains("nope"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_describe_identity_and_keys() {
        let driver = driver_with_users();
        let info = driver.describe(&ObjectRef::new("main", "users")).unwrap();
        assert_eq!(info.kind, ObjectKind::Table);
        assert_eq!(info.columns.len(), 3);
        assert!(info.columns[0].is_identity);
        assert!(info.columns[0].is_key);
        assert!(!info.columns[1].is_nullable);
        assert_eq!(info.columns[2].default_value.as_deref(), Some("0"));
    }

    #[test]
    fn test_describe_composite_key_has_no_identity() {
        let driver = SqliteDriver::open_in_memory().unwrap();
        driver
            .execute("CREATE TABLE pairs (a INTEGER, b INTEGER, PRIMARY KEY (a, b))", &[])
            .unwrap();
        let info = driver.describe(&ObjectRef::new("main", "pairs")).unwrap();
        assert!(info.columns.iter().all(|c| c.is_key && !c.is_identity));
    }

    #[test]
    fn test_describe_missing_object() {
        let driver = driver_with_users();
        let err = driver.describe(&ObjectRef::new("main", "ghost")).unwrap_err();
        assert!(matches!(err, DriverError::ObjectNotFound(name) if name == "main.ghost"));
    }

    #[test]
    fn test_foreign_keys_grouped() {
        let driver = driver_with_users();
        driver
            .execute(
                "CREATE TABLE posts (id INTEGER PRIMARY KEY, author INTEGER REFERENCES users(id))",
                &[],
            )
            .unwrap();
        let info = driver.describe(&ObjectRef::new("main", "posts")).unwrap();
        assert_eq!(info.foreign_keys.len(), 1);
        assert_eq!(info.foreign_keys[0].columns, vec!["author".to_string()]);
        assert_eq!(info.foreign_keys[0].referenced.name, "users");
        assert_eq!(info.foreign_keys[0].referenced_columns, vec!["id".to_string()]);
    }

    #[test]
    fn test_list_objects_and_schema_model() {
        let driver = driver_with_users();
        driver.execute("CREATE VIEW named AS SELECT name FROM users", &[]).unwrap();
        let objects = driver.list_objects().unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].kind, ObjectKind::Table);
        assert_eq!(objects[1].kind, ObjectKind::View);

        let model = driver.schema_model().unwrap();
        assert_eq!(model.len(), 1);
        assert_eq!(model[0].object.name, "users");
        assert_eq!(driver.list_databases().unwrap(), vec!["main".to_string()]);
    }

    #[test]
    fn test_cancel_interrupts_running_statement() {
        let driver = Arc::new(SqliteDriver::open_in_memory().unwrap());
        let worker = {
            let driver = Arc::clone(&driver);
            thread::spawn(move || {
                driver.execute(
                    "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                     SELECT count(*) FROM c",
                    &[],
                )
            })
        };
        // Interrupting an idle connection is a no-op, so keep poking until it lands.
        while !worker.is_finished() {
            driver.cancel();
            thread::sleep(Duration::from_millis(10));
        }
        let result = worker.join().unwrap();
        assert!(matches!(result, Err(DriverError::Cancelled)));
    }

    #[test]
    fn test_connector_requires_path() {
        let err = SqliteConnector.open(&ConnectionTarget::default()).err().unwrap();
        assert!(matches!(err, DriverError::Connection(_)));
    }
}
