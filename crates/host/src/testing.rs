//! Test helpers: an in-memory client channel and a service harness.

use std::io::{self, Cursor, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};

use sqlbridge_protocol::{Message, Notification, Request, RequestId};

use crate::dispatcher::{Dispatcher, Outbound};
use crate::provider::ServiceProvider;
use crate::transport::{FrameReader, FrameWriter};

const WAIT: Duration = Duration::from_secs(10);

/// Cloneable `Write` sink standing in for the client end of the stream.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Every complete frame written so far, decoded as JSON.
    pub fn frames(&self) -> Vec<Value> {
        let mut reader = FrameReader::new(Cursor::new(self.contents()));
        let mut frames = Vec::new();
        while let Ok(Some(body)) = reader.read_message() {
            if let Ok(value) = serde_json::from_slice(&body) {
                frames.push(value);
            }
        }
        frames
    }

    pub fn wait_for_frames(&self, count: usize) -> Vec<Value> {
        let deadline = Instant::now() + WAIT;
        loop {
            let frames = self.frames();
            if frames.len() >= count || Instant::now() > deadline {
                return frames;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Services wired to an in-memory client.
pub struct Harness {
    pub provider: ServiceProvider,
    pub dispatcher: Dispatcher,
    pub out: SharedBuf,
}

impl Harness {
    pub fn new(register: impl FnOnce(&mut ServiceProvider)) -> Self {
        let out = SharedBuf::new();
        let outbound = Outbound::with_timeout(FrameWriter::new(out.clone()), Duration::from_secs(5));
        let mut provider = ServiceProvider::new(outbound);
        register(&mut provider);
        let dispatcher = provider.take_dispatcher().unwrap();
        Self {
            provider,
            dispatcher,
            out,
        }
    }

    pub fn request(&self, id: i64, method: &str, params: Value) {
        self.dispatcher
            .dispatch(Message::Request(Request::new(RequestId::Number(id), method, Some(params))));
    }

    pub fn notify(&self, method: &str, params: Value) {
        self.dispatcher
            .dispatch(Message::Notification(Notification::new(method, Some(params))));
    }

    /// Wait for the first message matching `pred`.
    pub fn wait_for(&self, pred: impl Fn(&Value) -> bool) -> Value {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(found) = self.out.frames().into_iter().find(|m| pred(m)) {
                return found;
            }
            assert!(Instant::now() < deadline, "timed out; saw {:?}", self.out.frames());
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn response(&self, id: i64) -> Value {
        self.wait_for(|m| m["id"] == json!(id) && m.get("method").is_none())
    }

    /// Request and wait for its response.
    pub fn call(&self, id: i64, method: &str, params: Value) -> Value {
        self.request(id, method, params);
        self.response(id)
    }

    pub fn notification(&self, method: &str, pred: impl Fn(&Value) -> bool) -> Value {
        self.wait_for(|m| m["method"] == method && m.get("id").is_none() && pred(&m["params"]))["params"].clone()
    }

    pub fn notifications(&self, method: &str) -> Vec<Value> {
        self.out
            .frames()
            .into_iter()
            .filter(|m| m["method"] == method && m.get("id").is_none())
            .map(|m| m["params"].clone())
            .collect()
    }
}

pub fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// A SQLite database file with a `users` table (two rows) and a view.
pub fn users_db() -> tempfile::TempDir {
    use sqlbridge_engine::sqlite::SqliteDriver;
    use sqlbridge_engine::Driver;

    let dir = tempfile::tempdir().unwrap();
    let driver = SqliteDriver::open(&db_path(&dir)).unwrap();
    for sql in [
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT)",
        "CREATE VIEW user_names AS SELECT name FROM users",
        "INSERT INTO users (name, email) VALUES ('ada', 'ada@example.com')",
        "INSERT INTO users (name, email) VALUES ('bob', NULL)",
    ] {
        driver.execute(sql, &[]).unwrap();
    }
    dir
}

pub fn db_path(dir: &tempfile::TempDir) -> String {
    dir.path().join("app.db").to_string_lossy().into_owned()
}

/// Provider name of [`FaultyConnector`].
pub const FAULTY: &str = "faulty";

/// Connects fine, then panics inside object listing and statement execution.
pub struct FaultyConnector;

struct FaultyDriver;

impl sqlbridge_engine::Connector for FaultyConnector {
    fn provider(&self) -> &'static str {
        FAULTY
    }

    fn open(
        &self,
        _target: &sqlbridge_engine::ConnectionTarget,
    ) -> Result<Arc<dyn sqlbridge_engine::Driver>, sqlbridge_engine::DriverError> {
        Ok(Arc::new(FaultyDriver))
    }
}

impl sqlbridge_engine::Catalog for FaultyDriver {
    fn list_databases(&self) -> Result<Vec<String>, sqlbridge_engine::DriverError> {
        Ok(vec!["main".to_string()])
    }

    fn list_objects(&self) -> Result<Vec<sqlbridge_engine::ObjectInfo>, sqlbridge_engine::DriverError> {
        panic!("catalog exploded")
    }

    fn describe(
        &self,
        _object: &sqlbridge_engine::ObjectRef,
    ) -> Result<sqlbridge_engine::TableInfo, sqlbridge_engine::DriverError> {
        panic!("catalog exploded")
    }
}

impl sqlbridge_engine::Driver for FaultyDriver {
    fn dialect(&self) -> sqlbridge_engine::Dialect {
        sqlbridge_engine::Dialect::Sqlite
    }

    fn server_version(&self) -> String {
        "faulty 0".to_string()
    }

    fn execute(
        &self,
        _sql: &str,
        _params: &[sqlbridge_engine::DbValue],
    ) -> Result<sqlbridge_engine::QueryResult, sqlbridge_engine::DriverError> {
        panic!("driver exploded")
    }

    fn cancel(&self) {}

    fn catalog(&self) -> &dyn sqlbridge_engine::Catalog {
        self
    }
}

/// Built-in connectors plus [`FaultyConnector`].
pub fn faulty_registry() -> crate::services::connection::ConnectorRegistry {
    let mut registry = crate::services::connection::ConnectorRegistry::with_defaults();
    registry.register(Arc::new(FaultyConnector));
    registry
}
