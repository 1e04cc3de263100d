//! Per-feature session maps.
//!
//! Every feature keeps its sessions in a [`SessionMap`]: key → state,
//! running task kinds, generation and a feature payload, all behind one
//! mutex. The lock is held only for membership checks, state transitions
//! and payload updates; callers never hold it across a database call.
//!
//! Tasks get a [`TaskTicket`] when they are marked. A completion whose
//! ticket no longer matches (session closed, or replaced by a newer one
//! with the same key) is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::SessionError;
use crate::task::CancellationToken;

/// Task kind marked while a session initializes.
pub const INITIALIZE_TASK: &str = "initialize";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Ready,
    Busy,
    Closed,
}

/// What happens to a session whose initialization failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitFailurePolicy {
    /// Roll back to absent; the key can be created again.
    Remove,
    /// Keep the entry as `Closed`; operations report not-ready and the key
    /// stays taken until the client closes it.
    Close,
}

/// Proof that a task of `kind` was marked on `key`.
#[derive(Debug, Clone)]
pub struct TaskTicket {
    pub key: String,
    pub kind: String,
    pub generation: u64,
    pub token: CancellationToken,
}

/// Outcome of [`SessionMap::retrieve`].
#[derive(Debug)]
pub enum Retrieval<R> {
    Cached(R),
    Started(TaskTicket),
}

struct Entry<S> {
    state: SessionState,
    generation: u64,
    tasks: HashMap<String, CancellationToken>,
    payload: S,
}

impl<S> Entry<S> {
    fn settle(&mut self) {
        if self.state == SessionState::Busy && self.tasks.is_empty() {
            self.state = SessionState::Ready;
        }
    }
}

pub struct SessionMap<S> {
    feature: &'static str,
    entries: Mutex<HashMap<String, Entry<S>>>,
    next_generation: AtomicU64,
}

impl<S> SessionMap<S> {
    pub fn new(feature: &'static str) -> Self {
        Self {
            feature,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn ticket(key: &str, kind: &str, generation: u64, token: CancellationToken) -> TaskTicket {
        TaskTicket {
            key: key.to_string(),
            kind: kind.to_string(),
            generation,
            token,
        }
    }

    /// Insert `key` as `Initializing` with the initialize task marked. Any
    /// existing session with that key, closed or not, is left untouched.
    pub fn create(&self, key: &str, payload: S) -> Result<TaskTicket, SessionError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Err(SessionError::AlreadyExists(key.to_string()));
        }

        let generation = self.generation();
        let token = CancellationToken::new();
        let mut tasks = HashMap::new();
        tasks.insert(INITIALIZE_TASK.to_string(), token.clone());
        entries.insert(
            key.to_string(),
            Entry {
                state: SessionState::Initializing,
                generation,
                tasks,
                payload,
            },
        );
        log::debug!("[{}] session '{}' created", self.feature, key);
        Ok(Self::ticket(key, INITIALIZE_TASK, generation, token))
    }

    /// Insert `key` as `Ready` if absent. Returns whether it was inserted.
    pub fn ensure(&self, key: &str, make: impl FnOnce() -> S) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return false;
        }
        let generation = self.generation();
        entries.insert(
            key.to_string(),
            Entry {
                state: SessionState::Ready,
                generation,
                tasks: HashMap::new(),
                payload: make(),
            },
        );
        true
    }

    /// Insert or replace `key` as `Ready`. Tasks of a replaced session are
    /// discarded when they complete.
    pub fn insert_ready(&self, key: &str, payload: S) -> Option<S> {
        let generation = self.generation();
        let previous = self.entries.lock().insert(
            key.to_string(),
            Entry {
                state: SessionState::Ready,
                generation,
                tasks: HashMap::new(),
                payload,
            },
        );
        previous.map(|e| e.payload)
    }

    /// Finish initialization successfully. Returns `false` (and leaves the
    /// map alone) if the session was closed or replaced meanwhile.
    pub fn complete_init(&self, ticket: &TaskTicket, update: impl FnOnce(&mut S)) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&ticket.key) {
            Some(entry) if entry.generation == ticket.generation => {
                entry.tasks.remove(INITIALIZE_TASK);
                update(&mut entry.payload);
                entry.state = if entry.tasks.is_empty() {
                    SessionState::Ready
                } else {
                    SessionState::Busy
                };
                true
            }
            _ => {
                log::debug!(
                    "[{}] discarding initialization of '{}' (session gone)",
                    self.feature,
                    ticket.key
                );
                false
            }
        }
    }

    /// Apply the failure policy to a session whose initialization failed.
    pub fn fail_init(&self, ticket: &TaskTicket, policy: InitFailurePolicy) -> bool {
        let mut entries = self.entries.lock();
        let current = matches!(entries.get(&ticket.key), Some(e) if e.generation == ticket.generation);
        if !current {
            return false;
        }
        match policy {
            InitFailurePolicy::Remove => {
                entries.remove(&ticket.key);
            }
            InitFailurePolicy::Close => {
                if let Some(entry) = entries.get_mut(&ticket.key) {
                    entry.tasks.remove(INITIALIZE_TASK);
                    entry.state = SessionState::Closed;
                }
            }
        }
        log::debug!(
            "[{}] initialization of '{}' failed ({:?})",
            self.feature,
            ticket.key,
            policy
        );
        true
    }

    fn mark(entry: &mut Entry<S>, key: &str, kind: &str) -> Result<TaskTicket, SessionError> {
        match entry.state {
            SessionState::Initializing | SessionState::Closed => {
                return Err(SessionError::NotReady(key.to_string()))
            }
            SessionState::Ready | SessionState::Busy => {}
        }
        if entry.tasks.contains_key(kind) {
            return Err(SessionError::OperationInProgress {
                key: key.to_string(),
                kind: kind.to_string(),
            });
        }
        let token = CancellationToken::new();
        entry.tasks.insert(kind.to_string(), token.clone());
        entry.state = SessionState::Busy;
        Ok(Self::ticket(key, kind, entry.generation, token))
    }

    /// Check-and-mark: fails if a task of `kind` is already running.
    pub fn begin_task(&self, key: &str, kind: &str) -> Result<TaskTicket, SessionError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))?;
        Self::mark(entry, key, kind)
    }

    /// Return the cached value if `cached` finds one, otherwise mark a task
    /// of `kind`. Both happen under one lock acquisition.
    pub fn retrieve<R>(
        &self,
        key: &str,
        kind: &str,
        cached: impl FnOnce(&S) -> Option<R>,
    ) -> Result<Retrieval<R>, SessionError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))?;
        if matches!(entry.state, SessionState::Initializing | SessionState::Closed) {
            return Err(SessionError::NotReady(key.to_string()));
        }
        if let Some(value) = cached(&entry.payload) {
            return Ok(Retrieval::Cached(value));
        }
        Self::mark(entry, key, kind).map(Retrieval::Started)
    }

    /// Clear the task mark and apply `update`. Returns `false` if the
    /// completion is stale and was discarded.
    pub fn finish_task(&self, ticket: &TaskTicket, update: impl FnOnce(&mut S)) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&ticket.key) {
            Some(entry) if entry.generation == ticket.generation => {
                entry.tasks.remove(&ticket.kind);
                update(&mut entry.payload);
                entry.settle();
                true
            }
            _ => {
                log::debug!(
                    "[{}] discarding '{}' completion for '{}' (session gone)",
                    self.feature,
                    ticket.kind,
                    ticket.key
                );
                false
            }
        }
    }

    /// Signal the token of a running task. Returns whether one was running.
    pub fn cancel_task(&self, key: &str, kind: &str) -> Result<bool, SessionError> {
        let entries = self.entries.lock();
        let entry = entries
            .get(key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))?;
        Ok(match entry.tasks.get(kind) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        })
    }

    pub fn is_running(&self, key: &str, kind: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .map(|e| e.tasks.contains_key(kind))
            .unwrap_or(false)
    }

    pub fn state(&self, key: &str) -> Option<SessionState> {
        self.entries.lock().get(key).map(|e| e.state)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn with<R>(&self, key: &str, f: impl FnOnce(&S) -> R) -> Result<R, SessionError> {
        let entries = self.entries.lock();
        let entry = entries
            .get(key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))?;
        Ok(f(&entry.payload))
    }

    pub fn with_mut<R>(&self, key: &str, f: impl FnOnce(&mut S) -> R) -> Result<R, SessionError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))?;
        Ok(f(&mut entry.payload))
    }

    /// Mutate the payload of an initialized session, refusing while any task
    /// kind in `blocked_by` is running.
    pub fn with_ready_mut<R>(
        &self,
        key: &str,
        blocked_by: &[&str],
        f: impl FnOnce(&mut S) -> R,
    ) -> Result<R, SessionError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))?;
        if matches!(entry.state, SessionState::Initializing | SessionState::Closed) {
            return Err(SessionError::NotReady(key.to_string()));
        }
        if let Some(kind) = blocked_by.iter().find(|k| entry.tasks.contains_key(**k)) {
            return Err(SessionError::OperationInProgress {
                key: key.to_string(),
                kind: kind.to_string(),
            });
        }
        Ok(f(&mut entry.payload))
    }

    /// Remove `key`. Running tasks are not cancelled; their completions are
    /// discarded.
    pub fn remove(&self, key: &str) -> Result<S, SessionError> {
        let removed = self.entries.lock().remove(key);
        match removed {
            Some(entry) => {
                log::debug!("[{}] session '{}' closed", self.feature, key);
                Ok(entry.payload)
            }
            None => Err(SessionError::NotFound(key.to_string())),
        }
    }

    /// Remove every session and cancel its tasks. Used at host shutdown.
    pub fn drain(&self) -> Vec<(String, S)> {
        let drained: Vec<(String, Entry<S>)> = self.entries.lock().drain().collect();
        drained
            .into_iter()
            .map(|(key, entry)| {
                for token in entry.tasks.values() {
                    token.cancel();
                }
                (key, entry.payload)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_map() -> SessionMap<Option<String>> {
        let map = SessionMap::new("test");
        let ticket = map.create("s1", None).unwrap();
        assert!(map.complete_init(&ticket, |_| {}));
        map
    }

    #[test]
    fn test_create_duplicate_leaves_map_unchanged() {
        let map: SessionMap<u32> = SessionMap::new("test");
        map.create("s1", 1).unwrap();

        let err = map.create("s1", 2).unwrap_err();
        assert_eq!(err, SessionError::AlreadyExists("s1".into()));
        assert_eq!(map.len(), 1);
        assert_eq!(map.with("s1", |v| *v).unwrap(), 1);
        assert_eq!(map.state("s1"), Some(SessionState::Initializing));
    }

    #[test]
    fn test_close_removes_only_that_key() {
        let map: SessionMap<u32> = SessionMap::new("test");
        map.create("a", 1).unwrap();
        map.create("b", 2).unwrap();

        assert_eq!(map.remove("a").unwrap(), 1);
        assert_eq!(map.keys(), vec!["b".to_string()]);

        assert_eq!(map.remove("a").unwrap_err(), SessionError::NotFound("a".into()));
        assert_eq!(map.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn test_second_retrieve_reports_in_progress() {
        let map = ready_map();

        let first = map.retrieve("s1", "getSchemaModel", |s| s.clone()).unwrap();
        let ticket = match first {
            Retrieval::Started(ticket) => ticket,
            Retrieval::Cached(_) => panic!("nothing cached yet"),
        };
        assert_eq!(map.state("s1"), Some(SessionState::Busy));

        let second = map.retrieve("s1", "getSchemaModel", |s| s.clone()).unwrap_err();
        assert!(matches!(second, SessionError::OperationInProgress { ref kind, .. } if kind == "getSchemaModel"));

        assert!(map.finish_task(&ticket, |s| *s = Some("model".into())));
        assert_eq!(map.state("s1"), Some(SessionState::Ready));

        match map.retrieve("s1", "getSchemaModel", |s| s.clone()).unwrap() {
            Retrieval::Cached(v) => assert_eq!(v, "model"),
            Retrieval::Started(_) => panic!("expected cached value"),
        }
    }

    #[test]
    fn test_operations_before_ready() {
        let map: SessionMap<u32> = SessionMap::new("test");
        map.create("s1", 0).unwrap();
        assert_eq!(
            map.begin_task("s1", "work").unwrap_err(),
            SessionError::NotReady("s1".into())
        );
        assert_eq!(
            map.begin_task("nope", "work").unwrap_err(),
            SessionError::NotFound("nope".into())
        );
    }

    #[test]
    fn test_stale_completion_discarded_after_close() {
        let map = ready_map();
        let ticket = map.begin_task("s1", "expand").unwrap();
        map.remove("s1").unwrap();

        assert!(!map.finish_task(&ticket, |_| panic!("must not run")));
        assert!(!ticket.token.is_cancelled());
        assert!(map.is_empty());
    }

    #[test]
    fn test_stale_completion_discarded_after_recreate() {
        let map: SessionMap<u32> = SessionMap::new("test");
        let old = map.create("s1", 1).unwrap();
        map.remove("s1").unwrap();
        let new = map.create("s1", 2).unwrap();

        assert!(!map.complete_init(&old, |v| *v = 100));
        assert!(map.complete_init(&new, |v| *v += 1));
        assert_eq!(map.with("s1", |v| *v).unwrap(), 3);
    }

    #[test]
    fn test_init_failure_policies() {
        let map: SessionMap<u32> = SessionMap::new("test");
        let ticket = map.create("gone", 0).unwrap();
        assert!(map.fail_init(&ticket, InitFailurePolicy::Remove));
        assert!(!map.contains("gone"));

        let ticket = map.create("kept", 0).unwrap();
        assert!(map.fail_init(&ticket, InitFailurePolicy::Close));
        assert_eq!(map.state("kept"), Some(SessionState::Closed));
        assert_eq!(
            map.begin_task("kept", "x").unwrap_err(),
            SessionError::NotReady("kept".into())
        );

    }

    #[test]
    fn test_closed_session_keeps_its_key_until_removed() {
        let map: SessionMap<u32> = SessionMap::new("test");
        let ticket = map.create("k", 1).unwrap();
        assert!(map.fail_init(&ticket, InitFailurePolicy::Close));

        let err = map.create("k", 2).unwrap_err();
        assert_eq!(err, SessionError::AlreadyExists("k".into()));
        assert_eq!(map.with("k", |v| *v).unwrap(), 1);
        assert_eq!(map.state("k"), Some(SessionState::Closed));

        assert_eq!(map.remove("k").unwrap(), 1);
        map.create("k", 2).unwrap();
        assert_eq!(map.state("k"), Some(SessionState::Initializing));
    }

    #[test]
    fn test_with_ready_mut_blocked_by_running_task() {
        let map = ready_map();
        let ticket = map.begin_task("s1", "commit").unwrap();

        let err = map.with_ready_mut("s1", &["commit"], |_| ()).unwrap_err();
        assert!(matches!(err, SessionError::OperationInProgress { .. }));
        assert!(map.with_ready_mut("s1", &[], |_| ()).is_ok());

        map.finish_task(&ticket, |_| {});
        assert!(map.with_ready_mut("s1", &["commit"], |_| ()).is_ok());
    }

    #[test]
    fn test_cancel_and_drain() {
        let map = ready_map();
        let ticket = map.begin_task("s1", "execute").unwrap();
        assert!(map.cancel_task("s1", "execute").unwrap());
        assert!(ticket.token.is_cancelled());
        assert!(!map.cancel_task("s1", "other").unwrap());

        let other = map.begin_task("s1", "other").unwrap();
        let drained = map.drain();
        assert_eq!(drained.len(), 1);
        assert!(other.token.is_cancelled());
        assert!(map.is_empty());
    }

    #[test]
    fn test_concurrent_creates_single_winner() {
        use std::sync::Arc;
        use std::thread;

        let map: Arc<SessionMap<usize>> = Arc::new(SessionMap::new("test"));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let map = map.clone();
                thread::spawn(move || map.create("same", i).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(map.len(), 1);
    }
}
