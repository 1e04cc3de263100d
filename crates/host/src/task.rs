//! Background tasks: a named thread, a cooperative cancellation token and a
//! panic boundary.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::HostError;

/// Shared flag checked by long-running work between steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct TaskHandle {
    name: String,
    token: CancellationToken,
    join: JoinHandle<bool>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task. Returns `false` if the work panicked.
    pub fn join(self) -> bool {
        self.join.join().unwrap_or(false)
    }
}

/// Run `work` on its own thread. A panic in `work`, or a thread that could
/// not be started, is logged and handed to `on_fault` so the owner can clear
/// its session mark and answer whoever is waiting on the result.
pub fn spawn_task<W, P>(
    name: &str,
    token: CancellationToken,
    work: W,
    on_fault: P,
) -> Result<TaskHandle, HostError>
where
    W: FnOnce(&CancellationToken) + Send + 'static,
    P: FnOnce(String) + Send + 'static,
{
    let fault = Arc::new(Mutex::new(Some(on_fault)));
    let task_fault = fault.clone();
    let task_name = name.to_string();
    let task_token = token.clone();
    let spawned = thread::Builder::new()
        .name(format!("task:{}", name))
        .spawn(move || {
            match panic::catch_unwind(AssertUnwindSafe(|| work(&task_token))) {
                Ok(()) => true,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    log::error!("Task '{}' panicked: {}", task_name, message);
                    let on_fault = task_fault.lock().take();
                    if let Some(on_fault) = on_fault {
                        on_fault(message);
                    }
                    false
                }
            }
        });

    match spawned {
        Ok(join) => Ok(TaskHandle {
            name: name.to_string(),
            token,
            join,
        }),
        Err(e) => Err(start_failed(name, e, &fault)),
    }
}

fn start_failed<P: FnOnce(String)>(name: &str, error: io::Error, fault: &Mutex<Option<P>>) -> HostError {
    let message = format!("failed to start task '{}': {}", name, error);
    log::error!("{}", message);
    let on_fault = fault.lock().take();
    if let Some(on_fault) = on_fault {
        on_fault(message.clone());
    }
    HostError::Internal(message)
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_task_runs_and_sees_cancellation() {
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();

        let handle = spawn_task(
            "wait",
            token.clone(),
            move |token| {
                go_rx.recv().unwrap();
                tx.send(token.is_cancelled()).unwrap();
            },
            |_| {},
        )
        .unwrap();

        token.cancel();
        go_tx.send(()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(handle.join());
    }

    #[test]
    fn test_panic_is_contained() {
        let (tx, rx) = mpsc::channel();
        let handle = spawn_task(
            "boom",
            CancellationToken::new(),
            |_| panic!("driver exploded"),
            move |message| tx.send(message).unwrap(),
        )
        .unwrap();

        assert!(!handle.join());
        assert_eq!(rx.recv().unwrap(), "driver exploded");
    }

    #[test]
    fn test_start_failure_goes_to_fault_handler_once() {
        let (tx, rx) = mpsc::channel();
        let fault = Mutex::new(Some(move |message: String| tx.send(message).unwrap()));

        let err = start_failed("expand", io::Error::new(io::ErrorKind::WouldBlock, "no threads"), &fault);
        assert!(err.to_string().contains("failed to start task 'expand'"));
        assert!(rx.recv().unwrap().contains("no threads"));

        start_failed("expand", io::Error::new(io::ErrorKind::WouldBlock, "again"), &fault);
        assert!(rx.try_recv().is_err());
    }
}
