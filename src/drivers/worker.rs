//! Named worker threads with a bounded join.
//!
//! Every background activity (move monitors, pollers, fiber pattern,
//! sequence runs) is spawned through [`spawn`].  The returned [`Worker`]
//! signals completion on a crossbeam channel, so a caller can wait for it
//! with a deadline instead of blocking forever on `JoinHandle::join`.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};

use crate::error::{Error, Result};

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct Worker {
    name: String,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

/// Spawn `f` on a named thread.
pub fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> Result<Worker> {
    let (tx, done) = bounded(1);
    log::debug!("Spawning '{name}'");
    let handle = std::thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            f();
            // Receiver may be gone if the owner detached us.
            let _ = tx.send(());
        })
        .map_err(|e| {
            log::error!("Thread spawn for '{name}' failed: {e}");
            Error::NotReady("thread spawn failed")
        })?;
    Ok(Worker {
        name: name.into(),
        handle,
        done,
    })
}

impl Worker {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait up to `timeout` for the worker to return.
    ///
    /// Returns `false` and detaches the thread if it is still running.
    pub fn join_within(self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            // Disconnected means the closure unwound without signalling.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    log::error!("Worker '{}' panicked", self.name);
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Worker '{}' did not finish within {} ms, detaching",
                    self.name,
                    timeout.as_millis()
                );
                false
            }
        }
    }
}
