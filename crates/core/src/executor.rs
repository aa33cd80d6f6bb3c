//! Execution contexts for long-running pipeline work.

use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

/// A unit of work posted to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs posted tasks somewhere other than the caller's thread.
///
/// The RTSP server posts its bring-up and serve loop here. A task may block
/// for as long as the server is running, so executors shared with other work
/// should have more than one thread.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// A single dedicated thread draining a FIFO task queue.
///
/// Tasks run strictly one after another in posting order. Dropping the
/// executor closes the queue; tasks already queued still run.
pub struct SerialExecutor {
    name: String,
    tx: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialExecutor {
    /// Spawn the worker thread. Falls back to running tasks on a fresh
    /// thread each if the OS refuses to spawn the named worker.
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::channel::<Task>();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            });

        let (tx, worker) = match worker {
            Ok(handle) => (Some(tx), Some(handle)),
            Err(e) => {
                tracing::error!(name, error = %e, "failed to spawn executor thread");
                (None, None)
            }
        };

        Self {
            name: name.to_string(),
            tx: Mutex::new(tx),
            worker: Mutex::new(worker),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the queue and wait for queued tasks to finish.
    ///
    /// Must not be called from a task running on this executor.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!(name = %self.name, "executor task panicked");
            }
        }
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, task: Task) {
        let rejected = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(task).err().map(|e| e.0),
            None => Some(task),
        };

        if let Some(task) = rejected {
            tracing::warn!(name = %self.name, "executor closed, running task on a detached thread");
            thread::spawn(task);
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.tx.lock().take();
    }
}
