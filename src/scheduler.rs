//! Fixed-delay background task runner.
//!
//! Each scheduled task owns one worker thread that sleeps on a stop channel
//! between runs, so shutdown interrupts the wait immediately. A task that is
//! mid-run when shutdown begins is given a bounded grace period; after that
//! its thread is detached.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct Worker {
    name: String,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    name: String,
    stop_tx: Option<Vec<mpsc::Sender<()>>>,
    done_tx: mpsc::Sender<String>,
    done_rx: mpsc::Receiver<String>,
    workers: Vec<Worker>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl Scheduler {
    pub fn new(name: impl Into<String>) -> Self {
        let (done_tx, done_rx) = mpsc::channel();
        Self {
            name: name.into(),
            stop_tx: Some(Vec::new()),
            done_tx,
            done_rx,
            workers: Vec::new(),
        }
    }

    /// Runs `task` after `initial_delay`, then again `delay` after each run
    /// finishes. Errors and panics are logged and do not stop the schedule.
    pub fn schedule_with_fixed_delay<F>(
        &mut self,
        task_name: &str,
        initial_delay: Duration,
        delay: Duration,
        mut task: F,
    ) -> anyhow::Result<()>
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        let stop_senders = self
            .stop_tx
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("scheduler {} is shut down", self.name))?;
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        stop_senders.push(stop_tx);

        let done_tx = self.done_tx.clone();
        let thread_name = format!("{}-{}", self.name, task_name);
        let worker_name = thread_name.clone();
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut wait = initial_delay;
                loop {
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    match std::panic::catch_unwind(AssertUnwindSafe(&mut task)) {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::error!(task = %worker_name, error = %err, "scheduled task failed");
                        }
                        Err(panic) => {
                            tracing::error!(
                                task = %worker_name,
                                panic = panic_message(&*panic),
                                "scheduled task panicked"
                            );
                        }
                    }
                    wait = delay;
                }
                let _ = done_tx.send(worker_name);
            })?;
        self.workers.push(Worker {
            name: thread_name,
            handle,
        });
        Ok(())
    }

    /// Stops every task, waiting at most `timeout` in total for running
    /// tasks to return. Returns `true` when all workers exited in time.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        // Dropping the senders wakes every sleeping worker.
        self.stop_tx = None;

        let deadline = Instant::now() + timeout;
        let mut pending = self.workers.len();
        while pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(remaining) {
                Ok(_) => pending -= 1,
                Err(_) => break,
            }
        }

        let workers = std::mem::take(&mut self.workers);
        if pending > 0 {
            tracing::warn!(
                scheduler = %self.name,
                pending,
                "background tasks did not stop in time; detaching"
            );
            return false;
        }
        for worker in workers {
            if worker.handle.join().is_err() {
                tracing::error!(task = %worker.name, "background task panicked");
            }
        }
        true
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
