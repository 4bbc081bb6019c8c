//! Background reconciler: periodically flushes the engine.
//!
//! One thread per engine wakes every `reconcile_interval`, or immediately
//! when a writer crosses the flush threshold or a flush is requested, and
//! decides whether to snapshot and checkpoint. A failed cycle is logged and
//! retried on the next wake-up.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::engine::Engine;

#[derive(Debug, Default)]
struct SignalState {
    pending: bool,
    forced: bool,
    shutdown: bool,
}

/// Wake-up channel between writers and the reconciler thread.
#[derive(Debug, Default)]
pub struct FlushSignal {
    state: Mutex<SignalState>,
    cv: Condvar,
}

/// Why the reconciler woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Interval,
    Signalled { forced: bool },
    Shutdown,
}

impl FlushSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the reconciler. `forced` flushes even below the thresholds.
    pub fn notify(&self, forced: bool) {
        let mut s = self.state.lock().expect("flush signal lock poisoned");
        s.pending = true;
        s.forced |= forced;
        self.cv.notify_all();
    }

    fn shutdown(&self) {
        let mut s = self.state.lock().expect("flush signal lock poisoned");
        s.shutdown = true;
        self.cv.notify_all();
    }

    /// Block until signalled, shut down, or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Wake {
        let guard = self.state.lock().expect("flush signal lock poisoned");
        let (mut s, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |s| !s.pending && !s.shutdown)
            .expect("flush signal lock poisoned");
        if s.shutdown {
            return Wake::Shutdown;
        }
        if s.pending {
            let forced = s.forced;
            s.pending = false;
            s.forced = false;
            return Wake::Signalled { forced };
        }
        Wake::Interval
    }
}

/// Flush policy of one cycle.
pub fn should_flush(
    unflushed: u64,
    threshold: u64,
    since_last_flush: Duration,
    max_age: Duration,
    forced: bool,
) -> bool {
    forced || unflushed >= threshold || (unflushed > 0 && since_last_flush >= max_age)
}

/// Run one reconcile cycle. Returns whether a flush succeeded.
pub fn run_cycle(engine: &Engine, forced: bool) -> bool {
    let config = engine.config();
    if !should_flush(
        engine.unflushed(),
        config.flush_threshold,
        engine.since_last_flush(),
        config.flush_max_age(),
        forced,
    ) {
        return false;
    }
    // Errors are logged and counted by the engine; the next cycle retries.
    engine.flush().is_ok()
}

/// Handle to the reconciler thread. Dropping it stops the thread.
pub struct Reconciler {
    engine: Arc<Engine>,
    handle: Option<JoinHandle<()>>,
}

impl Reconciler {
    /// Start the background thread for `engine`.
    pub fn start(engine: Arc<Engine>) -> std::io::Result<Self> {
        let worker = Arc::clone(&engine);
        let interval = engine.config().reconcile_interval();
        let handle = std::thread::Builder::new()
            .name("mnemos-reconcile".into())
            .spawn(move || {
                tracing::debug!(interval_ms = interval.as_millis() as u64, "reconciler started");
                loop {
                    let forced = match worker.signal().wait(interval) {
                        Wake::Shutdown => break,
                        Wake::Interval => false,
                        Wake::Signalled { forced } => forced,
                    };
                    run_cycle(&worker, forced);
                }
                tracing::debug!("reconciler stopped");
            })?;
        Ok(Self {
            engine,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for an in-flight cycle to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.engine.signal().shutdown();
            if handle.join().is_err() {
                tracing::error!("reconciler thread panicked");
            }
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("running", &self.handle.is_some())
            .finish()
    }
}
