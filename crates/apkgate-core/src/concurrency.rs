//! Cross-run concurrency control.
//!
//! Runs are keyed by `(branch, pr_number)`. Starting a run for a key that
//! already has one in flight cancels the older run: last writer wins.
//!
//! Inside one process the [`RunRegistry`] fires the older run's cancel
//! signal directly. Across processes the newest run id is kept in a
//! [`RunStore`]; each run polls it and cancels itself once it lost its slot.
//! Dispatch is deduplicated per `(commit_sha, event_type)` in the same store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use apkgate_store::RunStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::event::{ConcurrencyKey, EventType};

/// Receiving side of a run's cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
    // Keeps an unowned signal from reporting a closed channel.
    _keepalive: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(std::sync::Arc::new(tx)),
        }
    }

    /// A signal plus the handle that fires it.
    pub fn pair() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx },
            Self {
                rx,
                _keepalive: None,
            },
        )
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Pending forever if the sender
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Sending side of a cancellation flag.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// An in-flight run registered with the [`RunRegistry`].
#[derive(Debug)]
pub struct RunTicket {
    run_id: String,
    key: ConcurrencyKey,
    generation: u64,
    signal: CancelSignal,
}

impl RunTicket {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn key(&self) -> &ConcurrencyKey {
        &self.key
    }

    /// Clone of the cancellation signal, to hand to the orchestrator.
    pub fn signal(&self) -> CancelSignal {
        self.signal.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }
}

struct ActiveRun {
    generation: u64,
    run_id: String,
    handle: CancelHandle,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<ConcurrencyKey, ActiveRun>,
    next_generation: u64,
}

/// Tracks in-flight runs of this process.
#[derive(Default)]
pub struct RunRegistry {
    state: Mutex<RegistryState>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new run for `key`, cancelling any run already in flight.
    pub fn begin(&self, key: ConcurrencyKey) -> RunTicket {
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        let run_id = Uuid::new_v4().to_string();
        let (handle, signal) = CancelSignal::pair();

        let previous = state.active.insert(
            key.clone(),
            ActiveRun {
                generation,
                run_id: run_id.clone(),
                handle,
            },
        );
        if let Some(prev) = previous {
            info!(key = %key, superseded = %prev.run_id, by = %run_id, "cancelling superseded run");
            prev.handle.cancel();
        }

        RunTicket {
            run_id,
            key,
            generation,
            signal,
        }
    }

    /// Unregister `ticket` if it is still the current run for its key.
    pub fn finish(&self, ticket: &RunTicket) -> bool {
        let mut state = self.lock();
        let current = state
            .active
            .get(&ticket.key)
            .is_some_and(|a| a.generation == ticket.generation);
        if current {
            state.active.remove(&ticket.key);
        }
        current
    }

    /// Whether `ticket` is the newest run for its key.
    pub fn is_current(&self, ticket: &RunTicket) -> bool {
        self.lock()
            .active
            .get(&ticket.key)
            .is_some_and(|a| a.generation == ticket.generation)
    }

    /// Cancel the in-flight run for `key`. Returns false if there is none.
    pub fn cancel(&self, key: &ConcurrencyKey) -> bool {
        let state = self.lock();
        match state.active.get(key) {
            Some(run) => {
                run.handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the in-flight run with `run_id`, whatever its key.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        let state = self.lock();
        match state.active.values().find(|a| a.run_id == run_id) {
            Some(run) => {
                run.handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of runs currently in flight.
    pub fn active_runs(&self) -> usize {
        self.lock().active.len()
    }
}

/// Key under which a trigger's dispatch is recorded.
pub fn dispatch_key(commit_sha: &str, event_type: EventType) -> String {
    format!("{commit_sha}:{event_type}")
}

/// Whether a run other than `run_id` now owns `key` in the run store. An
/// empty slot (no run ever recorded) supersedes no one.
pub async fn is_superseded(runs: &dyn RunStore, key: &ConcurrencyKey, run_id: &str) -> Result<bool> {
    Ok(runs
        .current(&key.to_string())
        .await?
        .is_some_and(|slot| slot.run_id != run_id))
}

/// Poll `runs` every `every` and cancel `run_id` in `registry` once another
/// run owns `key`. Abort the handle when the run ends.
pub fn spawn_supersession_watch(
    runs: Arc<dyn RunStore>,
    registry: Arc<RunRegistry>,
    key: ConcurrencyKey,
    run_id: String,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match is_superseded(runs.as_ref(), &key, &run_id).await {
                Ok(true) => {
                    info!(key = %key, run_id = %run_id, "run superseded by another process");
                    registry.cancel_run(&run_id);
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "run store check failed"),
            }
        }
    })
}
