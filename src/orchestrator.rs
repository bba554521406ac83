//! Run-level control over a set of scan workers.
//!
//! All mutable run data (configuration, current result, workers) sits behind one async mutex.
//! Control calls, process events and completion notices each take that lock for the duration of
//! one transition and write the affected documents before releasing it.
use anyhow::Result;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::state::{RunState, ScanState};
use crate::store::{blocking, ConfigurationStore, Stores};
use crate::supervisor::{ProcessEvent, ProcessSupervisor};
use crate::types::{now_rfc3339, RunConfiguration, RunResult};
use crate::worker::{persist_run_result, ScanWorker, WorkerNotice};

struct RunShared {
    config: RunConfiguration,
    result: Option<RunResult>,
    workers: Vec<ScanWorker>,
    // bumped for every new run result; events from older workers are dropped
    generation: u64,
}

struct Inner {
    shared: Mutex<RunShared>,
    stores: Stores,
    supervisor: Arc<dyn ProcessSupervisor>,
    state_tx: watch::Sender<RunState>,
}

/// Drives one run configuration. Cheap to clone; clones control the same run.
#[derive(Clone)]
pub struct RunOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RunOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOrchestrator")
            .field("state", &*self.inner.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl RunOrchestrator {
    /// A configuration loaded as `Active` or `Inactive` has no live processes behind it any more,
    /// so it is treated as an interrupted run and marked `Terminated`. An `Unconfigured` one that
    /// has scans is marked `Configured`.
    pub fn new(
        mut config: RunConfiguration,
        stores: Stores,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        if matches!(config.run_state, RunState::Active | RunState::Inactive) {
            warn!(run = %config.name, state = %config.run_state, "run was interrupted; marking terminated");
            config.run_state = RunState::Terminated;
            persist_run_configuration(stores.configs.as_ref(), &config);
        } else if config.settle_run_state() {
            info!(run = %config.name, "run has scans; marking configured");
            persist_run_configuration(stores.configs.as_ref(), &config);
        }
        let (state_tx, _) = watch::channel(config.run_state);
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(RunShared {
                    config,
                    result: None,
                    workers: Vec::new(),
                    generation: 0,
                }),
                stores,
                supervisor,
                state_tx,
            }),
        }
    }

    /// Load a stored configuration by name.
    pub fn load(
        name: &str,
        stores: Stores,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Result<Option<Self>> {
        let config = stores.configs.read_run_configuration(name)?;
        Ok(config.map(|c| Self::new(c, stores, supervisor)))
    }

    pub fn state(&self) -> RunState {
        *self.inner.state_tx.borrow()
    }

    /// Watch run state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the run reaches `Terminated`.
    pub async fn wait_terminated(&self) {
        let mut rx = self.subscribe();
        // the sender lives as long as `self`
        let _ = rx.wait_for(|s| *s == RunState::Terminated).await;
    }

    /// Clones of the configuration and the current run result.
    pub async fn snapshot(&self) -> (RunConfiguration, Option<RunResult>) {
        let shared = self.inner.shared.lock().await;
        (shared.config.clone(), shared.result.clone())
    }

    pub async fn name(&self) -> String {
        self.inner.shared.lock().await.config.name.clone()
    }

    /// Start or resume the run.
    ///
    /// Out of `Configured` or `Terminated` a new run result and worker set are created first.
    /// Out of `Configured`, `Inactive` or `Terminated` the run becomes `Active` and every worker
    /// is played. Anything else is a no-op.
    pub async fn play(&self) {
        let mut guard = self.inner.shared.lock().await;
        let shared = &mut *guard;
        let state = shared.config.run_state;

        if shared.config.scan_configurations.is_empty() {
            debug!(run = %shared.config.name, %state, "play ignored: no scans configured");
            return;
        }

        if matches!(state, RunState::Configured | RunState::Terminated) {
            self.inner.start_new_result(shared);
        }

        if matches!(
            state,
            RunState::Configured | RunState::Inactive | RunState::Terminated
        ) {
            self.inner.set_run_state(shared, RunState::Active);
            let RunShared {
                config,
                result,
                workers,
                ..
            } = &mut *shared;
            if let Some(result) = result.as_mut() {
                for (worker, scan) in workers.iter_mut().zip(config.scan_configurations.iter_mut()) {
                    worker.play(scan, result);
                }
            }
            self.inner.persist_config(shared);
        } else {
            debug!(run = %shared.config.name, %state, "play ignored");
        }
    }

    /// Suspend every scan of an `Active` run.
    pub async fn pause(&self) {
        let mut guard = self.inner.shared.lock().await;
        let shared = &mut *guard;
        if shared.config.run_state != RunState::Active {
            debug!(run = %shared.config.name, state = %shared.config.run_state, "pause ignored");
            return;
        }
        self.inner.set_run_state(shared, RunState::Inactive);
        let RunShared {
            config,
            result,
            workers,
            ..
        } = &mut *shared;
        if let Some(result) = result.as_mut() {
            for (worker, scan) in workers.iter_mut().zip(config.scan_configurations.iter_mut()) {
                worker.pause(scan, result);
            }
            persist_run_result(self.inner.stores.results.as_ref(), result);
        }
        self.inner.persist_config(shared);
    }

    /// Terminate every scan of an `Active` or `Inactive` run.
    pub async fn stop(&self) {
        let mut guard = self.inner.shared.lock().await;
        let shared = &mut *guard;
        if !matches!(
            shared.config.run_state,
            RunState::Active | RunState::Inactive
        ) {
            debug!(run = %shared.config.name, state = %shared.config.run_state, "stop ignored");
            return;
        }
        self.inner.set_run_state(shared, RunState::Terminated);
        let RunShared {
            config,
            result,
            workers,
            ..
        } = &mut *shared;
        if let Some(result) = result.as_mut() {
            for (worker, scan) in workers.iter_mut().zip(config.scan_configurations.iter_mut()) {
                worker.stop(scan, result);
            }
            persist_run_result(self.inner.stores.results.as_ref(), result);
        }
        self.inner.persist_config(shared);
    }

    /// Re-derive the run state from the workers: `Terminated` once every scan is.
    pub async fn check_terminated(&self) {
        let mut guard = self.inner.shared.lock().await;
        self.inner.check_terminated(&mut guard);
    }
}

impl Inner {
    fn set_run_state(&self, shared: &mut RunShared, state: RunState) {
        info!(run = %shared.config.name, from = %shared.config.run_state, to = %state, "run state");
        shared.config.run_state = state;
    }

    /// Write the configuration, then let subscribers see its run state.
    fn persist_config(&self, shared: &RunShared) {
        persist_run_configuration(self.stores.configs.as_ref(), &shared.config);
        let state = shared.config.run_state;
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn start_new_result(self: &Arc<Self>, shared: &mut RunShared) {
        shared.generation += 1;
        let generation = shared.generation;
        for scan in shared.config.scan_configurations.iter_mut() {
            scan.state = ScanState::Inactive;
        }

        let mut result = RunResult::new(now_rfc3339(), shared.config.clone());
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(shared.config.scan_configurations.len());
        for scan in &shared.config.scan_configurations {
            let mut worker = ScanWorker::new(
                scan,
                &mut result,
                generation,
                self.supervisor.clone(),
                self.stores.results.clone(),
                notice_tx.clone(),
            );
            if let Some(events) = worker.take_events() {
                spawn_event_pump(Arc::downgrade(self), generation, worker.index(), events);
            }
            workers.push(worker);
        }
        spawn_completion_listener(Arc::downgrade(self), generation, notice_rx);

        match blocking(|| self.stores.results.create_run_result(&result)) {
            Ok(ack) if ack.acknowledged => {}
            Ok(_) => warn!(run = %shared.config.name, timestamp = %result.timestamp, "run result create not acknowledged"),
            Err(e) => warn!(run = %shared.config.name, "failed to create run result: {e:#}"),
        }
        info!(
            run = %shared.config.name,
            timestamp = %result.timestamp,
            scans = workers.len(),
            "new run result"
        );
        // old workers drop here; their pumps and listener wind down with them
        shared.workers = workers;
        shared.result = Some(result);
    }

    fn check_terminated(&self, shared: &mut RunShared) {
        if shared.workers.is_empty() {
            return;
        }
        let all_done = shared
            .config
            .scan_configurations
            .iter()
            .all(|s| s.state == ScanState::Terminated);
        if all_done && shared.config.run_state != RunState::Terminated {
            self.set_run_state(shared, RunState::Terminated);
        }
        self.persist_config(shared);
    }
}

fn spawn_event_pump(
    inner: Weak<Inner>,
    generation: u64,
    index: usize,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else { break };
            let mut guard: MutexGuard<'_, RunShared> = inner.shared.lock().await;
            let shared = &mut *guard;
            if shared.generation != generation {
                break;
            }
            let RunShared {
                config,
                result,
                workers,
                ..
            } = &mut *shared;
            let (Some(result), Some(worker), Some(scan)) = (
                result.as_mut(),
                workers.get_mut(index),
                config.scan_configurations.get_mut(index),
            ) else {
                break;
            };
            if worker.handle_event(event, scan, result) {
                break;
            }
        }
    });
}

fn spawn_completion_listener(
    inner: Weak<Inner>,
    generation: u64,
    mut notices: mpsc::UnboundedReceiver<WorkerNotice>,
) {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            let WorkerNotice::Terminated {
                generation: from,
                scan,
            } = notice;
            if from != generation {
                continue;
            }
            let Some(inner) = inner.upgrade() else { break };
            let mut guard = inner.shared.lock().await;
            if guard.generation != generation {
                break;
            }
            debug!(run = %guard.config.name, scan, "scan terminated");
            inner.check_terminated(&mut guard);
        }
    });
}

/// Write a run configuration, logging instead of failing.
pub(crate) fn persist_run_configuration(store: &dyn ConfigurationStore, config: &RunConfiguration) {
    match blocking(|| store.update_run_configuration(config)) {
        Ok(true) => {}
        Ok(false) => warn!(run = %config.name, "run configuration update not acknowledged"),
        Err(e) => warn!(run = %config.name, "failed to persist run configuration: {e:#}"),
    }
}
