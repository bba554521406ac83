//! One scan's child process, mirrored into its scan configuration state and scan result.
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::state::ScanState;
use crate::store::{blocking, ResultStore};
use crate::supervisor::{LaunchSpec, ProcessEvent, ProcessSupervisor};
use crate::types::{now_rfc3339, RunResult, ScanConfiguration, ScanResult};

/// Published by a worker when its scan reaches `Terminated` on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerNotice {
    Terminated { generation: u64, scan: usize },
}

/// Owns the process of one scan within one run result.
///
/// The worker holds no reference to the data it mirrors; callers pass the scan configuration
/// and run result in, so every mutation happens under whatever lock guards the run.
pub struct ScanWorker {
    index: usize,
    scan_name: String,
    generation: u64,
    launch: LaunchSpec,
    // set once the process has been launched, even after it exits
    started: bool,
    pid: Option<u32>,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ProcessEvent>>,
    notices: mpsc::UnboundedSender<WorkerNotice>,
    supervisor: Arc<dyn ProcessSupervisor>,
    results: Arc<dyn ResultStore>,
}

impl std::fmt::Debug for ScanWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanWorker")
            .field("index", &self.index)
            .field("scan_name", &self.scan_name)
            .field("generation", &self.generation)
            .field("launch", &self.launch)
            .field("started", &self.started)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl ScanWorker {
    /// Builds the launch command (tool options followed by the target whitelist) and registers a
    /// fresh scan result on `run_result`. The scan result lands at `run_result.scan_results[index]`
    /// as long as workers are created in scan configuration order.
    pub fn new(
        scan: &ScanConfiguration,
        run_result: &mut RunResult,
        generation: u64,
        supervisor: Arc<dyn ProcessSupervisor>,
        results: Arc<dyn ResultStore>,
        notices: mpsc::UnboundedSender<WorkerNotice>,
    ) -> Self {
        let tool = &scan.tool_configuration;
        let mut args = tool.arg_list();
        args.extend(run_result.run_configuration.target.whitelist().iter().cloned());
        let index = run_result.add_scan_result(ScanResult::new(&scan.name));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            index,
            scan_name: scan.name.clone(),
            generation,
            launch: LaunchSpec {
                program: tool.path.clone(),
                args,
            },
            started: false,
            pid: None,
            events_tx,
            events_rx: Some(events_rx),
            notices,
            supervisor,
            results,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn scan_name(&self) -> &str {
        &self.scan_name
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        &self.launch
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_started(&self) -> bool {
        self.started
    }

    /// Output/exit events of this worker's process. Available once; whoever takes it must feed
    /// each event back through [`ScanWorker::handle_event`] in order.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessEvent>> {
        self.events_rx.take()
    }

    /// First call launches the process; later calls on a suspended scan resume it.
    pub fn play(&mut self, scan: &mut ScanConfiguration, run_result: &mut RunResult) {
        if scan.state != ScanState::Inactive {
            debug!(scan = %self.scan_name, state = %scan.state, "play ignored");
            return;
        }

        if self.started {
            let Some(pid) = self.pid else {
                debug!(scan = %self.scan_name, "play ignored: process already gone");
                return;
            };
            scan.state = ScanState::Active;
            self.persist(scan, run_result);
            info!(scan = %self.scan_name, pid, "resuming scan");
            if let Err(e) = self.supervisor.resume(pid) {
                warn!(scan = %self.scan_name, pid, "resume failed: {e:#}");
            }
            return;
        }

        scan.state = ScanState::Active;
        scan.execution_number = if scan.execution_number < 1 {
            1
        } else {
            scan.execution_number + 1
        };
        {
            let result = &mut run_result.scan_results[self.index];
            result.start_time = Some(now_rfc3339());
            result.scanned_ips = run_result.run_configuration.target.whitelist().to_vec();
        }
        self.persist(scan, run_result);

        self.started = true;
        match self.supervisor.launch(&self.launch, self.events_tx.clone()) {
            Ok(pid) => {
                info!(scan = %self.scan_name, pid, command = %self.launch, "scan launched");
                self.pid = Some(pid);
            }
            Err(e) => {
                error!(scan = %self.scan_name, command = %self.launch, "launch failed: {e:#}");
                let result = &mut run_result.scan_results[self.index];
                result.execution_status = false;
                result.end_time = Some(now_rfc3339());
                result.append_output(&format!("launch failed: {e:#}\n"));
                scan.state = ScanState::Terminated;
                self.persist(scan, run_result);
                self.notify_terminated();
            }
        }
    }

    /// Suspends a running process. Its output and exit status survive until it is resumed.
    pub fn pause(&mut self, scan: &mut ScanConfiguration, run_result: &mut RunResult) {
        if scan.state != ScanState::Active || !self.started {
            debug!(scan = %self.scan_name, state = %scan.state, "pause ignored");
            return;
        }
        scan.state = ScanState::Inactive;
        self.persist(scan, run_result);
        if let Some(pid) = self.pid {
            info!(scan = %self.scan_name, pid, "suspending scan");
            if let Err(e) = self.supervisor.suspend(pid) {
                warn!(scan = %self.scan_name, pid, "suspend failed: {e:#}");
            }
        }
    }

    pub fn stop(&mut self, scan: &mut ScanConfiguration, run_result: &mut RunResult) {
        if !self.started || scan.state == ScanState::Terminated {
            debug!(scan = %self.scan_name, state = %scan.state, "stop ignored");
            return;
        }
        scan.state = ScanState::Terminated;
        run_result.scan_results[self.index].end_time = Some(now_rfc3339());
        self.persist(scan, run_result);
        if let Some(pid) = self.pid.take() {
            info!(scan = %self.scan_name, pid, "terminating scan");
            if let Err(e) = self.supervisor.terminate(pid) {
                warn!(scan = %self.scan_name, pid, "terminate failed: {e:#}");
            }
        }
    }

    /// Apply one process event. Returns true once the process has exited.
    pub fn handle_event(
        &mut self,
        event: ProcessEvent,
        scan: &mut ScanConfiguration,
        run_result: &mut RunResult,
    ) -> bool {
        match event {
            ProcessEvent::Output(chunk) => {
                debug!(scan = %self.scan_name, bytes = chunk.len(), "output");
                run_result.scan_results[self.index].append_output(&chunk);
                self.persist(scan, run_result);
                false
            }
            ProcessEvent::Exited { code } => {
                self.finished(code, scan, run_result);
                true
            }
        }
    }

    fn finished(&mut self, code: Option<i32>, scan: &mut ScanConfiguration, run_result: &mut RunResult) {
        self.pid = None;
        if scan.state == ScanState::Terminated {
            // stopped explicitly; end time was stamped by stop()
            debug!(scan = %self.scan_name, ?code, "process exited after stop");
            return;
        }
        let result = &mut run_result.scan_results[self.index];
        result.end_time = Some(now_rfc3339());
        if code != Some(0) {
            result.execution_status = false;
        }
        scan.state = ScanState::Terminated;
        info!(scan = %self.scan_name, ?code, "scan finished");
        self.persist(scan, run_result);
        self.notify_terminated();
    }

    fn notify_terminated(&self) {
        let notice = WorkerNotice::Terminated {
            generation: self.generation,
            scan: self.index,
        };
        if self.notices.send(notice).is_err() {
            debug!(scan = %self.scan_name, "no completion listener");
        }
    }

    /// Mirror the scan state into the run result's configuration snapshot and write it out.
    fn persist(&self, scan: &ScanConfiguration, run_result: &mut RunResult) {
        if let Some(snap) = run_result
            .run_configuration
            .scan_configurations
            .get_mut(self.index)
        {
            snap.state = scan.state;
            snap.execution_number = scan.execution_number;
        }
        persist_run_result(self.results.as_ref(), run_result);
    }
}

/// Write a run result, logging instead of failing: a transition never waits on the store.
pub(crate) fn persist_run_result(store: &dyn ResultStore, run_result: &RunResult) {
    match blocking(|| store.update_run_result(run_result)) {
        Ok(true) => {}
        Ok(false) => warn!(
            run = %run_result.run_name(),
            timestamp = %run_result.timestamp,
            "run result update not acknowledged"
        ),
        Err(e) => warn!(
            run = %run_result.run_name(),
            timestamp = %run_result.timestamp,
            "failed to persist run result: {e:#}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::target::Target;
    use crate::types::{RunConfiguration, ToolConfiguration, ToolOptionArgument};
    use anyhow::{bail, Result};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        fail_launch: bool,
        calls: Mutex<Vec<String>>,
    }

    impl ProcessSupervisor for Recorder {
        fn launch(&self, spec: &LaunchSpec, _events: mpsc::UnboundedSender<ProcessEvent>) -> Result<u32> {
            if self.fail_launch {
                bail!("no such file");
            }
            self.calls.lock().push(format!("launch {spec}"));
            Ok(4242)
        }
        fn suspend(&self, pid: u32) -> Result<()> {
            self.calls.lock().push(format!("suspend {pid}"));
            Ok(())
        }
        fn resume(&self, pid: u32) -> Result<()> {
            self.calls.lock().push(format!("resume {pid}"));
            Ok(())
        }
        fn terminate(&self, pid: u32) -> Result<()> {
            self.calls.lock().push(format!("terminate {pid}"));
            Ok(())
        }
    }

    struct Fixture {
        scan: ScanConfiguration,
        result: RunResult,
        worker: ScanWorker,
        store: Arc<MemoryStore>,
        sup: Arc<Recorder>,
        notices: mpsc::UnboundedReceiver<WorkerNotice>,
    }

    fn fixture(fail_launch: bool) -> Fixture {
        let mut tool = ToolConfiguration::new("nmap", "/usr/bin/nmap");
        tool.add_option_argument(ToolOptionArgument::new("-p", "80"));
        let scan = ScanConfiguration::new("A", tool);
        let mut run = RunConfiguration::new("R1", "", Target::with_whitelist(["10.0.0.1", "10.0.0.2"]).unwrap());
        run.add_scan_configuration(scan.clone());
        let mut result = RunResult::new("t0", run);
        let store = Arc::new(MemoryStore::new());
        store.create_run_result(&result).unwrap();
        let sup = Arc::new(Recorder {
            fail_launch,
            ..Default::default()
        });
        let (tx, notices) = mpsc::unbounded_channel();
        let worker = ScanWorker::new(&scan, &mut result, 1, sup.clone(), store.clone(), tx);
        Fixture {
            scan,
            result,
            worker,
            store,
            sup,
            notices,
        }
    }

    #[test]
    fn construction_registers_empty_result_and_builds_args() {
        let f = fixture(false);
        assert_eq!(f.result.scan_results, vec![ScanResult::new("A")]);
        assert_eq!(f.worker.launch_spec().to_string(), "/usr/bin/nmap -p 80 10.0.0.1 10.0.0.2");
        assert!(!f.worker.has_started());
    }

    #[test]
    fn lifecycle_launch_pause_resume_stop() {
        let mut f = fixture(false);
        f.worker.play(&mut f.scan, &mut f.result);
        assert_eq!(f.scan.state, ScanState::Active);
        assert_eq!(f.scan.execution_number, 1);
        assert!(f.result.scan_results[0].start_time.is_some());
        assert_eq!(f.result.scan_results[0].scanned_ips, ["10.0.0.1", "10.0.0.2"]);
        assert_eq!(f.worker.pid(), Some(4242));

        f.worker.pause(&mut f.scan, &mut f.result);
        assert_eq!(f.scan.state, ScanState::Inactive);
        assert!(f.result.scan_results[0].end_time.is_none());

        f.worker.play(&mut f.scan, &mut f.result);
        assert_eq!(f.scan.state, ScanState::Active);

        f.worker.stop(&mut f.scan, &mut f.result);
        assert_eq!(f.scan.state, ScanState::Terminated);
        assert!(f.result.scan_results[0].end_time.is_some());
        assert_eq!(f.worker.pid(), None);

        // absorbing
        f.worker.play(&mut f.scan, &mut f.result);
        f.worker.pause(&mut f.scan, &mut f.result);
        assert_eq!(f.scan.state, ScanState::Terminated);

        assert_eq!(
            *f.sup.calls.lock(),
            vec![
                "launch /usr/bin/nmap -p 80 10.0.0.1 10.0.0.2".to_string(),
                "suspend 4242".to_string(),
                "resume 4242".to_string(),
                "terminate 4242".to_string(),
            ]
        );
        // stopping is not natural completion
        assert!(f.notices.try_recv().is_err());
    }

    #[test]
    fn pause_and_stop_before_launch_are_ignored() {
        let mut f = fixture(false);
        f.worker.pause(&mut f.scan, &mut f.result);
        f.worker.stop(&mut f.scan, &mut f.result);
        assert_eq!(f.scan.state, ScanState::Inactive);
        assert!(f.sup.calls.lock().is_empty());
    }

    #[test]
    fn output_appends_and_exit_notifies() {
        let mut f = fixture(false);
        f.worker.play(&mut f.scan, &mut f.result);
        for chunk in ["22/tcp open\n", "80/tcp ", "open\n"] {
            assert!(!f.worker.handle_event(ProcessEvent::Output(chunk.into()), &mut f.scan, &mut f.result));
        }
        let stored = f.store.read_run_result("R1", "t0").unwrap().unwrap();
        assert_eq!(stored.scan_results[0].formatted_scan_output, "22/tcp open\n80/tcp open\n");

        assert!(f.worker.handle_event(ProcessEvent::Exited { code: Some(0) }, &mut f.scan, &mut f.result));
        assert_eq!(f.scan.state, ScanState::Terminated);
        assert!(f.result.scan_results[0].execution_status);
        assert!(f.result.scan_results[0].end_time.is_some());
        assert_eq!(
            f.notices.try_recv().unwrap(),
            WorkerNotice::Terminated { generation: 1, scan: 0 }
        );
        let stored = f.store.read_run_result("R1", "t0").unwrap().unwrap();
        assert_eq!(stored.run_configuration.scan_configurations[0].state, ScanState::Terminated);
    }

    #[test]
    fn nonzero_exit_marks_failure() {
        let mut f = fixture(false);
        f.worker.play(&mut f.scan, &mut f.result);
        f.worker.handle_event(ProcessEvent::Exited { code: Some(1) }, &mut f.scan, &mut f.result);
        assert!(!f.result.scan_results[0].execution_status);
    }

    #[test]
    fn launch_failure_terminates_scan() {
        let mut f = fixture(true);
        f.worker.play(&mut f.scan, &mut f.result);
        assert_eq!(f.scan.state, ScanState::Terminated);
        let r = &f.result.scan_results[0];
        assert!(!r.execution_status);
        assert!(r.end_time.is_some());
        assert!(r.formatted_scan_output.contains("no such file"));
        assert!(f.notices.try_recv().is_ok());
    }
}
