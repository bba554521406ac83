#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use sea_runner::orchestrator::RunOrchestrator;
use sea_runner::store::{ConfigurationStore, MemoryStore, Stores};
use sea_runner::supervisor::{LaunchSpec, ProcessEvent, ProcessSupervisor};
use sea_runner::target::Target;
use sea_runner::types::{
    RunConfiguration, RunResult, ScanConfiguration, ToolConfiguration, ToolOptionArgument,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sig {
    Suspend,
    Resume,
    Terminate,
}

#[derive(Default)]
struct Script {
    next_pid: u32,
    launches: Vec<LaunchSpec>,
    pids: HashMap<String, u32>,
    senders: HashMap<u32, mpsc::UnboundedSender<ProcessEvent>>,
    signals: Vec<(Sig, u32)>,
    failing: HashSet<String>,
}

/// In-process stand-in for real child processes. Tests decide when a "process" prints or exits.
#[derive(Default)]
pub struct ScriptedSupervisor {
    script: Mutex<Script>,
}

impl ScriptedSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Launching `program` will fail from now on.
    pub fn fail(&self, program: &str) {
        self.script.lock().failing.insert(program.to_string());
    }

    /// Pid of the latest launch of `program`.
    pub fn pid(&self, program: &str) -> u32 {
        *self
            .script
            .lock()
            .pids
            .get(program)
            .unwrap_or_else(|| panic!("{program} was never launched"))
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.script.lock().launches.clone()
    }

    pub fn signals(&self) -> Vec<(Sig, u32)> {
        self.script.lock().signals.clone()
    }

    pub fn output(&self, program: &str, chunk: &str) {
        let pid = self.pid(program);
        if let Some(tx) = self.script.lock().senders.get(&pid) {
            let _ = tx.send(ProcessEvent::Output(chunk.to_string()));
        }
    }

    pub fn exit(&self, program: &str, code: i32) {
        let pid = self.pid(program);
        if let Some(tx) = self.script.lock().senders.remove(&pid) {
            let _ = tx.send(ProcessEvent::Exited { code: Some(code) });
        }
    }
}

impl ProcessSupervisor for ScriptedSupervisor {
    fn launch(&self, spec: &LaunchSpec, events: mpsc::UnboundedSender<ProcessEvent>) -> Result<u32> {
        let mut s = self.script.lock();
        if s.failing.contains(&spec.program) {
            bail!("{}: no such file or directory", spec.program);
        }
        s.next_pid += 1;
        let pid = 1000 + s.next_pid;
        s.launches.push(spec.clone());
        s.pids.insert(spec.program.clone(), pid);
        s.senders.insert(pid, events);
        Ok(pid)
    }

    fn suspend(&self, pid: u32) -> Result<()> {
        self.script.lock().signals.push((Sig::Suspend, pid));
        Ok(())
    }

    fn resume(&self, pid: u32) -> Result<()> {
        self.script.lock().signals.push((Sig::Resume, pid));
        Ok(())
    }

    /// Behaves like a real process: it dies by signal.
    fn terminate(&self, pid: u32) -> Result<()> {
        let mut s = self.script.lock();
        s.signals.push((Sig::Terminate, pid));
        if let Some(tx) = s.senders.remove(&pid) {
            let _ = tx.send(ProcessEvent::Exited { code: None });
        }
        Ok(())
    }
}

pub fn tool(program: &str) -> ToolConfiguration {
    let mut t = ToolConfiguration::new(program.rsplit('/').next().unwrap_or(program), program);
    t.add_option_argument(ToolOptionArgument::new("-sT", ""));
    t
}

/// Run `name` with one scan per program, targeting 10.0.0.1 and 10.0.0.2.
pub fn run_config(name: &str, programs: &[&str]) -> RunConfiguration {
    let target = Target::with_whitelist(["10.0.0.1", "10.0.0.2"]).unwrap();
    let mut rc = RunConfiguration::new(name, "test run", target);
    for (i, p) in programs.iter().enumerate() {
        let scan_name = ((b'A' + i as u8) as char).to_string();
        assert!(rc.add_scan_configuration(ScanConfiguration::new(scan_name, tool(p))));
    }
    rc
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub sup: Arc<ScriptedSupervisor>,
    pub run: RunOrchestrator,
}

pub fn harness(name: &str, programs: &[&str]) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let config = run_config(name, programs);
    assert!(store.create_run_configuration(&config).unwrap().acknowledged);
    let sup = ScriptedSupervisor::new();
    let run = RunOrchestrator::new(config, Stores::shared(store.clone()), sup.clone());
    Harness { store, sup, run }
}

/// Poll the orchestrator until `pred` holds, or panic after a few seconds.
pub async fn wait_for<F>(run: &RunOrchestrator, pred: F)
where
    F: Fn(&RunConfiguration, Option<&RunResult>) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (config, result) = run.snapshot().await;
        if pred(&config, result.as_ref()) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached; last config: {config:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
