//! Launching external tools and steering them with OS signals.
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const READ_CHUNK: usize = 4096;
const REAP_POLL: Duration = Duration::from_millis(20);

/// Resolved executable and argument list for one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        Ok(())
    }
}

/// Notifications about a launched process. Every `Output` precedes the single `Exited`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(String),
    /// `code` is `None` when the process was ended by a signal.
    Exited { code: Option<i32> },
}

pub trait ProcessSupervisor: Send + Sync {
    /// Start the process and return its pid. Events for it are sent on `events`.
    fn launch(&self, spec: &LaunchSpec, events: mpsc::UnboundedSender<ProcessEvent>)
        -> Result<u32>;
    fn suspend(&self, pid: u32) -> Result<()>;
    fn resume(&self, pid: u32) -> Result<()>;
    fn terminate(&self, pid: u32) -> Result<()>;
}

/// Runs tools as local tokio child processes. Must be used from within a tokio runtime.
///
/// A child stays registered under its pid until it is reaped. Signals only go to registered
/// pids, so a pid the OS has already recycled is never signalled.
#[derive(Debug, Default, Clone)]
pub struct OsSupervisor {
    children: Arc<Mutex<HashMap<u32, Child>>>,
}

impl OsSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a signal to `pid` if it is still one of ours. Reaping takes the same lock.
    fn signal_live(&self, pid: u32, send: fn(u32) -> Result<()>) -> Result<()> {
        let children = self.children.lock();
        if !children.contains_key(&pid) {
            debug!(pid, "process already reaped; signal skipped");
            return Ok(());
        }
        send(pid)
    }
}

/// Wait for a registered child to exit and unregister it in the same critical section.
async fn reap(children: &Mutex<HashMap<u32, Child>>, pid: u32) -> Option<i32> {
    loop {
        {
            let mut map = children.lock();
            let Some(child) = map.get_mut(&pid) else {
                return None;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    map.remove(&pid);
                    return status.code();
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(pid, "wait failed: {e}");
                    map.remove(&pid);
                    return None;
                }
            }
        }
        tokio::time::sleep(REAP_POLL).await;
    }
}

impl ProcessSupervisor for OsSupervisor {
    fn launch(
        &self,
        spec: &LaunchSpec,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<u32> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch {}", spec.program))?;
        let pid = child
            .id()
            .with_context(|| format!("{} exited before its pid was known", spec.program))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.children.lock().insert(pid, child);
        let children = self.children.clone();
        tokio::spawn(async move {
            let pump_stdout = async {
                let Some(mut out) = stdout else { return };
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    match out.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                            if events.send(ProcessEvent::Output(chunk)).is_err() {
                                // nobody listening; keep draining so the child never blocks
                                continue;
                            }
                        }
                        Err(e) => {
                            warn!(pid, "stdout read failed: {e}");
                            break;
                        }
                    }
                }
            };
            let log_stderr = async {
                let Some(err) = stderr else { return };
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(pid, "stderr: {line}");
                }
            };
            // both pipes close when the process exits
            tokio::join!(pump_stdout, log_stderr);

            let code = reap(&children, pid).await;
            let _ = events.send(ProcessEvent::Exited { code });
        });

        Ok(pid)
    }

    fn suspend(&self, pid: u32) -> Result<()> {
        self.signal_live(pid, signal::suspend)
    }

    fn resume(&self, pid: u32) -> Result<()> {
        self.signal_live(pid, signal::resume)
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.signal_live(pid, signal::terminate)
    }
}

#[cfg(unix)]
mod signal {
    use anyhow::{Context, Result};
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    fn send(pid: u32, sig: Signal) -> Result<()> {
        kill(Pid::from_raw(pid as i32), sig)
            .with_context(|| format!("failed to send {sig} to pid {pid}"))
    }

    pub fn suspend(pid: u32) -> Result<()> {
        send(pid, Signal::SIGSTOP)
    }

    pub fn resume(pid: u32) -> Result<()> {
        send(pid, Signal::SIGCONT)
    }

    /// SIGTERM, then SIGCONT so a stopped process wakes up to handle it.
    pub fn terminate(pid: u32) -> Result<()> {
        send(pid, Signal::SIGTERM)?;
        send(pid, Signal::SIGCONT)
    }
}

#[cfg(not(unix))]
mod signal {
    use anyhow::{bail, Result};

    pub fn suspend(pid: u32) -> Result<()> {
        bail!("suspending pid {pid} is only supported on unix")
    }

    pub fn resume(pid: u32) -> Result<()> {
        bail!("resuming pid {pid} is only supported on unix")
    }

    pub fn terminate(pid: u32) -> Result<()> {
        bail!("terminating pid {pid} is only supported on unix")
    }
}
