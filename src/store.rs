//! Persistence contract for run configurations and run results.
//!
//! The orchestrator only ever talks to these traits; handles are injected at construction.
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::types::{RunConfiguration, RunResult, ToolConfiguration};

/// Acknowledgement of a create operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub acknowledged: bool,
    pub id: Option<String>,
}

impl Ack {
    fn accepted(id: String) -> Self {
        Self {
            acknowledged: true,
            id: Some(id),
        }
    }

    fn rejected() -> Self {
        Self {
            acknowledged: false,
            id: None,
        }
    }
}

pub trait ConfigurationStore: Send + Sync {
    /// Not acknowledged if a configuration with the same name exists.
    fn create_run_configuration(&self, config: &RunConfiguration) -> Result<Ack>;
    fn read_run_configuration(&self, name: &str) -> Result<Option<RunConfiguration>>;
    fn read_all_run_configurations(&self) -> Result<Vec<RunConfiguration>>;
    /// Replaces the document keyed by `config.name`. Returns false if there was none.
    fn update_run_configuration(&self, config: &RunConfiguration) -> Result<bool>;
}

pub trait ResultStore: Send + Sync {
    fn create_run_result(&self, result: &RunResult) -> Result<Ack>;
    fn read_run_result(&self, name: &str, timestamp: &str) -> Result<Option<RunResult>>;
    /// Execution history of one run, oldest first.
    fn read_run_results(&self, name: &str) -> Result<Vec<RunResult>>;
    fn read_all_run_results(&self) -> Result<Vec<RunResult>>;
    /// Full-document replace keyed by (run name, timestamp); last writer wins.
    fn update_run_result(&self, result: &RunResult) -> Result<bool>;
}

/// Library of tool configurations that scans can be built from, keyed by tool name.
pub trait ToolStore: Send + Sync {
    fn create_tool_configuration(&self, tool: &ToolConfiguration) -> Result<Ack>;
    fn read_tool_configuration(&self, name: &str) -> Result<Option<ToolConfiguration>>;
    fn read_all_tool_configurations(&self) -> Result<Vec<ToolConfiguration>>;
    fn update_tool_configuration(&self, tool: &ToolConfiguration) -> Result<bool>;
    /// Returns false if there was no such tool.
    fn delete_tool_configuration(&self, name: &str) -> Result<bool>;
}

/// The store handles an orchestrator or server is built with.
#[derive(Clone)]
pub struct Stores {
    pub configs: Arc<dyn ConfigurationStore>,
    pub results: Arc<dyn ResultStore>,
    pub tools: Arc<dyn ToolStore>,
}

impl Stores {
    pub fn new(
        configs: Arc<dyn ConfigurationStore>,
        results: Arc<dyn ResultStore>,
        tools: Arc<dyn ToolStore>,
    ) -> Self {
        Self {
            configs,
            results,
            tools,
        }
    }

    /// Every role served by one backing store.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: ConfigurationStore + ResultStore + ToolStore + 'static,
    {
        Self {
            configs: store.clone(),
            results: store.clone(),
            tools: store,
        }
    }
}

/// Run a synchronous store call from async code. On a multi-threaded runtime the worker
/// thread is handed over to the scheduler for the duration of the call.
pub fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(h) if matches!(h.runtime_flavor(), RuntimeFlavor::MultiThread) => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Oldest first. RFC 3339 strings do not sort lexically once fractional seconds vary.
fn by_timestamp(a: &RunResult, b: &RunResult) -> Ordering {
    match (
        OffsetDateTime::parse(&a.timestamp, &Rfc3339),
        OffsetDateTime::parse(&b.timestamp, &Rfc3339),
    ) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.timestamp.cmp(&b.timestamp),
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    configs: RwLock<HashMap<String, RunConfiguration>>,
    results: RwLock<Vec<RunResult>>,
    tools: RwLock<HashMap<String, ToolConfiguration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigurationStore for MemoryStore {
    fn create_run_configuration(&self, config: &RunConfiguration) -> Result<Ack> {
        let mut map = self.configs.write();
        if map.contains_key(&config.name) {
            return Ok(Ack::rejected());
        }
        map.insert(config.name.clone(), config.clone());
        Ok(Ack::accepted(config.name.clone()))
    }

    fn read_run_configuration(&self, name: &str) -> Result<Option<RunConfiguration>> {
        Ok(self.configs.read().get(name).cloned())
    }

    fn read_all_run_configurations(&self) -> Result<Vec<RunConfiguration>> {
        let mut all: Vec<_> = self.configs.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    fn update_run_configuration(&self, config: &RunConfiguration) -> Result<bool> {
        let mut map = self.configs.write();
        match map.get_mut(&config.name) {
            Some(slot) => {
                *slot = config.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl ResultStore for MemoryStore {
    fn create_run_result(&self, result: &RunResult) -> Result<Ack> {
        let mut list = self.results.write();
        if list
            .iter()
            .any(|r| r.run_name() == result.run_name() && r.timestamp == result.timestamp)
        {
            return Ok(Ack::rejected());
        }
        list.push(result.clone());
        Ok(Ack::accepted(format!("{}@{}", result.run_name(), result.timestamp)))
    }

    fn read_run_result(&self, name: &str, timestamp: &str) -> Result<Option<RunResult>> {
        Ok(self
            .results
            .read()
            .iter()
            .find(|r| r.run_name() == name && r.timestamp == timestamp)
            .cloned())
    }

    fn read_run_results(&self, name: &str) -> Result<Vec<RunResult>> {
        let mut history: Vec<RunResult> = self
            .results
            .read()
            .iter()
            .filter(|r| r.run_name() == name)
            .cloned()
            .collect();
        history.sort_by(by_timestamp);
        Ok(history)
    }

    fn read_all_run_results(&self) -> Result<Vec<RunResult>> {
        Ok(self.results.read().clone())
    }

    fn update_run_result(&self, result: &RunResult) -> Result<bool> {
        let mut list = self.results.write();
        match list
            .iter_mut()
            .find(|r| r.run_name() == result.run_name() && r.timestamp == result.timestamp)
        {
            Some(slot) => {
                *slot = result.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl ToolStore for MemoryStore {
    fn create_tool_configuration(&self, tool: &ToolConfiguration) -> Result<Ack> {
        let mut map = self.tools.write();
        if map.contains_key(&tool.name) {
            return Ok(Ack::rejected());
        }
        map.insert(tool.name.clone(), tool.clone());
        Ok(Ack::accepted(tool.name.clone()))
    }

    fn read_tool_configuration(&self, name: &str) -> Result<Option<ToolConfiguration>> {
        Ok(self.tools.read().get(name).cloned())
    }

    fn read_all_tool_configurations(&self) -> Result<Vec<ToolConfiguration>> {
        let mut all: Vec<_> = self.tools.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    fn update_tool_configuration(&self, tool: &ToolConfiguration) -> Result<bool> {
        match self.tools.write().get_mut(&tool.name) {
            Some(slot) => {
                *slot = tool.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_tool_configuration(&self, name: &str) -> Result<bool> {
        Ok(self.tools.write().remove(name).is_some())
    }
}

/// Directory of pretty-printed JSON documents: `runs/<name>.json`,
/// `results/<name>/<timestamp>.json` and `tools/<name>.json`.
///
/// Keys are escaped losslessly into file names, and every read checks the key stored inside
/// the document as well.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    // serializes writers within this process
    write_lock: parking_lot::Mutex<()>,
}

impl JsonFileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("runs"))
            .with_context(|| format!("failed to create store at {}", root.display()))?;
        fs::create_dir_all(root.join("results"))
            .with_context(|| format!("failed to create store at {}", root.display()))?;
        fs::create_dir_all(root.join("tools"))
            .with_context(|| format!("failed to create store at {}", root.display()))?;
        Ok(Self {
            root,
            write_lock: parking_lot::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.root.join("runs").join(format!("{}.json", file_key(name)))
    }

    fn results_dir(&self, name: &str) -> PathBuf {
        self.root.join("results").join(file_key(name))
    }

    fn result_path(&self, name: &str, timestamp: &str) -> PathBuf {
        self.results_dir(name)
            .join(format!("{}.json", file_key(timestamp)))
    }

    fn tool_path(&self, name: &str) -> PathBuf {
        self.root.join("tools").join(format!("{}.json", file_key(name)))
    }
}

impl ConfigurationStore for JsonFileStore {
    fn create_run_configuration(&self, config: &RunConfiguration) -> Result<Ack> {
        let _guard = self.write_lock.lock();
        let path = self.config_path(&config.name);
        if path.exists() {
            return Ok(Ack::rejected());
        }
        write_json(&path, config)?;
        Ok(Ack::accepted(path.display().to_string()))
    }

    fn read_run_configuration(&self, name: &str) -> Result<Option<RunConfiguration>> {
        let config: Option<RunConfiguration> = read_json_opt(&self.config_path(name))?;
        Ok(config.filter(|c| c.name == name))
    }

    fn read_all_run_configurations(&self) -> Result<Vec<RunConfiguration>> {
        let mut all: Vec<RunConfiguration> = read_json_dir(&self.root.join("runs"))?;
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    fn update_run_configuration(&self, config: &RunConfiguration) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let path = self.config_path(&config.name);
        if !path.exists() {
            return Ok(false);
        }
        write_json(&path, config)?;
        Ok(true)
    }
}

impl ResultStore for JsonFileStore {
    fn create_run_result(&self, result: &RunResult) -> Result<Ack> {
        let _guard = self.write_lock.lock();
        let path = self.result_path(result.run_name(), &result.timestamp);
        if path.exists() {
            return Ok(Ack::rejected());
        }
        fs::create_dir_all(self.results_dir(result.run_name()))
            .with_context(|| format!("failed to create results dir for {}", result.run_name()))?;
        write_json(&path, result)?;
        Ok(Ack::accepted(path.display().to_string()))
    }

    fn read_run_result(&self, name: &str, timestamp: &str) -> Result<Option<RunResult>> {
        let result: Option<RunResult> = read_json_opt(&self.result_path(name, timestamp))?;
        Ok(result.filter(|r| r.run_name() == name && r.timestamp == timestamp))
    }

    fn read_run_results(&self, name: &str) -> Result<Vec<RunResult>> {
        let dir = self.results_dir(name);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut all: Vec<RunResult> = read_json_dir(&dir)?;
        all.retain(|r| r.run_name() == name);
        all.sort_by(by_timestamp);
        Ok(all)
    }

    fn read_all_run_results(&self) -> Result<Vec<RunResult>> {
        let mut all = Vec::new();
        for entry in fs::read_dir(self.root.join("results"))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let mut batch: Vec<RunResult> = read_json_dir(&entry.path())?;
                all.append(&mut batch);
            }
        }
        all.sort_by(|a, b| a.run_name().cmp(b.run_name()).then_with(|| by_timestamp(a, b)));
        Ok(all)
    }

    fn update_run_result(&self, result: &RunResult) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let path = self.result_path(result.run_name(), &result.timestamp);
        if !path.exists() {
            return Ok(false);
        }
        write_json(&path, result)?;
        Ok(true)
    }
}

impl ToolStore for JsonFileStore {
    fn create_tool_configuration(&self, tool: &ToolConfiguration) -> Result<Ack> {
        let _guard = self.write_lock.lock();
        let path = self.tool_path(&tool.name);
        if path.exists() {
            return Ok(Ack::rejected());
        }
        write_json(&path, tool)?;
        Ok(Ack::accepted(path.display().to_string()))
    }

    fn read_tool_configuration(&self, name: &str) -> Result<Option<ToolConfiguration>> {
        let tool: Option<ToolConfiguration> = read_json_opt(&self.tool_path(name))?;
        Ok(tool.filter(|t| t.name == name))
    }

    fn read_all_tool_configurations(&self) -> Result<Vec<ToolConfiguration>> {
        let mut all: Vec<ToolConfiguration> = read_json_dir(&self.root.join("tools"))?;
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    fn update_tool_configuration(&self, tool: &ToolConfiguration) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let path = self.tool_path(&tool.name);
        if !path.exists() {
            return Ok(false);
        }
        write_json(&path, tool)?;
        Ok(true)
    }

    fn delete_tool_configuration(&self, name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let path = self.tool_path(name);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
        Ok(true)
    }
}

/// Map an arbitrary key onto a file name, one to one: `[A-Za-z0-9-]` is kept and every other
/// byte (including `_`, the escape) becomes `_XX` in upper-case hex.
fn file_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "_{b:02X}");
        }
    }
    out
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let file = File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
    serde_json::to_writer_pretty(file, value)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let value = serde_json::from_reader(file)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

fn read_json_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(v) = read_json_opt(&path)? {
            out.push(v);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;
    use crate::types::{ScanConfiguration, ScanResult};

    fn run(name: &str) -> RunConfiguration {
        let mut rc = RunConfiguration::new(name, "desc", Target::with_whitelist(["10.0.0.1"]).unwrap());
        rc.add_scan_configuration(ScanConfiguration::new(
            "A",
            ToolConfiguration::new("echo", "/bin/echo"),
        ));
        rc
    }

    fn exercise<S: ConfigurationStore + ResultStore>(store: &S) {
        let rc = run("R1");
        assert!(store.create_run_configuration(&rc).unwrap().acknowledged);
        assert!(!store.create_run_configuration(&rc).unwrap().acknowledged);
        assert_eq!(store.read_run_configuration("R1").unwrap(), Some(rc.clone()));
        assert!(store.read_run_configuration("nope").unwrap().is_none());

        let mut changed = rc.clone();
        changed.description = "changed".into();
        assert!(store.update_run_configuration(&changed).unwrap());
        assert!(!store.update_run_configuration(&run("ghost")).unwrap());
        assert_eq!(store.read_all_run_configurations().unwrap(), vec![changed]);

        let mut first = RunResult::new("2024-01-01T00:00:00Z", rc.clone());
        first.add_scan_result(ScanResult::new("A"));
        let second = RunResult::new("2024-01-02T00:00:00Z", rc.clone());
        assert!(store.create_run_result(&first).unwrap().acknowledged);
        assert!(store.create_run_result(&second).unwrap().acknowledged);
        assert!(!store.create_run_result(&second).unwrap().acknowledged);

        first.scan_results[0].append_output("open 22/tcp\n");
        assert!(store.update_run_result(&first).unwrap());
        let back = store
            .read_run_result("R1", "2024-01-01T00:00:00Z")
            .unwrap()
            .unwrap();
        assert_eq!(back.scan_results[0].formatted_scan_output, "open 22/tcp\n");

        let history = store.read_run_results("R1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].timestamp, "2024-01-01T00:00:00Z");
        assert!(store.read_run_results("other").unwrap().is_empty());
        assert_eq!(store.read_all_run_results().unwrap().len(), 2);
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn json_file_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        exercise(&store);
        assert!(dir.path().join("runs").join("R1.json").exists());
    }

    #[test]
    fn file_keys_are_escaped_one_to_one() {
        assert_eq!(file_key("2024-01-01T00:00:00.5Z"), "2024-01-01T00_3A00_3A00_2E5Z");
        assert_eq!(file_key("../etc"), "_2E_2E_2Fetc");
        assert_eq!(file_key("R 1"), "R_201");
        assert_eq!(file_key("R_1"), "R_5F1");
        assert_eq!(file_key("R_201"), "R_5F201");
    }

    #[test]
    fn similar_run_names_do_not_share_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        assert!(store.create_run_configuration(&run("R 1")).unwrap().acknowledged);
        assert!(store.create_run_configuration(&run("R_1")).unwrap().acknowledged);
        assert_eq!(store.read_run_configuration("R_1").unwrap().unwrap().name, "R_1");
        assert_eq!(store.read_run_configuration("R 1").unwrap().unwrap().name, "R 1");

        let ts = "2024-01-01T00:00:00Z";
        assert!(store.create_run_result(&RunResult::new(ts, run("R 1"))).unwrap().acknowledged);
        assert!(store.read_run_results("R_1").unwrap().is_empty());
        assert!(store.read_run_result("R_1", ts).unwrap().is_none());
        assert_eq!(store.read_run_results("R 1").unwrap().len(), 1);
    }

    #[test]
    fn misplaced_documents_are_not_returned_under_another_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        store.create_run_configuration(&run("R1")).unwrap();
        // a document whose file name disagrees with the name inside it
        fs::copy(store.config_path("R1"), store.config_path("R2")).unwrap();
        assert!(store.read_run_configuration("R2").unwrap().is_none());
    }

    fn history_order<S: ResultStore>(store: &S) {
        let rc = run("R1");
        for ts in ["2024-01-01T00:00:00.5Z", "2024-01-01T00:00:00Z", "2024-01-01T00:00:00.25Z"] {
            store.create_run_result(&RunResult::new(ts, rc.clone())).unwrap();
        }
        let order: Vec<String> = store
            .read_run_results("R1")
            .unwrap()
            .into_iter()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(
            order,
            ["2024-01-01T00:00:00Z", "2024-01-01T00:00:00.25Z", "2024-01-01T00:00:00.5Z"]
        );
    }

    #[test]
    fn history_is_ordered_by_instant_not_by_text() {
        history_order(&MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        history_order(&JsonFileStore::open(dir.path()).unwrap());
    }

    fn tools_contract<S: ToolStore>(store: &S) {
        let mut nmap = ToolConfiguration::new("nmap", "/usr/bin/nmap");
        assert!(store.create_tool_configuration(&nmap).unwrap().acknowledged);
        assert!(!store.create_tool_configuration(&nmap).unwrap().acknowledged);
        store
            .create_tool_configuration(&ToolConfiguration::new("amass", "/usr/bin/amass"))
            .unwrap();

        nmap.description = "port scanner".into();
        assert!(store.update_tool_configuration(&nmap).unwrap());
        assert_eq!(store.read_tool_configuration("nmap").unwrap(), Some(nmap));
        let names: Vec<String> = store
            .read_all_tool_configurations()
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, ["amass", "nmap"]);

        assert!(store.delete_tool_configuration("nmap").unwrap());
        assert!(!store.delete_tool_configuration("nmap").unwrap());
        assert!(store.read_tool_configuration("nmap").unwrap().is_none());
        assert!(!store
            .update_tool_configuration(&ToolConfiguration::new("nmap", "/x"))
            .unwrap());
    }

    #[test]
    fn tool_library_contract() {
        tools_contract(&MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        tools_contract(&JsonFileStore::open(dir.path()).unwrap());
    }

    #[test]
    fn blocking_runs_outside_a_runtime() {
        assert_eq!(blocking(|| 7), 7);
    }

    #[tokio::test]
    async fn blocking_runs_on_a_current_thread_runtime() {
        assert_eq!(blocking(|| 7), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_runs_on_a_multi_thread_runtime() {
        assert_eq!(blocking(|| 7), 7);
    }
}
