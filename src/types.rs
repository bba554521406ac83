use serde::{Deserialize, Serialize};
use time::{format_description::well_known, OffsetDateTime};

use crate::state::{RunState, ScanState};
use crate::target::Target;

/// One option (and optional argument) handed to a tool on its command line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ToolOptionArgument {
    pub option: String,
    #[serde(default)]
    pub argument: String,
}

impl ToolOptionArgument {
    pub fn new(option: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            option: option.into(),
            argument: argument.into(),
        }
    }

    /// `[option, argument]` with empty parts dropped.
    pub fn to_args(&self) -> Vec<String> {
        [&self.option, &self.argument]
            .into_iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect()
    }
}

/// A datum a tool is known to emit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutputDataSpecification {
    pub element: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

/// Executable path plus the options every launch of the tool receives.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ToolConfiguration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub path: String,
    #[serde(default)]
    pub option_arguments: Vec<ToolOptionArgument>,
    #[serde(default)]
    pub output_data_specifications: Vec<OutputDataSpecification>,
}

impl ToolConfiguration {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            path: path.into(),
            option_arguments: Vec::new(),
            output_data_specifications: Vec::new(),
        }
    }

    /// Returns false if an identical option argument is already present.
    pub fn add_option_argument(&mut self, toa: ToolOptionArgument) -> bool {
        if self.option_arguments.contains(&toa) {
            return false;
        }
        self.option_arguments.push(toa);
        true
    }

    pub fn remove_option_argument(&mut self, toa: &ToolOptionArgument) -> bool {
        let before = self.option_arguments.len();
        self.option_arguments.retain(|t| t != toa);
        before != self.option_arguments.len()
    }

    pub fn add_output_data_specification(&mut self, ods: OutputDataSpecification) -> bool {
        if self.output_data_specifications.contains(&ods) {
            return false;
        }
        self.output_data_specifications.push(ods);
        true
    }

    pub fn arg_list(&self) -> Vec<String> {
        self.option_arguments
            .iter()
            .flat_map(ToolOptionArgument::to_args)
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanConfiguration {
    pub name: String,
    #[serde(default)]
    pub state: ScanState,
    #[serde(default = "default_execution_number")]
    pub execution_number: i64,
    pub tool_configuration: ToolConfiguration,
}

fn default_execution_number() -> i64 {
    -1
}

impl ScanConfiguration {
    pub fn new(name: impl Into<String>, tool: ToolConfiguration) -> Self {
        Self {
            name: name.into(),
            state: ScanState::Inactive,
            execution_number: default_execution_number(),
            tool_configuration: tool,
        }
    }
}

/// Static description of a Run: what to scan and with which tools.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RunConfiguration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target: Target,
    #[serde(default)]
    pub scan_configurations: Vec<ScanConfiguration>,
    #[serde(default)]
    pub run_state: RunState,
}

impl RunConfiguration {
    pub fn new(name: impl Into<String>, description: impl Into<String>, target: Target) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            target,
            scan_configurations: Vec::new(),
            run_state: RunState::Unconfigured,
        }
    }

    /// Adds a scan; the first one moves an `Unconfigured` run to `Configured`.
    /// Returns false if a scan with the same name exists.
    pub fn add_scan_configuration(&mut self, scan: ScanConfiguration) -> bool {
        if self.scan_configurations.iter().any(|s| s.name == scan.name) {
            return false;
        }
        self.scan_configurations.push(scan);
        if self.run_state == RunState::Unconfigured {
            self.run_state = RunState::Configured;
        }
        true
    }

    pub fn remove_scan_configuration(&mut self, name: &str) -> Option<ScanConfiguration> {
        let idx = self.scan_configurations.iter().position(|s| s.name == name)?;
        let removed = self.scan_configurations.remove(idx);
        if self.scan_configurations.is_empty() && self.run_state == RunState::Configured {
            self.run_state = RunState::Unconfigured;
        }
        Some(removed)
    }

    /// Promotes an `Unconfigured` run that already has scans, e.g. one parsed from a document
    /// without a `run_state`. Returns true if the state changed.
    pub fn settle_run_state(&mut self) -> bool {
        if self.run_state == RunState::Unconfigured && !self.scan_configurations.is_empty() {
            self.run_state = RunState::Configured;
            return true;
        }
        false
    }

    pub fn scan(&self, name: &str) -> Option<&ScanConfiguration> {
        self.scan_configurations.iter().find(|s| s.name == name)
    }
}

/// What happened to one scan during one execution attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub scan_name: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    #[serde(default)]
    pub scanned_ips: Vec<String>,
    /// true = success
    pub execution_status: bool,
    #[serde(default)]
    pub formatted_scan_output: String,
}

impl ScanResult {
    pub fn new(scan_name: impl Into<String>) -> Self {
        Self {
            scan_name: scan_name.into(),
            start_time: None,
            end_time: None,
            scanned_ips: Vec::new(),
            execution_status: true,
            formatted_scan_output: String::new(),
        }
    }

    pub fn append_output(&mut self, chunk: &str) {
        self.formatted_scan_output.push_str(chunk);
    }
}

/// One execution attempt of a Run. Scan results are kept in scan configuration order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub timestamp: String,
    pub run_configuration: RunConfiguration,
    #[serde(default)]
    pub scan_results: Vec<ScanResult>,
}

impl RunResult {
    pub fn new(timestamp: impl Into<String>, run_configuration: RunConfiguration) -> Self {
        Self {
            timestamp: timestamp.into(),
            run_configuration,
            scan_results: Vec::new(),
        }
    }

    pub fn run_name(&self) -> &str {
        &self.run_configuration.name
    }

    /// Registers a scan result and returns its index.
    pub fn add_scan_result(&mut self, result: ScanResult) -> usize {
        self.scan_results.push(result);
        self.scan_results.len() - 1
    }

    pub fn scan_result(&self, scan_name: &str) -> Option<&ScanResult> {
        self.scan_results.iter().find(|r| r.scan_name == scan_name)
    }
}

/// RFC 3339 UTC timestamp for the current instant.
pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
