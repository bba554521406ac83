use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a Run, derived from explicit commands and from the aggregate state of its scans.
///
/// `Unconfigured -> Configured -> Active <-> Inactive -> Terminated`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RunState {
    #[default]
    Unconfigured,
    Configured,
    Active,
    Inactive,
    Terminated,
}

/// Lifecycle of a single Scan, a projection of its child process.
///
/// `Inactive <-> Active -> Terminated`. `Paused` is declared for stored documents but never
/// assigned: a suspended scan is `Inactive` with a live process handle.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScanState {
    Active,
    #[default]
    Inactive,
    Paused,
    Terminated,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Unconfigured => "Unconfigured",
            RunState::Configured => "Configured",
            RunState::Active => "Active",
            RunState::Inactive => "Inactive",
            RunState::Terminated => "Terminated",
        }
    }
}

impl ScanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Active => "Active",
            ScanState::Inactive => "Inactive",
            ScanState::Paused => "Paused",
            ScanState::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
