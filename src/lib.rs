//! Library crate for sea-runner: run/scan orchestration over supervised tool processes.
pub mod orchestrator;
pub mod server;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod target;
pub mod types;
pub mod worker;
