//! Local tool backends: the exec session registry (long-lived external
//! processes that survive daemon restarts) and workspace-confined file
//! operations with before/after state capture.

pub mod exec;
pub mod file_ops;
pub mod output;
pub mod registry;

pub use registry::{ExecConfig, ExecRecord, ExecRegistry, ExecStatus};
