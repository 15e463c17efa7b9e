//! # Execution Broker
//!
//! Runs untrusted source snippets in one of several languages and returns a
//! normalized result. Every execution gets its own working area and
//! supervised process tree, bounded by wall-clock, memory, process-count and
//! output limits, and a fixed pool of workers caps how many run at once.

#[cfg(not(target_os = "linux"))]
compile_error!("exec-broker relies on child subreapers, /proc and rlimits and only builds on Linux");

mod config;
mod error;
mod languages;
mod normalize;
mod registry;
mod sandbox;
mod scheduler;
mod types;

#[cfg(test)]
mod tests;

pub use config::{ExecConfig, OverflowPolicy};
pub use error::Error;
pub use normalize::{Normalizer, StderrPolicy};
pub use registry::{CommandTemplate, InvocationKind, LanguageDescriptor, RunnerRegistry};
pub use scheduler::{ExecutionHandle, PoolMetrics, Scheduler};
pub use types::{ExecutionRequest, ExecutionResult, ExecutionState, Outcome, ResourceLimits};

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, Error>;
