use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Code execution request
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Language identifier, matched case-insensitively against the registry
    pub language: String,
    /// Source code to execute
    pub source: String,
    /// Bytes piped to the program's stdin, passed through untouched
    pub stdin: Option<Vec<u8>>,
    /// Requested wall-clock timeout, clamped to the configured maximum
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How an execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    CompileError,
    RuntimeError,
    Timeout,
    ResourceExceeded,
    Cancelled,
    InternalError,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::CompileError => "compile_error",
            Outcome::RuntimeError => "runtime_error",
            Outcome::Timeout => "timeout",
            Outcome::ResourceExceeded => "resource_exceeded",
            Outcome::Cancelled => "cancelled",
            Outcome::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

/// Execution result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Execution this result belongs to
    pub id: Uuid,
    pub outcome: Outcome,
    /// Program output (stdout), lossily decoded
    pub stdout: String,
    /// Program errors (stderr), or compiler diagnostics on a compile error
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Absent when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Compiler warnings from a successful compile step, or stderr kept
    /// alongside a success under the advisory stderr policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory: Option<String>,
}

impl ExecutionResult {
    /// A result for an execution that never reached a process
    pub(crate) fn without_process(id: Uuid, outcome: Outcome, details: impl Into<String>) -> Self {
        Self {
            id,
            outcome,
            stdout: String::new(),
            stderr: details.into(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: None,
            signal: None,
            duration: Duration::ZERO,
            advisory: None,
        }
    }
}

/// Lifecycle state of an execution handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Queued,
    Running,
    Completed,
    TimedOut,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionState::Queued | ExecutionState::Running)
    }

    /// States only move forward: Queued -> Running -> terminal, or straight
    /// from Queued to a terminal state when the request never ran.
    pub fn can_advance_to(self, next: ExecutionState) -> bool {
        match (self, next) {
            (ExecutionState::Queued, ExecutionState::Running) => true,
            (ExecutionState::Queued, next) | (ExecutionState::Running, next) => {
                next.is_terminal()
            }
            _ => false,
        }
    }

    /// Terminal state recorded for a finished execution
    pub fn for_outcome(outcome: Outcome) -> ExecutionState {
        match outcome {
            Outcome::Success
            | Outcome::CompileError
            | Outcome::RuntimeError
            | Outcome::ResourceExceeded => ExecutionState::Completed,
            Outcome::Timeout => ExecutionState::TimedOut,
            Outcome::Cancelled => ExecutionState::Cancelled,
            Outcome::InternalError => ExecutionState::Failed,
        }
    }
}

/// Resource limits for one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Wall-clock budget for the run step
    #[serde(rename = "wall_clock_timeout_ms", with = "duration_ms")]
    pub wall_clock_timeout: Duration,
    /// Memory ceiling (bytes)
    pub memory_ceiling_bytes: u64,
    /// Per-stream capture cap (bytes)
    pub max_output_bytes: usize,
    /// Largest file the program may write (bytes)
    pub file_size_bytes: u64,
    /// Processes the program may have alive at once, itself included
    pub max_processes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_clock_timeout: Duration::from_secs(5),
            memory_ceiling_bytes: 256 * 1024 * 1024, // 256MB
            max_output_bytes: 64 * 1024,             // 64KB
            file_size_bytes: 10 * 1024 * 1024,       // 10MB
            max_processes: 64,
        }
    }
}

impl ResourceLimits {
    /// Component-wise minimum against the server-side maxima
    pub fn clamp_to(&self, max: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            wall_clock_timeout: self.wall_clock_timeout.min(max.wall_clock_timeout),
            memory_ceiling_bytes: self.memory_ceiling_bytes.min(max.memory_ceiling_bytes),
            max_output_bytes: self.max_output_bytes.min(max.max_output_bytes),
            file_size_bytes: self.file_size_bytes.min(max.file_size_bytes),
            max_processes: self.max_processes.min(max.max_processes),
        }
    }

    pub fn memory_mb(&self) -> u64 {
        (self.memory_ceiling_bytes / (1024 * 1024)).max(1)
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
