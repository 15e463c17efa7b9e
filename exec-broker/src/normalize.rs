//! Result normalizer: folds whatever the sandbox observed into one stable
//! `ExecutionResult` shape.

use nix::sys::signal::Signal;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use uuid::Uuid;

use crate::types::{ExecutionResult, Outcome};

/// Allocation failures in the exact form each runtime reports them. A
/// Python `MemoryError` only counts as the final traceback line.
static OUT_OF_MEMORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?m)^MemoryError\b.*\s*\z",
        r"|^terminate called after throwing an instance of 'std::bad_alloc'",
        r#"|^Exception in thread "[^"]*" java\.lang\.OutOfMemoryError\b"#,
        r"|^FATAL ERROR: .*JavaScript heap out of memory",
        r"|: xmalloc: cannot allocate \d+ bytes",
    ))
    .expect("static pattern compiles")
});

/// How a run that exits 0 but writes to stderr is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrPolicy {
    /// Any stderr output is a runtime error
    #[default]
    Strict,
    /// Exit status decides; stderr is surfaced as advisory text
    Advisory,
}

/// Bytes read from one stream, capped at the output limit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl Captured {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl ExitInfo {
    fn describe(&self) -> String {
        match (self.code, self.signal) {
            (_, Some(signal)) => format!("terminated by signal {}", signal_name(signal)),
            (Some(code), None) => format!("exited with status {}", code),
            (None, None) => "exited with unknown status".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Compile,
    Run,
}

/// What the sandbox saw, before any classification
#[derive(Debug)]
pub(crate) enum RawOutcome {
    CompileFailed {
        exit: ExitInfo,
        stdout: Captured,
        stderr: Captured,
    },
    Exited {
        exit: ExitInfo,
        stdout: Captured,
        stderr: Captured,
        compile_warnings: Option<String>,
    },
    TimedOut {
        phase: Phase,
        limit: Duration,
        stdout: Captured,
        stderr: Captured,
    },
    Cancelled {
        stdout: Captured,
        stderr: Captured,
    },
    TooManyProcesses {
        limit: u64,
        stdout: Captured,
        stderr: Captured,
    },
    /// The sandbox itself failed: no working area, spawn failure, ...
    Internal(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    policy: StderrPolicy,
}

impl Normalizer {
    pub fn new(policy: StderrPolicy) -> Self {
        Self { policy }
    }

    pub(crate) fn normalize(&self, id: Uuid, raw: RawOutcome, duration: Duration) -> ExecutionResult {
        let mut result = match raw {
            RawOutcome::CompileFailed {
                exit,
                stdout,
                stderr,
            } => {
                let mut result = assemble(id, Outcome::CompileError, stdout, stderr, exit);
                if result.stderr.is_empty() {
                    result.stderr = format!("compiler {}", exit.describe());
                }
                result
            }
            RawOutcome::Exited {
                exit,
                stdout,
                stderr,
                compile_warnings,
            } => {
                let outcome = self.classify_exit(&exit, &stderr);
                let mut result = assemble(id, outcome, stdout, stderr, exit);
                result.advisory = compile_warnings;
                match outcome {
                    Outcome::Success if !result.stderr.is_empty() => {
                        let stderr = result.stderr.clone();
                        result.advisory = Some(match result.advisory.take() {
                            Some(warnings) => format!("{}\n{}", warnings, stderr),
                            None => stderr,
                        });
                    }
                    Outcome::RuntimeError | Outcome::ResourceExceeded
                        if result.stderr.is_empty() =>
                    {
                        result.stderr = format!("process {}", exit.describe());
                    }
                    _ => {}
                }
                result
            }
            RawOutcome::TimedOut {
                phase,
                limit,
                stdout,
                stderr,
            } => {
                let mut result = assemble(id, Outcome::Timeout, stdout, stderr, ExitInfo {
                    code: None,
                    signal: None,
                });
                let step = match phase {
                    Phase::Compile => "compilation",
                    Phase::Run => "execution",
                };
                let note = format!("{} exceeded the {} ms time limit", step, limit.as_millis());
                append_line(&mut result.stderr, &note);
                result
            }
            RawOutcome::Cancelled { stdout, stderr } => {
                let mut result = assemble(id, Outcome::Cancelled, stdout, stderr, ExitInfo {
                    code: None,
                    signal: None,
                });
                append_line(&mut result.stderr, "execution cancelled");
                result
            }
            RawOutcome::TooManyProcesses {
                limit,
                stdout,
                stderr,
            } => {
                let mut result =
                    assemble(id, Outcome::ResourceExceeded, stdout, stderr, ExitInfo {
                        code: None,
                        signal: None,
                    });
                let note = format!("execution exceeded the limit of {} processes", limit);
                append_line(&mut result.stderr, &note);
                result
            }
            RawOutcome::Internal(details) => {
                ExecutionResult::without_process(id, Outcome::InternalError, details)
            }
        };
        result.duration = duration;
        result
    }

    fn classify_exit(&self, exit: &ExitInfo, stderr: &Captured) -> Outcome {
        if let Some(signal) = exit.signal {
            return match Signal::try_from(signal) {
                // SIGKILL we did not send comes from the kernel OOM killer
                Ok(Signal::SIGXCPU | Signal::SIGXFSZ | Signal::SIGKILL) => {
                    Outcome::ResourceExceeded
                }
                _ if mentions_oom(stderr) => Outcome::ResourceExceeded,
                _ => Outcome::RuntimeError,
            };
        }
        match exit.code {
            Some(0) if stderr.is_empty() => Outcome::Success,
            Some(0) => match self.policy {
                StderrPolicy::Strict => Outcome::RuntimeError,
                StderrPolicy::Advisory => Outcome::Success,
            },
            _ if mentions_oom(stderr) => Outcome::ResourceExceeded,
            _ => Outcome::RuntimeError,
        }
    }
}

fn assemble(
    id: Uuid,
    outcome: Outcome,
    stdout: Captured,
    stderr: Captured,
    exit: ExitInfo,
) -> ExecutionResult {
    ExecutionResult {
        id,
        outcome,
        stdout: stdout.text(),
        stderr: stderr.text(),
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        exit_code: exit.code,
        signal: exit.signal,
        duration: Duration::ZERO,
        advisory: None,
    }
}

fn mentions_oom(stderr: &Captured) -> bool {
    OUT_OF_MEMORY.is_match(&String::from_utf8_lossy(&stderr.bytes))
}

fn append_line(buffer: &mut String, line: &str) {
    if !buffer.is_empty() && !buffer.ends_with('\n') {
        buffer.push('\n');
    }
    buffer.push_str(line);
}

fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| signal.to_string())
}
