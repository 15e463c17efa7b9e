//! Execution sandbox: one working area and one supervised process tree per
//! execution, both torn down on every exit path.

mod capture;
mod process_tree;
mod supervisor;

use process_tree::ProcessTree;
use supervisor::KernelLimits;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::{
    fs,
    io::AsyncWriteExt,
    process::Command,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::{
    error::Error,
    normalize::{Captured, ExitInfo, Phase, RawOutcome},
    registry::{CommandTemplate, LanguageDescriptor, TemplateVars},
    scheduler::ExecutionReporter,
    types::ResourceLimits,
};

/// PATH handed to sandboxed programs; the environment is otherwise cleared
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long output pipes may stay open after the process tree is gone
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// How often a running step's processes are counted
const CENSUS_INTERVAL: Duration = Duration::from_millis(10);

/// Sandbox environment for one execution
pub struct Sandbox {
    /// Root directory for the sandbox
    root_dir: PathBuf,
    /// Resource limits
    limits: ResourceLimits,
    compile_timeout: Duration,
    id: Uuid,
}

enum Termination {
    Exited(ExitInfo),
    TimedOut,
    Cancelled,
    /// More processes alive at once than the limit allows
    TooManyProcesses,
}

/// Result of running one command to completion (or to termination)
struct StepOutput {
    termination: Termination,
    stdout: Captured,
    stderr: Captured,
}

struct StepSpec<'a> {
    phase: Phase,
    command: &'a CommandTemplate,
    stdin: Option<&'a [u8]>,
    timeout: Duration,
    address_space: Option<u64>,
}

impl Sandbox {
    /// Create the working area `<work_root>/sandbox-<id>`
    pub async fn new(
        id: Uuid,
        work_root: &Path,
        limits: ResourceLimits,
        compile_timeout: Duration,
    ) -> Result<Self, Error> {
        fs::create_dir_all(work_root)
            .await
            .map_err(|e| Error::Sandbox(format!("Failed to create work root: {}", e)))?;

        let root_dir = work_root.join(format!("sandbox-{}", id));
        fs::create_dir(&root_dir)
            .await
            .map_err(|e| Error::Sandbox(format!("Failed to create sandbox directory: {}", e)))?;

        // From here on Drop owns the directory
        let sandbox = Sandbox {
            root_dir,
            limits,
            compile_timeout,
            id,
        };

        for dir in ["tmp", "home"] {
            fs::create_dir(sandbox.root_dir.join(dir)).await.map_err(|e| {
                Error::Sandbox(format!("Failed to create {} directory: {}", dir, e))
            })?;
        }

        Ok(sandbox)
    }

    #[cfg(test)]
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Compile (when the descriptor asks for it) and run `source`.
    /// Never fails: infrastructure problems come back as
    /// `RawOutcome::Internal` for the normalizer to fold.
    #[instrument(skip_all, fields(execution = %self.id, language = %descriptor.id))]
    pub(crate) async fn execute(
        &self,
        descriptor: &LanguageDescriptor,
        source: &str,
        stdin: Option<&[u8]>,
        cancel: &CancellationToken,
        reporter: &ExecutionReporter,
    ) -> RawOutcome {
        reporter.report_running();
        reporter.record_workdir(&self.root_dir);

        match self.compile_and_run(descriptor, source, stdin, cancel, reporter).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Sandbox failure: {}", e);
                RawOutcome::Internal(e.to_string())
            }
        }
    }

    async fn compile_and_run(
        &self,
        descriptor: &LanguageDescriptor,
        source: &str,
        stdin: Option<&[u8]>,
        cancel: &CancellationToken,
        reporter: &ExecutionReporter,
    ) -> Result<RawOutcome, Error> {
        let Some(run) = descriptor.run.as_ref() else {
            return Err(Error::NotExecutable(descriptor.id.clone()));
        };

        let source_path = self.root_dir.join(&descriptor.source_file);
        fs::write(&source_path, source)
            .await
            .map_err(|e| Error::Sandbox(format!("Failed to write source file: {}", e)))?;

        let artifact_path = descriptor
            .artifact
            .as_ref()
            .map(|artifact| self.root_dir.join(artifact))
            .unwrap_or_else(|| source_path.clone());
        let vars = TemplateVars {
            source: &source_path,
            artifact: &artifact_path,
            workdir: &self.root_dir,
            memory_mb: self.limits.memory_mb(),
        };

        let mut compile_warnings = None;
        if let Some(compile) = descriptor.compile.as_ref() {
            let step = StepSpec {
                phase: Phase::Compile,
                command: compile,
                stdin: None,
                timeout: self.compile_timeout,
                address_space: None,
            };
            let output = self.run_step(&step, &vars, cancel, reporter).await?;
            let exit = match output.termination {
                Termination::Exited(exit) => exit,
                Termination::TimedOut => {
                    return Ok(RawOutcome::TimedOut {
                        phase: Phase::Compile,
                        limit: self.compile_timeout,
                        stdout: output.stdout,
                        stderr: output.stderr,
                    })
                }
                Termination::Cancelled => {
                    return Ok(RawOutcome::Cancelled {
                        stdout: output.stdout,
                        stderr: output.stderr,
                    })
                }
                Termination::TooManyProcesses => {
                    return Ok(RawOutcome::TooManyProcesses {
                        limit: self.limits.max_processes,
                        stdout: output.stdout,
                        stderr: output.stderr,
                    })
                }
            };

            let produced = fs::try_exists(&artifact_path).await.unwrap_or(false);
            if exit.code != Some(0) || !produced {
                debug!("Compilation failed: {:?}, artifact produced: {}", exit, produced);
                let mut stderr = output.stderr;
                if stderr.is_empty() && exit.code == Some(0) {
                    stderr.bytes = format!("compiler produced no {}", artifact_path.display())
                        .into_bytes();
                }
                return Ok(RawOutcome::CompileFailed {
                    exit,
                    stdout: output.stdout,
                    stderr,
                });
            }
            if !output.stderr.is_empty() {
                compile_warnings = Some(String::from_utf8_lossy(&output.stderr.bytes).into_owned());
            }
        }

        let step = StepSpec {
            phase: Phase::Run,
            command: run,
            stdin,
            timeout: self.limits.wall_clock_timeout,
            address_space: descriptor
                .limit_address_space
                .then_some(self.limits.memory_ceiling_bytes),
        };
        let output = self.run_step(&step, &vars, cancel, reporter).await?;

        Ok(match output.termination {
            Termination::Exited(exit) => RawOutcome::Exited {
                exit,
                stdout: output.stdout,
                stderr: output.stderr,
                compile_warnings,
            },
            Termination::TimedOut => RawOutcome::TimedOut {
                phase: Phase::Run,
                limit: self.limits.wall_clock_timeout,
                stdout: output.stdout,
                stderr: output.stderr,
            },
            Termination::Cancelled => RawOutcome::Cancelled {
                stdout: output.stdout,
                stderr: output.stderr,
            },
            Termination::TooManyProcesses => RawOutcome::TooManyProcesses {
                limit: self.limits.max_processes,
                stdout: output.stdout,
                stderr: output.stderr,
            },
        })
    }

    /// Spawn one command under a supervisor and wait for it to exit, hit
    /// its deadline, outgrow its process limit, or be cancelled. The whole
    /// tree is killed afterwards in every case so no descendant outlives
    /// the step, not even one that called `setsid`.
    async fn run_step(
        &self,
        step: &StepSpec<'_>,
        vars: &TemplateVars<'_>,
        cancel: &CancellationToken,
        reporter: &ExecutionReporter,
    ) -> Result<StepOutput, Error> {
        let (program, args) = step.command.render(vars);
        let program_path = self.resolve_program(&program)?;

        debug!("Sandbox {:?} - Command: {}", step.phase, program_path.display());
        debug!("Sandbox {:?} - Args: {:?}", step.phase, args);

        let mut command = Command::new(&program_path);
        command
            .args(&args)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", self.root_dir.join("home"))
            .env("TMPDIR", self.root_dir.join("tmp"))
            .env("LANG", "C.UTF-8")
            .current_dir(&self.root_dir)
            .stdin(if step.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let (status_reader, status_writer) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| Error::Sandbox(format!("Failed to create status pipe: {}", e)))?;
        let status_fd = status_writer.as_raw_fd();
        let limits = KernelLimits {
            file_size: self.limits.file_size_bytes,
            cpu_seconds: step.timeout.as_secs() + 1,
            address_space: step.address_space,
            processes: process_tree::nproc_ceiling(self.limits.max_processes),
        };

        unsafe {
            command.pre_exec(move || supervisor::enter(limits, status_fd));
        }

        let spawned = command.spawn();
        // Only the supervisor may hold the write end, or the pipe never closes
        drop(status_writer);
        let mut child =
            spawned.map_err(|e| Error::Sandbox(format!("Failed to spawn {}: {}", program, e)))?;

        let tree = ProcessTree::new(child.id());
        if let Some(pgid) = tree.id() {
            reporter.record_process(pgid);
        }

        if let (Some(input), Some(mut pipe)) = (step.stdin, child.stdin.take()) {
            let input = input.to_vec();
            tokio::spawn(async move {
                // The program may exit without reading; a broken pipe is fine
                if let Err(e) = pipe.write_all(&input).await {
                    debug!("Stdin not fully consumed: {}", e);
                }
            });
        }

        let limit = self.limits.max_output_bytes;
        let drain = CancellationToken::new();
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(capture::read_bounded(out, limit, drain.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(capture::read_bounded(err, limit, drain.clone())));

        let program_exit = supervisor::program_exit(status_reader);
        tokio::pin!(program_exit);
        let deadline = time::sleep(step.timeout);
        tokio::pin!(deadline);
        let mut census = time::interval(CENSUS_INTERVAL);
        census.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let max_processes = self.limits.max_processes;

        let termination = loop {
            tokio::select! {
                exit = &mut program_exit => match exit {
                    Some(exit) => break Termination::Exited(exit),
                    // The supervisor is gone without a report; its own status is all there is
                    None => match child.wait().await {
                        Ok(status) => break Termination::Exited(status.into()),
                        Err(e) => {
                            tree.terminate();
                            return Err(Error::Sandbox(format!("Process error: {}", e)));
                        }
                    },
                },
                _ = &mut deadline => {
                    warn!("{:?} step exceeded {:?}, killing process tree", step.phase, step.timeout);
                    break Termination::TimedOut;
                }
                _ = cancel.cancelled() => {
                    debug!("{:?} step cancelled, killing process tree", step.phase);
                    break Termination::Cancelled;
                }
                _ = census.tick() => {
                    let alive = tree.descendants().len() as u64;
                    if alive > max_processes {
                        warn!(
                            "{:?} step has {} processes, limit is {}, killing process tree",
                            step.phase, alive, max_processes
                        );
                        break Termination::TooManyProcesses;
                    }
                }
            }
        };

        // Strays after a normal exit, the whole tree otherwise
        tree.terminate();
        if let Err(e) = child.wait().await {
            warn!("Failed to reap supervisor: {}", e);
        }

        let stdout = collect(stdout_task, "stdout", &drain).await;
        let stderr = collect(stderr_task, "stderr", &drain).await;

        Ok(StepOutput {
            termination,
            stdout,
            stderr,
        })
    }

    fn resolve_program(&self, program: &str) -> Result<PathBuf, Error> {
        if let Some(relative) = program.strip_prefix("./") {
            return Ok(self.root_dir.join(relative));
        }
        if program.contains('/') {
            return Ok(PathBuf::from(program));
        }
        which::which(program)
            .map_err(|_| Error::Sandbox(format!("Command not found: {}", program)))
    }
}

/// Join a capture task. Something outside the tree may still hold the pipe
/// open; after a short grace period the reader is stopped and keeps what it
/// has read so far.
async fn collect(
    task: Option<JoinHandle<std::io::Result<Captured>>>,
    stream: &str,
    drain: &CancellationToken,
) -> Captured {
    let Some(mut task) = task else {
        return Captured::default();
    };
    let joined = match time::timeout(DRAIN_GRACE, &mut task).await {
        Ok(joined) => joined,
        Err(_) => {
            warn!("{} still open after the process tree was killed", stream);
            drain.cancel();
            task.await
        }
    };
    match joined {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            warn!("Failed to read {}: {}", stream, e);
            Captured::default()
        }
        Err(e) => {
            error!("{} capture task failed: {}", stream, e);
            Captured::default()
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        // Clean up sandbox directory
        if let Err(e) = std::fs::remove_dir_all(&self.root_dir) {
            error!("Failed to clean up sandbox directory: {}", e);
        }
    }
}
