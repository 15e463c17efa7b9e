pub mod defaults {
    use crate::{
        CommandTemplate, ExecConfig, LanguageDescriptor, ResourceLimits, RunnerRegistry,
        Scheduler,
    };
    use std::path::Path;
    use tokio::time::Duration;

    pub fn default_test_limits() -> ResourceLimits {
        ResourceLimits {
            wall_clock_timeout: default_timeout(),
            memory_ceiling_bytes: 512 * 1024 * 1024, // 512MB
            max_output_bytes: 64 * 1024,             // 64KB
            file_size_bytes: 10 * 1024 * 1024,       // 10MB
            max_processes: 64,
        }
    }

    pub fn default_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn compile_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub fn test_config(work_root: &Path) -> ExecConfig {
        ExecConfig {
            pool_size: 2,
            queue_depth: 8,
            work_root: work_root.to_path_buf(),
            compile_timeout: compile_timeout(),
            default_limits: default_test_limits(),
            ..ExecConfig::default()
        }
    }

    /// Plain `sh` script runner, available on every unix host
    pub fn sh_descriptor() -> LanguageDescriptor {
        LanguageDescriptor::interpreted("sh", "main.sh", CommandTemplate::new("sh", ["{source}"]))
    }

    /// A fake compiled language: the "compiler" syntax-checks the script
    /// and copies it to the artifact, which is then run by `sh`
    pub fn shc_descriptor() -> LanguageDescriptor {
        LanguageDescriptor::compiled(
            "shc",
            "main.sh",
            "main.bin",
            CommandTemplate::new("sh", ["-c", "sh -n {source} && cp {source} {artifact}"]),
            CommandTemplate::new("sh", ["{artifact}"]),
        )
    }

    pub fn test_registry() -> RunnerRegistry {
        let mut disabled = sh_descriptor();
        disabled.id = "sh-off".to_string();
        disabled.enabled = false;

        let mut strict = sh_descriptor();
        strict.id = "sh-strict".to_string();
        strict.allow_empty_source = false;

        RunnerRegistry::from_descriptors([
            sh_descriptor(),
            shc_descriptor(),
            disabled,
            strict,
            LanguageDescriptor::markup("html"),
        ])
        .unwrap()
    }

    pub fn test_scheduler(config: ExecConfig) -> Scheduler {
        Scheduler::with_registry(config, test_registry()).unwrap()
    }
}

/// Returns false (and logs why) when any of `tools` is missing on this host
pub fn skip_if_not_available(tools: &[&str]) -> bool {
    let missing: Vec<_> = tools
        .iter()
        .filter(|tool| which::which(tool).is_err())
        .collect();
    if missing.is_empty() {
        return true;
    }
    eprintln!("skipping: {:?} not installed", missing);
    false
}

/// Inspection of the host process table through /proc
pub mod process_table {
    use std::fs;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Live (non-zombie) processes whose process group is `pgid`
    pub fn live_members(pgid: u32) -> Vec<u32> {
        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| {
                let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
                    return false;
                };
                // The command name may contain spaces; fields resume after the last ')'
                let Some(rest) = stat.rsplit_once(')').map(|(_, rest)| rest) else {
                    return false;
                };
                let mut fields = rest.split_whitespace();
                let state = fields.next();
                let _ppid = fields.next();
                let pgrp = fields.next().and_then(|field| field.parse::<u32>().ok());
                state != Some("Z") && pgrp == Some(pgid)
            })
            .collect()
    }

    /// Live (non-zombie) processes with `arg` as one of their arguments
    pub fn running_with_arg(arg: &str) -> Vec<u32> {
        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| {
                let Ok(cmdline) = fs::read(format!("/proc/{}/cmdline", pid)) else {
                    return false;
                };
                // Zombies have an empty command line
                cmdline
                    .split(|byte| *byte == 0)
                    .skip(1)
                    .any(|word| word == arg.as_bytes())
            })
            .collect()
    }

    /// Poll until no live process carries `arg`, for up to `within`
    pub fn gone_within(arg: &str, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if running_with_arg(arg).is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// Poll until no live process remains in `pgid`, for up to two seconds
    pub fn wait_until_gone(pgid: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if live_members(pgid).is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}
