use nix::errno::Errno;
use nix::sys::resource::{getrlimit, Resource};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Kill passes before giving up on a tree that keeps forking
const KILL_ROUNDS: usize = 50;

/// Pause between kill passes so SIGKILLed processes get to exit
const KILL_SETTLE: Duration = Duration::from_millis(2);

/// Whether `/proc/<pid>/task/<tid>/children` exists on this kernel
static CHILDREN_FILES: LazyLock<bool> =
    LazyLock::new(|| Path::new("/proc/thread-self/children").exists());

/// Every process below an execution's supervisor. The supervisor is a
/// child subreaper and leads its own process group, so this reaches
/// descendants that left the group with `setsid` as well.
#[derive(Debug)]
pub(crate) struct ProcessTree {
    root: Option<Pid>,
    terminated: AtomicBool,
}

impl ProcessTree {
    pub fn new(root_pid: Option<u32>) -> Self {
        Self {
            root: root_pid.map(|pid| Pid::from_raw(pid as i32)),
            terminated: AtomicBool::new(false),
        }
    }

    /// Process group id of the root
    pub fn id(&self) -> Option<u32> {
        self.root.map(|pid| pid.as_raw() as u32)
    }

    /// Live (non-zombie) processes below the root
    pub fn descendants(&self) -> Vec<Pid> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        let index = (!*CHILDREN_FILES).then(parent_index);

        let mut seen = HashSet::from([root.as_raw()]);
        let mut pending = vec![root.as_raw()];
        let mut live = Vec::new();
        while let Some(pid) = pending.pop() {
            let children = match &index {
                Some(index) => index.get(&pid).cloned().unwrap_or_default(),
                None => children_of(pid),
            };
            for child in children {
                if !seen.insert(child) {
                    continue;
                }
                if matches!(state_and_parent(child), Some((state, _)) if state != 'Z' && state != 'X')
                {
                    live.push(Pid::from_raw(child));
                }
                pending.push(child);
            }
        }
        live
    }

    /// SIGKILL everything below the root until nothing is left, then the
    /// root's group. Idempotent: later calls do nothing.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(root) = self.root else {
            return;
        };

        let mut cleared = false;
        for _ in 0..KILL_ROUNDS {
            let live = self.descendants();
            if live.is_empty() {
                cleared = true;
                break;
            }
            debug!("Killing {} processes below {}", live.len(), root);
            for pid in live {
                match kill(pid, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => warn!("Failed to kill process {}: {}", pid, e),
                }
            }
            thread::sleep(KILL_SETTLE);
        }
        if !cleared {
            warn!("Processes below {} still alive after {} kill passes", root, KILL_ROUNDS);
        }

        match killpg(root, Signal::SIGKILL) {
            Ok(()) => debug!("Sent SIGKILL to process group {}", root),
            Err(Errno::ESRCH) => debug!("Process group {} already gone", root),
            Err(e) => warn!("Failed to kill process group {}: {}", root, e),
        }
    }
}

impl Drop for ProcessTree {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// `RLIMIT_NPROC` for a program run as the current user. The kernel counts
/// every task of the uid, so the ceiling sits on top of what the user
/// already runs. It is a backstop at twice the limit: the exact limit is
/// enforced by counting the tree, which needs to see the breach happen.
/// Root ignores the limit, hence `None`. An unprivileged process cannot
/// raise its hard limit, so the ceiling never goes above it.
pub(crate) fn nproc_ceiling(max_processes: u64) -> Option<u64> {
    let uid = fs::metadata("/proc/self").ok()?.uid();
    if uid == 0 {
        return None;
    }
    let (_, hard) = getrlimit(Resource::RLIMIT_NPROC).ok()?;
    Some((tasks_owned_by(uid) + 2 * max_processes + 1).min(hard))
}

fn tasks_owned_by(uid: u32) -> u64 {
    let Ok(entries) = fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().is_some_and(|name| name.parse::<u32>().is_ok()))
        .filter(|entry| entry.metadata().is_ok_and(|meta| meta.uid() == uid))
        .map(|entry| {
            fs::read_dir(entry.path().join("task"))
                .map(|tasks| tasks.count() as u64)
                .unwrap_or(0)
        })
        .sum()
}

/// State letter and parent pid from `/proc/<pid>/stat`
fn state_and_parent(pid: i32) -> Option<(char, i32)> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name may contain spaces; fields resume after the last ')'
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let parent = fields.next()?.parse().ok()?;
    Some((state, parent))
}

fn children_of(pid: i32) -> Vec<i32> {
    let Ok(tasks) = fs::read_dir(format!("/proc/{}/task", pid)) else {
        return Vec::new();
    };
    tasks
        .filter_map(|task| task.ok())
        .filter_map(|task| fs::read_to_string(task.path().join("children")).ok())
        .flat_map(|list| {
            list.split_whitespace()
                .filter_map(|child| child.parse().ok())
                .collect::<Vec<i32>>()
        })
        .collect()
}

/// Parent to children map from a full `/proc` scan, for kernels without
/// the per-task `children` files
fn parent_index() -> HashMap<i32, Vec<i32>> {
    let mut index: HashMap<i32, Vec<i32>> = HashMap::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return index;
    };
    for pid in entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
    {
        if let Some((_, parent)) = state_and_parent(pid) {
            index.entry(parent).or_default().push(pid);
        }
    }
    index
}
