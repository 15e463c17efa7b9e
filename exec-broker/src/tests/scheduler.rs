use super::{
    fixtures::scripts::*,
    utils::{
        defaults::{default_test_limits, test_config, test_scheduler},
        process_table::wait_until_gone,
    },
};
use crate::{
    Error, ExecutionRequest, ExecutionState, Outcome, OverflowPolicy, ResourceLimits, Result,
    StderrPolicy,
};
use std::collections::HashSet;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

const SHORT_SLEEP: &str = "sleep 0.3\necho awake\n";

/// Poll `check` every 10ms for up to two seconds
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_every_submission_gets_one_result() -> Result<()> {
    let work = tempfile::tempdir()?;
    let scheduler = test_scheduler(test_config(work.path()));

    let mut handles = vec![];
    for _ in 0..6 {
        handles.push(scheduler.submit(ExecutionRequest::new("sh", HELLO)).await?);
    }
    let ids: HashSet<Uuid> = handles.iter().map(|h| h.id()).collect();
    assert_eq!(ids.len(), 6);

    for handle in handles {
        let id = handle.id();
        let result = handle.wait().await;
        assert_eq!(result.id, id);
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.stdout.trim(), "Hello from sh");
        assert_eq!(scheduler.status(id), Some(ExecutionState::Completed));
    }

    let metrics = scheduler.metrics();
    assert_eq!(metrics.admitted, 6);
    assert_eq!(metrics.completed, 6);
    assert_eq!(metrics.rejected, 0);
    Ok(())
}

#[tokio::test]
async fn test_submit_execution_passes_stdin() -> Result<()> {
    let work = tempfile::tempdir()?;
    let scheduler = test_scheduler(test_config(work.path()));

    let result = scheduler
        .submit_execution(ECHO_STDIN, "SH", Some(b"from the caller".to_vec()), None)
        .await?;
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.stdout, "from the caller");
    Ok(())
}

#[tokio::test]
async fn test_timeout_kills_process_tree() -> Result<()> {
    let work = tempfile::tempdir()?;
    let scheduler = test_scheduler(test_config(work.path()));
    let timeout = Duration::from_millis(500);

    let handle = scheduler
        .submit(ExecutionRequest::new("sh", FORK_AND_SLEEP).with_timeout(timeout))
        .await?;
    assert!(eventually(|| handle.process_group().is_some()).await);
    let pgid = handle.process_group().unwrap();
    let workdir = handle.workdir().unwrap();
    let id = handle.id();

    let result = handle.wait().await;
    assert_eq!(result.outcome, Outcome::Timeout);
    assert!(
        result.duration <= timeout + Duration::from_millis(500),
        "{:?}",
        result.duration
    );
    assert!(wait_until_gone(pgid), "process group {} survived", pgid);
    assert!(!workdir.exists());
    assert_eq!(scheduler.status(id), Some(ExecutionState::TimedOut));
    Ok(())
}

#[tokio::test]
async fn test_requested_timeout_is_clamped() -> Result<()> {
    let work = tempfile::tempdir()?;
    let mut config = test_config(work.path());
    config.max_limits = ResourceLimits {
        wall_clock_timeout: Duration::from_secs(1),
        ..default_test_limits()
    };
    config.default_limits.wall_clock_timeout = Duration::from_millis(500);
    let scheduler = test_scheduler(config);

    let result = scheduler
        .submit_execution(SLEEP_FOREVER, "sh", None, Some(Duration::from_secs(60)))
        .await?;
    assert_eq!(result.outcome, Outcome::Timeout);
    assert!(result.stderr.contains("1000 ms"));
    Ok(())
}

#[tokio::test]
async fn test_running_never_exceeds_pool_size() -> Result<()> {
    let work = tempfile::tempdir()?;
    let scheduler = test_scheduler(test_config(work.path()));

    let mut handles = vec![];
    for _ in 0..6 {
        handles.push(scheduler.submit(ExecutionRequest::new("sh", SHORT_SLEEP)).await?);
    }
    assert_eq!(scheduler.available_slots(), 0);
    for handle in handles {
        assert_eq!(handle.wait().await.outcome, Outcome::Success);
    }

    let metrics = scheduler.metrics();
    assert_eq!(metrics.pool_size, 2);
    assert_eq!(metrics.peak_running, 2);
    assert!(eventually(|| scheduler.available_slots() == 2).await);
    Ok(())
}

#[tokio::test]
async fn test_queue_is_first_in_first_out() -> Result<()> {
    let work = tempfile::tempdir()?;
    let log_dir = tempfile::tempdir()?;
    let log = log_dir.path().join("order.log");
    let mut config = test_config(work.path());
    config.pool_size = 1;
    let scheduler = test_scheduler(config);

    let blocker = format!("sleep 0.3\n{}", append_to(&log, "first"));
    let mut handles = vec![scheduler.submit(ExecutionRequest::new("sh", blocker)).await?];
    for n in 1..=5 {
        let script = append_to(&log, &n.to_string());
        handles.push(scheduler.submit(ExecutionRequest::new("sh", script)).await?);
    }
    assert_eq!(scheduler.metrics().queued, 5);

    for handle in handles {
        assert_eq!(handle.wait().await.outcome, Outcome::Success);
    }
    let order = std::fs::read_to_string(&log)?;
    assert_eq!(order.lines().collect::<Vec<_>>(), ["first", "1", "2", "3", "4", "5"]);
    Ok(())
}

#[tokio::test]
async fn test_cancel_queued_and_running() -> Result<()> {
    let work = tempfile::tempdir()?;
    let mut config = test_config(work.path());
    config.pool_size = 1;
    let scheduler = test_scheduler(config);

    let running = scheduler.submit(ExecutionRequest::new("sh", SLEEP_FOREVER)).await?;
    let queued = scheduler.submit(ExecutionRequest::new("sh", HELLO)).await?;
    assert_eq!(queued.state(), ExecutionState::Queued);

    assert!(scheduler.cancel(queued.id()));
    let result = queued.wait().await;
    assert_eq!(result.outcome, Outcome::Cancelled);
    assert!(result.stdout.is_empty());
    assert_eq!(result.exit_code, None);

    assert!(eventually(|| running.state() == ExecutionState::Running).await);
    assert!(running.started_at().is_some());
    let started = Instant::now();
    assert!(scheduler.cancel(running.id()));
    let id = running.id();
    let result = running.wait().await;
    assert_eq!(result.outcome, Outcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(scheduler.status(id), Some(ExecutionState::Cancelled));
    Ok(())
}

#[tokio::test]
async fn test_cancel_after_completion_is_refused() -> Result<()> {
    let work = tempfile::tempdir()?;
    let scheduler = test_scheduler(test_config(work.path()));

    let handle = scheduler.submit(ExecutionRequest::new("sh", HELLO)).await?;
    let id = handle.id();
    assert_eq!(handle.wait().await.outcome, Outcome::Success);

    assert!(!scheduler.cancel(id));
    assert!(!scheduler.cancel(Uuid::new_v4()));
    assert_eq!(scheduler.status(id), Some(ExecutionState::Completed));
    Ok(())
}

#[tokio::test]
async fn test_reject_when_saturated() -> Result<()> {
    let work = tempfile::tempdir()?;
    let mut config = test_config(work.path());
    config.pool_size = 1;
    config.queue_depth = 1;
    config.overflow = OverflowPolicy::Reject;
    let scheduler = test_scheduler(config);

    let running = scheduler.submit(ExecutionRequest::new("sh", SLEEP_FOREVER)).await?;
    let queued = scheduler.submit(ExecutionRequest::new("sh", HELLO)).await?;

    let rejected = scheduler.submit(ExecutionRequest::new("sh", HELLO)).await;
    assert!(matches!(
        rejected,
        Err(Error::AdmissionRejected {
            running: 1,
            queued: 1
        })
    ));
    assert_eq!(scheduler.metrics().rejected, 1);

    scheduler.cancel(running.id());
    assert_eq!(running.wait().await.outcome, Outcome::Cancelled);
    assert_eq!(queued.wait().await.outcome, Outcome::Success);

    // Capacity is back once both have finished
    let result = scheduler.submit_execution(HELLO, "sh", None, None).await?;
    assert_eq!(result.outcome, Outcome::Success);
    Ok(())
}

#[tokio::test]
async fn test_block_waits_for_capacity() -> Result<()> {
    let work = tempfile::tempdir()?;
    let mut config = test_config(work.path());
    config.pool_size = 1;
    config.queue_depth = 0;
    config.overflow = OverflowPolicy::Block;
    let scheduler = test_scheduler(config);

    let first = scheduler.submit(ExecutionRequest::new("sh", SHORT_SLEEP)).await?;
    let waiting = scheduler.clone();
    let pending =
        tokio::spawn(async move { waiting.submit_execution(HELLO, "sh", None, None).await });

    sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished());
    assert_eq!(scheduler.metrics().admitted, 1);

    assert_eq!(first.wait().await.outcome, Outcome::Success);
    let second = pending.await.unwrap()?;
    assert_eq!(second.outcome, Outcome::Success);
    assert_eq!(scheduler.metrics().rejected, 0);
    Ok(())
}

#[tokio::test]
async fn test_language_errors_never_reach_a_sandbox() -> Result<()> {
    let work = tempfile::tempdir()?;
    let scheduler = test_scheduler(test_config(work.path()));

    let result = scheduler.submit(ExecutionRequest::new("cobol", "DISPLAY 'HI'.")).await;
    assert!(matches!(result, Err(Error::UnsupportedLanguage(ref id)) if id == "cobol"));

    let result = scheduler.submit(ExecutionRequest::new("sh-off", HELLO)).await;
    assert!(matches!(result, Err(Error::LanguageDisabled(_))));

    let result = scheduler.submit(ExecutionRequest::new("html", "<p>hi</p>")).await;
    assert!(matches!(result, Err(Error::NotExecutable(_))));

    let result = scheduler.submit(ExecutionRequest::new("sh-strict", "  \n")).await;
    assert!(matches!(result, Err(Error::EmptySource(_))));

    assert_eq!(scheduler.metrics().admitted, 0);
    let leftovers = std::fs::read_dir(work.path())?.count();
    assert_eq!(leftovers, 0);
    Ok(())
}

#[tokio::test]
async fn test_stderr_policy() -> Result<()> {
    let work = tempfile::tempdir()?;
    let strict = test_scheduler(test_config(work.path()));
    let result = strict.submit_execution(WARN_AND_EXIT_ZERO, "sh", None, None).await?;
    assert_eq!(result.outcome, Outcome::RuntimeError);
    assert_eq!(result.stdout, "done\n");

    let mut config = test_config(work.path());
    config.stderr_policy = StderrPolicy::Advisory;
    let advisory = test_scheduler(config);
    let result = advisory.submit_execution(WARN_AND_EXIT_ZERO, "sh", None, None).await?;
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.advisory.as_deref(), Some("careful\n"));
    Ok(())
}

#[tokio::test]
async fn test_status_history_is_bounded() -> Result<()> {
    let work = tempfile::tempdir()?;
    let mut config = test_config(work.path());
    config.history_limit = 2;
    let scheduler = test_scheduler(config);

    let mut ids = vec![];
    for _ in 0..3 {
        let handle = scheduler.submit(ExecutionRequest::new("sh", HELLO)).await?;
        ids.push(handle.id());
        handle.wait().await;
    }
    assert_eq!(scheduler.status(ids[0]), None);
    assert_eq!(scheduler.status(ids[1]), Some(ExecutionState::Completed));
    assert_eq!(scheduler.status(ids[2]), Some(ExecutionState::Completed));
    Ok(())
}

#[tokio::test]
async fn test_compile_failure_through_scheduler() -> Result<()> {
    let work = tempfile::tempdir()?;
    let scheduler = test_scheduler(test_config(work.path()));

    let result = scheduler.submit_execution(SYNTAX_ERROR, "shc", None, None).await?;
    assert_eq!(result.outcome, Outcome::CompileError);
    assert!(!result.stderr.is_empty());
    Ok(())
}
