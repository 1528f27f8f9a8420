use std::sync::Arc;
use std::time::Duration;

use stage_exec::executor::{
    CommandRunner, MockRunner, RunOutput, Sge, SgeExecutor, Slurm, SlurmExecutor,
};
use stage_exec::{
    BackendConfig, Command, CommandExecutor, CommandStatus, ExecError, ExecutorSettings,
    PollPolicy, EXIT_INDETERMINATE,
};
use tempfile::TempDir;

fn settings(tmp: &TempDir, coarse: Duration) -> ExecutorSettings {
    ExecutorSettings::new(tmp.path()).with_poll(PollPolicy {
        coarse_interval: coarse,
        fine_interval: Duration::from_millis(10),
        exit_read_retries: 10,
    })
}

fn sge(tmp: &TempDir, runner: Arc<MockRunner>, coarse: Duration) -> Arc<SgeExecutor> {
    let command = Command::new("42", "align reads", "bwa mem ref.fa r1.fq > out.sam");
    let runner: Arc<dyn CommandRunner> = runner;
    Arc::new(SgeExecutor::new(Sge, settings(tmp, coarse), command, runner))
}

fn submitted_runner() -> Arc<MockRunner> {
    Arc::new(MockRunner::with_responses(vec![RunOutput::ok("4242\n")]))
}

#[tokio::test]
async fn test_submit_reports_queueing_then_running() {
    let tmp = TempDir::new().unwrap();
    let runner = submitted_runner();
    let exec = sge(&tmp, runner.clone(), Duration::from_millis(20));

    assert_eq!(exec.status(), CommandStatus::Unknown);
    exec.start(&BackendConfig::new()).await.unwrap();

    assert_eq!(exec.job_id().as_deref(), Some("4242"));
    assert!(exec.job_dir().script_exists());
    assert_eq!(exec.status(), CommandStatus::Running);
    assert_eq!(exec.status_message(), "SGE job 4242 is RUNNING");

    let calls = runner.invocations();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].program, "qsub");
    assert!(calls[0].args.contains(&"align_reads".to_string()));
    assert_eq!(
        calls[0].args.last().map(String::as_str),
        Some(exec.job_dir().script_path().to_str().unwrap())
    );
}

#[tokio::test]
async fn test_wait_returns_exit_code_from_file() {
    let tmp = TempDir::new().unwrap();
    let exec = sge(&tmp, submitted_runner(), Duration::from_millis(20));
    exec.start(&BackendConfig::new()).await.unwrap();

    let waiter = {
        let exec = exec.clone();
        tokio::spawn(async move { exec.wait_for().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    exec.job_dir().write_exit_code(0).unwrap();

    assert_eq!(waiter.await.unwrap(), 0);
    assert_eq!(exec.status(), CommandStatus::Complete);
}

#[tokio::test]
async fn test_empty_exit_file_is_retried() {
    let tmp = TempDir::new().unwrap();
    let exec = sge(&tmp, submitted_runner(), Duration::from_secs(60));
    exec.start(&BackendConfig::new()).await.unwrap();

    std::fs::write(exec.job_dir().exit_path(), "").unwrap();
    assert_ne!(exec.status(), CommandStatus::Complete);

    let waiter = {
        let exec = exec.clone();
        tokio::spawn(async move { exec.wait_for().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    std::fs::write(exec.job_dir().exit_path(), "3\n").unwrap();

    let code = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, 3);
}

#[tokio::test]
async fn test_unparseable_exit_file_is_indeterminate() {
    let tmp = TempDir::new().unwrap();
    let exec = sge(&tmp, submitted_runner(), Duration::from_secs(60));
    exec.start(&BackendConfig::new()).await.unwrap();

    std::fs::write(exec.job_dir().exit_path(), "not a number").unwrap();

    let code = tokio::time::timeout(Duration::from_secs(5), exec.wait_for())
        .await
        .unwrap();
    assert_eq!(code, EXIT_INDETERMINATE);
    assert_eq!(exec.status(), CommandStatus::Running);
}

#[tokio::test]
async fn test_concurrent_waiters_see_same_code() {
    let tmp = TempDir::new().unwrap();
    let exec = sge(&tmp, submitted_runner(), Duration::from_millis(20));
    exec.start(&BackendConfig::new()).await.unwrap();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let exec = exec.clone();
            tokio::spawn(async move { exec.wait_for().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(40)).await;
    exec.job_dir().write_exit_code(7).unwrap();

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), 7);
    }
}

#[tokio::test]
async fn test_stop_cancels_job_and_unblocks_wait() {
    let tmp = TempDir::new().unwrap();
    let runner = submitted_runner();
    let exec = sge(&tmp, runner.clone(), Duration::from_secs(60));
    exec.start(&BackendConfig::new()).await.unwrap();

    let waiter = {
        let exec = exec.clone();
        tokio::spawn(async move { exec.wait_for().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    exec.stop().await.unwrap();

    let code = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("stop should unblock a coarse poll")
        .unwrap();
    assert_eq!(code, EXIT_INDETERMINATE);

    let calls = runner.invocations();
    assert_eq!(calls.last().unwrap().to_string(), "qdel 4242");
}

#[tokio::test]
async fn test_exit_code_wins_over_stop() {
    let tmp = TempDir::new().unwrap();
    let exec = sge(&tmp, submitted_runner(), Duration::from_secs(60));
    exec.start(&BackendConfig::new()).await.unwrap();

    exec.job_dir().write_exit_code(5).unwrap();
    exec.stop().await.unwrap();
    assert_eq!(exec.wait_for().await, 5);
}

#[tokio::test]
async fn test_stop_tool_failure_is_reported() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::with_responses(vec![
        RunOutput::ok("4242"),
        RunOutput::failed(1, "denied: job 4242 does not exist"),
    ]));
    let exec = sge(&tmp, runner, Duration::from_millis(20));
    exec.start(&BackendConfig::new()).await.unwrap();

    match exec.stop().await {
        Err(ExecError::Stop { job_id, stderr }) => {
            assert_eq!(job_id, "4242");
            assert!(stderr.contains("does not exist"));
        }
        other => panic!("expected stop error, got {:?}", other),
    }
    // The stop flag is set even though the tool failed.
    assert_eq!(exec.wait_for().await, EXIT_INDETERMINATE);
}

#[tokio::test]
async fn test_stop_before_submission_runs_no_tool() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::new());
    let exec = sge(&tmp, runner.clone(), Duration::from_millis(20));

    exec.stop().await.unwrap();
    assert!(runner.invocations().is_empty());
    assert_eq!(exec.wait_for().await, EXIT_INDETERMINATE);
}

#[tokio::test]
async fn test_submission_failure_carries_tool_output() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::with_responses(vec![RunOutput::failed(
        2,
        "Unable to run job: queue \"nope\" unknown",
    )]));
    let exec = sge(&tmp, runner, Duration::from_millis(20));

    let config = BackendConfig::new().with("queue", "nope");
    match exec.start(&config).await {
        Err(ExecError::Submission(msg)) => assert!(msg.contains("unknown")),
        other => panic!("expected submission error, got {:?}", other),
    }
    assert!(exec.job_id().is_none());
    assert_eq!(exec.status(), CommandStatus::Queueing);
}

#[tokio::test]
async fn test_unexpected_submission_output_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::with_responses(vec![RunOutput::ok(
        "Your job has been submitted\n",
    )]));
    let exec = sge(&tmp, runner, Duration::from_millis(20));
    assert!(matches!(
        exec.start(&BackendConfig::new()).await,
        Err(ExecError::Submission(_))
    ));
}

#[tokio::test]
async fn test_legacy_procs_expands_to_parallel_environment() {
    let tmp = TempDir::new().unwrap();
    let runner = submitted_runner();
    let exec = sge(&tmp, runner.clone(), Duration::from_millis(20));

    let config = BackendConfig::new()
        .with("queue", "long")
        .with("procs", "orte 4");
    exec.start(&config).await.unwrap();

    let args = runner.invocations()[0].args.join(" ");
    assert!(args.contains("-q long"), "{}", args);
    assert!(args.contains("-pe orte 4"), "{}", args);
}

#[tokio::test]
async fn test_bad_procs_fails_before_any_side_effect() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::new());
    let exec = sge(&tmp, runner.clone(), Duration::from_millis(20));

    let config = BackendConfig::new().with("procs", "orte");
    assert!(matches!(
        exec.start(&config).await,
        Err(ExecError::Configuration(_))
    ));
    assert!(runner.invocations().is_empty());
    assert!(!exec.job_dir().script_exists());
}

#[tokio::test]
async fn test_status_is_monotonic() {
    let tmp = TempDir::new().unwrap();
    let exec = sge(&tmp, submitted_runner(), Duration::from_millis(20));
    exec.start(&BackendConfig::new()).await.unwrap();

    exec.job_dir().write_exit_code(0).unwrap();
    assert_eq!(exec.status(), CommandStatus::Complete);

    std::fs::remove_file(exec.job_dir().exit_path()).unwrap();
    assert_eq!(exec.status(), CommandStatus::Complete);
    assert_eq!(exec.command().status(), CommandStatus::Complete);
}

#[tokio::test]
async fn test_stale_exit_file_is_cleared_on_start() {
    let tmp = TempDir::new().unwrap();
    let exec = sge(&tmp, submitted_runner(), Duration::from_millis(20));

    std::fs::create_dir_all(exec.job_dir().path()).unwrap();
    exec.job_dir().write_exit_code(9).unwrap();

    exec.start(&BackendConfig::new()).await.unwrap();
    assert_eq!(exec.status(), CommandStatus::Running);
}

#[tokio::test]
async fn test_slurm_submission_and_cancel() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::with_responses(vec![RunOutput::ok(
        "9001;cluster-a\n",
    )]));
    let command = Command::new("7", "sort", "sort in.txt > out.txt");
    let dyn_runner: Arc<dyn CommandRunner> = runner.clone();
    let exec = SlurmExecutor::new(
        Slurm,
        settings(&tmp, Duration::from_millis(20)),
        command,
        dyn_runner,
    );

    let config = BackendConfig::new()
        .with("procs", "8")
        .with("walltime", "01:00:00");
    exec.start(&config).await.unwrap();
    assert_eq!(exec.job_id().as_deref(), Some("9001"));

    let submit = &runner.invocations()[0];
    assert_eq!(submit.program, "sbatch");
    assert!(submit.args.contains(&"--ntasks=8".to_string()));
    assert!(submit.args.contains(&"--time=01:00:00".to_string()));

    exec.stop().await.unwrap();
    assert_eq!(runner.invocations()[1].to_string(), "scancel 9001");

    assert!(exec
        .ignorable_outputs()
        .iter()
        .any(|p| p.ends_with("slurm.log")));
}

#[tokio::test]
async fn test_status_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let runner = submitted_runner();
    let exec = sge(&tmp, runner.clone(), Duration::from_millis(20));
    exec.start(&BackendConfig::new()).await.unwrap();

    let files_before: Vec<_> = std::fs::read_dir(exec.job_dir().path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    let first = exec.status();
    for _ in 0..10 {
        assert_eq!(exec.status(), first);
    }
    let files_after: Vec<_> = std::fs::read_dir(exec.job_dir().path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();

    assert_eq!(first, CommandStatus::Running);
    assert_eq!(files_before.len(), files_after.len());
    assert_eq!(runner.invocations().len(), 1);
}

#[tokio::test]
async fn test_status_while_waiting() {
    let tmp = TempDir::new().unwrap();
    let exec = sge(&tmp, submitted_runner(), Duration::from_millis(20));
    exec.start(&BackendConfig::new()).await.unwrap();

    let waiter = {
        let exec = exec.clone();
        tokio::spawn(async move { exec.wait_for().await })
    };
    for _ in 0..5 {
        assert_eq!(exec.status(), CommandStatus::Running);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!waiter.is_finished());

    exec.job_dir().write_exit_code(1).unwrap();
    assert_eq!(exec.status(), CommandStatus::Complete);
    assert_eq!(waiter.await.unwrap(), 1);
}

#[tokio::test]
async fn test_qsub_starts_in_submission_directory() {
    let tmp = TempDir::new().unwrap();
    let runner = submitted_runner();
    let exec = sge(&tmp, runner.clone(), Duration::from_millis(20));
    exec.start(&BackendConfig::new()).await.unwrap();

    assert!(runner.invocations()[0].args.contains(&"-cwd".to_string()));
    let script = std::fs::read_to_string(exec.job_dir().script_path()).unwrap();
    let cd_target = script
        .lines()
        .find_map(|l| l.strip_prefix("cd "))
        .unwrap()
        .trim_matches('\'');
    assert!(std::path::Path::new(cd_target).is_absolute(), "{}", cd_target);
}
