//! External tool invocation.
//!
//! `CommandRunner` is the seam between executors and scheduler CLIs
//! (`qsub`, `sbatch`, `qdel`, `kill`, ...). `ShellRunner` spawns the real
//! tool. `MockRunner` records invocations and replays preset outputs; it is
//! only built for tests and with the `test-util` feature.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

/// A program plus arguments, passed to the tool without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn push(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }
}

impl std::fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of one tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// `None` when the tool was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync + std::fmt::Debug {
    async fn run(&self, invocation: &ToolInvocation) -> std::io::Result<RunOutput>;
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, invocation: &ToolInvocation) -> std::io::Result<RunOutput> {
        tracing::debug!(command = %invocation, "Running external tool");
        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(RunOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Test double: records every invocation and returns queued outputs in
/// order, falling back to an empty success once the queue is drained.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct MockRunner {
    responses: std::sync::Mutex<std::collections::VecDeque<RunOutput>>,
    invocations: std::sync::Mutex<Vec<ToolInvocation>>,
}

#[cfg(any(test, feature = "test-util"))]
impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<RunOutput>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
            invocations: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, response: RunOutput) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(response);
        }
    }

    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.invocations
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, invocation: &ToolInvocation) -> std::io::Result<RunOutput> {
        if let Ok(mut calls) = self.invocations.lock() {
            calls.push(invocation.clone());
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front());
        Ok(next.unwrap_or_else(|| RunOutput::ok("")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_display() {
        let inv = ToolInvocation::new("qdel").arg("123");
        assert_eq!(inv.to_string(), "qdel 123");
    }

    #[tokio::test]
    async fn mock_runner_records_and_replays() {
        let runner = MockRunner::with_responses(vec![
            RunOutput::ok("first"),
            RunOutput::failed(1, "boom"),
        ]);
        let a = runner.run(&ToolInvocation::new("echo").arg("a")).await.unwrap();
        let b = runner.run(&ToolInvocation::new("echo").arg("b")).await.unwrap();
        let c = runner.run(&ToolInvocation::new("echo").arg("c")).await.unwrap();

        assert_eq!(a.stdout, "first");
        assert!(!b.success());
        assert_eq!(b.stderr, "boom");
        assert!(c.success());

        let calls = runner.invocations();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].args, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn shell_runner_captures_output() {
        let out = ShellRunner
            .run(&ToolInvocation::new("sh").arg("-c").arg("echo out; echo err >&2; exit 4"))
            .await
            .unwrap();
        assert_eq!(out.code, Some(4));
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[tokio::test]
    async fn shell_runner_missing_program_is_io_error() {
        let result = ShellRunner
            .run(&ToolInvocation::new("nonexistent_tool_12345"))
            .await;
        assert!(result.is_err());
    }
}
