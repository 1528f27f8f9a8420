//! Wrapper-script preparation and submission-tool invocation.
//!
//! Used by every backend that renders a script, hands it to a tool and
//! reads a job id back. The local backend uses only [`TemplateSubmitter::prepare`].

use std::collections::HashMap;
use std::path::PathBuf;

use crate::command::Command;
use crate::config::{absolute, ExecutorSettings};
use crate::error::{ExecError, Result};
use crate::executor::runner::{CommandRunner, ToolInvocation};
use crate::jobdir::JobDir;
use crate::template::{shell_quote, Template, WRAPPER_TEMPLATE};

pub struct TemplateSubmitter<'a> {
    dir: &'a JobDir,
    runner: &'a dyn CommandRunner,
}

impl<'a> TemplateSubmitter<'a> {
    pub fn new(dir: &'a JobDir, runner: &'a dyn CommandRunner) -> Self {
        Self { dir, runner }
    }

    /// Create the job directory and write the wrapper script.
    ///
    /// Leftover exit-code files from an earlier attempt are removed first;
    /// otherwise the new job would read as complete before it starts.
    pub async fn prepare(
        &self,
        settings: &ExecutorSettings,
        command: &Command,
        directives: &str,
    ) -> Result<PathBuf> {
        self.dir.create(settings).await?;

        for stale in [self.dir.exit_path(), self.dir.exit_tmp_path()] {
            match tokio::fs::remove_file(&stale).await {
                Ok(()) => tracing::debug!(path = %stale.display(), "Removed stale exit file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ExecError::Submission(format!(
                        "cannot clear {}: {}",
                        stale.display(),
                        e
                    )))
                }
            }
        }

        let script = render_wrapper(command, self.dir, directives)?;
        self.dir.write_script(&script).await.map_err(|e| {
            ExecError::Submission(format!(
                "cannot write wrapper script in {}: {}",
                self.dir.path().display(),
                e
            ))
        })
    }

    /// Run the submission tool and extract the job id from its stdout.
    pub async fn submit<F>(&self, invocation: &ToolInvocation, parse_job_id: F) -> Result<String>
    where
        F: FnOnce(&str) -> Result<String>,
    {
        let output = self.runner.run(invocation).await.map_err(|e| {
            ExecError::Submission(format!("failed to run {}: {}", invocation.program, e))
        })?;

        if !output.success() {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            return Err(ExecError::Submission(format!(
                "{} exited with {:?}: {}",
                invocation.program, output.code, detail
            )));
        }

        parse_job_id(&output.stdout)
    }
}

/// Render the wrapper for `command` inside `dir`.
///
/// A relative working directory is resolved now, at submission time;
/// schedulers may start the script anywhere.
pub fn render_wrapper(command: &Command, dir: &JobDir, directives: &str) -> Result<String> {
    let quote_path = |p: PathBuf| shell_quote(&p.display().to_string());

    let mut vars: HashMap<&str, String> = HashMap::new();
    vars.insert("DIRECTIVES", directives.to_string());
    vars.insert("WORKDIR", quote_path(absolute(command.workdir.clone())));
    vars.insert("COMMAND", command.text.clone());
    vars.insert("STDOUT", quote_path(dir.stdout_path()));
    vars.insert("STDERR", quote_path(dir.stderr_path()));
    vars.insert("EXIT_TMP", quote_path(dir.exit_tmp_path()));
    vars.insert("EXIT_FILE", quote_path(dir.exit_path()));

    Template::parse(WRAPPER_TEMPLATE)?.render(&vars)
}

/// First non-empty line of a tool's stdout, or a submission error.
pub fn first_line(stdout: &str, tool: &str) -> Result<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ExecError::Submission(format!("{} printed no job id", tool)))
}
