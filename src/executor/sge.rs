//! Sun/Univa Grid Engine (`qsub` / `qdel`).

use crate::command::{Command, CommandStatus};
use crate::config::{keys, BackendConfig};
use crate::error::{ExecError, Result};
use crate::executor::batch::{job_name, request_options, BatchBackend, BatchExecutor};
use crate::executor::runner::ToolInvocation;
use crate::executor::submission::first_line;
use crate::executor::BackendType;
use crate::jobdir::JobDir;

pub type SgeExecutor = BatchExecutor<Sge>;

#[derive(Debug, Clone, Default)]
pub struct Sge;

impl BatchBackend for Sge {
    const TYPE: BackendType = BackendType::Sge;

    fn directives(&self) -> String {
        "#$ -S /bin/sh".to_string()
    }

    fn log_file(&self) -> &'static str {
        "sge.log"
    }

    fn submit_command(
        &self,
        command: &Command,
        dir: &JobDir,
        config: &BackendConfig,
    ) -> Result<ToolInvocation> {
        let mut inv = ToolInvocation::new("qsub")
            .arg("-terse")
            .arg("-V")
            .arg("-cwd")
            .arg("-N")
            .arg(job_name(command))
            .arg("-j")
            .arg("y")
            .arg("-o")
            .arg(dir.file(self.log_file()).display().to_string());

        if let Some(queue) = config.get(keys::QUEUE) {
            inv.push("-q");
            inv.push(queue);
        }
        if let Some(account) = config.get(keys::ACCOUNT) {
            inv.push("-A");
            inv.push(account);
        }
        if let Some(procs) = config.procs()? {
            if procs > 1 {
                let pe = config.get(keys::PE).ok_or_else(|| {
                    ExecError::Configuration(format!(
                        "procs = {} needs a parallel environment ('pe' or '<pe> <count>')",
                        procs
                    ))
                })?;
                inv.push("-pe");
                inv.push(pe);
                inv.push(procs.to_string());
            }
        }
        if let Some(walltime) = config.get(keys::WALLTIME) {
            inv.push("-l");
            inv.push(format!("h_rt={}", walltime));
        }
        if let Some(memory) = config.get(keys::MEMORY) {
            inv.push("-l");
            inv.push(format!("h_vmem={}", memory));
        }
        for opt in request_options(config) {
            inv.push(opt);
        }
        inv.push(dir.script_path().display().to_string());
        Ok(inv)
    }

    /// `qsub -terse` prints the bare id, or `<id>.<range>` for array jobs.
    fn parse_job_id(&self, stdout: &str) -> Result<String> {
        let line = first_line(stdout, "qsub")?;
        let id = line.split('.').next().unwrap_or_default();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
            return Err(ExecError::Submission(format!(
                "unexpected qsub output: '{}'",
                line
            )));
        }
        Ok(id.to_string())
    }

    fn cancel_command(&self, job_id: &str) -> ToolInvocation {
        ToolInvocation::new("qdel").arg(job_id)
    }

    fn status_message(&self, job_id: Option<&str>, status: CommandStatus) -> String {
        match job_id {
            Some(id) => format!("SGE job {} is {}", id, status),
            None => format!("SGE job (not yet submitted) is {}", status),
        }
    }
}
