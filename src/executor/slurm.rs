//! Slurm (`sbatch` / `scancel`).

use crate::command::{Command, CommandStatus};
use crate::config::{keys, BackendConfig};
use crate::error::{ExecError, Result};
use crate::executor::batch::{job_name, request_options, BatchBackend, BatchExecutor};
use crate::executor::runner::ToolInvocation;
use crate::executor::submission::first_line;
use crate::executor::BackendType;
use crate::jobdir::JobDir;

pub type SlurmExecutor = BatchExecutor<Slurm>;

#[derive(Debug, Clone, Default)]
pub struct Slurm;

impl BatchBackend for Slurm {
    const TYPE: BackendType = BackendType::Slurm;

    fn log_file(&self) -> &'static str {
        "slurm.log"
    }

    fn submit_command(
        &self,
        command: &Command,
        dir: &JobDir,
        config: &BackendConfig,
    ) -> Result<ToolInvocation> {
        let mut inv = ToolInvocation::new("sbatch")
            .arg("--parsable")
            .arg(format!("--job-name={}", job_name(command)))
            .arg(format!("--output={}", dir.file(self.log_file()).display()));

        if let Some(queue) = config.get(keys::QUEUE) {
            inv.push(format!("--partition={}", queue));
        }
        if let Some(account) = config.get(keys::ACCOUNT) {
            inv.push(format!("--account={}", account));
        }
        if let Some(procs) = config.procs()? {
            if let Some(pe) = config.get(keys::PE) {
                tracing::debug!(pe, "Slurm ignores parallel environment");
            }
            inv.push(format!("--ntasks={}", procs));
        }
        if let Some(walltime) = config.get(keys::WALLTIME) {
            inv.push(format!("--time={}", walltime));
        }
        if let Some(memory) = config.get(keys::MEMORY) {
            inv.push(format!("--mem={}", memory));
        }
        for opt in request_options(config) {
            inv.push(opt);
        }
        inv.push(dir.script_path().display().to_string());
        Ok(inv)
    }

    /// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`.
    fn parse_job_id(&self, stdout: &str) -> Result<String> {
        let line = first_line(stdout, "sbatch")?;
        let id = line.split(';').next().unwrap_or_default().trim();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
            return Err(ExecError::Submission(format!(
                "unexpected sbatch output: '{}'",
                line
            )));
        }
        Ok(id.to_string())
    }

    fn cancel_command(&self, job_id: &str) -> ToolInvocation {
        ToolInvocation::new("scancel").arg(job_id)
    }

    fn status_message(&self, job_id: Option<&str>, status: CommandStatus) -> String {
        match job_id {
            Some(id) => format!("Slurm job {} is {}", id, status),
            None => format!("Slurm job (not yet submitted) is {}", status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_line() {
        let cmd = Command::new("9", "call variants", "gatk ...");
        let cfg = BackendConfig::new()
            .with(keys::QUEUE, "debug")
            .with(keys::ACCOUNT, "proj1")
            .with(keys::PROCS, "orte 4")
            .with(keys::WALLTIME, "00:30:00")
            .normalized()
            .unwrap();
        let inv = Slurm
            .submit_command(&cmd, &JobDir::from_path("/w/commandtmp/9"), &cfg)
            .unwrap();
        assert_eq!(inv.program, "sbatch");
        assert_eq!(
            inv.args,
            vec![
                "--parsable",
                "--job-name=call_variants",
                "--output=/w/commandtmp/9/slurm.log",
                "--partition=debug",
                "--account=proj1",
                "--ntasks=4",
                "--time=00:30:00",
                "/w/commandtmp/9/cmd.sh"
            ]
        );
    }

    #[test]
    fn parse_job_ids() {
        assert_eq!(Slurm.parse_job_id("1234\n").unwrap(), "1234");
        assert_eq!(Slurm.parse_job_id("1234;cluster-a\n").unwrap(), "1234");
        assert!(Slurm.parse_job_id("sbatch: error").is_err());
    }

    #[test]
    fn cancel_command() {
        assert_eq!(Slurm.cancel_command("1234").to_string(), "scancel 1234");
    }
}
