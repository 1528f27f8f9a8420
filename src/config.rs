use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ExecError, Result};

/// Recognized backend configuration keys.
pub mod keys {
    pub const QUEUE: &str = "queue";
    pub const ACCOUNT: &str = "account";
    pub const PROCS: &str = "procs";
    pub const PE: &str = "pe";
    pub const WALLTIME: &str = "walltime";
    pub const MEMORY: &str = "memory";
    pub const REQUEST_OPTIONS: &str = "request_options";
}

/// Timing policy for `wait_for`.
///
/// The coarse interval is used while no exit-code file exists. Once the file
/// shows up but does not yet hold a parseable integer, the loop switches to
/// the fine interval and gives up after `exit_read_retries` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub coarse_interval: Duration,
    pub fine_interval: Duration,
    pub exit_read_retries: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            coarse_interval: Duration::from_secs(5),
            fine_interval: Duration::from_millis(100),
            exit_read_retries: 10,
        }
    }
}

/// Settings shared by every executor created by one controller.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Root of the controller's working state. Job directories live under
    /// `<workroot>/commandtmp`, recovery snapshots under `<workroot>/commands`.
    pub workroot: PathBuf,
    pub poll: PollPolicy,
    /// How many times to re-check that a freshly created job directory is
    /// visible (networked filesystems can lag behind `mkdir`).
    pub dir_visibility_retries: u32,
    pub dir_visibility_interval: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            workroot: absolute(PathBuf::from(".stage-exec")),
            poll: PollPolicy::default(),
            dir_visibility_retries: 5,
            dir_visibility_interval: Duration::from_millis(200),
        }
    }
}

impl ExecutorSettings {
    /// A relative `workroot` is resolved against the current directory, so
    /// wrapper scripts can reach their job directory after `cd`.
    pub fn new(workroot: impl Into<PathBuf>) -> Self {
        Self {
            workroot: absolute(workroot.into()),
            ..Default::default()
        }
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn command_tmp_dir(&self) -> PathBuf {
        self.workroot.join("commandtmp")
    }

    pub fn recovery_dir(&self) -> PathBuf {
        self.workroot.join("commands")
    }

    pub fn workroot(&self) -> &Path {
        &self.workroot
    }
}

/// Resolve `path` against the current directory. Falls back to the path as
/// given if the current directory cannot be read.
pub fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::path::absolute(&path) {
        Ok(abs) => abs,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Cannot resolve relative path");
            path
        }
    }
}

/// Backend configuration: an open string map with typed accessors for the
/// keys the backends understand. Unrecognized keys are carried along.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendConfig {
    values: BTreeMap<String, String>,
}

impl BackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse a `key=value` pair as given on the command line.
    pub fn parse_pair(pair: &str) -> Result<(String, String)> {
        match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
            _ => Err(ExecError::Configuration(format!(
                "expected key=value, got '{}'",
                pair
            ))),
        }
    }

    /// Process count after normalization. `None` when not requested.
    pub fn procs(&self) -> Result<Option<u32>> {
        match self.get(keys::PROCS) {
            None => Ok(None),
            Some(raw) => raw.parse::<u32>().map(Some).map_err(|_| {
                ExecError::Configuration(format!("procs must be an integer, got '{}'", raw))
            }),
        }
    }

    /// Return a validated copy with legacy forms rewritten.
    ///
    /// The receiver is never modified, so a base configuration shared by many
    /// executors stays intact. A legacy `procs` value of the form
    /// `"<pe> <count>"` is split into `pe` and an integer `procs`; tokens
    /// after the count are ignored.
    pub fn normalized(&self) -> Result<BackendConfig> {
        let mut out = self.clone();

        if let Some(raw) = self.get(keys::PROCS) {
            if raw.parse::<u32>().is_err() {
                let tokens: Vec<&str> = raw.split_whitespace().collect();
                if tokens.len() < 2 {
                    return Err(ExecError::Configuration(format!(
                        "procs '{}' is neither an integer nor '<parallel-environment> <count>'",
                        raw
                    )));
                }
                let count: u32 = tokens[1].parse().map_err(|_| {
                    ExecError::Configuration(format!(
                        "procs '{}' has a non-integer process count",
                        raw
                    ))
                })?;
                if tokens.len() > 2 {
                    tracing::warn!(procs = raw, "Ignoring trailing tokens in legacy procs");
                }
                if self.get(keys::PE).is_none() {
                    out.set(keys::PE, tokens[0]);
                }
                out.set(keys::PROCS, count.to_string());
            }
        }

        if let Some(walltime) = self.get(keys::WALLTIME) {
            if !is_walltime(walltime) {
                return Err(ExecError::Configuration(format!(
                    "walltime '{}' must be HH:MM:SS",
                    walltime
                )));
            }
        }

        Ok(out)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for BackendConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn is_walltime(value: &str) -> bool {
    let parts: Vec<&str> = value.split(':').collect();
    parts.len() == 3
        && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        && parts[1].len() == 2
        && parts[2].len() == 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_policy_default() {
        let policy = PollPolicy::default();
        assert_eq!(policy.coarse_interval, Duration::from_secs(5));
        assert_eq!(policy.fine_interval, Duration::from_millis(100));
        assert_eq!(policy.exit_read_retries, 10);
    }

    #[test]
    fn settings_layout() {
        let settings = ExecutorSettings::new("/work");
        assert_eq!(settings.command_tmp_dir(), PathBuf::from("/work/commandtmp"));
        assert_eq!(settings.recovery_dir(), PathBuf::from("/work/commands"));
    }

    #[test]
    fn legacy_procs_is_split() {
        let cfg = BackendConfig::new().with(keys::PROCS, "orte 4");
        let normalized = cfg.normalized().unwrap();
        assert_eq!(normalized.procs().unwrap(), Some(4));
        assert_eq!(normalized.get(keys::PE), Some("orte"));
        // the original is untouched
        assert_eq!(cfg.get(keys::PROCS), Some("orte 4"));
        assert_eq!(cfg.get(keys::PE), None);
    }

    #[test]
    fn legacy_procs_single_token_fails() {
        let cfg = BackendConfig::new().with(keys::PROCS, "orte");
        assert!(matches!(cfg.normalized(), Err(ExecError::Configuration(_))));
    }

    #[test]
    fn legacy_procs_ignores_trailing_tokens() {
        let cfg = BackendConfig::new().with(keys::PROCS, "orte 4 extra");
        let normalized = cfg.normalized().unwrap();
        assert_eq!(normalized.procs().unwrap(), Some(4));
        assert_eq!(normalized.get(keys::PE), Some("orte"));
    }

    #[test]
    fn relative_workroot_is_resolved() {
        let settings = ExecutorSettings::new(".stage-exec");
        assert!(settings.workroot().is_absolute());
        assert!(settings.workroot().ends_with(".stage-exec"));
        assert!(settings.command_tmp_dir().is_absolute());
    }

    #[test]
    fn legacy_procs_bad_count_fails() {
        let cfg = BackendConfig::new().with(keys::PROCS, "orte four");
        assert!(matches!(cfg.normalized(), Err(ExecError::Configuration(_))));
    }

    #[test]
    fn plain_procs_passes_through() {
        let cfg = BackendConfig::new().with(keys::PROCS, "8");
        let normalized = cfg.normalized().unwrap();
        assert_eq!(normalized, cfg);
        assert_eq!(normalized.procs().unwrap(), Some(8));
    }

    #[test]
    fn explicit_pe_wins_over_legacy() {
        let cfg = BackendConfig::new()
            .with(keys::PROCS, "orte 2")
            .with(keys::PE, "smp");
        let normalized = cfg.normalized().unwrap();
        assert_eq!(normalized.get(keys::PE), Some("smp"));
        assert_eq!(normalized.procs().unwrap(), Some(2));
    }

    #[test]
    fn walltime_validation() {
        assert!(BackendConfig::new()
            .with(keys::WALLTIME, "12:00:00")
            .normalized()
            .is_ok());
        assert!(BackendConfig::new()
            .with(keys::WALLTIME, "12h")
            .normalized()
            .is_err());
    }

    #[test]
    fn blank_values_read_as_absent() {
        let cfg = BackendConfig::new().with(keys::QUEUE, "  ");
        assert_eq!(cfg.get(keys::QUEUE), None);
    }

    #[test]
    fn parse_pair() {
        assert_eq!(
            BackendConfig::parse_pair("queue=long").unwrap(),
            ("queue".to_string(), "long".to_string())
        );
        assert_eq!(
            BackendConfig::parse_pair("request_options=-l a=b").unwrap(),
            ("request_options".to_string(), "-l a=b".to_string())
        );
        assert!(BackendConfig::parse_pair("novalue").is_err());
        assert!(BackendConfig::parse_pair("=x").is_err());
    }

    #[test]
    fn config_serializes_as_flat_map() {
        let cfg = BackendConfig::new().with(keys::QUEUE, "short");
        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(json, r#"{"queue":"short"}"#);
    }
}
