//! Replication verbs backing detached-snapshot clone mode (spec.md
//! §4.3.3, §4.3.4): `replication.run_onetime`, `replication.job_status`,
//! and the `wait_for_job` convenience that polls to a terminal state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::client::Client;
use super::error::ApplianceError;

const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Push,
    Local,
}

#[derive(Debug, Clone, Serialize)]
pub struct OneTimeReplicationArgs<'a> {
    pub source_dataset: &'a str,
    pub target_dataset: &'a str,
    pub transport: TransportMode,
    pub name_regex: &'a str,
    pub exclude_properties: &'a [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Waiting,
    Running,
    Success,
    Failed,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Error)
    }

    pub fn is_success(self) -> bool {
        matches!(self, JobState::Success)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: u64,
    pub state: JobState,
    #[serde(default)]
    pub error: Option<String>,
}

/// Properties that must never be copied onto a replicated clone target,
/// per spec.md §4.3.3.
pub const EXCLUDED_REPLICATION_PROPERTIES: &[&str] = &["mountpoint", "sharenfs", "sharesmb", "csi:csi_volume_name"];

impl Client {
    /// Replicates the snapshot named `snapshot_name` from `source_dataset`
    /// to `target_dataset`, copying properties except the excluded set.
    /// Returns the appliance job id.
    pub async fn replication_run_onetime(
        &self,
        source_dataset: &str,
        target_dataset: &str,
        snapshot_name: &str,
        transport: TransportMode,
    ) -> Result<u64, ApplianceError> {
        let args = OneTimeReplicationArgs {
            source_dataset,
            target_dataset,
            transport,
            name_regex: &format!("^{snapshot_name}$"),
            exclude_properties: EXCLUDED_REPLICATION_PROPERTIES,
        };
        self.call("replication.run_onetime", (args,)).await
    }

    pub async fn replication_job_status(&self, job_id: u64) -> Result<JobStatus, ApplianceError> {
        self.call("replication.job_status", (job_id,)).await
    }

    /// Polls `replication.job_status` every 2s until the job reaches a
    /// terminal state. spec.md §4.1.
    pub async fn replication_wait_for_job(&self, job_id: u64) -> Result<(), ApplianceError> {
        loop {
            let status = self.replication_job_status(job_id).await?;
            if status.state.is_terminal() {
                return if status.state.is_success() {
                    Ok(())
                } else {
                    Err(ApplianceError::Unknown(
                        status.error.unwrap_or_else(|| format!("replication job {job_id} failed: {:?}", status.state)),
                    ))
                };
            }
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
        }
    }

    pub async fn replication_run_onetime_and_wait(
        &self,
        source_dataset: &str,
        target_dataset: &str,
        snapshot_name: &str,
        transport: TransportMode,
    ) -> Result<(), ApplianceError> {
        let job_id = self
            .replication_run_onetime(source_dataset, target_dataset, snapshot_name, transport)
            .await?;
        self.replication_wait_for_job(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_terminality() {
        assert!(JobState::Success.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Error.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Waiting.is_terminal());
    }

    #[test]
    fn excludes_mountpoint_and_csi_name() {
        assert!(EXCLUDED_REPLICATION_PROPERTIES.contains(&"mountpoint"));
        assert!(EXCLUDED_REPLICATION_PROPERTIES.contains(&"csi:csi_volume_name"));
    }
}
