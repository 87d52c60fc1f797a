//! One-shot replication jobs. Detached snapshots and detached clones are
//! produced by a local PUSH replication of a single temporary snapshot,
//! then waiting for the job to reach a terminal state.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{client::ApiClient, error::ApiError, property::PROPERTY_CSI_VOLUME_NAME};

/// How often a replication job is polled for completion.
pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct ReplicationRunOnetimeParams {
    pub direction: String,
    pub transport: String,
    pub source_datasets: Vec<String>,
    pub target_dataset: String,
    pub recursive: bool,
    pub properties: bool,
    pub properties_exclude: Vec<String>,
    pub replicate: bool,
    pub encryption: bool,
    /// Only snapshots matching this regex are sent.
    pub name_regex: String,
    pub retention_policy: String,
    pub readonly: String,
    pub allow_from_scratch: bool,
}

impl ReplicationRunOnetimeParams {
    /// A local PUSH copy of exactly one snapshot of `source` into `target`,
    /// carrying properties along except the ones that must not leak into
    /// the copy (mount/share state and the CSI volume name).
    pub fn local_copy(source: &str, target: &str, snapshot_name: &str) -> Self {
        ReplicationRunOnetimeParams {
            direction: "PUSH".into(),
            transport: "LOCAL".into(),
            source_datasets: vec![source.to_string()],
            target_dataset: target.to_string(),
            recursive: false,
            properties: true,
            properties_exclude: vec![
                "mountpoint".into(),
                "sharenfs".into(),
                "sharesmb".into(),
                PROPERTY_CSI_VOLUME_NAME.into(),
            ],
            replicate: false,
            encryption: false,
            name_regex: snapshot_name.to_string(),
            retention_policy: "NONE".into(),
            readonly: "IGNORE".into(),
            allow_from_scratch: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: i64,
    pub state: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        matches!(self.state.as_str(), "SUCCESS" | "FAILED" | "ABORTED")
    }
}

impl ApiClient {
    /// Start a one-shot replication and return its job id.
    pub async fn replication_run_onetime(
        &self,
        params: &ReplicationRunOnetimeParams,
    ) -> Result<i64, ApiError> {
        let body = serde_json::to_value(params).map_err(|source| ApiError::InvalidReply {
            method: "replication.run_onetime".into(),
            source,
        })?;
        let reply = self.call("replication.run_onetime", json!([body])).await?;
        reply.as_i64().ok_or_else(|| ApiError::Unknown {
            method: "replication.run_onetime".into(),
            detail: format!("expected a job id, got {reply}"),
        })
    }

    pub async fn job_status(&self, job_id: i64) -> Result<Job, ApiError> {
        let jobs: Vec<Job> = self
            .call_de("core.get_jobs", json!([[["id", "=", job_id]]]))
            .await?;
        jobs.into_iter().next().ok_or_else(|| ApiError::NotFound {
            detail: format!("job {job_id}"),
        })
    }

    /// Poll `job_id` every [`JOB_POLL_INTERVAL`] until it reaches a terminal
    /// state or `timeout` elapses.
    pub async fn wait_for_job(&self, job_id: i64, timeout: Duration) -> Result<(), ApiError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.job_status(job_id).await?;
            match job.state.as_str() {
                "SUCCESS" => return Ok(()),
                "FAILED" | "ABORTED" => {
                    return Err(ApiError::Unknown {
                        method: "replication.run_onetime".into(),
                        detail: job
                            .error
                            .unwrap_or_else(|| format!("job {job_id} {}", job.state)),
                    })
                }
                state => trace!("job {} still {}", job_id, state),
            }
            if tokio::time::Instant::now() + JOB_POLL_INTERVAL > deadline {
                return Err(ApiError::Unknown {
                    method: "replication.run_onetime".into(),
                    detail: format!("job {job_id} did not finish within {timeout:?}"),
                });
            }
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
        }
    }

    /// Convenience: run a one-shot replication and block until it finishes.
    pub async fn replication_run_and_wait(
        &self,
        params: &ReplicationRunOnetimeParams,
        timeout: Duration,
    ) -> Result<(), ApiError> {
        let job_id = self.replication_run_onetime(params).await?;
        info!(
            "replication job {} started: {} -> {}",
            job_id,
            params.source_datasets.join(","),
            params.target_dataset
        );
        self.wait_for_job(job_id, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_copy_excludes_identity_properties() {
        let params = ReplicationRunOnetimeParams::local_copy(
            "tank/k8s/vol",
            "tank/csi-detached-snapshots/snap",
            "csi-detached-temp-1",
        );
        assert_eq!(params.direction, "PUSH");
        assert_eq!(params.transport, "LOCAL");
        assert!(params
            .properties_exclude
            .contains(&PROPERTY_CSI_VOLUME_NAME.to_string()));
        assert!(params.properties_exclude.contains(&"mountpoint".to_string()));
        assert_eq!(params.name_regex, "csi-detached-temp-1");
    }

    #[test]
    fn params_serialise_to_appliance_field_names() {
        let params = ReplicationRunOnetimeParams::local_copy("a", "b", "s");
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["source_datasets"], json!(["a"]));
        assert_eq!(value["target_dataset"], "b");
        assert_eq!(value["retention_policy"], "NONE");
        assert_eq!(value["allow_from_scratch"], true);
    }

    #[test]
    fn job_terminal_states() {
        for (state, terminal) in [
            ("RUNNING", false),
            ("PENDING", false),
            ("SUCCESS", true),
            ("FAILED", true),
            ("ABORTED", true),
        ] {
            let job = Job {
                id: 1,
                state: state.into(),
                error: None,
            };
            assert_eq!(job.is_terminal(), terminal, "{state}");
        }
    }
}
