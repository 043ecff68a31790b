//! Effectuation: apply a parameter assignment to the remote targets.
//!
//! The heavy lifting (SSH, playbooks) happens in the external workflow
//! engine; the worker submits an apply job and waits for its result.

use crate::config::{BreederConfig, Objective, Target};
use crate::error::{Error, Result};
use crate::params::ParamAssignment;
use std::collections::BTreeMap;
use std::env;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub status: String,
    pub metrics: BTreeMap<String, f64>,
}

/// Something that can push an assignment onto a set of targets.
pub trait Effectuator: Send {
    fn apply(
        &self,
        config: &BreederConfig,
        targets: &[Target],
        params: &ParamAssignment,
    ) -> Result<ApplyOutcome>;
}

/// Client for the workflow engine's job API: submit the apply flow, then
/// poll for its result.
pub struct WorkflowClient {
    client: reqwest::blocking::Client,
    base_url: String,
    poll_interval: Duration,
    result_timeout: Duration,
}

impl WorkflowClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(2),
            result_timeout: Duration::from_secs(3600),
        })
    }

    pub fn from_env() -> Result<Self> {
        let url = env::var("GODON_WORKFLOW_URL").unwrap_or_else(|_| "http://windmill:8000".into());
        Self::new(url)
    }

    pub fn with_polling(mut self, poll_interval: Duration, result_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.result_timeout = result_timeout;
        self
    }

    /// Submit a flow run; returns the job id.
    fn run_flow(&self, flow_path: &str, inputs: &serde_json::Value) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/api/jobs/run/{flow_path}", self.base_url))
            .json(inputs)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Effectuation(format!(
                "flow submission failed with {status}"
            )));
        }
        let body: serde_json::Value = response.json()?;
        let job_id = match &body {
            serde_json::Value::String(id) => Some(id.clone()),
            serde_json::Value::Object(map) => map
                .get("job_id")
                .or_else(|| map.get("id"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            _ => None,
        };
        job_id.ok_or_else(|| Error::Effectuation(format!("no job id in response: {body}")))
    }

    /// Block until the job result is available.
    fn wait_result(&self, job_id: &str) -> Result<serde_json::Value> {
        let started = Instant::now();
        loop {
            let response = self
                .client
                .get(format!("{}/api/jobs/{job_id}/result", self.base_url))
                .send()?;
            match response.status() {
                status if status.is_success() => return Ok(response.json()?),
                // Result not materialized yet.
                reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::ACCEPTED => {}
                status => {
                    return Err(Error::Effectuation(format!(
                        "result fetch for job {job_id} failed with {status}"
                    )))
                }
            }
            if started.elapsed() > self.result_timeout {
                return Err(Error::Effectuation(format!(
                    "timed out waiting for job {job_id}"
                )));
            }
            thread::sleep(self.poll_interval);
        }
    }
}

impl Effectuator for WorkflowClient {
    fn apply(
        &self,
        config: &BreederConfig,
        targets: &[Target],
        params: &ParamAssignment,
    ) -> Result<ApplyOutcome> {
        let inputs = serde_json::json!({
            "config": config,
            "targets": targets,
            "params": params,
        });
        tracing::info!(
            flow = %config.effectuation.flow,
            targets = targets.len(),
            params = params.len(),
            "submitting effectuation flow"
        );

        let job_id = self.run_flow(&config.effectuation.flow, &inputs)?;
        tracing::debug!(job_id = %job_id, "effectuation flow submitted");

        let result = self.wait_result(&job_id)?;
        let status = result
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        if status != "completed" {
            return Err(Error::Effectuation(format!(
                "effectuation flow ended with status '{status}'"
            )));
        }

        let metrics: BTreeMap<String, f64> = result
            .get("metrics")
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(name, value)| value.as_f64().map(|v| (name.clone(), v)))
                    .collect()
            })
            .unwrap_or_default();

        tracing::info!(status = %status, metrics = metrics.len(), "effectuation flow completed");
        Ok(ApplyOutcome { status, metrics })
    }
}

/// Penalty map: every objective scored `+inf`.
pub fn penalty_map(objectives: &[Objective]) -> BTreeMap<String, f64> {
    objectives
        .iter()
        .map(|objective| (objective.name.clone(), f64::INFINITY))
        .collect()
}

/// Apply with absorbing semantics: errors and missing metrics become a
/// penalty map, never a propagated failure. `stabilization_seconds` is
/// honored after a successful apply, for setups where no reconnaissance
/// sampler runs afterwards.
pub fn apply_or_penalty(
    effectuator: &dyn Effectuator,
    config: &BreederConfig,
    targets: &[Target],
    params: &ParamAssignment,
    stabilization_seconds: Option<u64>,
) -> BTreeMap<String, f64> {
    match effectuator.apply(config, targets, params) {
        Ok(outcome) => {
            if let Some(seconds) = stabilization_seconds.filter(|s| *s > 0) {
                tracing::info!(seconds, "waiting for system stabilization");
                thread::sleep(Duration::from_secs(seconds));
            }
            if outcome.metrics.is_empty() {
                tracing::error!("no metrics returned from effectuation flow");
                return penalty_map(&config.objectives);
            }
            outcome.metrics
        }
        Err(error) => {
            tracing::error!(%error, "effectuation flow failed");
            penalty_map(&config.objectives)
        }
    }
}
