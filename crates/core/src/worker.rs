//! The breeder worker: one control loop driving one study to completion.

use crate::archive::{Archive, ArchiveConfig};
use crate::config::{parse_time_budget, AfterAction, BreederConfig, CompletionCriteria, Direction};
use crate::cooperation::CooperationCallback;
use crate::effectuation::{apply_or_penalty, penalty_map, Effectuator, WorkflowClient};
use crate::error::Result;
use crate::guardrail::check_guardrails;
use crate::metrics::MetricsClient;
use crate::params::ParamAssignment;
use crate::recon::{self, MetricSource, PrometheusSource, RetryPolicy};
use crate::rng::stable_hash;
use crate::rollback::{RollbackCoordinator, RollbackOutcome};
use crate::sampler::{self, SamplerKind};
use crate::study::{study_name, Study};
use crate::suggest;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

/// External collaborators, injectable for tests and alternative transports.
pub struct WorkerHandles {
    pub effectuator: Box<dyn Effectuator>,
    /// When present, metrics are measured by the worker after each apply;
    /// otherwise the effectuation result must carry them.
    pub recon_source: Option<Box<dyn MetricSource>>,
}

/// Final summary handed back to the controller.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub worker_id: String,
    pub breeder_type: String,
    pub breeder_id: String,
    pub run_id: u32,
    pub target_id: u32,
    pub total_trials: u64,
    pub best_params: Option<ParamAssignment>,
    pub best_values: Option<Vec<f64>>,
    pub status: String,
}

pub struct BreederWorker {
    config: BreederConfig,
    worker_id: String,
    sampler_kind: SamplerKind,
    study: Study,
    cooperation: Option<CooperationCallback>,
    rollback: Option<RollbackCoordinator>,
    metrics: MetricsClient,
    effectuator: Box<dyn Effectuator>,
    recon_source: Option<Box<dyn MetricSource>>,
    retry_policy: RetryPolicy,
    start_time: DateTime<Utc>,
}

impl BreederWorker {
    /// Wire a worker against the given archive and collaborators.
    pub fn new(config: BreederConfig, archive: Archive, handles: WorkerHandles) -> Result<Self> {
        let breeder_id = config.breeder.uuid.clone();
        let breeder_type = config.breeder.name.clone();
        let parallel = config.run.parallel;

        // Parallel workers get a run-slot suffix so each hashes onto its own
        // sampler kind.
        let worker_id = if parallel > 1 {
            format!("{}-{}", config.worker_id(), config.run_id)
        } else {
            config.worker_id()
        };

        let sampler_kind = sampler::assign(&worker_id, parallel);
        let sampler = sampler::create(sampler_kind, stable_hash(&worker_id));
        let name = study_name(&breeder_id, &sampler_kind.to_string(), parallel);
        let directions: Vec<Direction> = config
            .objectives
            .iter()
            .map(|objective| objective.direction)
            .collect();
        let mut study = Study::load_or_create(archive, &name, &directions, sampler)?;

        let cooperation = CooperationCallback::from_config(&config.cooperation, parallel);
        let rollback = RollbackCoordinator::from_config(&config);
        if let Some(coordinator) = &rollback {
            coordinator.init_state(&mut study)?;
        }

        let metrics = MetricsClient::new(&breeder_id, &worker_id, &breeder_type)?;
        let start_time = config.creation_ts;

        let mut worker = Self {
            config,
            worker_id,
            sampler_kind,
            study,
            cooperation,
            rollback,
            metrics,
            effectuator: handles.effectuator,
            recon_source: handles.recon_source,
            retry_policy: RetryPolicy::default(),
            start_time,
        };
        worker.publish_state("running")?;
        Ok(worker)
    }

    /// Standard wiring: archive, workflow engine, and monitoring backend
    /// resolved from the environment.
    pub fn from_env(config: BreederConfig) -> Result<Self> {
        let archive_config = ArchiveConfig::from_env();
        let archive = Archive::open_from_env(&archive_config, &config.archive_db_name())?;

        let needs_prometheus = recon::metric_specs(&config)
            .iter()
            .any(|(_, spec)| spec.service == "prometheus");
        let recon_source: Option<Box<dyn MetricSource>> = if needs_prometheus {
            Some(Box::new(PrometheusSource::from_env()?))
        } else {
            None
        };

        let handles = WorkerHandles {
            effectuator: Box::new(WorkflowClient::from_env()?),
            recon_source,
        };
        Self::new(config, archive, handles)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn sampler_kind(&self) -> SamplerKind {
        self.sampler_kind
    }

    pub fn study(&self) -> &Study {
        &self.study
    }

    /// Drive the study until a completion criterion fires.
    pub fn run(&mut self) -> Result<WorkerReport> {
        tracing::info!(
            worker_id = %self.worker_id,
            breeder = %self.config.breeder.name,
            uuid = %self.config.breeder.uuid,
            sampler = %self.sampler_kind,
            "starting breeder worker"
        );
        self.metrics.mark_running();
        self.metrics.push();

        let outcome = self.run_loop();

        // Flush final status regardless of how the loop ended.
        self.metrics.mark_stopped();
        self.metrics.push();

        match outcome {
            Ok(()) => {
                self.publish_state("completed")?;
                let report = self.report("completed")?;
                tracing::info!(
                    worker_id = %self.worker_id,
                    total_trials = report.total_trials,
                    "breeder worker completed"
                );
                if let Some(best) = self.study.best_trial()? {
                    tracing::info!(
                        best_trial = best.number,
                        values = ?best.values,
                        "best trial"
                    );
                }
                Ok(report)
            }
            Err(error) => {
                tracing::error!(worker_id = %self.worker_id, %error, "breeder worker failed");
                if let Err(publish_error) = self.publish_state("failed") {
                    tracing::warn!(%publish_error, "failed to publish final state");
                }
                Err(error)
            }
        }
    }

    fn run_loop(&mut self) -> Result<()> {
        let mut trial_count = 0u64;

        while self.should_continue()? {
            if let Some(coordinator) = &self.rollback {
                if coordinator.target_skipped(&mut self.study)? {
                    tracing::warn!(
                        target_id = coordinator.target_id(),
                        "target marked skip_target, stopping worker"
                    );
                    break;
                }
                if coordinator.needs_rollback(&mut self.study)? {
                    tracing::warn!("rollback needed, executing before next trial");
                    match coordinator.execute(
                        &mut self.study,
                        self.effectuator.as_ref(),
                        &self.config,
                    ) {
                        Ok(RollbackOutcome::Completed) => {
                            self.metrics.inc_rollback("success");
                            self.metrics.push();
                        }
                        Ok(_) => {
                            self.metrics.inc_rollback("failed");
                            self.metrics.push();
                            tracing::warn!("rollback failed, continuing with trials");
                        }
                        Err(error) => {
                            // on_failure=stop: leave the loop, metrics are
                            // flushed by the caller.
                            self.metrics.inc_rollback("failed");
                            self.metrics.push();
                            return Err(error);
                        }
                    }

                    let (action, duration) = coordinator.after_policy();
                    match action {
                        AfterAction::Pause => {
                            tracing::info!(duration, "pausing after rollback");
                            thread::sleep(Duration::from_secs(duration));
                        }
                        AfterAction::Stop => {
                            tracing::info!("rollback completed with after.action=stop, halting");
                            break;
                        }
                        AfterAction::Continue => {}
                    }
                }
            }

            let mut trial = self.study.ask()?;
            let number = trial.number;
            tracing::info!(trial = number, "trial started");
            let started = Instant::now();

            let params = match suggest::suggest_params(&mut self.study, &mut trial, &self.config) {
                Ok(params) => params,
                Err(error) => {
                    tracing::error!(trial = number, %error, "trial failed during suggestion");
                    self.study.tell_failed(trial)?;
                    self.record_failure()?;
                    trial_count += 1;
                    self.maybe_publish(trial_count)?;
                    continue;
                }
            };

            let measured = self.execute_trial(&params);
            let (violated, violations) = check_guardrails(&self.config.guardrails, &measured);

            if violated {
                tracing::error!(trial = number, ?violations, "trial failed guardrails");
                self.study.tell_failed(trial)?;
                for violation in &violations {
                    self.metrics.inc_guardrail_violation(&violation.name);
                }
                self.record_failure()?;
            } else {
                let values: Vec<f64> = self
                    .config
                    .objectives
                    .iter()
                    .map(|objective| {
                        measured
                            .get(&objective.name)
                            .copied()
                            .unwrap_or(f64::INFINITY)
                    })
                    .collect();
                let frozen = self.study.tell_complete(trial, values.clone())?;
                tracing::info!(trial = number, ?values, "trial completed");

                self.metrics.inc_trial("complete", values.first().copied());
                self.metrics
                    .observe_trial_duration(started.elapsed().as_secs_f64());
                self.metrics.inc_effectuation("success");

                if let Some(best) = self.study.best_trial()? {
                    if best.number == frozen.number {
                        if let Some(value) = values.first() {
                            self.metrics.set_best_value(*value);
                        }
                    }
                }

                if let Some(coordinator) = &self.rollback {
                    coordinator.on_trial_success(&mut self.study, &frozen.params)?;
                }

                if let Some(callback) = &self.cooperation {
                    match callback.on_trial_complete(&mut self.study, &frozen) {
                        Ok(Some(_)) => {
                            self.metrics
                                .inc_trial_shared(self.config.cooperation.share_strategy.as_str());
                        }
                        Ok(None) => {}
                        Err(error) => tracing::warn!(%error, "cooperation callback failed"),
                    }
                }
            }

            trial_count += 1;
            self.maybe_publish(trial_count)?;
        }

        Ok(())
    }

    /// Bookkeeping shared by every failed-trial path.
    fn record_failure(&mut self) -> Result<()> {
        self.metrics.inc_trial("failed", None);
        self.metrics.inc_effectuation("failure");
        if let Some(coordinator) = &self.rollback {
            coordinator.on_trial_failure(&mut self.study)?;
        }
        Ok(())
    }

    fn maybe_publish(&mut self, trial_count: u64) -> Result<()> {
        if trial_count % 5 == 0 {
            self.publish_state("running")?;
            self.metrics.set_total_trials(self.study.n_trials()?);
            self.metrics.push();
        }
        Ok(())
    }

    /// Apply the assignment and measure its effect.
    ///
    /// With a reconnaissance source the worker measures after the apply
    /// (stabilization and sampling per metric); without one the effectuation
    /// result must carry the metrics, and its stabilization sleep happens in
    /// the adapter.
    fn execute_trial(&mut self, params: &ParamAssignment) -> BTreeMap<String, f64> {
        let targets = &self.config.effectuation.targets;
        match &self.recon_source {
            None => {
                let stabilization = self
                    .config
                    .objectives
                    .first()
                    .map(|objective| objective.reconnaissance.stabilization_seconds);
                apply_or_penalty(
                    self.effectuator.as_ref(),
                    &self.config,
                    targets,
                    params,
                    stabilization,
                )
            }
            Some(source) => match self.effectuator.apply(&self.config, targets, params) {
                Ok(_) => {
                    let specs = recon::metric_specs(&self.config);
                    recon::collect_metrics(source.as_ref(), &specs, &self.retry_policy)
                }
                Err(error) => {
                    tracing::error!(%error, "effectuation failed");
                    penalty_map(&self.config.objectives)
                }
            },
        }
    }

    fn should_continue(&self) -> Result<bool> {
        let criteria = &self.config.run.completion_criteria;
        let n_trials = self.study.n_trials()?;

        if n_trials < criteria.iterations.min {
            tracing::debug!(n_trials, min = criteria.iterations.min, "continuing: below min iterations");
            return Ok(true);
        }
        if n_trials >= criteria.iterations.max {
            tracing::info!(n_trials, max = criteria.iterations.max, "stopping: max iterations reached");
            return Ok(false);
        }
        if self.time_budget_exceeded(criteria) {
            tracing::info!("stopping: time budget exceeded");
            return Ok(false);
        }
        if criteria.quality_achieved && self.quality_thresholds_met()? {
            tracing::info!("stopping: all quality thresholds achieved");
            return Ok(false);
        }
        Ok(true)
    }

    fn time_budget_exceeded(&self, criteria: &CompletionCriteria) -> bool {
        let Some(end) = &criteria.timing.end else {
            return false;
        };
        let Some(budget) = parse_time_budget(end) else {
            return false;
        };
        let elapsed = (Utc::now() - self.start_time).to_std().unwrap_or_default();
        elapsed >= budget
    }

    /// All objectives must declare a threshold and the best trial must meet
    /// every one of them.
    fn quality_thresholds_met(&self) -> Result<bool> {
        let Some(best) = self.study.best_trial()? else {
            return Ok(false);
        };
        let Some(values) = &best.values else {
            return Ok(false);
        };
        if self.config.objectives.is_empty() {
            return Ok(false);
        }
        for (value, objective) in values.iter().zip(&self.config.objectives) {
            let Some(threshold) = objective.quality_threshold else {
                return Ok(false);
            };
            let met = match objective.direction {
                Direction::Minimize => *value <= threshold,
                Direction::Maximize => *value >= threshold,
            };
            if !met {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Record progress where every cooperating worker can see it.
    fn publish_state(&mut self, status: &str) -> Result<()> {
        let best = self.study.best_trial()?;
        let state = serde_json::json!({
            "breeder_id": self.config.breeder.uuid,
            "total_trials": self.study.n_trials()?,
            "study_name": self.study.name(),
            "status": status,
            "best_trial_number": best.as_ref().map(|trial| trial.number),
            "best_params": best.as_ref().map(|trial| &trial.params),
            "best_values": best.as_ref().and_then(|trial| trial.values.as_ref()),
        });
        let key = format!("worker_state_{}", self.worker_id);
        self.study.set_user_attr(&key, &state.to_string())?;
        tracing::debug!(status, "published worker state");
        Ok(())
    }

    fn report(&self, status: &str) -> Result<WorkerReport> {
        let best = self.study.best_trial()?;
        Ok(WorkerReport {
            worker_id: self.worker_id.clone(),
            breeder_type: self.config.breeder.name.clone(),
            breeder_id: self.config.breeder.uuid.clone(),
            run_id: self.config.run_id,
            target_id: self.config.target_id,
            total_trials: self.study.n_trials()?,
            best_params: best.as_ref().map(|trial| trial.params.clone()),
            best_values: best.and_then(|trial| trial.values),
            status: status.to_string(),
        })
    }
}
