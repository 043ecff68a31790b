//! Rollback: per-target safety state machine.
//!
//! State lives in the study's user attributes so every worker tuning the
//! same target observes the same failure history. Writes are last-writer-
//! wins; the monotone `version` field lets observers detect racing writers.

use crate::config::{AfterAction, BreederConfig, OnFailure, RollbackStrategy, RollbackTarget, Target};
use crate::effectuation::Effectuator;
use crate::error::{Error, Result};
use crate::params::ParamAssignment;
use crate::study::Study;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Normal,
    NeedsRollback,
    InProgress,
    Completed,
    Failed,
    SkipTarget,
}

/// The JSON blob stored under `rollback_state_target_{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackState {
    pub state: TargetState,
    pub consecutive_failures: u32,
    pub last_successful_params: Option<ParamAssignment>,
    pub rollback_strategy: String,
    pub version: u64,
}

impl RollbackState {
    fn initial(strategy: &str) -> Self {
        Self {
            state: TargetState::Normal,
            consecutive_failures: 0,
            last_successful_params: None,
            rollback_strategy: strategy.to_string(),
            version: 0,
        }
    }
}

/// How a rollback execution ended, for callers that must not unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    Completed,
    Failed,
    TargetSkipped,
}

pub fn state_key(target_id: u32) -> String {
    format!("rollback_state_target_{target_id}")
}

pub struct RollbackCoordinator {
    target: Target,
    strategy: RollbackStrategy,
}

impl RollbackCoordinator {
    /// Build the coordinator for this worker's target; `None` when the
    /// target has rollback disabled.
    pub fn from_config(config: &BreederConfig) -> Option<Self> {
        let target = config.worker_target()?.clone();
        if !target.rollback.enabled {
            return None;
        }
        let strategy = config.rollback_strategy(&target);
        tracing::info!(
            target_id = target.id,
            strategy = %target.rollback.strategy,
            threshold = strategy.consecutive_failures,
            "rollback enabled"
        );
        Some(Self { target, strategy })
    }

    pub fn target_id(&self) -> u32 {
        self.target.id
    }

    pub fn after_policy(&self) -> (&AfterAction, u64) {
        (&self.strategy.after.action, self.strategy.after.duration)
    }

    fn key(&self) -> String {
        state_key(self.target.id)
    }

    /// Create the state attribute if this is the first worker to start.
    pub fn init_state(&self, study: &mut Study) -> Result<()> {
        if study.get_user_attr(&self.key())?.is_some() {
            tracing::debug!(target_id = self.target.id, "rollback state already initialized");
            return Ok(());
        }
        let state = RollbackState::initial(&self.target.rollback.strategy);
        study.set_user_attr(&self.key(), &serde_json::to_string(&state)?)?;
        tracing::info!(target_id = self.target.id, ?state, "initialized rollback state");
        Ok(())
    }

    pub fn load_state(&self, study: &mut Study) -> Result<RollbackState> {
        match study.get_user_attr(&self.key())? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => {
                tracing::warn!(target_id = self.target.id, "no rollback state found, initializing");
                self.init_state(study)?;
                Ok(RollbackState::initial(&self.target.rollback.strategy))
            }
        }
    }

    /// Persist a state mutation; every write bumps `version`.
    fn store_state(&self, study: &mut Study, state: &mut RollbackState) -> Result<()> {
        state.version += 1;
        study.set_user_attr(&self.key(), &serde_json::to_string(state)?)?;
        tracing::debug!(
            target_id = self.target.id,
            version = state.version,
            state = ?state.state,
            "updated rollback state"
        );
        Ok(())
    }

    /// Trial failed (guardrail violation or execution error): count it and
    /// arm the rollback once the threshold is reached.
    pub fn on_trial_failure(&self, study: &mut Study) -> Result<RollbackState> {
        let mut state = self.load_state(study)?;
        state.consecutive_failures += 1;
        state.state = if state.consecutive_failures >= self.strategy.consecutive_failures {
            tracing::warn!(
                failures = state.consecutive_failures,
                threshold = self.strategy.consecutive_failures,
                "rollback needed"
            );
            TargetState::NeedsRollback
        } else {
            TargetState::Normal
        };
        self.store_state(study, &mut state)?;
        Ok(state)
    }

    /// Trial succeeded: reset the failure streak and remember the params as
    /// the last known-good assignment.
    pub fn on_trial_success(&self, study: &mut Study, params: &ParamAssignment) -> Result<()> {
        let mut state = self.load_state(study)?;
        state.consecutive_failures = 0;
        state.state = TargetState::Normal;
        state.last_successful_params = Some(params.clone());
        self.store_state(study, &mut state)
    }

    pub fn needs_rollback(&self, study: &mut Study) -> Result<bool> {
        let state = self.load_state(study)?;
        Ok(state.state == TargetState::NeedsRollback
            || state.consecutive_failures >= self.strategy.consecutive_failures)
    }

    pub fn target_skipped(&self, study: &mut Study) -> Result<bool> {
        Ok(self.load_state(study)?.state == TargetState::SkipTarget)
    }

    /// Revert the target to the strategy's reference assignment.
    ///
    /// Only `on_failure: stop` escapes as an error; the other policies are
    /// reported through [`RollbackOutcome`].
    pub fn execute(
        &self,
        study: &mut Study,
        effectuator: &dyn Effectuator,
        config: &BreederConfig,
    ) -> Result<RollbackOutcome> {
        tracing::info!(target_id = self.target.id, "executing rollback");
        let mut state = self.load_state(study)?;

        let params = match self.strategy.target_state {
            RollbackTarget::Previous => state.last_successful_params.clone(),
            RollbackTarget::Best => study.best_trial()?.map(|trial| trial.params),
            // Empty assignment: the remote apply restores platform defaults.
            RollbackTarget::Baseline => Some(ParamAssignment::new()),
        };
        let Some(params) = params else {
            let reason = format!(
                "no parameters to restore for target_state={:?}",
                self.strategy.target_state
            );
            tracing::error!(target_id = self.target.id, %reason, "rollback aborted");
            return self.handle_failure(study, &mut state, reason);
        };

        tracing::info!(
            target_id = self.target.id,
            target_state = ?self.strategy.target_state,
            params = params.len(),
            "rolling back"
        );

        state.state = TargetState::InProgress;
        self.store_state(study, &mut state)?;

        // Restricted to this single target.
        match effectuator.apply(config, std::slice::from_ref(&self.target), &params) {
            Ok(outcome) => {
                tracing::info!(status = %outcome.status, "rollback effectuation completed");
                state.state = TargetState::Completed;
                state.consecutive_failures = 0;
                self.store_state(study, &mut state)?;
                Ok(RollbackOutcome::Completed)
            }
            Err(error) => {
                tracing::error!(%error, "rollback execution failed");
                self.handle_failure(study, &mut state, error.to_string())
            }
        }
    }

    fn handle_failure(
        &self,
        study: &mut Study,
        state: &mut RollbackState,
        reason: String,
    ) -> Result<RollbackOutcome> {
        match self.strategy.on_failure {
            OnFailure::Stop => {
                tracing::error!("rollback failed with on_failure=stop, halting optimization");
                state.state = TargetState::Failed;
                self.store_state(study, state)?;
                Err(Error::Rollback {
                    target_id: self.target.id,
                    reason,
                })
            }
            OnFailure::Continue => {
                tracing::warn!("rollback failed with on_failure=continue, continuing optimization");
                state.state = TargetState::Failed;
                self.store_state(study, state)?;
                Ok(RollbackOutcome::Failed)
            }
            OnFailure::SkipTarget => {
                tracing::error!("rollback failed with on_failure=skip_target, marking target unhealthy");
                state.state = TargetState::SkipTarget;
                self.store_state(study, state)?;
                Ok(RollbackOutcome::TargetSkipped)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archive;
    use crate::config::Direction;
    use crate::effectuation::ApplyOutcome;
    use crate::params::ParamValue;
    use crate::sampler::{self, SamplerKind};
    use std::sync::Mutex;

    fn config(on_failure: &str, target_state: &str) -> BreederConfig {
        BreederConfig::from_value(serde_json::json!({
            "breeder": {"name": "b", "uuid": "u-1"},
            "creation_ts": "2025-06-01T12:00:00Z",
            "objectives": [
                {"name": "latency", "direction": "minimize",
                 "reconnaissance": {"service": "prometheus", "query": "q"}}
            ],
            "effectuation": {"targets": [
                {"id": 0, "address": "10.0.0.5",
                 "rollback": {"enabled": true, "strategy": "standard"}}
            ]},
            "rollback_strategies": {
                "standard": {
                    "consecutive_failures": 3,
                    "target_state": target_state,
                    "on_failure": on_failure,
                    "after": {"action": "continue"}
                }
            }
        }))
        .unwrap()
    }

    fn study() -> Study {
        Study::load_or_create(
            Archive::open_in_memory().unwrap(),
            "u-1_study",
            &[Direction::Minimize],
            sampler::create(SamplerKind::Random, 1),
        )
        .unwrap()
    }

    fn params(value: i64) -> ParamAssignment {
        let mut map = ParamAssignment::new();
        map.insert("vm.swappiness".into(), ParamValue::Int(value));
        map
    }

    /// Records applied target/param sets; optionally fails every apply.
    struct RecordingEffectuator {
        applied: Mutex<Vec<(Vec<u32>, ParamAssignment)>>,
        fail: bool,
    }

    impl RecordingEffectuator {
        fn new(fail: bool) -> Self {
            Self {
                applied: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    impl Effectuator for RecordingEffectuator {
        fn apply(
            &self,
            _config: &BreederConfig,
            targets: &[Target],
            params: &ParamAssignment,
        ) -> Result<ApplyOutcome> {
            self.applied
                .lock()
                .unwrap()
                .push((targets.iter().map(|t| t.id).collect(), params.clone()));
            if self.fail {
                Err(Error::Effectuation("target unreachable".into()))
            } else {
                Ok(ApplyOutcome {
                    status: "completed".into(),
                    metrics: Default::default(),
                })
            }
        }
    }

    // ==================== STATE TRANSITIONS ====================

    #[test]
    fn test_initial_state() {
        let config = config("continue", "previous");
        let coordinator = RollbackCoordinator::from_config(&config).unwrap();
        let mut study = study();

        let state = coordinator.load_state(&mut study).unwrap();
        assert_eq!(state.state, TargetState::Normal);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.version, 0);
        assert!(state.last_successful_params.is_none());
    }

    #[test]
    fn test_failures_accumulate_to_needs_rollback() {
        let config = config("continue", "previous");
        let coordinator = RollbackCoordinator::from_config(&config).unwrap();
        let mut study = study();
        coordinator.init_state(&mut study).unwrap();

        for expected in 1..=2u32 {
            let state = coordinator.on_trial_failure(&mut study).unwrap();
            assert_eq!(state.consecutive_failures, expected);
            assert_eq!(state.state, TargetState::Normal);
            assert!(!coordinator.needs_rollback(&mut study).unwrap());
        }

        let state = coordinator.on_trial_failure(&mut study).unwrap();
        assert_eq!(state.consecutive_failures, 3);
        assert_eq!(state.state, TargetState::NeedsRollback);
        assert!(coordinator.needs_rollback(&mut study).unwrap());
    }

    #[test]
    fn test_success_resets_streak_and_records_params() {
        let config = config("continue", "previous");
        let coordinator = RollbackCoordinator::from_config(&config).unwrap();
        let mut study = study();
        coordinator.init_state(&mut study).unwrap();

        coordinator.on_trial_failure(&mut study).unwrap();
        coordinator.on_trial_failure(&mut study).unwrap();
        coordinator.on_trial_success(&mut study, &params(10)).unwrap();

        let state = coordinator.load_state(&mut study).unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.state, TargetState::Normal);
        assert_eq!(state.last_successful_params, Some(params(10)));
    }

    #[test]
    fn test_version_monotonically_increases() {
        let config = config("continue", "previous");
        let coordinator = RollbackCoordinator::from_config(&config).unwrap();
        let mut study = study();
        coordinator.init_state(&mut study).unwrap();

        let mut last_version = coordinator.load_state(&mut study).unwrap().version;
        for _ in 0..4 {
            coordinator.on_trial_failure(&mut study).unwrap();
            let version = coordinator.load_state(&mut study).unwrap().version;
            assert!(version > last_version);
            last_version = version;
        }
    }

    // ==================== ROLLBACK EXECUTION ====================

    #[test]
    fn test_rollback_to_previous_applies_last_good_params() {
        let config = config("continue", "previous");
        let coordinator = RollbackCoordinator::from_config(&config).unwrap();
        let mut study = study();
        coordinator.init_state(&mut study).unwrap();
        coordinator.on_trial_success(&mut study, &params(20)).unwrap();
        for _ in 0..3 {
            coordinator.on_trial_failure(&mut study).unwrap();
        }

        let effectuator = RecordingEffectuator::new(false);
        let outcome = coordinator.execute(&mut study, &effectuator, &config).unwrap();

        assert_eq!(outcome, RollbackOutcome::Completed);
        let applied = effectuator.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        // Restricted to the single affected target, with the last good set.
        assert_eq!(applied[0].0, vec![0]);
        assert_eq!(applied[0].1, params(20));

        let state = coordinator.load_state(&mut study).unwrap();
        assert_eq!(state.state, TargetState::Completed);
        assert_eq!(state.consecutive_failures, 0);
        assert!(!coordinator.needs_rollback(&mut study).unwrap());
    }

    #[test]
    fn test_rollback_to_baseline_sends_empty_params() {
        let config = config("continue", "baseline");
        let coordinator = RollbackCoordinator::from_config(&config).unwrap();
        let mut study = study();
        coordinator.init_state(&mut study).unwrap();

        let effectuator = RecordingEffectuator::new(false);
        let outcome = coordinator.execute(&mut study, &effectuator, &config).unwrap();

        assert_eq!(outcome, RollbackOutcome::Completed);
        assert!(effectuator.applied.lock().unwrap()[0].1.is_empty());
    }

    #[test]
    fn test_rollback_to_best_uses_best_trial() {
        let config = config("continue", "best");
        let coordinator = RollbackCoordinator::from_config(&config).unwrap();
        let mut study = study();
        coordinator.init_state(&mut study).unwrap();

        let mut trial = study.ask().unwrap();
        study.suggest_int(&mut trial, "vm.swappiness", 0, 100, 10).unwrap();
        let best_params = trial.params.clone();
        study.tell_complete(trial, vec![1.0]).unwrap();

        let effectuator = RecordingEffectuator::new(false);
        coordinator.execute(&mut study, &effectuator, &config).unwrap();
        assert_eq!(effectuator.applied.lock().unwrap()[0].1, best_params);
    }

    #[test]
    fn test_rollback_previous_without_history_is_failure() {
        let config = config("continue", "previous");
        let coordinator = RollbackCoordinator::from_config(&config).unwrap();
        let mut study = study();
        coordinator.init_state(&mut study).unwrap();

        let effectuator = RecordingEffectuator::new(false);
        let outcome = coordinator.execute(&mut study, &effectuator, &config).unwrap();

        // Nothing recorded yet: treated as a rollback failure, nothing applied.
        assert_eq!(outcome, RollbackOutcome::Failed);
        assert!(effectuator.applied.lock().unwrap().is_empty());
        let state = coordinator.load_state(&mut study).unwrap();
        assert_eq!(state.state, TargetState::Failed);
    }

    // ==================== ON_FAILURE POLICIES ====================

    #[test]
    fn test_on_failure_stop_escapes_as_error() {
        let config = config("stop", "previous");
        let coordinator = RollbackCoordinator::from_config(&config).unwrap();
        let mut study = study();
        coordinator.init_state(&mut study).unwrap();
        coordinator.on_trial_success(&mut study, &params(5)).unwrap();

        let effectuator = RecordingEffectuator::new(true);
        let result = coordinator.execute(&mut study, &effectuator, &config);

        assert!(matches!(result, Err(Error::Rollback { target_id: 0, .. })));
        let state = coordinator.load_state(&mut study).unwrap();
        assert_eq!(state.state, TargetState::Failed);
    }

    #[test]
    fn test_on_failure_continue_reports_failed() {
        let config = config("continue", "previous");
        let coordinator = RollbackCoordinator::from_config(&config).unwrap();
        let mut study = study();
        coordinator.init_state(&mut study).unwrap();
        coordinator.on_trial_success(&mut study, &params(5)).unwrap();

        let effectuator = RecordingEffectuator::new(true);
        let outcome = coordinator.execute(&mut study, &effectuator, &config).unwrap();
        assert_eq!(outcome, RollbackOutcome::Failed);
    }

    #[test]
    fn test_on_failure_skip_target_marks_state() {
        let config = config("skip_target", "previous");
        let coordinator = RollbackCoordinator::from_config(&config).unwrap();
        let mut study = study();
        coordinator.init_state(&mut study).unwrap();
        coordinator.on_trial_success(&mut study, &params(5)).unwrap();

        let effectuator = RecordingEffectuator::new(true);
        let outcome = coordinator.execute(&mut study, &effectuator, &config).unwrap();
        assert_eq!(outcome, RollbackOutcome::TargetSkipped);
        assert!(coordinator.target_skipped(&mut study).unwrap());
    }

    #[test]
    fn test_disabled_rollback_yields_no_coordinator() {
        let mut config = config("continue", "previous");
        config.effectuation.targets[0].rollback.enabled = false;
        assert!(RollbackCoordinator::from_config(&config).is_none());
    }

    #[test]
    fn test_state_json_shape_is_stable() {
        let state = RollbackState::initial("standard");
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"state\":\"normal\""));
        assert!(json.contains("\"consecutive_failures\":0"));
        assert!(json.contains("\"rollback_strategy\":\"standard\""));
        assert!(json.contains("\"version\":0"));
        assert_eq!(state_key(3), "rollback_state_target_3");
    }
}
