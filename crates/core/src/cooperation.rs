//! Cooperation: copy high-value trials into peer studies.
//!
//! Sharing strategies pick which completed trials are worth spreading:
//! probabilistically, only top performers, only bottom performers (negative
//! knowledge), or both extremes.

use crate::archive::FrozenTrial;
use crate::config::{Cooperation, ShareStrategy};
use crate::error::Result;
use crate::study::Study;
use rand::Rng;

pub struct CooperationCallback {
    strategy: ShareStrategy,
    probability: f64,
    top_percentile: f64,
    bottom_percentile: f64,
    min_trials_for_filtering: usize,
    share_within_breeder: bool,
}

impl CooperationCallback {
    /// Construct from the cooperation block; `None` when cooperation is off.
    /// Sharing within the breeder (across its sampler studies) is enabled
    /// exactly when the breeder runs parallel workers.
    pub fn from_config(cooperation: &Cooperation, parallel: u32) -> Option<Self> {
        if !cooperation.active {
            tracing::info!("cooperation disabled");
            return None;
        }
        let share_within_breeder = parallel > 1;
        tracing::info!(
            strategy = ?cooperation.share_strategy,
            share_within_breeder,
            "cooperation enabled"
        );
        Some(Self {
            strategy: cooperation.share_strategy,
            probability: cooperation.probability,
            top_percentile: cooperation.top_percentile,
            bottom_percentile: cooperation.bottom_percentile,
            min_trials_for_filtering: cooperation.min_trials_for_filtering,
            share_within_breeder,
        })
    }

    pub fn strategy(&self) -> ShareStrategy {
        self.strategy
    }

    /// Invoke after an accepted trial. Returns the number of peers that
    /// received the trial, or `None` when the strategy decided not to share.
    pub fn on_trial_complete(
        &self,
        study: &mut Study,
        trial: &FrozenTrial,
    ) -> Result<Option<usize>> {
        if !self.should_share(study, trial)? {
            tracing::debug!(trial = trial.number, strategy = ?self.strategy, "not sharing trial");
            return Ok(None);
        }
        tracing::debug!(trial = trial.number, strategy = ?self.strategy, "sharing trial");
        Ok(Some(self.share(study, trial)))
    }

    fn should_share(&self, study: &Study, trial: &FrozenTrial) -> Result<bool> {
        if self.strategy == ShareStrategy::Probabilistic {
            return Ok(rand::rng().random::<f64>() < self.probability);
        }

        let completed = study.completed_trials()?;
        let values: Vec<f64> = completed
            .iter()
            .filter_map(|t| t.values.as_ref().and_then(|v| v.first().copied()))
            .collect();

        // Quality filtering needs a meaningful sample to rank against.
        if values.len() < self.min_trials_for_filtering {
            tracing::debug!(
                completed = values.len(),
                needed = self.min_trials_for_filtering,
                "insufficient trials for quality filtering, sharing all"
            );
            return Ok(true);
        }

        let trial_value = trial
            .values
            .as_ref()
            .and_then(|v| v.first().copied())
            .unwrap_or(f64::INFINITY);
        let percentile = percentile_of(&values, trial_value);
        let top_threshold = 100.0 - self.top_percentile * 100.0;
        let bottom_threshold = self.bottom_percentile * 100.0;

        Ok(match self.strategy {
            ShareStrategy::Best => percentile >= top_threshold,
            ShareStrategy::Worst => percentile <= bottom_threshold,
            ShareStrategy::Extremes => {
                percentile >= top_threshold || percentile <= bottom_threshold
            }
            ShareStrategy::Probabilistic => unreachable!("handled above"),
        })
    }

    /// Copy the trial into every peer study in the same storage; any single
    /// peer failing is logged and does not stop the rest.
    fn share(&self, study: &mut Study, trial: &FrozenTrial) -> usize {
        let own_name = study.name().to_string();
        let breeder_prefix = own_name.split('_').next().unwrap_or(&own_name).to_string();

        let peers = match study.all_study_names() {
            Ok(names) => names,
            Err(error) => {
                tracing::error!(%error, "communication failed");
                return 0;
            }
        };

        let mut shared = 0;
        for peer in peers {
            if peer == own_name {
                continue;
            }
            if !self.share_within_breeder && peer.starts_with(&breeder_prefix) {
                continue;
            }
            match study.add_trial_to(&peer, trial) {
                Ok(true) => {
                    tracing::info!(trial = trial.number, peer = %peer, "shared trial");
                    shared += 1;
                }
                Ok(false) => {
                    tracing::debug!(trial = trial.number, peer = %peer, "peer already has trial");
                }
                Err(error) => {
                    tracing::warn!(peer = %peer, %error, "failed to share with peer");
                }
            }
        }
        shared
    }
}

/// Percentage of values less than or equal to `value` ("weak" percentile).
fn percentile_of(values: &[f64], value: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let at_or_below = values.iter().filter(|&&v| v <= value).count();
    at_or_below as f64 / values.len() as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archive;
    use crate::config::Direction;
    use crate::sampler::{self, SamplerKind};

    fn cooperation(strategy: ShareStrategy) -> Cooperation {
        Cooperation {
            active: true,
            share_strategy: strategy,
            probability: 0.8,
            top_percentile: 0.2,
            bottom_percentile: 0.2,
            min_trials_for_filtering: 10,
        }
    }

    /// One archive holding the worker's study plus peers, with `n` completed
    /// trials (values 1..=n) in the worker's study.
    fn study_with_peers(completed: usize, peers: &[&str]) -> Study {
        let mut archive = Archive::open_in_memory().unwrap();
        for peer in peers {
            archive
                .create_or_load_study(peer, &[Direction::Minimize])
                .unwrap();
        }
        let mut study = Study::load_or_create(
            archive,
            "u1_tpe_study",
            &[Direction::Minimize],
            sampler::create(SamplerKind::Random, 1),
        )
        .unwrap();
        for value in 1..=completed {
            let trial = study.ask().unwrap();
            study.tell_complete(trial, vec![value as f64]).unwrap();
        }
        study
    }

    fn frozen(study: &Study, value: f64) -> FrozenTrial {
        study
            .completed_trials()
            .unwrap()
            .into_iter()
            .find(|t| t.values.as_deref() == Some(&[value]))
            .unwrap()
    }

    #[test]
    fn test_percentile_weak_definition() {
        let values: Vec<f64> = (1..=12).map(|v| v as f64).collect();
        let low = percentile_of(&values, 2.0);
        assert!((low - 16.666).abs() < 0.1);
        assert_eq!(percentile_of(&values, 12.0), 100.0);
    }

    #[test]
    fn test_inactive_cooperation_yields_none() {
        let mut inactive = cooperation(ShareStrategy::Best);
        inactive.active = false;
        assert!(CooperationCallback::from_config(&inactive, 3).is_none());
    }

    #[test]
    fn test_best_strategy_shares_only_top_percentile() {
        // 12 completed trials, first-objective values 1..12, minimize.
        let callback =
            CooperationCallback::from_config(&cooperation(ShareStrategy::Best), 1).unwrap();
        let mut study = study_with_peers(12, &["peer_a_study", "peer_b_study"]);

        // Value 2 sits at percentile ~16.7 < 80: not shared.
        let low = frozen(&study, 2.0);
        assert_eq!(callback.on_trial_complete(&mut study, &low).unwrap(), None);

        // Value 12 sits at percentile 100 >= 80: shared to both peers.
        let high = frozen(&study, 12.0);
        assert_eq!(
            callback.on_trial_complete(&mut study, &high).unwrap(),
            Some(2)
        );
    }

    #[test]
    fn test_worst_strategy_shares_bottom() {
        let callback =
            CooperationCallback::from_config(&cooperation(ShareStrategy::Worst), 1).unwrap();
        let mut study = study_with_peers(12, &["peer_a_study"]);

        let low = frozen(&study, 2.0);
        assert_eq!(
            callback.on_trial_complete(&mut study, &low).unwrap(),
            Some(1)
        );
        let high = frozen(&study, 12.0);
        assert_eq!(callback.on_trial_complete(&mut study, &high).unwrap(), None);
    }

    #[test]
    fn test_extremes_strategy_shares_both_ends() {
        let callback =
            CooperationCallback::from_config(&cooperation(ShareStrategy::Extremes), 1).unwrap();
        let mut study = study_with_peers(12, &["peer_a_study"]);

        let low = frozen(&study, 1.0);
        assert!(callback
            .on_trial_complete(&mut study, &low)
            .unwrap()
            .is_some());
        let high = frozen(&study, 12.0);
        assert!(callback
            .on_trial_complete(&mut study, &high)
            .unwrap()
            .is_some());
        let mid = frozen(&study, 6.0);
        assert!(callback
            .on_trial_complete(&mut study, &mid)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_below_min_trials_always_shares() {
        let callback =
            CooperationCallback::from_config(&cooperation(ShareStrategy::Best), 1).unwrap();
        let mut study = study_with_peers(4, &["peer_a_study"]);

        let low = frozen(&study, 1.0);
        assert_eq!(
            callback.on_trial_complete(&mut study, &low).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn test_probabilistic_extremes_of_probability() {
        let mut always = cooperation(ShareStrategy::Probabilistic);
        always.probability = 1.0;
        let callback = CooperationCallback::from_config(&always, 1).unwrap();
        let mut study = study_with_peers(3, &["peer_a_study"]);
        let trial = frozen(&study, 1.0);
        assert!(callback.on_trial_complete(&mut study, &trial).unwrap().is_some());

        let mut never = cooperation(ShareStrategy::Probabilistic);
        never.probability = 0.0;
        let callback = CooperationCallback::from_config(&never, 1).unwrap();
        assert!(callback.on_trial_complete(&mut study, &trial).unwrap().is_none());
    }

    #[test]
    fn test_share_within_breeder_prefix_skip() {
        // parallel=1 disables sharing within the breeder prefix "u1".
        let callback =
            CooperationCallback::from_config(&cooperation(ShareStrategy::Best), 1).unwrap();
        let mut study = study_with_peers(12, &["u1_nsga2_study", "zz_study"]);

        let high = frozen(&study, 12.0);
        // Only the foreign-prefix peer receives the trial.
        assert_eq!(
            callback.on_trial_complete(&mut study, &high).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn test_resharing_is_idempotent() {
        let callback =
            CooperationCallback::from_config(&cooperation(ShareStrategy::Best), 2).unwrap();
        let mut study = study_with_peers(12, &["peer_a_study"]);

        let high = frozen(&study, 12.0);
        assert_eq!(
            callback.on_trial_complete(&mut study, &high).unwrap(),
            Some(1)
        );
        // Second invocation decides to share again but the peer dedupes.
        assert_eq!(
            callback.on_trial_complete(&mut study, &high).unwrap(),
            Some(0)
        );
    }
}
