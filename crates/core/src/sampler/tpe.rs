//! Tree-structured Parzen Estimator, univariate form.
//!
//! Each parameter is modeled independently: completed trials are split into
//! a good and a bad fraction by the first objective, each side becomes a
//! Gaussian kernel mixture, and candidates are ranked by the log-density
//! gap between the two mixtures.

use super::{call_rng, param_of, ranked_observations, NumericRange, Sampler, SamplerKind, SamplerProfile};
use crate::archive::FrozenTrial;
use crate::config::Direction;
use crate::params::ParamValue;
use rand::Rng;
use rand_distr::Normal;

const GAMMA: f64 = 0.25;
const CANDIDATES: usize = 24;

pub struct TpeSampler {
    profile: SamplerProfile,
    seed: u64,
}

impl TpeSampler {
    pub fn new(profile: SamplerProfile, seed: u64) -> Self {
        Self { profile, seed }
    }

    fn n_startup_trials(&self) -> usize {
        match self.profile {
            SamplerProfile::Tpe {
                n_startup_trials, ..
            } => n_startup_trials as usize,
            _ => 10,
        }
    }
}

/// Log-density of an equally-weighted Gaussian kernel mixture at `x`,
/// evaluated via log-sum-exp so far-out candidates keep a finite score.
fn log_mixture_density(x: f64, centers: &[f64], bandwidth: f64) -> f64 {
    if centers.is_empty() {
        return f64::NEG_INFINITY;
    }
    let exponents: Vec<f64> = centers
        .iter()
        .map(|center| -0.5 * ((x - center) / bandwidth).powi(2))
        .collect();
    let peak = exponents.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mass: f64 = exponents.iter().map(|e| (e - peak).exp()).sum();
    let normalization = (centers.len() as f64).ln()
        + bandwidth.ln()
        + 0.5 * (2.0 * std::f64::consts::PI).ln();
    peak + mass.ln() - normalization
}

impl Sampler for TpeSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::Tpe
    }

    fn profile(&self) -> &SamplerProfile {
        &self.profile
    }

    fn suggest_numeric(
        &self,
        name: &str,
        range: &NumericRange,
        history: &[FrozenTrial],
        directions: &[Direction],
    ) -> f64 {
        let mut rng = call_rng(self.seed, name, history.len());
        let ranked = ranked_observations(name, history, directions);

        if ranked.len() < self.n_startup_trials() {
            return rng.random_range(range.lower..=range.upper);
        }

        let split = ((ranked.len() as f64 * GAMMA).ceil() as usize)
            .max(2)
            .min(ranked.len() - 1);
        let (good, bad) = ranked.split_at(split);
        let good_vals: Vec<f64> = good
            .iter()
            .filter_map(|(trial, _)| param_of(trial, name))
            .collect();
        let bad_vals: Vec<f64> = bad
            .iter()
            .filter_map(|(trial, _)| param_of(trial, name))
            .collect();

        // Ten percent of the span as kernel bandwidth; floored so a
        // degenerate range still yields a valid kernel.
        let bandwidth = ((range.upper - range.lower).abs() * 0.1).max(1e-9);
        let Ok(kernel) = Normal::new(0.0, bandwidth) else {
            return rng.random_range(range.lower..=range.upper);
        };

        // Propose around good observations, keep the candidate with the
        // widest log-density gap over the bad mixture.
        let mut best_candidate = rng.random_range(range.lower..=range.upper);
        let mut best_gap = f64::NEG_INFINITY;
        for _ in 0..CANDIDATES {
            let candidate = if good_vals.is_empty() {
                rng.random_range(range.lower..=range.upper)
            } else {
                let center = good_vals[rng.random_range(0..good_vals.len())];
                (center + rng.sample(kernel)).clamp(range.lower, range.upper)
            };
            let gap = log_mixture_density(candidate, &good_vals, bandwidth)
                - log_mixture_density(candidate, &bad_vals, bandwidth);
            if gap > best_gap {
                best_gap = gap;
                best_candidate = candidate;
            }
        }
        best_candidate
    }

    fn suggest_categorical(
        &self,
        name: &str,
        choices: &[ParamValue],
        history: &[FrozenTrial],
        directions: &[Direction],
    ) -> usize {
        let mut rng = call_rng(self.seed, name, history.len());

        let completed: Vec<&FrozenTrial> = history
            .iter()
            .filter(|trial| trial.values.is_some() && trial.params.contains_key(name))
            .collect();

        if completed.len() < self.n_startup_trials() {
            return rng.random_range(0..choices.len());
        }

        // Weight choices by their frequency among the good fraction, with
        // add-one smoothing so unseen choices stay reachable.
        let ranked = {
            let minimize = directions.first() != Some(&Direction::Maximize);
            let mut trials = completed;
            trials.sort_by(|a, b| {
                let left = a.values.as_ref().and_then(|v| v.first().copied()).unwrap_or(f64::INFINITY);
                let right = b.values.as_ref().and_then(|v| v.first().copied()).unwrap_or(f64::INFINITY);
                let ordering = left.partial_cmp(&right).unwrap_or(std::cmp::Ordering::Equal);
                if minimize { ordering } else { ordering.reverse() }
            });
            trials
        };
        let split = ((ranked.len() as f64 * GAMMA).ceil() as usize).max(1);
        let good = &ranked[..split.min(ranked.len())];

        let mut weights: Vec<f64> = vec![1.0; choices.len()];
        for trial in good {
            if let Some(value) = trial.params.get(name) {
                if let Some(index) = choices.iter().position(|choice| choice == value) {
                    weights[index] += 1.0;
                }
            }
        }

        let total: f64 = weights.iter().sum();
        let mut threshold = rng.random_range(0.0..total);
        for (index, weight) in weights.iter().enumerate() {
            if threshold < *weight {
                return index;
            }
            threshold -= weight;
        }
        choices.len() - 1
    }
}
