//! Search strategies and their per-worker assignment.
//!
//! Parallel workers of one breeder each run a different sampler family so
//! the job explores with heterogeneous strategies. Assignment is a pure
//! function of the worker id, so restarts land on the same study.

mod genetic;
mod random;
mod tpe;

pub use genetic::EvolutionarySampler;
pub use random::{QmcSampler, RandomSampler};
pub use tpe::TpeSampler;

use crate::archive::FrozenTrial;
use crate::config::Direction;
use crate::params::ParamValue;
use crate::rng::{get_rng, stable_hash};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    Tpe,
    Nsga2,
    Nsga3,
    Random,
    Qmc,
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tpe => "tpe",
            Self::Nsga2 => "nsga2",
            Self::Nsga3 => "nsga3",
            Self::Random => "random",
            Self::Qmc => "qmc",
        };
        write!(f, "{name}")
    }
}

/// Fixed rotation used when sharding samplers across parallel workers.
pub const DIVERSITY_ORDER: [SamplerKind; 5] = [
    SamplerKind::Tpe,
    SamplerKind::Nsga2,
    SamplerKind::Random,
    SamplerKind::Nsga3,
    SamplerKind::Qmc,
];

/// Assign this worker's sampler kind.
///
/// Single-worker breeders always get TPE. With `parallel` workers the first
/// `min(parallel, 5)` kinds of [`DIVERSITY_ORDER`] are in play and the
/// worker indexes them by a stable hash of its id.
pub fn assign(worker_id: &str, parallel: u32) -> SamplerKind {
    if parallel <= 1 {
        return SamplerKind::Tpe;
    }
    let available = &DIVERSITY_ORDER[..parallel.min(5) as usize];
    let index = (stable_hash(worker_id) % available.len() as u64) as usize;
    let assigned = available[index];
    tracing::info!(
        worker_id,
        parallel,
        sampler = %assigned,
        "algorithm diversity: sampler assigned"
    );
    assigned
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crossover {
    Uniform,
    Undx,
    Spx,
    BlxAlpha,
    Sbx,
    Vsbx,
}

/// Hyperparameters drawn once at sampler creation, from known-good profiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SamplerProfile {
    Tpe {
        multivariate: bool,
        group: bool,
        constant_liar: bool,
        n_startup_trials: u32,
    },
    Nsga2 {
        population_size: u32,
        mutation_prob: f64,
        crossover_prob: f64,
        crossover: Crossover,
    },
    Nsga3 {
        population_size: u32,
    },
    Random,
    Qmc,
}

impl SamplerProfile {
    /// Randomized profile for a sampler kind; a pure function of the RNG.
    pub fn draw(kind: SamplerKind, rng: &mut ChaCha8Rng) -> Self {
        match kind {
            SamplerKind::Tpe => {
                // group=true is only valid together with multivariate=true.
                let (multivariate, group) =
                    *pick(rng, &[(true, true), (true, false), (false, false)]);
                Self::Tpe {
                    multivariate,
                    group,
                    constant_liar: *pick(rng, &[true, false]),
                    n_startup_trials: *pick(rng, &[5, 10, 20]),
                }
            }
            SamplerKind::Nsga2 => {
                let crossover = *pick(
                    rng,
                    &[
                        Crossover::Uniform,
                        Crossover::Undx,
                        Crossover::Spx,
                        Crossover::BlxAlpha,
                        Crossover::Sbx,
                        Crossover::Vsbx,
                    ],
                );
                let mut population_size = *pick(rng, &[30, 50, 75, 100, 125, 150]);
                // UNDX and SPX need at least 3 parents.
                if matches!(crossover, Crossover::Undx | Crossover::Spx) {
                    population_size = population_size.max(3);
                }
                Self::Nsga2 {
                    population_size,
                    mutation_prob: *pick(rng, &[0.05, 0.1, 0.15]),
                    crossover_prob: *pick(rng, &[0.8, 0.9, 0.95]),
                    crossover,
                }
            }
            SamplerKind::Nsga3 => Self::Nsga3 {
                population_size: *pick(rng, &[50, 100]),
            },
            SamplerKind::Random => Self::Random,
            SamplerKind::Qmc => Self::Qmc,
        }
    }
}

fn pick<'a, T>(rng: &mut ChaCha8Rng, options: &'a [T]) -> &'a T {
    use rand::Rng;
    &options[rng.random_range(0..options.len())]
}

/// Numeric suggestion domain. Samplers emit a raw value inside
/// `[lower, upper]`; the study quantizes it onto the step grid.
#[derive(Debug, Clone, Copy)]
pub struct NumericRange {
    pub lower: f64,
    pub upper: f64,
    pub step: f64,
    pub integral: bool,
}

impl NumericRange {
    /// Clamp into bounds and snap onto the `lower + k*step` grid.
    pub fn quantize(&self, raw: f64) -> f64 {
        let clamped = raw.clamp(self.lower, self.upper);
        let snapped = if self.step > 0.0 {
            let steps = ((clamped - self.lower) / self.step).round();
            (self.lower + steps * self.step).clamp(self.lower, self.upper)
        } else {
            clamped
        };
        if self.integral {
            snapped.round()
        } else {
            snapped
        }
    }
}

/// One search strategy instance.
///
/// Suggestions are deterministic in `(seed, parameter name, history length)`
/// so an unchanged trial state reproduces the same assignment.
pub trait Sampler: Send {
    fn kind(&self) -> SamplerKind;
    fn profile(&self) -> &SamplerProfile;

    fn suggest_numeric(
        &self,
        name: &str,
        range: &NumericRange,
        history: &[FrozenTrial],
        directions: &[Direction],
    ) -> f64;

    /// Returns an index into `choices`.
    fn suggest_categorical(
        &self,
        name: &str,
        choices: &[ParamValue],
        history: &[FrozenTrial],
        directions: &[Direction],
    ) -> usize;
}

/// Instantiate the sampler for a kind, drawing its profile from `seed`.
pub fn create(kind: SamplerKind, seed: u64) -> Box<dyn Sampler> {
    let mut rng = get_rng(seed);
    let profile = SamplerProfile::draw(kind, &mut rng);
    tracing::info!(sampler = %kind, ?profile, "created sampler");
    match kind {
        SamplerKind::Tpe => Box::new(TpeSampler::new(profile, seed)),
        SamplerKind::Nsga2 | SamplerKind::Nsga3 => {
            Box::new(EvolutionarySampler::new(kind, profile, seed))
        }
        SamplerKind::Random => Box::new(RandomSampler::new(seed)),
        SamplerKind::Qmc => Box::new(QmcSampler::new(seed)),
    }
}

/// Per-suggestion RNG, derived rather than stateful so that suggestions are
/// reproducible for a given study state.
pub(crate) fn call_rng(seed: u64, name: &str, history_len: usize) -> ChaCha8Rng {
    let mix = stable_hash(name)
        .rotate_left(17)
        .wrapping_add((history_len as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    get_rng(seed ^ mix)
}

/// Completed trials carrying a numeric value for `name`, best first by the
/// first objective.
pub(crate) fn ranked_observations<'a>(
    name: &str,
    history: &'a [FrozenTrial],
    directions: &[Direction],
) -> Vec<(&'a FrozenTrial, f64)> {
    let minimize = directions.first() != Some(&Direction::Maximize);
    let mut observed: Vec<(&FrozenTrial, f64)> = history
        .iter()
        .filter_map(|trial| {
            let value = trial.values.as_ref()?.first().copied()?;
            trial.params.get(name)?.as_f64()?;
            Some((trial, value))
        })
        .collect();
    observed.sort_by(|a, b| {
        let ordering = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
        if minimize {
            ordering
        } else {
            ordering.reverse()
        }
    });
    observed
}

pub(crate) fn param_of(trial: &FrozenTrial, name: &str) -> Option<f64> {
    trial.params.get(name)?.as_f64()
}
