//! Evolutionary sampler backing the NSGA-II and NSGA-III kinds.
//!
//! A lightweight genetic suggestion scheme: tournament selection over the
//! fittest slice of completed trials, the profile's crossover operator per
//! parameter, and uniform mutation. The heavy multi-objective machinery of
//! the full algorithms stays in the study engine family this models.

use super::{call_rng, param_of, ranked_observations, Crossover, NumericRange, Sampler, SamplerKind, SamplerProfile};
use crate::archive::FrozenTrial;
use crate::config::Direction;
use crate::params::ParamValue;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

const SBX_ETA: f64 = 20.0;
const BLX_ALPHA: f64 = 0.5;

pub struct EvolutionarySampler {
    kind: SamplerKind,
    profile: SamplerProfile,
    seed: u64,
}

impl EvolutionarySampler {
    pub fn new(kind: SamplerKind, profile: SamplerProfile, seed: u64) -> Self {
        Self { kind, profile, seed }
    }

    fn population_size(&self) -> usize {
        match self.profile {
            SamplerProfile::Nsga2 { population_size, .. }
            | SamplerProfile::Nsga3 { population_size } => population_size as usize,
            _ => 50,
        }
    }

    fn mutation_prob(&self) -> f64 {
        match self.profile {
            SamplerProfile::Nsga2 { mutation_prob, .. } => mutation_prob,
            _ => 0.1,
        }
    }

    fn crossover_prob(&self) -> f64 {
        match self.profile {
            SamplerProfile::Nsga2 { crossover_prob, .. } => crossover_prob,
            _ => 0.9,
        }
    }

    fn crossover(&self) -> Crossover {
        match self.profile {
            SamplerProfile::Nsga2 { crossover, .. } => crossover,
            _ => Crossover::Uniform,
        }
    }

    /// Tournament of two over the ranked population; lower rank wins.
    fn tournament(rng: &mut ChaCha8Rng, population: usize) -> usize {
        let a = rng.random_range(0..population);
        let b = rng.random_range(0..population);
        a.min(b)
    }

    fn cross(&self, rng: &mut ChaCha8Rng, parent_a: f64, parent_b: f64) -> f64 {
        match self.crossover() {
            Crossover::Uniform => {
                if rng.random_bool(0.5) {
                    parent_a
                } else {
                    parent_b
                }
            }
            Crossover::BlxAlpha => {
                let low = parent_a.min(parent_b);
                let high = parent_a.max(parent_b);
                let spread = (high - low).max(f64::MIN_POSITIVE);
                rng.random_range((low - BLX_ALPHA * spread)..=(high + BLX_ALPHA * spread))
            }
            Crossover::Sbx | Crossover::Vsbx => {
                let u: f64 = rng.random::<f64>();
                let beta = if u <= 0.5 {
                    (2.0 * u).powf(1.0 / (SBX_ETA + 1.0))
                } else {
                    (1.0 / (2.0 * (1.0 - u))).powf(1.0 / (SBX_ETA + 1.0))
                };
                0.5 * ((1.0 + beta) * parent_a + (1.0 - beta) * parent_b)
            }
            Crossover::Undx | Crossover::Spx => {
                let midpoint = 0.5 * (parent_a + parent_b);
                let sigma = 0.5 * (parent_a - parent_b).abs();
                midpoint + rng.sample::<f64, _>(rand_distr::StandardNormal) * sigma
            }
        }
    }
}

impl Sampler for EvolutionarySampler {
    fn kind(&self) -> SamplerKind {
        self.kind
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

        if ranked.len() < 2 {
            return rng.random_range(range.lower..=range.upper);
        }

        let population = ranked.len().min(self.population_size());
        let parent_a = param_of(ranked[Self::tournament(&mut rng, population)].0, name);
        let parent_b = param_of(ranked[Self::tournament(&mut rng, population)].0, name);
        let (Some(parent_a), Some(parent_b)) = (parent_a, parent_b) else {
            return rng.random_range(range.lower..=range.upper);
        };

        let mut child = if rng.random_bool(self.crossover_prob()) {
            self.cross(&mut rng, parent_a, parent_b)
        } else {
            parent_a
        };
        if rng.random_bool(self.mutation_prob()) {
            child = rng.random_range(range.lower..=range.upper);
        }
        child.clamp(range.lower, range.upper)
    }

    fn suggest_categorical(
        &self,
        name: &str,
        choices: &[ParamValue],
        history: &[FrozenTrial],
        directions: &[Direction],
    ) -> usize {
        let mut rng = call_rng(self.seed, name, history.len());

        let minimize = directions.first() != Some(&Direction::Maximize);
        let mut ranked: Vec<&FrozenTrial> = history
            .iter()
            .filter(|trial| trial.values.is_some() && trial.params.contains_key(name))
            .collect();
        ranked.sort_by(|a, b| {
            let left = a.values.as_ref().and_then(|v| v.first().copied()).unwrap_or(f64::INFINITY);
            let right = b.values.as_ref().and_then(|v| v.first().copied()).unwrap_or(f64::INFINITY);
            let ordering = left.partial_cmp(&right).unwrap_or(std::cmp::Ordering::Equal);
            if minimize { ordering } else { ordering.reverse() }
        });

        if ranked.is_empty() || rng.random_bool(self.mutation_prob()) {
            return rng.random_range(0..choices.len());
        }

        let population = ranked.len().min(self.population_size());
        let parent = ranked[Self::tournament(&mut rng, population)];
        parent
            .params
            .get(name)
            .and_then(|value| choices.iter().position(|choice| choice == value))
            .unwrap_or_else(|| rng.random_range(0..choices.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::TrialState;
    use crate::params::ParamAssignment;
    use crate::rng::get_rng;

    fn trial(number: u64, x: f64, value: f64) -> FrozenTrial {
        let mut params = ParamAssignment::new();
        params.insert("x".into(), ParamValue::Float(x));
        FrozenTrial {
            number,
            state: TrialState::Complete,
            params,
            values: Some(vec![value]),
            origin_study: "s".into(),
            origin_number: number,
        }
    }

    fn sampler(kind: SamplerKind) -> EvolutionarySampler {
        let mut rng = get_rng(11);
        EvolutionarySampler::new(kind, SamplerProfile::draw(kind, &mut rng), 11)
    }

    #[test]
    fn test_empty_history_falls_back_to_uniform() {
        let nsga2 = sampler(SamplerKind::Nsga2);
        let range = NumericRange { lower: 0.0, upper: 10.0, step: 0.0, integral: false };
        let value = nsga2.suggest_numeric("x", &range, &[], &[Direction::Minimize]);
        assert!((0.0..=10.0).contains(&value));
    }

    #[test]
    fn test_children_stay_in_bounds() {
        let nsga2 = sampler(SamplerKind::Nsga2);
        let history: Vec<FrozenTrial> =
            (0..40).map(|i| trial(i as u64, (i % 10) as f64, (i % 7) as f64)).collect();
        let range = NumericRange { lower: 0.0, upper: 9.0, step: 0.0, integral: false };

        for shift in 0..10 {
            let value = nsga2.suggest_numeric("x", &range, &history[..30 + shift], &[Direction::Minimize]);
            assert!((0.0..=9.0).contains(&value));
        }
    }

    #[test]
    fn test_nsga3_uses_profile_population() {
        let nsga3 = sampler(SamplerKind::Nsga3);
        assert!(matches!(
            nsga3.profile(),
            SamplerProfile::Nsga3 { population_size } if [50, 100].contains(population_size)
        ));
        assert_eq!(nsga3.kind(), SamplerKind::Nsga3);
    }

    #[test]
    fn test_categorical_inherits_from_population() {
        let nsga2 = sampler(SamplerKind::Nsga2);
        let choices = vec![ParamValue::Text("a".into()), ParamValue::Text("b".into())];
        let mut history = Vec::new();
        for number in 0..20 {
            let mut params = ParamAssignment::new();
            params.insert("cc".into(), ParamValue::Text("b".into()));
            history.push(FrozenTrial {
                number,
                state: TrialState::Complete,
                params,
                values: Some(vec![number as f64]),
                origin_study: "s".into(),
                origin_number: number,
            });
        }
        let index = nsga2.suggest_categorical("cc", &choices, &history, &[Direction::Minimize]);
        assert!(index < choices.len());
    }
}
