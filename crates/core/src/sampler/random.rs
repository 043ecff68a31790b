//! Random and quasi-Monte-Carlo samplers.

use super::{call_rng, NumericRange, Sampler, SamplerKind, SamplerProfile};
use crate::archive::FrozenTrial;
use crate::config::Direction;
use crate::params::ParamValue;
use crate::rng::stable_hash;
use rand::Rng;

pub struct RandomSampler {
    seed: u64,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl Sampler for RandomSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::Random
    }

    fn profile(&self) -> &SamplerProfile {
        &SamplerProfile::Random
    }

    fn suggest_numeric(
        &self,
        name: &str,
        range: &NumericRange,
        history: &[FrozenTrial],
        _directions: &[Direction],
    ) -> f64 {
        let mut rng = call_rng(self.seed, name, history.len());
        rng.random_range(range.lower..=range.upper)
    }

    fn suggest_categorical(
        &self,
        name: &str,
        choices: &[ParamValue],
        history: &[FrozenTrial],
        _directions: &[Direction],
    ) -> usize {
        let mut rng = call_rng(self.seed, name, history.len());
        rng.random_range(0..choices.len())
    }
}

/// Low-discrepancy sampler: a scrambled van der Corput sequence per
/// parameter, indexed by history length, covers the range far more evenly
/// than independent uniforms at small trial counts.
pub struct QmcSampler {
    seed: u64,
}

impl QmcSampler {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn unit_sample(&self, name: &str, index: u64) -> f64 {
        let scramble = (stable_hash(name) ^ self.seed) as f64 / u64::MAX as f64;
        let sample = van_der_corput(index + 1) + scramble;
        sample.fract()
    }
}

/// Radical inverse of `index` in base 2.
fn van_der_corput(mut index: u64) -> f64 {
    let mut result = 0.0;
    let mut fraction = 0.5;
    while index > 0 {
        if index & 1 == 1 {
            result += fraction;
        }
        fraction *= 0.5;
        index >>= 1;
    }
    result
}

impl Sampler for QmcSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::Qmc
    }

    fn profile(&self) -> &SamplerProfile {
        &SamplerProfile::Qmc
    }

    fn suggest_numeric(
        &self,
        name: &str,
        range: &NumericRange,
        history: &[FrozenTrial],
        _directions: &[Direction],
    ) -> f64 {
        let unit = self.unit_sample(name, history.len() as u64);
        range.lower + unit * (range.upper - range.lower)
    }

    fn suggest_categorical(
        &self,
        name: &str,
        choices: &[ParamValue],
        history: &[FrozenTrial],
        _directions: &[Direction],
    ) -> usize {
        let unit = self.unit_sample(name, history.len() as u64);
        ((unit * choices.len() as f64) as usize).min(choices.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_van_der_corput_prefix() {
        assert_eq!(van_der_corput(1), 0.5);
        assert_eq!(van_der_corput(2), 0.25);
        assert_eq!(van_der_corput(3), 0.75);
        assert_eq!(van_der_corput(4), 0.125);
    }

    #[test]
    fn test_random_stays_in_bounds_and_is_deterministic() {
        let sampler = RandomSampler::new(5);
        let range = NumericRange { lower: 10.0, upper: 20.0, step: 0.0, integral: false };
        let a = sampler.suggest_numeric("p", &range, &[], &[Direction::Minimize]);
        let b = sampler.suggest_numeric("p", &range, &[], &[Direction::Minimize]);
        assert!((10.0..=20.0).contains(&a));
        assert_eq!(a, b);
    }

    #[test]
    fn test_qmc_spreads_over_range() {
        let sampler = QmcSampler::new(5);
        let range = NumericRange { lower: 0.0, upper: 1.0, step: 0.0, integral: false };

        // Successive history lengths must not collapse onto one point.
        let mut samples = Vec::new();
        for len in 0..8u64 {
            let history = make_history(len as usize);
            samples.push(sampler.suggest_numeric("p", &range, &history, &[Direction::Minimize]));
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
        samples.dedup_by(|a, b| (*a - *b).abs() < 1e-12);
        assert!(samples.len() >= 6);
    }

    #[test]
    fn test_qmc_categorical_in_bounds() {
        let sampler = QmcSampler::new(9);
        let choices = vec![
            ParamValue::Text("on".into()),
            ParamValue::Text("off".into()),
        ];
        for len in 0..6 {
            let history = make_history(len);
            let index = sampler.suggest_categorical("opt", &choices, &history, &[Direction::Minimize]);
            assert!(index < choices.len());
        }
    }

    fn make_history(len: usize) -> Vec<FrozenTrial> {
        use crate::archive::TrialState;
        use crate::params::ParamAssignment;
        (0..len)
            .map(|number| FrozenTrial {
                number: number as u64,
                state: TrialState::Complete,
                params: ParamAssignment::new(),
                values: Some(vec![number as f64]),
                origin_study: "s".into(),
                origin_number: number as u64,
            })
            .collect()
    }
}
