//! Study handle: ask/tell plus parameter suggestion on top of the archive.

use crate::archive::{Archive, FrozenTrial, TrialState};
use crate::config::Direction;
use crate::error::{Error, Result};
use crate::params::{ParamAssignment, ParamValue};
use crate::sampler::{NumericRange, Sampler};

/// Deterministic study name: sampler-suffixed only when the breeder runs
/// parallel workers (one study per sampler kind).
pub fn study_name(breeder_uuid: &str, sampler: &str, parallel: u32) -> String {
    if parallel > 1 {
        format!("{breeder_uuid}_{sampler}_study")
    } else {
        format!("{breeder_uuid}_study")
    }
}

/// An open trial being populated by the suggester. Consumed by `tell_*`.
#[derive(Debug)]
pub struct Trial {
    row_id: i64,
    pub number: u64,
    pub params: ParamAssignment,
}

pub struct Study {
    archive: Archive,
    id: i64,
    name: String,
    directions: Vec<Direction>,
    sampler: Box<dyn Sampler>,
}

impl Study {
    /// Open the study by name, creating it when absent. Existing trials are
    /// retained either way; the sampler always lives in-process.
    pub fn load_or_create(
        mut archive: Archive,
        name: &str,
        directions: &[Direction],
        sampler: Box<dyn Sampler>,
    ) -> Result<Self> {
        let record = archive.create_or_load_study(name, directions)?;
        let existing = archive.count_trials(record.id)?;
        tracing::info!(study = name, trials = existing, "study opened");
        Ok(Self {
            archive,
            id: record.id,
            name: record.name,
            directions: record.directions,
            sampler,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directions(&self) -> &[Direction] {
        &self.directions
    }

    pub fn sampler_kind(&self) -> crate::sampler::SamplerKind {
        self.sampler.kind()
    }

    pub fn ask(&mut self) -> Result<Trial> {
        let (row_id, number) = self.archive.begin_trial(self.id, &self.name)?;
        Ok(Trial {
            row_id,
            number,
            params: ParamAssignment::new(),
        })
    }

    pub fn tell_complete(&mut self, trial: Trial, values: Vec<f64>) -> Result<FrozenTrial> {
        self.archive
            .finish_trial(trial.row_id, &trial.params, &values)?;
        Ok(FrozenTrial {
            number: trial.number,
            state: TrialState::Complete,
            params: trial.params,
            values: Some(values),
            origin_study: self.name.clone(),
            origin_number: trial.number,
        })
    }

    pub fn tell_failed(&mut self, trial: Trial) -> Result<()> {
        self.archive.fail_trial(trial.row_id, &trial.params)
    }

    pub fn suggest_int(
        &mut self,
        trial: &mut Trial,
        name: &str,
        lower: i64,
        upper: i64,
        step: i64,
    ) -> Result<i64> {
        let range = NumericRange {
            lower: lower as f64,
            upper: upper as f64,
            step: step.max(1) as f64,
            integral: true,
        };
        let history = self.archive.completed_trials(self.id)?;
        let raw = self
            .sampler
            .suggest_numeric(name, &range, &history, &self.directions);
        let value = range.quantize(raw) as i64;
        trial.params.insert(name.to_string(), ParamValue::Int(value));
        Ok(value)
    }

    pub fn suggest_float(
        &mut self,
        trial: &mut Trial,
        name: &str,
        lower: f64,
        upper: f64,
        step: f64,
    ) -> Result<f64> {
        let range = NumericRange {
            lower,
            upper,
            step,
            integral: false,
        };
        let history = self.archive.completed_trials(self.id)?;
        let raw = self
            .sampler
            .suggest_numeric(name, &range, &history, &self.directions);
        let value = range.quantize(raw);
        trial
            .params
            .insert(name.to_string(), ParamValue::Float(value));
        Ok(value)
    }

    pub fn suggest_categorical(
        &mut self,
        trial: &mut Trial,
        name: &str,
        choices: &[ParamValue],
    ) -> Result<ParamValue> {
        if choices.is_empty() {
            return Err(Error::suggestion(name, "empty categorical value list"));
        }
        let history = self.archive.completed_trials(self.id)?;
        let index = self
            .sampler
            .suggest_categorical(name, choices, &history, &self.directions);
        let value = choices[index.min(choices.len() - 1)].clone();
        trial.params.insert(name.to_string(), value.clone());
        Ok(value)
    }

    pub fn n_trials(&self) -> Result<u64> {
        self.archive.count_trials(self.id)
    }

    pub fn trials(&self) -> Result<Vec<FrozenTrial>> {
        self.archive.trials(self.id)
    }

    pub fn completed_trials(&self) -> Result<Vec<FrozenTrial>> {
        self.archive.completed_trials(self.id)
    }

    /// First trial of the non-dominated front (by trial number). For a
    /// single objective this is simply the best completed trial.
    pub fn best_trial(&self) -> Result<Option<FrozenTrial>> {
        let completed = self.archive.completed_trials(self.id)?;
        let best = completed
            .iter()
            .filter(|candidate| {
                let Some(candidate_values) = candidate.values.as_deref() else {
                    return false;
                };
                !completed.iter().any(|other| {
                    other.number != candidate.number
                        && other
                            .values
                            .as_deref()
                            .is_some_and(|other_values| {
                                dominates(other_values, candidate_values, &self.directions)
                            })
                })
            })
            .min_by_key(|trial| trial.number)
            .cloned();
        Ok(best)
    }

    pub fn set_user_attr(&mut self, key: &str, value: &str) -> Result<()> {
        self.archive.set_user_attr(self.id, key, value)
    }

    pub fn get_user_attr(&self, key: &str) -> Result<Option<String>> {
        self.archive.get_user_attr(self.id, key)
    }

    /// Every study name in the same storage, including this one.
    pub fn all_study_names(&self) -> Result<Vec<String>> {
        self.archive.all_study_names()
    }

    /// Copy a frozen trial into a peer study of the same storage. Returns
    /// false when the peer already holds this trial.
    pub fn add_trial_to(&mut self, peer_name: &str, trial: &FrozenTrial) -> Result<bool> {
        let peer = self
            .archive
            .load_study(peer_name)?
            .ok_or_else(|| Error::StudyNotFound(peer_name.to_string()))?;
        self.archive.add_trial(peer.id, trial)
    }
}

/// Pareto dominance under the study's objective directions.
fn dominates(a: &[f64], b: &[f64], directions: &[Direction]) -> bool {
    let mut strictly_better = false;
    for ((&left, &right), direction) in a.iter().zip(b).zip(directions) {
        let (better, worse) = match direction {
            Direction::Minimize => (left < right, left > right),
            Direction::Maximize => (left > right, left < right),
        };
        if worse {
            return false;
        }
        if better {
            strictly_better = true;
        }
    }
    strictly_better
}
