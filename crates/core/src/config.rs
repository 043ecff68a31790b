//! Breeder configuration model.
//!
//! The controller hands every worker one immutable configuration object
//! (YAML or JSON). The model below mirrors that wire shape; semantic checks
//! beyond what serde can express live in [`crate::preflight`].

use crate::error::{Error, Result};
use crate::params::ParamValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreederConfig {
    pub breeder: BreederMeta,
    /// Job creation timestamp, RFC-3339. Anchor for the wall-clock budget.
    pub creation_ts: DateTime<Utc>,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub objectives: Vec<Objective>,
    #[serde(default)]
    pub guardrails: Vec<Guardrail>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub cooperation: Cooperation,
    #[serde(default)]
    pub effectuation: Effectuation,
    #[serde(default)]
    pub rollback_strategies: HashMap<String, RollbackStrategy>,
    #[serde(default)]
    pub meta: Meta,
    /// Parallel run slot this worker occupies, assigned by the controller.
    #[serde(default)]
    pub run_id: u32,
    /// Index into `effectuation.targets` this worker drives.
    #[serde(default)]
    pub target_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreederMeta {
    pub name: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    /// Overrides the caller's strict flag when set.
    #[serde(default)]
    pub strict_validation: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_parallel")]
    pub parallel: u32,
    #[serde(default)]
    pub completion_criteria: CompletionCriteria,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            completion_criteria: CompletionCriteria::default(),
        }
    }
}

fn default_parallel() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionCriteria {
    #[serde(default)]
    pub iterations: Iterations,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub quality_achieved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iterations {
    #[serde(default = "default_min_iterations")]
    pub min: u64,
    #[serde(default = "default_max_iterations")]
    pub max: u64,
}

impl Default for Iterations {
    fn default() -> Self {
        Self {
            min: default_min_iterations(),
            max: default_max_iterations(),
        }
    }
}

fn default_min_iterations() -> u64 {
    10
}

fn default_max_iterations() -> u64 {
    1000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timing {
    /// Wall-clock budget relative to `creation_ts`, format `{N}[dhm]`.
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Minimize,
    Maximize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
    pub direction: Direction,
    #[serde(alias = "reconaissance")]
    pub reconnaissance: ReconSpec,
    #[serde(default)]
    pub quality_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guardrail {
    pub name: String,
    /// Hard upper limit. Kept loosely typed: non-numeric limits are skipped
    /// with a warning at check time instead of rejecting the whole config.
    #[serde(default)]
    pub hard_limit: Option<serde_json::Value>,
    #[serde(default, alias = "reconaissance")]
    pub reconnaissance: Option<ReconSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconSpec {
    pub service: String,
    pub query: String,
    #[serde(default = "default_samples")]
    pub samples: u32,
    /// Seconds between consecutive samples.
    #[serde(default)]
    pub interval: u64,
    #[serde(default = "default_stabilization")]
    pub stabilization_seconds: u64,
    #[serde(default)]
    pub aggregation: Aggregation,
}

fn default_samples() -> u32 {
    1
}

fn default_stabilization() -> u64 {
    120
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Median,
    Mean,
    Min,
    Max,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub sysctl: ParamMap,
    #[serde(default)]
    pub sysfs: ParamMap,
    #[serde(default)]
    pub cpufreq: ParamMap,
    /// Nested one level deeper: interface name → option → spec.
    #[serde(default)]
    pub ethtool: BTreeMap<String, ParamMap>,
}

pub type ParamMap = BTreeMap<String, ParameterSpec>;

impl Settings {
    /// The flat (non-ethtool) categories in declaration order.
    pub fn flat_categories(&self) -> [(&'static str, &ParamMap); 3] {
        [
            ("sysctl", &self.sysctl),
            ("sysfs", &self.sysfs),
            ("cpufreq", &self.cpufreq),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Non-empty in a valid config; preflight reports the empty case so all
    /// parameter errors surface together instead of failing at parse time.
    #[serde(default, deserialize_with = "constraints_list")]
    pub constraints: Vec<Constraint>,
}

/// A single constraint entry: either enumerated values or a stepped range.
///
/// Anything else deserializes as `Malformed` and is reported by preflight
/// (or fails the trial if it reaches the suggester).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Constraint {
    Values { values: Vec<ParamValue> },
    Range {
        lower: serde_json::Number,
        upper: serde_json::Number,
        step: serde_json::Number,
    },
    Malformed(serde_json::Value),
}

impl Constraint {
    /// A range is integral when lower, upper and step are all integers; the
    /// suggester emits `Int` values for integral ranges and `Float` otherwise.
    pub fn is_integral(&self) -> bool {
        match self {
            Self::Range { lower, upper, step } => {
                lower.is_i64() && upper.is_i64() && step.is_i64()
            }
            _ => false,
        }
    }
}

/// Accept both a list of constraints and a bare `{values: [...]}` object,
/// normalizing the latter to a single-element list.
fn constraints_list<'de, D>(deserializer: D) -> std::result::Result<Vec<Constraint>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<Constraint>),
        One(Constraint),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(list) => list,
        OneOrMany::One(single) => vec![single],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareStrategy {
    Probabilistic,
    Best,
    Worst,
    Extremes,
}

impl ShareStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Probabilistic => "probabilistic",
            Self::Best => "best",
            Self::Worst => "worst",
            Self::Extremes => "extremes",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cooperation {
    #[serde(default)]
    pub active: bool,
    #[serde(default = "default_share_strategy")]
    pub share_strategy: ShareStrategy,
    #[serde(default = "default_probability")]
    pub probability: f64,
    #[serde(default = "default_percentile")]
    pub top_percentile: f64,
    #[serde(default = "default_percentile")]
    pub bottom_percentile: f64,
    #[serde(default = "default_min_trials")]
    pub min_trials_for_filtering: usize,
}

impl Default for Cooperation {
    fn default() -> Self {
        Self {
            active: false,
            share_strategy: default_share_strategy(),
            probability: default_probability(),
            top_percentile: default_percentile(),
            bottom_percentile: default_percentile(),
            min_trials_for_filtering: default_min_trials(),
        }
    }
}

fn default_share_strategy() -> ShareStrategy {
    ShareStrategy::Probabilistic
}

fn default_probability() -> f64 {
    0.8
}

fn default_percentile() -> f64 {
    0.2
}

fn default_min_trials() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Effectuation {
    #[serde(default)]
    pub targets: Vec<Target>,
    /// Workflow path of the remote-apply flow.
    #[serde(default = "default_flow")]
    pub flow: String,
}

impl Default for Effectuation {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            flow: default_flow(),
        }
    }
}

fn default_flow() -> String {
    "f/breeder/linux_performance/effectuation_flow".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: u32,
    pub address: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub ssh_key_variable_path: Option<String>,
    #[serde(default)]
    pub rollback: TargetRollback,
}

fn default_username() -> String {
    "root".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRollback {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rollback_strategy")]
    pub strategy: String,
}

impl Default for TargetRollback {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: default_rollback_strategy(),
        }
    }
}

fn default_rollback_strategy() -> String {
    "standard".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStrategy {
    /// Contiguous failed trials before a rollback is scheduled.
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub target_state: RollbackTarget,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub after: AfterPolicy,
}

impl Default for RollbackStrategy {
    fn default() -> Self {
        Self {
            consecutive_failures: default_consecutive_failures(),
            target_state: RollbackTarget::default(),
            on_failure: OnFailure::default(),
            after: AfterPolicy::default(),
        }
    }
}

fn default_consecutive_failures() -> u32 {
    3
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackTarget {
    #[default]
    Previous,
    Best,
    Baseline,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    #[default]
    Stop,
    Continue,
    SkipTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AfterPolicy {
    #[serde(default)]
    pub action: AfterAction,
    /// Pause duration in seconds, only meaningful for `action: pause`.
    #[serde(default = "default_pause_duration")]
    pub duration: u64,
}

impl Default for AfterPolicy {
    fn default() -> Self {
        Self {
            action: AfterAction::default(),
            duration: default_pause_duration(),
        }
    }
}

fn default_pause_duration() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfterAction {
    Pause,
    #[default]
    Continue,
    Stop,
}

impl BreederConfig {
    /// Load from a YAML (`.yaml`/`.yml`) or JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let value: serde_json::Value = if is_yaml {
            serde_yaml::from_str(&contents)?
        } else {
            serde_json::from_str(&contents)?
        };
        Self::from_value(value)
    }

    /// Deserialize from an already-parsed document.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        warn_legacy_keys(&value, "");
        let config: Self = serde_json::from_value(value)?;
        if config.run.parallel < 1 {
            return Err(Error::Config("run.parallel must be >= 1".into()));
        }
        Ok(config)
    }

    /// `{breeder.name}_worker_{breeder.uuid}`, stable across restarts.
    pub fn worker_id(&self) -> String {
        format!("{}_worker_{}", self.breeder.name, self.breeder.uuid)
    }

    /// Archive database name; dashes are flattened for storage compatibility.
    pub fn archive_db_name(&self) -> String {
        format!("breeder_{}", self.breeder.uuid.replace('-', "_"))
    }

    /// The target this worker drives. Falls back to the first configured
    /// target when `target_id` is out of range.
    pub fn worker_target(&self) -> Option<&Target> {
        let targets = &self.effectuation.targets;
        match targets.get(self.target_id as usize) {
            Some(target) => Some(target),
            None => {
                if !targets.is_empty() {
                    tracing::warn!(
                        target_id = self.target_id,
                        "invalid target_id, using first target"
                    );
                }
                targets.first()
            }
        }
    }

    /// Resolve the rollback strategy block configured for a target.
    pub fn rollback_strategy(&self, target: &Target) -> RollbackStrategy {
        self.rollback_strategies
            .get(&target.rollback.strategy)
            .cloned()
            .unwrap_or_default()
    }
}

/// Wall-clock budget strings look like `7d`, `24h`, `60m`.
///
/// Invalid strings disable the budget (with a warning) rather than failing
/// the run, matching how the controller treats them.
pub fn parse_time_budget(spec: &str) -> Option<Duration> {
    let spec = spec.trim();
    if spec.len() < 2 {
        tracing::warn!(spec, "invalid time budget format");
        return None;
    }
    let (digits, unit) = spec.split_at(spec.len() - 1);
    let value: u64 = match digits.parse() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(spec, "invalid time budget format");
            return None;
        }
    };
    let unit_seconds = match unit {
        "d" => 86_400,
        "h" => 3_600,
        "m" => 60,
        _ => {
            tracing::warn!(spec, "invalid time budget unit");
            return None;
        }
    };
    Some(Duration::from_secs(value * unit_seconds))
}

/// Older configs spell the reconnaissance block `reconaissance`. serde
/// aliases keep them loading; this pass surfaces the deprecation.
fn warn_legacy_keys(value: &serde_json::Value, path: &str) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                if key == "reconaissance" {
                    tracing::warn!(
                        key = %child_path,
                        "deprecated spelling 'reconaissance', use 'reconnaissance'"
                    );
                }
                warn_legacy_keys(child, &child_path);
            }
        }
        serde_json::Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                warn_legacy_keys(child, &format!("{path}[{index}]"));
            }
        }
        _ => {}
    }
}
