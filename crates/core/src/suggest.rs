//! Parameter suggestion: translate configured constraints into one concrete
//! assignment per trial.

use crate::config::{BreederConfig, Constraint, ParameterSpec};
use crate::error::{Error, Result};
use crate::params::ParamAssignment;
use crate::study::{Study, Trial};

/// Walk the configured categories and suggest a value for every parameter.
///
/// Ethtool options are flattened to `{interface}_{option}` keys. Parameters
/// without constraints are skipped with a warning; a malformed constraint
/// fails the suggestion (and with it the trial).
pub fn suggest_params(
    study: &mut Study,
    trial: &mut Trial,
    config: &BreederConfig,
) -> Result<ParamAssignment> {
    for (category, params) in config.settings.flat_categories() {
        for (name, spec) in params {
            let location = format!("{category}.{name}");
            if spec.constraints.is_empty() {
                tracing::warn!(param = %location, "missing constraints, skipping");
                continue;
            }
            suggest_single(study, trial, name, spec, &location)?;
        }
    }

    for (interface, options) in &config.settings.ethtool {
        for (option, spec) in options {
            let location = format!("ethtool.{interface}.{option}");
            if spec.constraints.is_empty() {
                tracing::warn!(param = %location, "missing constraints, skipping");
                continue;
            }
            let key = format!("{interface}_{option}");
            suggest_single(study, trial, &key, spec, &location)?;
        }
    }

    Ok(trial.params.clone())
}

/// Suggest one value from the first constraint entry.
///
/// Broader disjoint ranges are sharded across workers upstream, so only the
/// first range is consulted here.
fn suggest_single(
    study: &mut Study,
    trial: &mut Trial,
    name: &str,
    spec: &ParameterSpec,
    location: &str,
) -> Result<()> {
    match &spec.constraints[0] {
        Constraint::Values { values } => {
            let value = study.suggest_categorical(trial, name, values)?;
            tracing::debug!(param = %location, %value, "suggested categorical");
        }
        constraint @ Constraint::Range { lower, upper, step } => {
            let integral = constraint.is_integral();
            let int_bounds = (lower.as_i64(), upper.as_i64(), step.as_i64());
            if let (true, (Some(lower), Some(upper), Some(step))) = (integral, int_bounds) {
                let value = study.suggest_int(trial, name, lower, upper, step)?;
                tracing::debug!(param = %location, value, "suggested int");
            } else {
                let (Some(lower), Some(upper), Some(step)) =
                    (lower.as_f64(), upper.as_f64(), step.as_f64())
                else {
                    return Err(Error::suggestion(location, "non-finite range bounds"));
                };
                let value = study.suggest_float(trial, name, lower, upper, step)?;
                tracing::debug!(param = %location, value, "suggested float");
            }
        }
        Constraint::Malformed(_) => {
            return Err(Error::suggestion(
                location,
                "constraint must have either 'values' (categorical) or 'step/lower/upper' (numeric range)",
            ));
        }
    }
    Ok(())
}
