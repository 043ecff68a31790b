//! Guardrail checking: hard limits that invalidate a trial when exceeded.

use crate::config::Guardrail;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub name: String,
    pub hard_limit: f64,
    pub actual: f64,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Guardrail '{}' violated: {} > {}",
            self.name, self.actual, self.hard_limit
        )
    }
}

/// Compare collected metrics against hard limits.
///
/// Guardrails are binary constraints, not objectives: the direction is
/// fixed to "must not exceed". Missing metrics and non-numeric limits skip
/// the check with a warning rather than failing the trial.
pub fn check_guardrails(
    guardrails: &[Guardrail],
    metrics: &BTreeMap<String, f64>,
) -> (bool, Vec<Violation>) {
    let mut violations = Vec::new();

    for guardrail in guardrails {
        let Some(raw_limit) = &guardrail.hard_limit else {
            tracing::warn!(guardrail = %guardrail.name, "missing hard_limit, skipping");
            continue;
        };
        let Some(hard_limit) = raw_limit.as_f64() else {
            tracing::warn!(guardrail = %guardrail.name, "non-numeric hard_limit, skipping");
            continue;
        };
        let Some(actual) = metrics.get(&guardrail.name).copied() else {
            tracing::warn!(guardrail = %guardrail.name, "metric not found, skipping check");
            continue;
        };

        if actual > hard_limit {
            let violation = Violation {
                name: guardrail.name.clone(),
                hard_limit,
                actual,
            };
            tracing::error!(%violation, "guardrail violated");
            violations.push(violation);
        } else {
            tracing::debug!(guardrail = %guardrail.name, actual, hard_limit, "guardrail ok");
        }
    }

    (!violations.is_empty(), violations)
}
