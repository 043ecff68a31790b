//! Preflight validation.
//!
//! Runs synchronously in the controller before any worker starts, so every
//! problem in the config must surface in one pass; the validator aggregates
//! errors instead of stopping at the first.

use crate::config::{BreederConfig, Constraint, ParamMap};
use crate::registry::{self, Category, ParamKind};
use serde::Serialize;

#[derive(Debug, Default, Serialize)]
pub struct PreflightReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PreflightReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Joined error message in the controller's reporting format.
    pub fn error_message(&self) -> String {
        let mut message = String::from("Preflight validation failed:");
        for error in &self.errors {
            message.push_str("\n  - ");
            message.push_str(error);
        }
        message
    }

    pub fn into_result(self) -> crate::Result<Vec<String>> {
        if self.is_success() {
            Ok(self.warnings)
        } else {
            Err(crate::Error::Preflight(self.error_message()))
        }
    }
}

/// Validate a breeder configuration against the parameter registry.
///
/// `config.meta.strict_validation` overrides the `strict` argument when set.
/// Strict mode treats unknown parameters as errors; permissive mode warns
/// and keeps the structural checks.
pub fn validate(config: &BreederConfig, strict: bool) -> PreflightReport {
    let strict = config.meta.strict_validation.unwrap_or(strict);
    let mut report = PreflightReport::default();

    check_metric_names(config, &mut report);

    let flat = [
        (Category::Sysctl, "sysctl", &config.settings.sysctl),
        (Category::Sysfs, "sysfs", &config.settings.sysfs),
        (Category::Cpufreq, "cpufreq", &config.settings.cpufreq),
    ];
    for (category, category_name, params) in flat {
        check_category(category, category_name, params, strict, &mut report);
    }

    for (interface, options) in &config.settings.ethtool {
        let prefix = format!("ethtool.{interface}");
        check_category(Category::Ethtool, &prefix, options, strict, &mut report);
    }

    report
}

/// Objective and guardrail names key the reconnaissance metrics map, so a
/// collision would silently merge two metrics.
fn check_metric_names(config: &BreederConfig, report: &mut PreflightReport) {
    if config.objectives.is_empty() {
        report
            .errors
            .push("objectives: at least one objective is required".to_string());
    }

    let mut seen = std::collections::HashSet::new();
    let names = config
        .objectives
        .iter()
        .map(|objective| &objective.name)
        .chain(config.guardrails.iter().map(|guardrail| &guardrail.name));
    for name in names {
        if !seen.insert(name.clone()) {
            report.errors.push(format!(
                "metric name '{name}' used by more than one objective/guardrail"
            ));
        }
    }
}

fn check_category(
    category: Category,
    prefix: &str,
    params: &ParamMap,
    strict: bool,
    report: &mut PreflightReport,
) {
    for (param_name, spec) in params {
        let location = format!("settings.{prefix}.{param_name}");

        let meta = if category == Category::Ethtool {
            registry::lookup_ethtool(param_name)
        } else {
            registry::lookup(param_name)
        };

        let meta = match meta {
            Some(meta) => Some(meta),
            None if strict => {
                report.errors.push(format!(
                    "{location}: unsupported parameter. Supported {category} parameters: {}",
                    registry::supported_names(category).join(", ")
                ));
                continue;
            }
            None => {
                report.warnings.push(format!(
                    "{location}: not in parameter registry, structural checks only"
                ));
                None
            }
        };

        if spec.constraints.is_empty() {
            report.errors.push(format!("{location}: missing 'constraints'"));
            continue;
        }

        for constraint in &spec.constraints {
            if matches!(constraint, Constraint::Malformed(_)) {
                report.errors.push(format!(
                    "{location}: constraint must have either 'values' (categorical) \
                     or 'step/lower/upper' (numeric range)"
                ));
            }
        }

        let Some(meta) = meta else { continue };

        match meta.kind {
            ParamKind::Categorical => {
                let has_values = spec
                    .constraints
                    .iter()
                    .any(|constraint| matches!(constraint, Constraint::Values { .. }));
                if !has_values {
                    report.errors.push(format!(
                        "{location}: parameter is categorical but constraints don't have 'values'"
                    ));
                }
            }
            ParamKind::Int | ParamKind::Float => {
                let has_range = spec
                    .constraints
                    .iter()
                    .any(|constraint| matches!(constraint, Constraint::Range { .. }));
                if !has_range {
                    let kind = if meta.kind == ParamKind::Int { "int" } else { "float" };
                    report.errors.push(format!(
                        "{location}: parameter is {kind} but constraints don't have step/lower/upper"
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreederConfig;

    fn config_with_settings(settings: serde_json::Value) -> BreederConfig {
        BreederConfig::from_value(serde_json::json!({
            "breeder": {"name": "linux_performance", "uuid": "abc-123"},
            "creation_ts": "2025-06-01T12:00:00Z",
            "objectives": [
                {
                    "name": "latency",
                    "direction": "minimize",
                    "reconnaissance": {"service": "prometheus", "query": "scalar(x)"}
                }
            ],
            "settings": settings
        }))
        .unwrap()
    }

    // ==================== SUCCESS PATHS ====================

    #[test]
    fn test_valid_numeric_and_categorical_params() {
        let config = config_with_settings(serde_json::json!({
            "sysctl": {
                "net.core.netdev_budget": {
                    "constraints": [{"lower": 100, "upper": 800, "step": 50}]
                },
                "net.ipv4.tcp_congestion_control": {
                    "constraints": [{"values": ["cubic", "bbr"]}]
                }
            },
            "cpufreq": {
                "min_freq_ghz": {
                    "constraints": [{"lower": 0.8, "upper": 2.4, "step": 0.1}]
                }
            }
        }));

        let report = validate(&config, true);
        assert!(report.is_success(), "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_ethtool_nesting_validated_per_interface() {
        let config = config_with_settings(serde_json::json!({
            "ethtool": {
                "eth0": {
                    "tso": {"constraints": [{"values": ["on", "off"]}]},
                    "rx_ring": {"constraints": [{"lower": 256, "upper": 4096, "step": 256}]}
                }
            }
        }));

        let report = validate(&config, true);
        assert!(report.is_success(), "errors: {:?}", report.errors);
    }

    #[test]
    fn test_stateless_revalidation() {
        let config = config_with_settings(serde_json::json!({
            "sysctl": {
                "vm.swappiness": {"constraints": [{"lower": 0, "upper": 100, "step": 10}]}
            }
        }));

        assert!(validate(&config, true).is_success());
        assert!(validate(&config, true).is_success());
    }

    // ==================== ERROR AGGREGATION ====================

    #[test]
    fn test_all_errors_collected_in_one_pass() {
        let config = config_with_settings(serde_json::json!({
            "sysctl": {
                "net.made.up": {"constraints": [{"lower": 1, "upper": 2, "step": 1}]},
                "net.ipv4.tcp_congestion_control": {
                    "constraints": [{"lower": 1, "upper": 2, "step": 1}]
                },
                "net.core.netdev_budget": {}
            }
        }));

        let report = validate(&config, true);
        assert_eq!(report.errors.len(), 3);
        assert!(report.error_message().contains("net.made.up"));
        assert!(report.error_message().contains("categorical"));
        assert!(report.error_message().contains("missing 'constraints'"));
    }

    #[test]
    fn test_kind_shape_mismatch_numeric() {
        let config = config_with_settings(serde_json::json!({
            "sysctl": {
                "net.core.netdev_budget": {"constraints": [{"values": [100, 200]}]}
            }
        }));

        let report = validate(&config, true);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("is int"));
    }

    #[test]
    fn test_malformed_constraint_reported() {
        let config = config_with_settings(serde_json::json!({
            "sysctl": {
                "vm.swappiness": {"constraints": [{"bogus": 1}]}
            }
        }));

        let report = validate(&config, true);
        assert!(report
            .errors
            .iter()
            .any(|error| error.contains("either 'values'")));
    }

    #[test]
    fn test_duplicate_metric_names_rejected() {
        let mut value = serde_json::json!({
            "breeder": {"name": "b", "uuid": "u-1"},
            "creation_ts": "2025-06-01T12:00:00Z",
            "objectives": [
                {
                    "name": "latency",
                    "direction": "minimize",
                    "reconnaissance": {"service": "prometheus", "query": "q"}
                }
            ],
            "guardrails": [
                {"name": "latency", "hard_limit": 10.0}
            ]
        });
        let config = BreederConfig::from_value(value.take()).unwrap();

        let report = validate(&config, true);
        assert!(report
            .errors
            .iter()
            .any(|error| error.contains("more than one")));
    }

    // ==================== STRICT VS PERMISSIVE ====================

    #[test]
    fn test_unknown_param_permissive_warns() {
        let config = config_with_settings(serde_json::json!({
            "sysctl": {
                "net.experimental.knob": {
                    "constraints": [{"lower": 1, "upper": 10, "step": 1}]
                }
            }
        }));

        let report = validate(&config, false);
        assert!(report.is_success());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_meta_overrides_caller_flag() {
        let mut config = config_with_settings(serde_json::json!({
            "sysctl": {
                "net.experimental.knob": {
                    "constraints": [{"lower": 1, "upper": 10, "step": 1}]
                }
            }
        }));
        config.meta.strict_validation = Some(true);

        // Caller asks for permissive, config insists on strict.
        let report = validate(&config, false);
        assert!(!report.is_success());
    }

    #[test]
    fn test_permissive_still_checks_structure() {
        let config = config_with_settings(serde_json::json!({
            "sysfs": {
                "totally_new_knob": {}
            }
        }));

        let report = validate(&config, false);
        assert!(!report.is_success());
        assert!(report.errors[0].contains("missing 'constraints'"));
    }
}
