//! Reconnaissance: turn monitoring queries into trial scores.
//!
//! For each metric the sampler waits out a stabilization interval, takes N
//! scalar samples with retry, and reduces them with the configured
//! aggregator. A metric that cannot be measured scores `+inf` so the trial
//! is penalized without aborting the remaining metrics.

use crate::config::{Aggregation, BreederConfig, ReconSpec};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::env;
use std::thread;
use std::time::Duration;

/// A query against the monitoring backend, routed by the `service` tag.
pub trait MetricSource: Send {
    /// Execute a scalar query. `Ok(None)` means the backend answered with
    /// NaN or a missing value.
    fn query_scalar(&self, query: &str) -> std::result::Result<Option<f64>, QueryError>;
}

/// Query failures split by whether a retry can help.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// Connection refused, timeout, or backend-side error.
    #[error("retryable query failure: {0}")]
    Retryable(String),
    /// Malformed query or response; retrying would repeat the failure.
    #[error("query failure: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(5),
        }
    }
}

/// Prometheus-compatible HTTP API source.
pub struct PrometheusSource {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl PrometheusSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    pub fn from_env() -> Result<Self> {
        let url =
            env::var("GODON_PROMETHEUS_URL").unwrap_or_else(|_| "http://prometheus:9090".into());
        Self::new(url)
    }
}

impl MetricSource for PrometheusSource {
    fn query_scalar(&self, query: &str) -> std::result::Result<Option<f64>, QueryError> {
        let response = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", query)])
            .send()
            .map_err(|error| {
                if error.is_timeout() || error.is_connect() {
                    QueryError::Retryable(error.to_string())
                } else {
                    QueryError::Fatal(error.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(QueryError::Retryable(format!("backend returned {status}")));
        }
        if !status.is_success() {
            return Err(QueryError::Fatal(format!("backend returned {status}")));
        }

        let body: serde_json::Value = response
            .json()
            .map_err(|error| QueryError::Fatal(error.to_string()))?;
        // The HTTP API wraps the payload in {status, data}; a bare payload is
        // accepted too for parity with client-library shaped responses.
        let data = body.get("data").unwrap_or(&body);

        let result_type = data.get("resultType").and_then(|v| v.as_str());
        if result_type != Some("scalar") {
            return Err(QueryError::Fatal(format!(
                "query must return scalar result, got: {}",
                result_type.unwrap_or("<missing>")
            )));
        }

        let result = data
            .get("result")
            .and_then(|v| v.as_array())
            .ok_or_else(|| QueryError::Fatal("missing scalar result".into()))?;
        if result.len() < 2 {
            return Err(QueryError::Fatal(format!(
                "invalid scalar result format: {result:?}"
            )));
        }

        extract_scalar_value(&result[1])
    }
}

/// Second element of a `(ts, value)` scalar pair. `"NaN"` and null become
/// `None`.
fn extract_scalar_value(raw: &serde_json::Value) -> std::result::Result<Option<f64>, QueryError> {
    match raw {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(number) => Ok(number.as_f64().filter(|v| !v.is_nan())),
        serde_json::Value::String(text) if text == "NaN" => Ok(None),
        serde_json::Value::String(text) => text
            .parse::<f64>()
            .map(Some)
            .map_err(|_| QueryError::Fatal(format!("non-numeric scalar value: {text:?}"))),
        other => Err(QueryError::Fatal(format!("unexpected scalar value: {other}"))),
    }
}

/// Exponential backoff around a single query: base delay doubling per
/// attempt, fatal errors surface immediately.
pub fn query_with_retry(
    source: &dyn MetricSource,
    query: &str,
    policy: &RetryPolicy,
) -> Result<Option<f64>> {
    let mut delay = policy.initial_delay;
    let mut last_error = String::new();
    for attempt in 1..=policy.max_attempts {
        match source.query_scalar(query) {
            Ok(value) => return Ok(value),
            Err(QueryError::Fatal(reason)) => return Err(Error::Recon(reason)),
            Err(QueryError::Retryable(reason)) => {
                last_error = reason;
                if attempt < policy.max_attempts {
                    tracing::warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_secs = delay.as_secs_f64(),
                        error = %last_error,
                        "query failed, retrying"
                    );
                    thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
    }
    Err(Error::Recon(format!(
        "query failed after {} retries: {last_error}",
        policy.max_attempts
    )))
}

/// Reduce non-null samples with the configured aggregator; all-null sample
/// sets score `+inf`.
pub fn aggregate_samples(samples: &[Option<f64>], method: Aggregation) -> f64 {
    let mut valid: Vec<f64> = samples
        .iter()
        .flatten()
        .copied()
        .filter(|v| v.is_finite())
        .collect();
    if valid.is_empty() {
        return f64::INFINITY;
    }
    match method {
        Aggregation::Median => {
            valid.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = valid.len() / 2;
            if valid.len() % 2 == 1 {
                valid[mid]
            } else {
                (valid[mid - 1] + valid[mid]) / 2.0
            }
        }
        Aggregation::Mean => valid.iter().sum::<f64>() / valid.len() as f64,
        Aggregation::Min => valid.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregation::Max => valid.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}

/// Measure one metric end to end. Failures are logged and score `+inf`.
pub fn collect_metric(
    source: &dyn MetricSource,
    name: &str,
    spec: &ReconSpec,
    policy: &RetryPolicy,
) -> f64 {
    if spec.service != "prometheus" {
        tracing::error!(metric = name, service = %spec.service, "unsupported reconnaissance service");
        return f64::INFINITY;
    }

    if spec.stabilization_seconds > 0 {
        tracing::info!(
            metric = name,
            seconds = spec.stabilization_seconds,
            "waiting for stabilization"
        );
        thread::sleep(Duration::from_secs(spec.stabilization_seconds));
    }

    let samples = spec.samples.max(1);
    let mut collected: Vec<Option<f64>> = Vec::with_capacity(samples as usize);
    for index in 0..samples {
        match query_with_retry(source, &spec.query, policy) {
            Ok(value) => {
                tracing::debug!(metric = name, sample = index + 1, total = samples, ?value, "sample");
                collected.push(value);
            }
            Err(error) => {
                tracing::error!(metric = name, %error, "failed to gather metric");
                return f64::INFINITY;
            }
        }
        // No sleep after the final sample.
        if index + 1 < samples && spec.interval > 0 {
            thread::sleep(Duration::from_secs(spec.interval));
        }
    }

    let value = aggregate_samples(&collected, spec.aggregation);
    if value.is_infinite() {
        tracing::warn!(metric = name, "all samples returned NaN");
    } else {
        tracing::info!(metric = name, value, aggregation = ?spec.aggregation, "metric collected");
    }
    value
}

/// All reconnaissance-bearing metrics of a config: objectives first, then
/// guardrails that declare their own spec.
pub fn metric_specs(config: &BreederConfig) -> Vec<(&str, &ReconSpec)> {
    let mut specs: Vec<(&str, &ReconSpec)> = config
        .objectives
        .iter()
        .map(|objective| (objective.name.as_str(), &objective.reconnaissance))
        .collect();
    for guardrail in &config.guardrails {
        if let Some(spec) = &guardrail.reconnaissance {
            specs.push((guardrail.name.as_str(), spec));
        }
    }
    specs
}

/// Measure every metric; per-metric failures penalize only that metric.
pub fn collect_metrics(
    source: &dyn MetricSource,
    specs: &[(&str, &ReconSpec)],
    policy: &RetryPolicy,
) -> BTreeMap<String, f64> {
    let mut metrics = BTreeMap::new();
    for (name, spec) in specs {
        let value = collect_metric(source, name, spec, policy);
        metrics.insert((*name).to_string(), value);
    }
    tracing::info!(count = metrics.len(), "reconnaissance completed");
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // ==================== AGGREGATION ====================

    #[test]
    fn test_median_odd_and_even() {
        let odd = [Some(3.0), Some(1.0), Some(2.0)];
        assert_eq!(aggregate_samples(&odd, Aggregation::Median), 2.0);
        let even = [Some(1.0), Some(2.0), Some(3.0), Some(4.0)];
        assert_eq!(aggregate_samples(&even, Aggregation::Median), 2.5);
    }

    #[test]
    fn test_mean_min_max() {
        let samples = [Some(1.0), Some(2.0), Some(6.0)];
        assert_eq!(aggregate_samples(&samples, Aggregation::Mean), 3.0);
        assert_eq!(aggregate_samples(&samples, Aggregation::Min), 1.0);
        assert_eq!(aggregate_samples(&samples, Aggregation::Max), 6.0);
    }

    #[test]
    fn test_nulls_ignored_all_null_is_penalty() {
        let mixed = [None, Some(4.0), None];
        assert_eq!(aggregate_samples(&mixed, Aggregation::Median), 4.0);
        let all_null = [None, None];
        assert!(aggregate_samples(&all_null, Aggregation::Median).is_infinite());
    }

    #[test]
    fn test_infinite_samples_excluded() {
        let samples = [Some(f64::INFINITY), Some(2.0)];
        assert_eq!(aggregate_samples(&samples, Aggregation::Median), 2.0);
    }

    #[test]
    fn test_aggregation_deterministic() {
        let samples = [Some(5.0), Some(1.0), Some(3.0)];
        let first = aggregate_samples(&samples, Aggregation::Median);
        let second = aggregate_samples(&samples, Aggregation::Median);
        assert_eq!(first, second);
    }

    // ==================== SCALAR EXTRACTION ====================

    #[test]
    fn test_extract_scalar_variants() {
        assert_eq!(
            extract_scalar_value(&serde_json::json!("12.5")).unwrap(),
            Some(12.5)
        );
        assert_eq!(extract_scalar_value(&serde_json::json!("NaN")).unwrap(), None);
        assert_eq!(extract_scalar_value(&serde_json::Value::Null).unwrap(), None);
        assert!(extract_scalar_value(&serde_json::json!("bogus")).is_err());
    }

    // ==================== RETRY & HTTP ====================

    struct FlakySource {
        failures_before_success: usize,
        calls: Arc<AtomicUsize>,
    }

    impl MetricSource for FlakySource {
        fn query_scalar(&self, _query: &str) -> std::result::Result<Option<f64>, QueryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(QueryError::Retryable("connection refused".into()))
            } else {
                Ok(Some(10.0))
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_retry_recovers_from_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = FlakySource {
            failures_before_success: 2,
            calls: calls.clone(),
        };
        let value = query_with_retry(&source, "q", &fast_policy()).unwrap();
        assert_eq!(value, Some(10.0));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_exhaustion_errors() {
        let source = FlakySource {
            failures_before_success: 10,
            calls: Arc::new(AtomicUsize::new(0)),
        };
        assert!(query_with_retry(&source, "q", &fast_policy()).is_err());
    }

    struct FatalSource {
        calls: Arc<AtomicUsize>,
    }

    impl MetricSource for FatalSource {
        fn query_scalar(&self, _query: &str) -> std::result::Result<Option<f64>, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(QueryError::Fatal("query must return scalar result".into()))
        }
    }

    #[test]
    fn test_fatal_errors_do_not_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = FatalSource { calls: calls.clone() };
        assert!(query_with_retry(&source, "q", &fast_policy()).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn spawn_prometheus_stub(bodies: Vec<(u16, String)>) -> String {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = format!("http://{}", server.server_addr());
        std::thread::spawn(move || {
            for (status, body) in bodies {
                let Ok(request) = server.recv() else { return };
                let response = tiny_http::Response::from_string(body).with_status_code(status);
                let _ = request.respond(response);
            }
        });
        addr
    }

    fn scalar_body(value: &str) -> String {
        format!(
            r#"{{"status":"success","data":{{"resultType":"scalar","result":[1719246000.0,"{value}"]}}}}"#
        )
    }

    #[test]
    fn test_prometheus_source_scalar_roundtrip() {
        let addr = spawn_prometheus_stub(vec![(200, scalar_body("42.5"))]);
        let source = PrometheusSource::new(addr).unwrap();
        let value = source.query_scalar("scalar(avg(tcp_rtt))").unwrap();
        assert_eq!(value, Some(42.5));
    }

    #[test]
    fn test_prometheus_source_nan_is_none() {
        let addr = spawn_prometheus_stub(vec![(200, scalar_body("NaN"))]);
        let source = PrometheusSource::new(addr).unwrap();
        assert_eq!(source.query_scalar("q").unwrap(), None);
    }

    #[test]
    fn test_prometheus_source_vector_rejected_fatally() {
        let body = r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        let addr = spawn_prometheus_stub(vec![(200, body.to_string())]);
        let source = PrometheusSource::new(addr).unwrap();
        assert!(matches!(
            source.query_scalar("q"),
            Err(QueryError::Fatal(_))
        ));
    }

    #[test]
    fn test_prometheus_source_5xx_is_retryable() {
        let addr = spawn_prometheus_stub(vec![(500, "oops".to_string())]);
        let source = PrometheusSource::new(addr).unwrap();
        assert!(matches!(
            source.query_scalar("q"),
            Err(QueryError::Retryable(_))
        ));
    }

    // ==================== COLLECTION ====================

    fn recon_spec(samples: u32, aggregation: Aggregation) -> ReconSpec {
        ReconSpec {
            service: "prometheus".into(),
            query: "scalar(x)".into(),
            samples,
            interval: 0,
            stabilization_seconds: 0,
            aggregation,
        }
    }

    struct SequenceSource {
        values: Vec<Option<f64>>,
        calls: Arc<AtomicUsize>,
    }

    impl MetricSource for SequenceSource {
        fn query_scalar(&self, _query: &str) -> std::result::Result<Option<f64>, QueryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.values[call.min(self.values.len() - 1)])
        }
    }

    #[test]
    fn test_collect_metric_aggregates_samples() {
        let source = SequenceSource {
            values: vec![Some(10.0), Some(30.0), Some(20.0)],
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let value = collect_metric(&source, "latency", &recon_spec(3, Aggregation::Median), &fast_policy());
        assert_eq!(value, 20.0);
    }

    #[test]
    fn test_collect_metric_all_nan_penalized() {
        let source = SequenceSource {
            values: vec![None, None, None],
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let value = collect_metric(&source, "latency", &recon_spec(3, Aggregation::Median), &fast_policy());
        assert!(value.is_infinite());
    }

    #[test]
    fn test_collect_metric_unknown_service_penalized() {
        let source = SequenceSource {
            values: vec![Some(1.0)],
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let mut spec = recon_spec(1, Aggregation::Median);
        spec.service = "graphite".into();
        assert!(collect_metric(&source, "latency", &spec, &fast_policy()).is_infinite());
    }

    #[test]
    fn test_collect_metrics_isolates_failures() {
        let source = SequenceSource {
            values: vec![Some(5.0)],
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let good = recon_spec(1, Aggregation::Median);
        let mut bad = recon_spec(1, Aggregation::Median);
        bad.service = "unsupported".into();

        let specs = vec![("latency", &good), ("throughput", &bad)];
        let metrics = collect_metrics(&source, &specs, &fast_policy());

        assert_eq!(metrics["latency"], 5.0);
        assert!(metrics["throughput"].is_infinite());
    }
}
