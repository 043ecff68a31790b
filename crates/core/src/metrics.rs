//! Worker metrics pushed to the telemetry gateway.
//!
//! Thin facade over a dedicated `prometheus` registry. Pushing is strictly
//! best-effort: a gateway outage must never disturb the worker loop.

use crate::error::Result;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::env;
use std::time::Duration;

const BASE_LABELS: [&str; 3] = ["breeder_id", "worker_id", "breeder_type"];

const DURATION_BUCKETS: [f64; 9] = [1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0];

pub struct MetricsClient {
    enabled: bool,
    gateway_url: String,
    job: String,
    client: reqwest::blocking::Client,
    registry: Registry,
    breeder_id: String,
    worker_id: String,
    breeder_type: String,

    worker_status: IntGaugeVec,
    trials_total: IntCounterVec,
    best_value: GaugeVec,
    last_trial_value: GaugeVec,
    total_trials: IntGaugeVec,
    trial_duration: HistogramVec,
    effectuation_total: IntCounterVec,
    guardrail_violations_total: IntCounterVec,
    rollbacks_total: IntCounterVec,
    trials_shared_total: IntCounterVec,
}

fn labels_with(extra: &str) -> Vec<&str> {
    let mut labels = BASE_LABELS.to_vec();
    labels.push(extra);
    labels
}

impl MetricsClient {
    pub fn new(breeder_id: &str, worker_id: &str, breeder_type: &str) -> Result<Self> {
        let enabled = env::var("PUSH_METRICS_ENABLED")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(true);
        let gateway_url =
            env::var("PUSH_GATEWAY_URL").unwrap_or_else(|_| "http://pushgateway:9091".into());
        if !enabled {
            tracing::info!("metrics pushing disabled via PUSH_METRICS_ENABLED=false");
        }

        let registry = Registry::new();

        let worker_status = IntGaugeVec::new(
            Opts::new("godon_breeder_worker_status", "Breeder worker running status"),
            &labels_with("status"),
        )?;
        let trials_total = IntCounterVec::new(
            Opts::new("godon_breeder_trials_total", "Total trials executed"),
            &labels_with("state"),
        )?;
        let best_value = GaugeVec::new(
            Opts::new("godon_breeder_best_value", "Best objective value achieved"),
            &BASE_LABELS,
        )?;
        let last_trial_value = GaugeVec::new(
            Opts::new("godon_breeder_last_trial_value", "Most recent trial value"),
            &BASE_LABELS,
        )?;
        let total_trials = IntGaugeVec::new(
            Opts::new("godon_breeder_total_trials", "Total number of trials in study"),
            &BASE_LABELS,
        )?;
        let trial_duration = HistogramVec::new(
            HistogramOpts::new("godon_breeder_trial_duration_seconds", "Trial execution time")
                .buckets(DURATION_BUCKETS.to_vec()),
            &BASE_LABELS,
        )?;
        let effectuation_total = IntCounterVec::new(
            Opts::new("godon_breeder_effectuation_total", "Effectuation executions"),
            &labels_with("status"),
        )?;
        let guardrail_violations_total = IntCounterVec::new(
            Opts::new(
                "godon_breeder_guardrail_violations_total",
                "Safety guardrail violations",
            ),
            &labels_with("guardrail_name"),
        )?;
        let rollbacks_total = IntCounterVec::new(
            Opts::new("godon_breeder_rollbacks_total", "Number of rollbacks performed"),
            &labels_with("status"),
        )?;
        let trials_shared_total = IntCounterVec::new(
            Opts::new(
                "godon_breeder_trials_shared_total",
                "Trials shared with other breeders",
            ),
            &labels_with("strategy"),
        )?;

        registry.register(Box::new(worker_status.clone()))?;
        registry.register(Box::new(trials_total.clone()))?;
        registry.register(Box::new(best_value.clone()))?;
        registry.register(Box::new(last_trial_value.clone()))?;
        registry.register(Box::new(total_trials.clone()))?;
        registry.register(Box::new(trial_duration.clone()))?;
        registry.register(Box::new(effectuation_total.clone()))?;
        registry.register(Box::new(guardrail_violations_total.clone()))?;
        registry.register(Box::new(rollbacks_total.clone()))?;
        registry.register(Box::new(trials_shared_total.clone()))?;

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            enabled,
            gateway_url,
            job: format!("breeder_{breeder_id}"),
            client,
            registry,
            breeder_id: breeder_id.to_string(),
            worker_id: worker_id.to_string(),
            breeder_type: breeder_type.to_string(),
            worker_status,
            trials_total,
            best_value,
            last_trial_value,
            total_trials,
            trial_duration,
            effectuation_total,
            guardrail_violations_total,
            rollbacks_total,
            trials_shared_total,
        })
    }

    fn base(&self) -> [&str; 3] {
        [&self.breeder_id, &self.worker_id, &self.breeder_type]
    }

    fn with_extra<'a>(&'a self, extra: &'a str) -> [&'a str; 4] {
        [&self.breeder_id, &self.worker_id, &self.breeder_type, extra]
    }

    pub fn mark_running(&self) {
        self.worker_status.with_label_values(&self.with_extra("running")).set(1);
        self.worker_status.with_label_values(&self.with_extra("stopped")).set(0);
    }

    pub fn mark_stopped(&self) {
        self.worker_status.with_label_values(&self.with_extra("running")).set(0);
        self.worker_status.with_label_values(&self.with_extra("stopped")).set(1);
    }

    /// Count a trial in `state`; a value also refreshes the last-value gauge.
    pub fn inc_trial(&self, state: &str, value: Option<f64>) {
        self.trials_total.with_label_values(&self.with_extra(state)).inc();
        if let Some(value) = value {
            self.last_trial_value.with_label_values(&self.base()).set(value);
        }
    }

    pub fn set_best_value(&self, value: f64) {
        self.best_value.with_label_values(&self.base()).set(value);
    }

    pub fn set_total_trials(&self, count: u64) {
        self.total_trials.with_label_values(&self.base()).set(count as i64);
    }

    pub fn observe_trial_duration(&self, seconds: f64) {
        self.trial_duration.with_label_values(&self.base()).observe(seconds);
    }

    pub fn inc_effectuation(&self, status: &str) {
        self.effectuation_total.with_label_values(&self.with_extra(status)).inc();
    }

    pub fn inc_guardrail_violation(&self, guardrail_name: &str) {
        self.guardrail_violations_total
            .with_label_values(&self.with_extra(guardrail_name))
            .inc();
    }

    pub fn inc_rollback(&self, status: &str) {
        self.rollbacks_total.with_label_values(&self.with_extra(status)).inc();
    }

    pub fn inc_trial_shared(&self, strategy: &str) {
        self.trials_shared_total.with_label_values(&self.with_extra(strategy)).inc();
    }

    /// Push the registry to the gateway; returns whether the push landed.
    pub fn push(&self) -> bool {
        if !self.enabled {
            return false;
        }
        self.push_to(&self.gateway_url)
    }

    fn push_to(&self, gateway_url: &str) -> bool {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(error) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(%error, "failed to encode metrics");
            return false;
        }

        let url = format!("{}/metrics/job/{}", gateway_url.trim_end_matches('/'), self.job);
        let result = self
            .client
            .put(&url)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(buffer)
            .send();
        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(gateway = gateway_url, "pushed metrics");
                true
            }
            Ok(response) => {
                tracing::warn!(gateway = gateway_url, status = %response.status(), "metrics push rejected");
                false
            }
            Err(error) => {
                tracing::warn!(gateway = gateway_url, %error, "failed to push metrics");
                false
            }
        }
    }

    #[cfg(test)]
    fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MetricsClient {
        MetricsClient::new("abc-123", "worker-1", "linux_performance").unwrap()
    }

    #[test]
    fn test_trial_counter_and_last_value() {
        let metrics = client();
        metrics.inc_trial("complete", Some(0.85));
        metrics.inc_trial("complete", Some(0.75));
        metrics.inc_trial("failed", None);

        let text = metrics.gather_text();
        assert!(text.contains("godon_breeder_trials_total"));
        assert!(text.contains("state=\"complete\""));
        assert!(text.contains("state=\"failed\""));
        assert!(text.contains("godon_breeder_last_trial_value"));
        assert!(text.contains("0.75"));
    }

    #[test]
    fn test_worker_status_flips() {
        let metrics = client();
        metrics.mark_running();
        let text = metrics.gather_text();
        assert!(text.contains("status=\"running\"} 1"));
        assert!(text.contains("status=\"stopped\"} 0"));

        metrics.mark_stopped();
        let text = metrics.gather_text();
        assert!(text.contains("status=\"running\"} 0"));
        assert!(text.contains("status=\"stopped\"} 1"));
    }

    #[test]
    fn test_histogram_buckets() {
        let metrics = client();
        metrics.observe_trial_duration(42.0);
        let text = metrics.gather_text();
        assert!(text.contains("godon_breeder_trial_duration_seconds_bucket"));
        assert!(text.contains("le=\"60\""));
        assert!(text.contains("le=\"1800\""));
    }

    #[test]
    fn test_labeled_counters() {
        let metrics = client();
        metrics.inc_effectuation("success");
        metrics.inc_guardrail_violation("cpu_usage");
        metrics.inc_rollback("failed");
        metrics.inc_trial_shared("best");

        let text = metrics.gather_text();
        assert!(text.contains("godon_breeder_effectuation_total"));
        assert!(text.contains("guardrail_name=\"cpu_usage\""));
        assert!(text.contains("godon_breeder_rollbacks_total"));
        assert!(text.contains("strategy=\"best\""));
        assert!(text.contains("breeder_id=\"abc-123\""));
    }

    #[test]
    fn test_push_to_gateway_stub() {
        use std::io::Read;

        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = format!("http://{}", server.server_addr());
        let handle = std::thread::spawn(move || {
            let mut request = server.recv().unwrap();
            let url = request.url().to_string();
            let mut body = String::new();
            request.as_reader().read_to_string(&mut body).unwrap();
            let _ = request.respond(tiny_http::Response::from_string("ok"));
            (url, body)
        });

        let metrics = client();
        metrics.inc_trial("complete", Some(1.0));
        assert!(metrics.push_to(&addr));

        let (url, body) = handle.join().unwrap();
        assert_eq!(url, "/metrics/job/breeder_abc-123");
        assert!(body.contains("godon_breeder_trials_total"));
    }

    #[test]
    fn test_push_failure_is_absorbed() {
        let metrics = client();
        // Nothing is listening on this port.
        assert!(!metrics.push_to("http://127.0.0.1:9"));
    }
}
