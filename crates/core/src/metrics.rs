use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::tenant::TenantId;
use crate::types::{ActionRef, Outcome, RunStatus};

pub const NODE_DISPATCHES: &str = "node_dispatches_total";
pub const NODE_FAILURES: &str = "node_failures_total";
pub const NODE_RETRIES: &str = "node_retries_total";
pub const NODE_DURATION: &str = "node_duration_seconds";
pub const RUNS_FINISHED: &str = "runs_finished_total";
pub const QUEUE_DEPTH: &str = "queue_depth";

/// In-process metrics for node execution and queue pressure
pub struct MetricsCollector {
    counters: Mutex<HashMap<String, Counter>>,
    gauges: Mutex<HashMap<String, Gauge>>,
    histograms: Mutex<HashMap<String, Histogram>>,
}

/// Counter - monotonically increasing value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counter {
    pub name: String,
    pub value: u64,
    pub labels: HashMap<String, String>,
    pub last_updated: DateTime<Utc>,
}

/// Gauge - value that can go up or down
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gauge {
    pub name: String,
    pub value: f64,
    pub labels: HashMap<String, String>,
    pub last_updated: DateTime<Utc>,
}

/// Histogram - tracks distribution of values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram {
    pub name: String,
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
    pub labels: HashMap<String, String>,
    pub last_updated: DateTime<Utc>,
}

/// Everything the collector holds, for the metrics endpoint
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<Counter>,
    pub gauges: Vec<Gauge>,
    pub histograms: Vec<Histogram>,
}

fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
        }
    }

    /// Record a finished dispatch of one job attempt
    pub fn record_dispatch(
        &self,
        tenant_id: &TenantId,
        action: &ActionRef,
        outcome: &Outcome,
        duration: Duration,
    ) {
        let outcome_label = match outcome {
            Outcome::Success { .. } => "success",
            Outcome::RetryableFailure { .. } => "retryable_failure",
            Outcome::PermanentFailure { .. } => "permanent_failure",
            Outcome::Cancelled => "cancelled",
        };
        let tenant = tenant_id.0.as_str();
        let action = action.0.as_str();

        self.increment_counter(
            NODE_DISPATCHES,
            labels(&[("tenant", tenant), ("action", action), ("outcome", outcome_label)]),
        );
        self.observe_histogram(
            NODE_DURATION,
            duration.as_secs_f64(),
            labels(&[("action", action)]),
        );
    }

    /// Record a node that reached `failed`
    pub fn record_node_failure(&self, tenant_id: &TenantId, action: &ActionRef) {
        self.increment_counter(
            NODE_FAILURES,
            labels(&[("tenant", tenant_id.0.as_str()), ("action", action.0.as_str())]),
        );
    }

    pub fn record_retry(&self, tenant_id: &TenantId, action: &ActionRef) {
        self.increment_counter(
            NODE_RETRIES,
            labels(&[("tenant", tenant_id.0.as_str()), ("action", action.0.as_str())]),
        );
    }

    pub fn record_run_finished(&self, tenant_id: &TenantId, status: RunStatus) {
        let status = status.to_string();
        self.increment_counter(
            RUNS_FINISHED,
            labels(&[("tenant", tenant_id.0.as_str()), ("status", status.as_str())]),
        );
    }

    pub fn set_queue_depth(&self, tenant_id: &TenantId, depth: usize) {
        self.set_gauge(
            QUEUE_DEPTH,
            depth as f64,
            labels(&[("tenant", tenant_id.0.as_str())]),
        );
    }

    /// Increment a counter
    pub fn increment_counter(&self, name: &str, labels: HashMap<String, String>) {
        let mut counters = self.counters.lock();
        let key = Self::metric_key(name, &labels);

        counters
            .entry(key)
            .and_modify(|c| {
                c.value += 1;
                c.last_updated = Utc::now();
            })
            .or_insert_with(|| Counter {
                name: name.to_string(),
                value: 1,
                labels,
                last_updated: Utc::now(),
            });
    }

    /// Set a gauge value
    pub fn set_gauge(&self, name: &str, value: f64, labels: HashMap<String, String>) {
        let mut gauges = self.gauges.lock();
        let key = Self::metric_key(name, &labels);

        gauges
            .entry(key)
            .and_modify(|g| {
                g.value = value;
                g.last_updated = Utc::now();
            })
            .or_insert_with(|| Gauge {
                name: name.to_string(),
                value,
                labels,
                last_updated: Utc::now(),
            });
    }

    /// Record a histogram observation
    pub fn observe_histogram(&self, name: &str, value: f64, labels: HashMap<String, String>) {
        let mut histograms = self.histograms.lock();
        let key = Self::metric_key(name, &labels);

        let histogram = histograms.entry(key).or_insert_with(|| {
            // Seconds: 10ms up to 5 minutes
            let buckets = vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];
            Histogram {
                name: name.to_string(),
                counts: vec![0; buckets.len()],
                buckets,
                sum: 0.0,
                count: 0,
                labels,
                last_updated: Utc::now(),
            }
        });

        histogram.sum += value;
        histogram.count += 1;
        for (i, bucket) in histogram.buckets.iter().enumerate() {
            if value <= *bucket {
                histogram.counts[i] += 1;
            }
        }
        histogram.last_updated = Utc::now();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.lock().values().cloned().collect(),
            gauges: self.gauges.lock().values().cloned().collect(),
            histograms: self.histograms.lock().values().cloned().collect(),
        }
    }

    /// Get a specific counter
    pub fn get_counter(&self, name: &str, labels: &HashMap<String, String>) -> Option<Counter> {
        let key = Self::metric_key(name, labels);
        self.counters.lock().get(&key).cloned()
    }

    /// Sum a counter across all label sets
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .values()
            .filter(|c| c.name == name)
            .map(|c| c.value)
            .sum()
    }

    pub fn get_gauge(&self, name: &str, labels: &HashMap<String, String>) -> Option<Gauge> {
        let key = Self::metric_key(name, labels);
        self.gauges.lock().get(&key).cloned()
    }

    pub fn get_histogram(&self, name: &str, labels: &HashMap<String, String>) -> Option<Histogram> {
        let key = Self::metric_key(name, labels);
        self.histograms.lock().get(&key).cloned()
    }

    /// Generate a unique key for a metric with labels
    fn metric_key(name: &str, labels: &HashMap<String, String>) -> String {
        if labels.is_empty() {
            return name.to_string();
        }

        let mut sorted_labels: Vec<_> = labels.iter().collect();
        sorted_labels.sort_by_key(|(k, _)| *k);

        let label_str = sorted_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        format!("{}:{}", name, label_str)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    /// Upper bucket bound containing the p-th percentile
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 || !(0.0..=100.0).contains(&p) {
            return None;
        }

        let target_count = ((self.count as f64) * (p / 100.0)).ceil() as u64;
        self.counts
            .iter()
            .position(|count| *count >= target_count)
            .map(|i| self.buckets[i])
    }

    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_metrics() {
        let collector = MetricsCollector::new();
        let tenant = TenantId::new("acme");
        let action = ActionRef::new("core.echo");

        collector.record_dispatch(
            &tenant,
            &action,
            &Outcome::success(serde_json::Value::Null),
            Duration::from_millis(200),
        );
        collector.record_dispatch(
            &tenant,
            &action,
            &Outcome::retryable("503"),
            Duration::from_millis(400),
        );

        assert_eq!(collector.counter_total(NODE_DISPATCHES), 2);

        let success = labels(&[("tenant", "acme"), ("action", "core.echo"), ("outcome", "success")]);
        assert_eq!(collector.get_counter(NODE_DISPATCHES, &success).unwrap().value, 1);

        let histogram = collector
            .get_histogram(NODE_DURATION, &labels(&[("action", "core.echo")]))
            .unwrap();
        assert_eq!(histogram.count, 2);
        assert!((histogram.average().unwrap() - 0.3).abs() < 1e-9);
        assert_eq!(histogram.percentile(50.0), Some(0.5));
    }

    #[test]
    fn test_queue_depth_gauge() {
        let collector = MetricsCollector::new();
        let tenant = TenantId::new("acme");

        collector.set_queue_depth(&tenant, 7);
        collector.set_queue_depth(&tenant, 3);

        let gauge = collector
            .get_gauge(QUEUE_DEPTH, &labels(&[("tenant", "acme")]))
            .unwrap();
        assert_eq!(gauge.value, 3.0);
    }

    #[test]
    fn test_metric_labels_are_order_independent() {
        let a = labels(&[("tenant", "acme"), ("action", "x")]);
        let b = labels(&[("action", "x"), ("tenant", "acme")]);
        assert_eq!(
            MetricsCollector::metric_key("m", &a),
            MetricsCollector::metric_key("m", &b)
        );
    }

    #[test]
    fn test_snapshot() {
        let collector = MetricsCollector::new();
        let tenant = TenantId::new("acme");
        collector.record_retry(&tenant, &ActionRef::new("core.fail"));
        collector.record_run_finished(&tenant, RunStatus::Completed);
        collector.set_queue_depth(&tenant, 1);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.counters.len(), 2);
        assert_eq!(snapshot.gauges.len(), 1);
        assert!(snapshot.histograms.is_empty());
    }
}
