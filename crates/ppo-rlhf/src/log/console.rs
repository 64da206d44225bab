//! Console logging backend.

use std::collections::BTreeMap;

use serde_json::Value;

use super::MetricLogger;

/// Logger that emits metrics as tracing events.
pub struct ConsoleLogger;

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleLogger {
    pub fn new() -> Self {
        Self
    }
}

/// One line per step, keys in sorted order.
pub(crate) fn format_metrics(metrics: &BTreeMap<String, f64>, step: u64) -> String {
    let body = metrics
        .iter()
        .map(|(key, value)| format!("{}:{:.4}", key, value))
        .collect::<Vec<_>>()
        .join(" ");
    format!("Step {} | {}", step, body)
}

impl MetricLogger for ConsoleLogger {
    fn log(&self, name: &str, value: f64, step: u64) {
        tracing::info!("Step {}: {} = {:.4}", step, name, value);
    }

    fn log_dict(&self, metrics: &BTreeMap<String, f64>, step: u64) {
        tracing::info!("{}", format_metrics(metrics, step));
    }

    fn log_config(&self, config: &Value) {
        tracing::info!(config = %config, "Run configuration");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_metrics_is_sorted() {
        let mut metrics = BTreeMap::new();
        metrics.insert("value_loss".to_string(), 0.25);
        metrics.insert("kl".to_string(), -0.125);
        assert_eq!(format_metrics(&metrics, 7), "Step 7 | kl:-0.1250 value_loss:0.2500");
    }
}
