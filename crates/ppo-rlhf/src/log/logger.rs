//! Metric logger traits and composites.

use std::collections::BTreeMap;

use serde_json::Value;

/// Trait for logging metrics to various backends.
pub trait MetricLogger: Send + Sync {
    /// Log a scalar value (e.g. reward, loss).
    fn log(&self, name: &str, value: f64, step: u64);

    /// Log a set of metrics collected in a map.
    fn log_dict(&self, metrics: &BTreeMap<String, f64>, step: u64);

    /// Record the run configuration.
    fn log_config(&self, _config: &Value) {}

    /// Close the logger and flush any pending writes.
    fn close(&self) {}
}

/// A logger that does nothing (default).
pub struct NoOpLogger;

impl MetricLogger for NoOpLogger {
    fn log(&self, _name: &str, _value: f64, _step: u64) {}
    fn log_dict(&self, _metrics: &BTreeMap<String, f64>, _step: u64) {}
}

/// A composite logger that dispatches to multiple backends.
pub struct CompositeLogger {
    loggers: Vec<Box<dyn MetricLogger>>,
}

impl CompositeLogger {
    pub fn new(loggers: Vec<Box<dyn MetricLogger>>) -> Self {
        Self { loggers }
    }

    pub fn add(&mut self, logger: Box<dyn MetricLogger>) {
        self.loggers.push(logger);
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl MetricLogger for CompositeLogger {
    fn log(&self, name: &str, value: f64, step: u64) {
        for logger in &self.loggers {
            logger.log(name, value, step);
        }
    }

    fn log_dict(&self, metrics: &BTreeMap<String, f64>, step: u64) {
        for logger in &self.loggers {
            logger.log_dict(metrics, step);
        }
    }

    fn log_config(&self, config: &Value) {
        for logger in &self.loggers {
            logger.log_config(config);
        }
    }

    fn close(&self) {
        for logger in &self.loggers {
            logger.close();
        }
    }
}
