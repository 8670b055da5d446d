use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};

/// Telemetry builder for the federation engine.
pub struct FederationTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl FederationTelemetryBuilder {
    /// Creates a new builder scoped to a module label.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Info,
            event_publisher: None,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops log records below `level` (default `INFO`).
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds telemetry.
    pub fn build(self) -> Result<FederationTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::with_min_level(path, self.min_level)?),
            None => None,
        };
        Ok(FederationTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared by the driver and scenario.
///
/// Both sinks are optional; a handle with neither is a no-op.
#[derive(Clone)]
pub struct FederationTelemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl fmt::Debug for FederationTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FederationTelemetry")
            .field("module", &self.inner.module)
            .field("log", &self.inner.logger.as_ref().map(JsonLogger::path))
            .field("events", &self.inner.publisher.is_some())
            .finish()
    }
}

impl Default for FederationTelemetry {
    fn default() -> Self {
        Self::disabled()
    }
}

impl FederationTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> FederationTelemetryBuilder {
        FederationTelemetryBuilder::new(module)
    }

    /// Telemetry without sinks.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: "fedsim".into(),
                logger: None,
                publisher: None,
            }),
        }
    }

    /// Module label stamped on records.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Writes a structured log record.
    pub fn log(&self, level: LogLevel, message: &str, round: Option<u64>, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let mut record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            record.round = round;
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Publishes a lifecycle event.
    pub async fn event(&self, event_type: &str, round: Option<u64>, payload: Value) -> Result<()> {
        if let Some(publisher) = &self.inner.publisher {
            publisher
                .publish(EventRecord::new(&self.inner.module, event_type, round, payload))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use shared_logging::read_log;
    use tempfile::tempdir;

    #[tokio::test]
    async fn writes_logs_and_events() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(MemoryEventBus::new(8));
        let telemetry = FederationTelemetry::builder("driver")
            .log_path(dir.path().join("fedsim.log"))
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "round completed", Some(2), json!({"fit": 10}))
            .unwrap();
        telemetry
            .log(LogLevel::Debug, "filtered out", None, Value::Null)
            .unwrap();
        telemetry
            .event("round.fit.completed", Some(2), json!({"succeeded": 10}))
            .await
            .unwrap();

        let records = read_log(dir.path().join("fedsim.log")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].module, "driver");
        assert_eq!(records[0].round, Some(2));
        assert_eq!(records[0].metadata["fit"], json!(10));
        let events = bus.of_type("round.fit.completed");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "driver");
    }

    #[tokio::test]
    async fn disabled_is_a_no_op() {
        let telemetry = FederationTelemetry::default();
        assert!(telemetry.log(LogLevel::Error, "x", None, Value::Null).is_ok());
        assert!(telemetry.event("x", None, Value::Null).await.is_ok());
        assert_eq!(telemetry.module(), "fedsim");
    }
}
