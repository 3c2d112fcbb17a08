use serde_json::Value;
use tracing::{Level, debug, error, info, trace, warn};

use crate::{error::Result, reading::Reading};

use super::{FilterPlugin, category_item};

/// Passthrough plugin that logs every reading it sees. Handy for tracing
/// what a pipeline is doing to live control traffic.
pub struct LogPlugin {
    level: Level,
}

impl LogPlugin {
    pub fn new() -> Self {
        Self { level: Level::INFO }
    }

    fn apply(&mut self, config: &Value) {
        if let Some(level) = category_item(config, "level") {
            self.level = match level.to_ascii_lowercase().as_str() {
                "trace" => Level::TRACE,
                "debug" => Level::DEBUG,
                "info" => Level::INFO,
                "warn" | "warning" => Level::WARN,
                "error" => Level::ERROR,
                other => {
                    warn!("log filter: unsupported level '{}', using info", other);
                    Level::INFO
                }
            };
        }
    }

    fn log(&self, message: String) {
        match self.level {
            Level::TRACE => trace!(target: "dispatchx.filter.log", "{}", message),
            Level::DEBUG => debug!(target: "dispatchx.filter.log", "{}", message),
            Level::INFO => info!(target: "dispatchx.filter.log", "{}", message),
            Level::WARN => warn!(target: "dispatchx.filter.log", "{}", message),
            Level::ERROR => error!(target: "dispatchx.filter.log", "{}", message),
        }
    }
}

impl Default for LogPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterPlugin for LogPlugin {
    fn name(&self) -> &'static str {
        "log"
    }

    fn default_config(&self) -> Value {
        serde_json::json!({
            "level": {"value": "info", "default": "info",
                      "description": "Level the control requests are logged at"}
        })
    }

    fn init(&mut self, config: &Value) -> Result<()> {
        self.apply(config);
        Ok(())
    }

    fn ingest(&mut self, readings: Vec<Reading>) -> Vec<Reading> {
        for reading in &readings {
            let rendered = serde_json::to_string(reading).unwrap_or_default();
            self.log(format!("control request {}", rendered));
        }
        readings
    }

    fn reconfigure(&mut self, config: &Value) {
        self.apply(config);
    }

    fn shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvlist::KVList;
    use serde_json::json;

    #[test]
    fn passes_readings_through_unchanged() {
        let mut plugin = LogPlugin::new();
        plugin.init(&json!({"level": "debug"})).unwrap();

        let mut values = KVList::new();
        values.add("rpm", "1500");
        let reading = values.to_reading("reading");

        let out = plugin.ingest(vec![reading.clone()]);
        assert_eq!(out, vec![reading]);
    }
}
