use serde_json::Value;

use crate::{error::Result, reading::Reading};

use super::{FilterPlugin, category_item};

/// Removes named datapoints from each reading. A reading stripped of all
/// its datapoints is dropped, which in turn suppresses the control
/// request.
pub struct ExcludePlugin {
    datapoints: Vec<String>,
}

impl ExcludePlugin {
    pub fn new() -> Self {
        Self {
            datapoints: Vec::new(),
        }
    }

    fn apply(&mut self, config: &Value) {
        if let Some(raw) = category_item(config, "datapoints") {
            self.datapoints = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
}

impl Default for ExcludePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterPlugin for ExcludePlugin {
    fn name(&self) -> &'static str {
        "exclude"
    }

    fn default_config(&self) -> Value {
        serde_json::json!({
            "datapoints": {"value": "", "default": "",
                           "description": "Comma separated list of datapoints to remove"}
        })
    }

    fn init(&mut self, config: &Value) -> Result<()> {
        self.apply(config);
        Ok(())
    }

    fn ingest(&mut self, mut readings: Vec<Reading>) -> Vec<Reading> {
        if self.datapoints.is_empty() {
            return readings;
        }
        for reading in readings.iter_mut() {
            reading
                .datapoints
                .retain(|dp| !self.datapoints.contains(&dp.name));
        }
        readings.retain(|reading| !reading.is_empty());
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
    fn drops_named_datapoints() {
        let mut plugin = ExcludePlugin::new();
        plugin.init(&json!({"datapoints": "secret, debug"})).unwrap();

        let mut values = KVList::new();
        values.add("rpm", "1500");
        values.add("secret", "hunter2");

        let out = plugin.ingest(vec![values.to_reading("reading")]);
        let back = KVList::from_reading(&out[0]);
        assert_eq!(back.get("rpm"), Some("1500"));
        assert_eq!(back.get("secret"), None);
    }

    #[test]
    fn emptied_reading_is_removed() {
        let mut plugin = ExcludePlugin::new();
        plugin.init(&json!({"datapoints": "rpm"})).unwrap();

        let mut values = KVList::new();
        values.add("rpm", "1500");

        let out = plugin.ingest(vec![values.to_reading("reading")]);
        assert!(out.is_empty());
    }
}
