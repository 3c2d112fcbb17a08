use serde_json::Value;

use crate::{error::Result, reading::Reading};

use super::{FilterPlugin, category_item};

/// Renames a datapoint within each reading. Configured with the name to
/// look for and the name to give it.
pub struct RenamePlugin {
    from: String,
    to: String,
}

impl RenamePlugin {
    pub fn new() -> Self {
        Self {
            from: String::new(),
            to: String::new(),
        }
    }

    fn apply(&mut self, config: &Value) {
        if let Some(from) = category_item(config, "find") {
            self.from = from;
        }
        if let Some(to) = category_item(config, "replace") {
            self.to = to;
        }
    }
}

impl Default for RenamePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterPlugin for RenamePlugin {
    fn name(&self) -> &'static str {
        "rename"
    }

    fn default_config(&self) -> Value {
        serde_json::json!({
            "find": {"value": "", "default": "",
                     "description": "Datapoint name to rename"},
            "replace": {"value": "", "default": "",
                        "description": "New name for the datapoint"}
        })
    }

    fn init(&mut self, config: &Value) -> Result<()> {
        self.apply(config);
        Ok(())
    }

    fn ingest(&mut self, mut readings: Vec<Reading>) -> Vec<Reading> {
        if self.from.is_empty() {
            return readings;
        }
        for reading in readings.iter_mut() {
            for datapoint in reading.datapoints.iter_mut() {
                if datapoint.name == self.from {
                    datapoint.name = self.to.clone();
                }
            }
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
    fn renames_matching_datapoints() {
        let mut plugin = RenamePlugin::new();
        plugin
            .init(&json!({"find": "rpm", "replace": "speed"}))
            .unwrap();

        let mut values = KVList::new();
        values.add("rpm", "1500");
        values.add("mode", "auto");

        let out = plugin.ingest(vec![values.to_reading("reading")]);
        let back = KVList::from_reading(&out[0]);
        assert_eq!(back.get("speed"), Some("1500"));
        assert_eq!(back.get("rpm"), None);
        assert_eq!(back.get("mode"), Some("auto"));
    }

    #[test]
    fn unconfigured_plugin_is_a_passthrough() {
        let mut plugin = RenamePlugin::new();
        plugin.init(&json!({})).unwrap();

        let mut values = KVList::new();
        values.add("rpm", "1500");
        let reading = values.to_reading("reading");
        let out = plugin.ingest(vec![reading.clone()]);
        assert_eq!(out, vec![reading]);
    }
}
