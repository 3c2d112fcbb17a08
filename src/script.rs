use std::{collections::BTreeMap, thread, time::Duration};

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{
    acl::CallerContext,
    delivery::{OPERATION_PATH, Origin, SETPOINT_PATH},
    error::{DispatchError, Result},
    kvlist::{KVList, substitute_tokens},
    service::DispatcherService,
    storage::StorageTables,
};

/// How deep `script` steps may recurse before the run is aborted.
pub const MAX_SCRIPT_DEPTH: usize = 8;

/// A conditional guard on a script step: the step runs only when the
/// named parameter compares as requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCondition {
    pub key: String,
    pub op: String,
    pub value: String,
}

impl ScriptCondition {
    /// Missing parameters skip the step with a warning. Operators other
    /// than `==` and `!=` are reserved; they evaluate to true.
    pub fn evaluate(&self, params: &KVList) -> bool {
        let Some(actual) = params.get(&self.key) else {
            warn!(
                "the key '{}' was not present in the parameters to the script",
                self.key
            );
            return false;
        };
        match self.op.as_str() {
            "==" => actual == self.value,
            "!=" => actual != self.value,
            other => {
                warn!("unsupported script condition operator '{}'", other);
                true
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum StepAction {
    Write {
        service: String,
        values: KVList,
    },
    Operation {
        operation: String,
        service: String,
        parameters: KVList,
    },
    Delay {
        duration_ms: u64,
    },
    Config {
        category: String,
        item: String,
        value: String,
    },
    Script {
        name: String,
    },
}

#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub condition: Option<ScriptCondition>,
    pub action: StepAction,
}

impl ScriptStep {
    fn execute(
        &self,
        service: &DispatcherService,
        caller: &CallerContext,
        params: &KVList,
        depth: usize,
    ) -> Result<()> {
        if let Some(condition) = &self.condition {
            if !condition.evaluate(params) {
                debug!("script step condition not met, skipping");
                return Ok(());
            }
        }

        let origin = Origin::new(&caller.source_name, &caller.source_type);
        match &self.action {
            StepAction::Write {
                service: target,
                values,
            } => {
                let mut values = values.clone();
                values.substitute(params);
                let payload = json!({"values": values});
                service.send_to_service(target, SETPOINT_PATH, &payload, &origin)
            }
            StepAction::Operation {
                operation,
                service: target,
                parameters,
            } => {
                let mut payload = json!({"operation": operation});
                if !parameters.is_empty() {
                    let mut parameters = parameters.clone();
                    parameters.substitute(params);
                    payload["parameters"] = serde_json::to_value(&parameters)?;
                }
                service.send_to_service(target, OPERATION_PATH, &payload, &origin)
            }
            StepAction::Delay { duration_ms } => {
                thread::sleep(Duration::from_millis(*duration_ms));
                Ok(())
            }
            StepAction::Config {
                category,
                item,
                value,
            } => {
                let value = substitute_tokens(value, params);
                service.config_store().set_category_item(category, item, &value)
            }
            StepAction::Script { name } => service.run_script(name, params, caller, depth + 1),
        }
    }
}

/// A persisted automation script: an ordered program of steps loaded from
/// the scripts table and executed by the `WriteScript` request variant.
#[derive(Debug, Clone)]
pub struct Script {
    name: String,
    acl_name: Option<String>,
    steps: BTreeMap<i64, ScriptStep>,
}

impl Script {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acl_name(&self) -> Option<&str> {
        self.acl_name.as_deref()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Load and parse a script row.
    pub fn load(name: &str, storage: &dyn StorageTables) -> Result<Script> {
        let row = storage
            .script(name)?
            .ok_or_else(|| DispatchError::NotFound("script", name.to_string()))?;
        let acl_name = row
            .acl
            .as_deref()
            .map(str::trim)
            .filter(|acl| !acl.is_empty())
            .map(str::to_string);
        let steps = parse_steps(name, &row.steps)?;
        Ok(Script {
            name: name.to_string(),
            acl_name,
            steps,
        })
    }

    /// Run the steps in ascending order. The first failing step aborts
    /// the script.
    pub fn execute(
        &self,
        service: &DispatcherService,
        caller: &CallerContext,
        params: &KVList,
        depth: usize,
    ) -> Result<()> {
        for (order, step) in &self.steps {
            step.execute(service, caller, params, depth).map_err(|err| {
                DispatchError::Script(format!(
                    "script '{}' failed at step {}: {}",
                    self.name, order, err
                ))
            })?;
        }
        Ok(())
    }
}

/// The steps column holds a JSON array, a string containing a JSON array
/// (single quotes tolerated), or an object wrapping the array under a
/// `steps` member.
fn parse_steps(script: &str, raw: &Value) -> Result<BTreeMap<i64, ScriptStep>> {
    let parsed;
    let steps = match raw {
        Value::String(text) => {
            parsed = serde_json::from_str::<Value>(&text.replace('\'', "\""))
                .map_err(|err| step_error(script, format!("steps are not valid JSON: {}", err)))?;
            &parsed
        }
        other => other,
    };
    let steps = match steps {
        Value::Object(map) => map
            .get("steps")
            .ok_or_else(|| step_error(script, "missing steps".into()))?,
        other => other,
    };
    let Value::Array(items) = steps else {
        return Err(step_error(script, "steps should be an array".into()));
    };

    let mut ordered = BTreeMap::new();
    for item in items {
        let Value::Object(entry) = item else {
            return Err(step_error(script, "step items should be objects".into()));
        };
        if entry.len() != 1 {
            return Err(step_error(
                script,
                "each step must hold exactly one step kind".into(),
            ));
        }
        let (kind, body) = entry.iter().next().unwrap();
        let order = body
            .get("order")
            .and_then(Value::as_i64)
            .filter(|order| *order >= 1)
            .ok_or_else(|| {
                step_error(script, format!("{} step is missing an order item", kind))
            })?;
        let step = parse_step(script, kind, body)?;
        if ordered.insert(order, step).is_some() {
            return Err(step_error(
                script,
                format!("duplicate step order {}", order),
            ));
        }
    }
    Ok(ordered)
}

fn parse_step(script: &str, kind: &str, body: &Value) -> Result<ScriptStep> {
    let condition = parse_condition(script, body)?;
    let action = match kind {
        "write" => StepAction::Write {
            service: required_str(script, kind, body, "service")?,
            values: KVList::from_json(body.get("values").ok_or_else(|| {
                step_error(script, "write type steps must contain values".into())
            })?)?,
        },
        "operation" => StepAction::Operation {
            operation: required_str(script, kind, body, "operation")?,
            service: required_str(script, kind, body, "service")?,
            parameters: match body.get("parameters") {
                Some(parameters) => KVList::from_json(parameters)?,
                None => KVList::new(),
            },
        },
        "delay" => StepAction::Delay {
            duration_ms: body
                .get("duration")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    step_error(script, "delay type steps must contain a duration".into())
                })?,
        },
        "config" => StepAction::Config {
            category: required_str(script, kind, body, "category")?,
            item: required_str(script, kind, body, "name")?,
            value: required_str(script, kind, body, "value")?,
        },
        "script" => StepAction::Script {
            name: required_str(script, kind, body, "name")?,
        },
        other => {
            return Err(step_error(
                script,
                format!("{} is not a supported script step", other),
            ));
        }
    };
    Ok(ScriptStep { condition, action })
}

fn parse_condition(script: &str, body: &Value) -> Result<Option<ScriptCondition>> {
    let Some(condition) = body.get("condition") else {
        return Ok(None);
    };
    let Value::Object(_) = condition else {
        return Err(step_error(script, "the condition should be an object".into()));
    };
    let get = |field: &str| {
        condition
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    match (get("key"), get("condition"), get("value")) {
        (Some(key), Some(op), Some(value)) => Ok(Some(ScriptCondition { key, op, value })),
        _ => Err(step_error(
            script,
            "the condition object must have a key, condition and value property".into(),
        )),
    }
}

fn required_str(script: &str, kind: &str, body: &Value, field: &str) -> Result<String> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            step_error(
                script,
                format!("{} type steps must contain a {} item", kind, field),
            )
        })
}

fn step_error(script: &str, detail: String) -> DispatchError {
    DispatchError::Script(format!("control script '{}' is badly formatted: {}", script, detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, ScriptRow};

    fn storage_with(steps: Value) -> MemoryStorage {
        let storage = MemoryStorage::new();
        storage.insert_script(ScriptRow {
            name: "S".into(),
            steps,
            acl: None,
        });
        storage
    }

    #[test]
    fn parses_steps_in_order() {
        let storage = storage_with(json!([
            {"write": {"order": 2, "service": "b", "values": {"x": "1"}}},
            {"write": {"order": 1, "service": "a", "values": {"x": "$v$"}}},
        ]));
        let script = Script::load("S", &storage).unwrap();
        assert_eq!(script.step_count(), 2);
        let orders: Vec<i64> = script.steps.keys().copied().collect();
        assert_eq!(orders, vec![1, 2]);
    }

    #[test]
    fn parses_string_steps_with_single_quotes() {
        let storage = storage_with(json!(
            "[{'delay': {'order': 1, 'duration': 100}}]"
        ));
        let script = Script::load("S", &storage).unwrap();
        assert_eq!(script.step_count(), 1);
        assert!(matches!(
            script.steps[&1].action,
            StepAction::Delay { duration_ms: 100 }
        ));
    }

    #[test]
    fn wrapped_steps_object_is_accepted() {
        let storage = storage_with(json!({"steps": [
            {"script": {"order": 1, "name": "other"}}
        ]}));
        let script = Script::load("S", &storage).unwrap();
        assert_eq!(script.step_count(), 1);
    }

    #[test]
    fn duplicate_orders_fail_the_script() {
        let storage = storage_with(json!([
            {"write": {"order": 1, "service": "a", "values": {"x": "1"}}},
            {"delay": {"order": 1, "duration": 5}},
        ]));
        assert!(Script::load("S", &storage).is_err());
    }

    #[test]
    fn missing_order_fails_the_script() {
        let storage = storage_with(json!([
            {"write": {"service": "a", "values": {"x": "1"}}},
        ]));
        assert!(Script::load("S", &storage).is_err());
    }

    #[test]
    fn unknown_step_kinds_fail_the_script() {
        let storage = storage_with(json!([
            {"teleport": {"order": 1, "target": "mars"}},
        ]));
        assert!(Script::load("S", &storage).is_err());
    }

    #[test]
    fn step_with_two_kinds_fails_the_script() {
        let storage = storage_with(json!([
            {"write": {"order": 1, "service": "a", "values": {}},
             "delay": {"order": 2, "duration": 5}},
        ]));
        assert!(Script::load("S", &storage).is_err());
    }

    #[test]
    fn conditions_require_all_three_fields() {
        let storage = storage_with(json!([
            {"write": {"order": 1, "service": "a", "values": {"x": "1"},
                       "condition": {"key": "v", "condition": "=="}}},
        ]));
        assert!(Script::load("S", &storage).is_err());
    }

    #[test]
    fn condition_evaluation_follows_the_operator() {
        let mut params = KVList::new();
        params.add("v", "on");

        let eq = ScriptCondition {
            key: "v".into(),
            op: "==".into(),
            value: "on".into(),
        };
        let ne = ScriptCondition {
            key: "v".into(),
            op: "!=".into(),
            value: "on".into(),
        };
        assert!(eq.evaluate(&params));
        assert!(!ne.evaluate(&params));

        let missing = ScriptCondition {
            key: "absent".into(),
            op: "==".into(),
            value: "on".into(),
        };
        assert!(!missing.evaluate(&params));
    }

    #[test]
    fn blank_acl_column_means_unrestricted() {
        let storage = MemoryStorage::new();
        storage.insert_script(ScriptRow {
            name: "S".into(),
            steps: json!([]),
            acl: Some("  ".into()),
        });
        let script = Script::load("S", &storage).unwrap();
        assert!(script.acl_name().is_none());
    }
}
