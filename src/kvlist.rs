use std::fmt;

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{MapAccess, Visitor},
    ser::SerializeMap,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::{DispatchError, Result},
    reading::{Datapoint, DatapointValue, EMPTY_SENTINEL, Reading},
};

/// An ordered list of key/value pairs. Duplicate keys are permitted;
/// lookup returns the first match and serialisation emits every pair in
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KVList {
    items: Vec<(String, String)>,
}

impl KVList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list from a JSON object. String values are taken as-is;
    /// numbers and booleans are rendered lexically; nested structures are
    /// rejected.
    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(DispatchError::BadRequest(
                "expected a JSON object of key/value pairs".into(),
            ));
        };
        let mut list = KVList::new();
        for (key, item) in map {
            let rendered = match item {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(DispatchError::BadRequest(format!(
                        "value for key '{}' must be a scalar",
                        key
                    )));
                }
            };
            list.add(key, rendered);
        }
        Ok(list)
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.items.push((key.into(), value.into()));
    }

    /// First value stored under the key, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Replace every `$name$` token in the stored values with the value of
    /// `name` from `params`. An unterminated `$` is left literal with a
    /// warning; an unknown name substitutes the empty string.
    pub fn substitute(&mut self, params: &KVList) {
        for (_, value) in self.items.iter_mut() {
            *value = substitute_tokens(value, params);
        }
    }

    /// Convert the list into a pipeline reading. Each value becomes a
    /// datapoint with its type deduced; an empty list carries a single
    /// sentinel datapoint so the pipeline always has something to chew on.
    pub fn to_reading(&self, asset: &str) -> Reading {
        if self.items.is_empty() {
            return Reading::new(
                asset,
                vec![Datapoint::new(EMPTY_SENTINEL, DatapointValue::Integer(0))],
            );
        }
        let datapoints = self
            .items
            .iter()
            .map(|(key, value)| Datapoint::new(key.clone(), DatapointValue::deduce(value)))
            .collect();
        Reading::new(asset, datapoints)
    }

    /// Rebuild a list from a filtered reading, dropping the sentinel
    /// datapoint inserted by `to_reading`.
    pub fn from_reading(reading: &Reading) -> KVList {
        let mut list = KVList::new();
        for datapoint in &reading.datapoints {
            if datapoint.name == EMPTY_SENTINEL {
                continue;
            }
            list.add(datapoint.name.clone(), datapoint.value.render());
        }
        list
    }
}

/// Replace `$name$` tokens in a single value. See `KVList::substitute`.
pub fn substitute_tokens(value: &str, params: &KVList) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find('$') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('$') {
            Some(end) => {
                let name = &after[..end];
                match params.get(name) {
                    Some(replacement) => out.push_str(replacement),
                    None => {
                        debug!("substitution variable '{}' has no value", name);
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                warn!("unterminated substitution variable in value '{}'", value);
                out.push('$');
                out.push_str(after);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

impl Serialize for KVList {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.items.len()))?;
        for (key, value) in &self.items {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for KVList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct KVVisitor;

        impl<'de> Visitor<'de> for KVVisitor {
            type Value = KVList;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of string keys to string values")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<KVList, A::Error> {
                let mut list = KVList::new();
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    list.add(key, value);
                }
                Ok(list)
            }
        }

        deserializer.deserialize_map(KVVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> KVList {
        let mut p = KVList::new();
        p.add("v", "on");
        p.add("speed", "1500");
        p
    }

    #[test]
    fn first_match_wins_on_lookup() {
        let mut list = KVList::new();
        list.add("k", "first");
        list.add("k", "second");
        assert_eq!(list.get("k"), Some("first"));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn json_round_trip_preserves_order() {
        let list = KVList::from_json(&json!({"rpm": "1500", "mode": "auto"})).unwrap();
        let rendered = serde_json::to_value(&list).unwrap();
        assert_eq!(rendered, json!({"rpm": "1500", "mode": "auto"}));

        let back: KVList = serde_json::from_value(rendered).unwrap();
        assert_eq!(back, list);
    }

    #[test]
    fn from_json_renders_scalars_and_rejects_nesting() {
        let list = KVList::from_json(&json!({"rpm": 1500, "auto": true})).unwrap();
        assert_eq!(list.get("rpm"), Some("1500"));
        assert_eq!(list.get("auto"), Some("true"));
        assert!(KVList::from_json(&json!({"bad": {"nested": 1}})).is_err());
        assert!(KVList::from_json(&json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn substitutes_variables() {
        let mut list = KVList::new();
        list.add("x", "$v$");
        list.add("y", "run at $speed$ rpm");
        list.substitute(&params());
        assert_eq!(list.get("x"), Some("on"));
        assert_eq!(list.get("y"), Some("run at 1500 rpm"));
    }

    #[test]
    fn substitution_is_idempotent() {
        let mut list = KVList::new();
        list.add("x", "$v$/plain");
        list.substitute(&params());
        let once = list.clone();
        list.substitute(&params());
        assert_eq!(list, once);
    }

    #[test]
    fn unterminated_token_is_left_literal() {
        let mut list = KVList::new();
        list.add("x", "price is $12");
        list.substitute(&params());
        assert_eq!(list.get("x"), Some("price is $12"));
    }

    #[test]
    fn unknown_variable_becomes_empty() {
        let mut list = KVList::new();
        list.add("x", "$missing$");
        list.substitute(&params());
        assert_eq!(list.get("x"), Some(""));
    }

    #[test]
    fn reading_round_trip_preserves_keys_and_strings() {
        let mut list = KVList::new();
        list.add("rpm", "1500");
        list.add("mode", "auto");
        list.add("ratio", "0.50");

        let reading = list.to_reading("reading");
        assert_eq!(reading.asset, "reading");
        assert_eq!(reading.datapoints.len(), 3);
        assert_eq!(
            reading.datapoints[0].value,
            DatapointValue::Integer(1500)
        );

        let back = KVList::from_reading(&reading);
        let keys: Vec<&str> = back.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["rpm", "mode", "ratio"]);
        assert_eq!(back.get("mode"), Some("auto"));
        // Numerics may re-render canonically.
        assert_eq!(back.get("ratio"), Some("0.5"));
    }

    #[test]
    fn empty_list_gets_a_sentinel_that_is_stripped() {
        let list = KVList::new();
        let reading = list.to_reading("reading");
        assert_eq!(reading.datapoints.len(), 1);
        assert_eq!(reading.datapoints[0].name, EMPTY_SENTINEL);

        let back = KVList::from_reading(&reading);
        assert!(back.is_empty());
    }
}
