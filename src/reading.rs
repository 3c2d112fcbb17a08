use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Datapoint name used to keep a reading non-empty when it is built from
/// an empty key/value list. Stripped again on the way back out.
pub const EMPTY_SENTINEL: &str = "__empty__";

/// A single typed value carried through a filter pipeline. The type is
/// deduced from the lexical shape of the incoming string value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatapointValue {
    Integer(i64),
    Float(f64),
    Str(String),
}

impl DatapointValue {
    /// Deduce a typed value from its string rendering: integers first,
    /// then floats, anything else stays a string. Values like `inf` or
    /// `nan` that happen to parse as floats stay strings.
    pub fn deduce(raw: &str) -> DatapointValue {
        if let Ok(i) = raw.parse::<i64>() {
            return DatapointValue::Integer(i);
        }
        let looks_numeric = raw
            .chars()
            .next()
            .map(|c| c.is_ascii_digit() || c == '-' || c == '+' || c == '.')
            .unwrap_or(false);
        if looks_numeric {
            if let Ok(f) = raw.parse::<f64>() {
                if f.is_finite() {
                    return DatapointValue::Float(f);
                }
            }
        }
        DatapointValue::Str(raw.to_string())
    }

    /// Canonical string rendering, used when converting back to a
    /// key/value list.
    pub fn render(&self) -> String {
        match self {
            DatapointValue::Integer(i) => i.to_string(),
            DatapointValue::Float(f) => f.to_string(),
            DatapointValue::Str(s) => s.clone(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            DatapointValue::Integer(i) => Value::Number((*i).into()),
            DatapointValue::Float(f) => Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(f.to_string())),
            DatapointValue::Str(s) => Value::String(s.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub name: String,
    pub value: DatapointValue,
}

impl Datapoint {
    pub fn new(name: impl Into<String>, value: DatapointValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// The carrier passed through a filter pipeline: a named asset with an
/// ordered list of typed datapoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub asset: String,
    pub datapoints: Vec<Datapoint>,
}

impl Reading {
    pub fn new(asset: impl Into<String>, datapoints: Vec<Datapoint>) -> Self {
        Self {
            asset: asset.into(),
            datapoints,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.datapoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduces_integers_floats_and_strings() {
        assert_eq!(DatapointValue::deduce("1500"), DatapointValue::Integer(1500));
        assert_eq!(DatapointValue::deduce("-42"), DatapointValue::Integer(-42));
        assert_eq!(DatapointValue::deduce("3.25"), DatapointValue::Float(3.25));
        assert_eq!(
            DatapointValue::deduce("on"),
            DatapointValue::Str("on".into())
        );
        assert_eq!(
            DatapointValue::deduce("inf"),
            DatapointValue::Str("inf".into())
        );
        assert_eq!(DatapointValue::deduce(""), DatapointValue::Str("".into()));
    }

    #[test]
    fn renders_canonical_forms() {
        assert_eq!(DatapointValue::deduce("1500").render(), "1500");
        assert_eq!(DatapointValue::deduce("1.50").render(), "1.5");
        assert_eq!(DatapointValue::deduce("fast").render(), "fast");
    }
}
