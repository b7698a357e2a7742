//! Tolerant access to loosely-typed provider documents
//!
//! Providers disagree on field names (`quality` vs `maxquality`, `translate`
//! vs `voice`) and on types (numbers sent as strings). Rather than modelling
//! each provider's shape, lookups try a list of aliases over a generic
//! [`serde_json::Value`] tree and coerce where it is unambiguous.

use serde_json::Value;
use std::collections::BTreeMap;

/// Alias-aware field access on JSON values
pub(crate) trait DocumentExt {
    /// First present, non-null field among `names`
    fn field(&self, names: &[&str]) -> Option<&Value>;

    /// First field among `names` holding a non-blank string
    ///
    /// Numbers are rendered to strings so `"id": 42` reads as `"42"`.
    fn str_field(&self, names: &[&str]) -> Option<String>;

    /// First field among `names` holding a non-negative integer
    ///
    /// Accepts integers, integral floats and numeric strings (`"03"`).
    fn number_field(&self, names: &[&str]) -> Option<u32>;

    /// First field among `names` holding an object of string values
    fn string_map_field(&self, names: &[&str]) -> Option<BTreeMap<String, String>>;
}

impl DocumentExt for Value {
    fn field(&self, names: &[&str]) -> Option<&Value> {
        let object = self.as_object()?;
        names
            .iter()
            .filter_map(|name| object.get(*name))
            .find(|value| !value.is_null())
    }

    fn str_field(&self, names: &[&str]) -> Option<String> {
        let object = self.as_object()?;
        names.iter().filter_map(|name| object.get(*name)).find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    fn number_field(&self, names: &[&str]) -> Option<u32> {
        let object = self.as_object()?;
        names
            .iter()
            .filter_map(|name| object.get(*name))
            .find_map(as_number)
    }

    fn string_map_field(&self, names: &[&str]) -> Option<BTreeMap<String, String>> {
        let object = self.field(names)?.as_object()?;
        let map: BTreeMap<String, String> = object
            .iter()
            .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_string())))
            .collect();
        (!map.is_empty()).then_some(map)
    }
}

fn as_number(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
