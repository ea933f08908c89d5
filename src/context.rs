//! Per-problem grading context: generated parameters and expected answers.
//!
//! Backed by a JSON object so the orchestrator can hand over whatever the problem
//! generator produced. Lookups take dotted paths (`answers.primeFactors.value`);
//! absent keys and `null` both resolve to `None`, never a panic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::format_number;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
  #[error("missing expected value `{0}` in problem context")]
  Missing(String),
  #[error("context value `{0}` is not a number")]
  NotNumeric(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GradingContext {
  values: Map<String, Value>,
}

impl GradingContext {
  pub fn new() -> Self {
    Self::default()
  }

  /// Build from a JSON value; anything but an object yields an empty context.
  pub fn from_value(v: Value) -> Self {
    match v {
      Value::Object(values) => Self { values },
      _ => Self::default(),
    }
  }

  pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
    self.values.insert(key.to_string(), value.into());
    self
  }

  pub fn get(&self, path: &str) -> Option<&Value> {
    let mut parts = path.split('.');
    let mut cur = self.values.get(parts.next()?)?;
    for part in parts {
      cur = match cur {
        Value::Object(m) => m.get(part)?,
        Value::Array(a) => a.get(part.parse::<usize>().ok()?)?,
        _ => return None,
      };
    }
    if cur.is_null() { None } else { Some(cur) }
  }

  pub fn contains(&self, path: &str) -> bool {
    self.get(path).is_some()
  }

  /// Value at `path`, looking through one level of `{value: ...}` nesting.
  pub fn get_unwrapped(&self, path: &str) -> Option<&Value> {
    self.get(path).map(unwrap_value)
  }

  pub fn get_number(&self, path: &str) -> Result<f64, ContextError> {
    let v = self
      .get_unwrapped(path)
      .ok_or_else(|| ContextError::Missing(path.to_string()))?;
    value_as_number(v).ok_or_else(|| ContextError::NotNumeric(path.to_string()))
  }

  pub fn get_text(&self, path: &str) -> Option<String> {
    self.get_unwrapped(path).and_then(value_as_text)
  }

  /// Canonical answer for another field, as `answers.<field>.value`.
  pub fn answer_value(&self, field: &str) -> Option<String> {
    self.get(&format!("answers.{}.value", field)).and_then(value_as_text)
  }

  pub fn scenario(&self) -> String {
    self.get_text("scenario").unwrap_or_default()
  }

  /// Replace every `{{path}}` with the context value at `path`.
  /// `extra` pairs win over context keys. Unknown placeholders are left in place.
  pub fn interpolate(&self, template: &str, extra: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
      out.push_str(&rest[..start]);
      let after = &rest[start + 2..];
      match after.find("}}") {
        Some(end) => {
          let key = after[..end].trim();
          let replacement = extra
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
            .or_else(|| self.get_text(key));
          match replacement {
            Some(v) => out.push_str(&v),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
          }
          rest = &after[end + 2..];
        }
        None => {
          out.push_str(&rest[start..]);
          rest = "";
        }
      }
    }
    out.push_str(rest);
    out
  }
}

/// Look through one level of `{value: ...}` nesting.
pub fn unwrap_value(v: &Value) -> &Value {
  match v {
    Value::Object(m) => m.get("value").unwrap_or(v),
    _ => v,
  }
}

pub fn value_as_number(v: &Value) -> Option<f64> {
  match v {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse::<f64>().ok(),
    _ => None,
  }
}

pub fn value_as_text(v: &Value) -> Option<String> {
  match unwrap_value(v) {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => n.as_f64().map(format_number),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}
