//! Typed field mapping
//!
//! Maps an external payload (API response, scraper export row) onto entity
//! attributes through a declared schema. Each mapping names its source key,
//! target column, value type, whether it is required and how it merges with
//! the current value. The resulting column list feeds `columns_affected` on
//! the audit log.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Conversion applied to a source value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Trimmed string; numbers and booleans are rendered as text
    Text,
    /// `true`/`yes`/`1` (any case) are true, other strings false
    Boolean,
    Integer,
    /// Passed through unchanged
    Json,
}

/// How a mapped value combines with the entity's current value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    Overwrite,
    /// Only set when the current value is null, missing or blank
    FillIfEmpty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
    pub field_type: FieldType,
    pub required: bool,
    pub policy: MergePolicy,
}

impl FieldMapping {
    /// Optional text field that overwrites
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            field_type: FieldType::Text,
            required: false,
            policy: MergePolicy::Overwrite,
        }
    }

    pub fn typed(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn fill_if_empty(mut self) -> Self {
        self.policy = MergePolicy::FillIfEmpty;
        self
    }

    fn convert(&self, raw: &Value) -> Option<Value> {
        match (self.field_type, raw) {
            (_, Value::Null) => None,
            (FieldType::Json, v) => Some(v.clone()),
            (FieldType::Text, Value::String(s)) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| Value::String(trimmed.to_string()))
            }
            (FieldType::Text, Value::Number(n)) => Some(Value::String(n.to_string())),
            (FieldType::Text, Value::Bool(b)) => Some(Value::String(b.to_string())),
            (FieldType::Boolean, Value::Bool(b)) => Some(Value::Bool(*b)),
            (FieldType::Boolean, Value::String(s)) => {
                let s = s.trim().to_ascii_lowercase();
                (!s.is_empty()).then(|| Value::Bool(matches!(s.as_str(), "true" | "yes" | "1")))
            }
            (FieldType::Boolean, Value::Number(n)) => Some(Value::Bool(n.as_f64() != Some(0.0))),
            (FieldType::Integer, Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                .map(Value::from),
            (FieldType::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            _ => None,
        }
    }
}

/// Result of applying a schema to one payload
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MappedUpdate {
    /// Target column to new value, only for values that differ
    pub changes: Map<String, Value>,
    /// Changed target columns, in schema order
    pub columns_affected: Vec<String>,
    /// Source keys of required mappings with no usable value
    pub missing_required: Vec<String>,
}

impl MappedUpdate {
    pub fn is_complete(&self) -> bool {
        self.missing_required.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Ordered set of mappings; for a shared target the earlier mapping wins
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    mappings: Vec<FieldMapping>,
}

impl FieldSchema {
    pub fn new(mappings: Vec<FieldMapping>) -> Self {
        Self { mappings }
    }

    pub fn mappings(&self) -> &[FieldMapping] {
        &self.mappings
    }

    /// Map `payload` onto `current`
    pub fn apply(&self, payload: &Map<String, Value>, current: &Map<String, Value>) -> MappedUpdate {
        let mut update = MappedUpdate::default();

        for mapping in &self.mappings {
            let value = payload.get(&mapping.source).and_then(|raw| mapping.convert(raw));
            let Some(value) = value else {
                if mapping.required {
                    update.missing_required.push(mapping.source.clone());
                }
                continue;
            };

            if update.changes.contains_key(&mapping.target) {
                continue;
            }

            let existing = current.get(&mapping.target);
            if mapping.policy == MergePolicy::FillIfEmpty && !is_blank(existing) {
                continue;
            }
            if existing == Some(&value) {
                continue;
            }

            update.columns_affected.push(mapping.target.clone());
            update.changes.insert(mapping.target.clone(), value);
        }

        update
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}
