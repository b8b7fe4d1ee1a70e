//! Closed response schemas.
//!
//! A [`Schema`] does two jobs:
//! - it is rendered into the service's `responseSchema` so the model is constrained to emit
//!   only data of that shape
//! - it validates whatever comes back, strictly, before anything is decoded into a typed value
//!
//! "Closed" means every listed property is required and nothing else is tolerated.

use serde_json::{Map, Value, json};
use thiserror::Error;

/// A closed response-shape contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schema {
    /// A non-blank string.
    String { description: Option<String> },

    /// A homogeneous array with optional length bounds (inclusive).
    Array {
        items: Box<Schema>,
        min_items: Option<usize>,
        max_items: Option<usize>,
        description: Option<String>,
    },

    /// An object whose listed properties are all required, in this order.
    Object {
        properties: Vec<(String, Schema)>,
        description: Option<String>,
    },
}

/// The first place a value failed to satisfy a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("at {path}: {reason}")]
pub struct SchemaViolation {
    /// JSON path of the offending value, e.g. `$.newScript.sections[1].visualCue`.
    pub path: String,
    pub reason: String,
}

impl Schema {
    pub fn string() -> Self {
        Self::String { description: None }
    }

    pub fn array(items: Schema) -> Self {
        Self::Array {
            items: Box::new(items),
            min_items: None,
            max_items: None,
            description: None,
        }
    }

    pub fn object<I, K>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, Schema)>,
        K: Into<String>,
    {
        Self::Object {
            properties: properties
                .into_iter()
                .map(|(name, schema)| (name.into(), schema))
                .collect(),
            description: None,
        }
    }

    /// Attach a human-readable description that is sent to the service.
    pub fn describe(mut self, text: impl Into<String>) -> Self {
        let text = Some(text.into());
        match &mut self {
            Self::String { description }
            | Self::Array { description, .. }
            | Self::Object { description, .. } => *description = text,
        }
        self
    }

    /// Bound the number of items in an array schema. No-op for other kinds.
    pub fn items_between(mut self, min: usize, max: usize) -> Self {
        if let Self::Array {
            min_items,
            max_items,
            ..
        } = &mut self
        {
            *min_items = Some(min);
            *max_items = Some(max);
        }
        self
    }

    /// Require at least `min` items in an array schema. No-op for other kinds.
    pub fn min_items(mut self, min: usize) -> Self {
        if let Self::Array { min_items, .. } = &mut self {
            *min_items = Some(min);
        }
        self
    }

    /// Render the schema in the service's `responseSchema` dialect (an OpenAPI subset with
    /// upper-case type names).
    pub fn to_wire(&self) -> Value {
        let mut out = Map::new();
        let description = match self {
            Self::String { description } => {
                out.insert("type".into(), json!("STRING"));
                description
            }
            Self::Array {
                items,
                min_items,
                max_items,
                description,
            } => {
                out.insert("type".into(), json!("ARRAY"));
                out.insert("items".into(), items.to_wire());
                if let Some(min) = min_items {
                    out.insert("minItems".into(), json!(min));
                }
                if let Some(max) = max_items {
                    out.insert("maxItems".into(), json!(max));
                }
                description
            }
            Self::Object {
                properties,
                description,
            } => {
                let names: Vec<&str> = properties.iter().map(|(n, _)| n.as_str()).collect();
                let props: Map<String, Value> = properties
                    .iter()
                    .map(|(name, schema)| (name.clone(), schema.to_wire()))
                    .collect();
                out.insert("type".into(), json!("OBJECT"));
                out.insert("properties".into(), Value::Object(props));
                out.insert("required".into(), json!(names));
                out.insert("propertyOrdering".into(), json!(names));
                description
            }
        };
        if let Some(text) = description {
            out.insert("description".into(), json!(text));
        }
        Value::Object(out)
    }

    /// Check `value` against this schema, reporting the first violation.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaViolation> {
        self.validate_at(value, "$")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<(), SchemaViolation> {
        match self {
            Self::String { .. } => match value {
                Value::String(s) if s.trim().is_empty() => Err(violation(path, "blank string")),
                Value::String(_) => Ok(()),
                other => Err(violation(
                    path,
                    format!("expected string, found {}", kind(other)),
                )),
            },
            Self::Array {
                items,
                min_items,
                max_items,
                ..
            } => {
                let Value::Array(elems) = value else {
                    return Err(violation(
                        path,
                        format!("expected array, found {}", kind(value)),
                    ));
                };
                match (*min_items, *max_items) {
                    (Some(min), _) if elems.len() < min => {
                        return Err(violation(
                            path,
                            format!("expected at least {min} items, found {}", elems.len()),
                        ));
                    }
                    (_, Some(max)) if elems.len() > max => {
                        return Err(violation(
                            path,
                            format!("expected at most {max} items, found {}", elems.len()),
                        ));
                    }
                    _ => {}
                }
                for (i, elem) in elems.iter().enumerate() {
                    items.validate_at(elem, &format!("{path}[{i}]"))?;
                }
                Ok(())
            }
            Self::Object { properties, .. } => {
                let Value::Object(fields) = value else {
                    return Err(violation(
                        path,
                        format!("expected object, found {}", kind(value)),
                    ));
                };
                for (name, schema) in properties {
                    let child = format!("{path}.{name}");
                    match fields.get(name) {
                        Some(v) => schema.validate_at(v, &child)?,
                        None => return Err(violation(&child, "missing required field")),
                    }
                }
                if let Some(extra) = fields
                    .keys()
                    .find(|k| !properties.iter().any(|(name, _)| name == *k))
                {
                    return Err(violation(
                        &format!("{path}.{extra}"),
                        "field is not part of the schema",
                    ));
                }
                Ok(())
            }
        }
    }
}

fn violation(path: &str, reason: impl Into<String>) -> SchemaViolation {
    SchemaViolation {
        path: path.to_string(),
        reason: reason.into(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
