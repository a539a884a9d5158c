//! Runtime schema for tool parameters and results
//!
//! Tool inputs arrive as untyped JSON; they are checked against a tagged schema
//! tree by one recursive validator.

use crate::{Result, RuntimeError};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Compiled patterns keyed by source, shared by every schema
fn pattern_cache() -> &'static DashMap<String, Regex> {
    static CACHE: OnceLock<DashMap<String, Regex>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// Compile a pattern once; later lookups clone the cached `Regex`
fn compiled(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    if let Some(regex) = pattern_cache().get(pattern) {
        return Ok(regex.clone());
    }
    let regex = Regex::new(pattern)?;
    pattern_cache().insert(pattern.to_string(), regex.clone());
    Ok(regex)
}

/// Typed schema node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schema {
    Object {
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        properties: BTreeMap<String, Schema>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        required: Vec<String>,
    },
    Array {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        items: Option<Box<Schema>>,
    },
    String {
        #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
        enum_values: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
    Number {
        #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
        enum_values: Option<Vec<f64>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum: Option<f64>,
    },
    Boolean,
}

impl Default for Schema {
    fn default() -> Self {
        Schema::Object {
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

impl Schema {
    pub fn object<I, S>(properties: I, required: &[&str]) -> Self
    where
        I: IntoIterator<Item = (S, Schema)>,
        S: Into<String>,
    {
        Schema::Object {
            properties: properties
                .into_iter()
                .map(|(name, schema)| (name.into(), schema))
                .collect(),
            required: required.iter().map(|name| name.to_string()).collect(),
        }
    }

    pub fn string() -> Self {
        Schema::String {
            enum_values: None,
            pattern: None,
        }
    }

    pub fn number() -> Self {
        Schema::Number {
            enum_values: None,
            minimum: None,
            maximum: None,
        }
    }

    pub fn array_of(items: Schema) -> Self {
        Schema::Array {
            items: Some(Box::new(items)),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Schema::Object { .. } => "object",
            Schema::Array { .. } => "array",
            Schema::String { .. } => "string",
            Schema::Number { .. } => "number",
            Schema::Boolean => "boolean",
        }
    }

    /// Validate a value against this schema
    pub fn validate(&self, value: &Value) -> Result<()> {
        self.validate_at(value, "")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<()> {
        match (self, value) {
            (
                Schema::Object {
                    properties,
                    required,
                },
                Value::Object(map),
            ) => {
                for name in required {
                    if map.get(name).map_or(true, Value::is_null) {
                        let field = join_path(path, name);
                        return Err(RuntimeError::validation(
                            field.clone(),
                            format!("Missing required field: {}", field),
                        ));
                    }
                }
                for (name, schema) in properties {
                    if let Some(child) = map.get(name).filter(|child| !child.is_null()) {
                        schema.validate_at(child, &join_path(path, name))?;
                    }
                }
                Ok(())
            }
            (Schema::Array { items }, Value::Array(values)) => {
                if let Some(items) = items {
                    for (index, child) in values.iter().enumerate() {
                        items.validate_at(child, &format!("{}[{}]", path, index))?;
                    }
                }
                Ok(())
            }
            (
                Schema::String {
                    enum_values,
                    pattern,
                },
                Value::String(text),
            ) => {
                if let Some(allowed) = enum_values {
                    if !allowed.iter().any(|candidate| candidate == text) {
                        return Err(RuntimeError::validation(
                            field_name(path),
                            format!(
                                "Value '{}' is not one of [{}]",
                                text,
                                allowed.join(", ")
                            ),
                        ));
                    }
                }
                if let Some(pattern) = pattern {
                    let regex = compiled(pattern).map_err(|e| {
                        RuntimeError::validation(
                            field_name(path),
                            format!("Invalid pattern '{}': {}", pattern, e),
                        )
                    })?;
                    if !regex.is_match(text) {
                        return Err(RuntimeError::validation(
                            field_name(path),
                            format!("Value '{}' does not match pattern '{}'", text, pattern),
                        ));
                    }
                }
                Ok(())
            }
            (
                Schema::Number {
                    enum_values,
                    minimum,
                    maximum,
                },
                Value::Number(number),
            ) => {
                let number = number.as_f64().unwrap_or(f64::NAN);
                if let Some(allowed) = enum_values {
                    if !allowed.iter().any(|candidate| *candidate == number) {
                        return Err(RuntimeError::validation(
                            field_name(path),
                            format!("Value {} is not an allowed value", number),
                        ));
                    }
                }
                if let Some(minimum) = minimum {
                    if number < *minimum {
                        return Err(RuntimeError::validation(
                            field_name(path),
                            format!("Value {} is below minimum {}", number, minimum),
                        ));
                    }
                }
                if let Some(maximum) = maximum {
                    if number > *maximum {
                        return Err(RuntimeError::validation(
                            field_name(path),
                            format!("Value {} is above maximum {}", number, maximum),
                        ));
                    }
                }
                Ok(())
            }
            (Schema::Boolean, Value::Bool(_)) => Ok(()),
            (schema, value) => Err(RuntimeError::validation(
                field_name(path),
                format!(
                    "Expected {}, got {}",
                    schema.type_name(),
                    json_type_name(value)
                ),
            )),
        }
    }

    /// Check the schema itself is well formed (patterns compile, bounds ordered)
    pub fn check(&self) -> Result<()> {
        match self {
            Schema::Object { properties, .. } => {
                properties.values().try_for_each(Schema::check)
            }
            Schema::Array { items } => items.as_deref().map_or(Ok(()), Schema::check),
            Schema::String {
                pattern: Some(pattern),
                ..
            } => compiled(pattern).map(|_| ()).map_err(|e| {
                RuntimeError::InvalidManifest(format!("invalid pattern '{}': {}", pattern, e))
            }),
            Schema::Number {
                minimum: Some(minimum),
                maximum: Some(maximum),
                ..
            } if minimum > maximum => Err(RuntimeError::InvalidManifest(format!(
                "minimum {} exceeds maximum {}",
                minimum, maximum
            ))),
            _ => Ok(()),
        }
    }
}

fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

fn field_name(path: &str) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path.to_string()
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn title_schema() -> Schema {
        Schema::object([("title", Schema::string())], &["title"])
    }

    fn field_of(error: RuntimeError) -> Option<String> {
        match error {
            RuntimeError::Validation { field, .. } => field,
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_required_field() {
        let error = title_schema().validate(&json!({})).unwrap_err();
        assert_eq!(error.error_code(), "VALIDATION_ERROR");
        assert!(error.to_string().contains("title"));
        assert_eq!(field_of(error), Some("title".to_string()));
    }

    #[test]
    fn test_type_mismatch() {
        let error = title_schema().validate(&json!({ "title": 42 })).unwrap_err();
        assert!(error.to_string().contains("Expected string, got number"));
        assert_eq!(field_of(error), Some("title".to_string()));
    }

    #[test]
    fn test_enum_pattern_and_bounds() {
        let schema: Schema = serde_json::from_value(json!({
            "type": "object",
            "properties": {
                "priority": { "type": "string", "enum": ["low", "high"] },
                "code": { "type": "string", "pattern": "^[A-Z]{3}$" },
                "count": { "type": "number", "minimum": 1, "maximum": 10 }
            }
        }))
        .unwrap();

        assert!(schema
            .validate(&json!({ "priority": "low", "code": "ABC", "count": 5 }))
            .is_ok());
        assert!(schema.validate(&json!({ "priority": "urgent" })).is_err());
        assert!(schema.validate(&json!({ "code": "abc" })).is_err());
        assert!(schema.validate(&json!({ "count": 0 })).is_err());
        assert!(schema.validate(&json!({ "count": 11 })).is_err());
    }

    #[test]
    fn test_nested_array_paths() {
        let schema = Schema::object(
            [(
                "tags",
                Schema::array_of(Schema::object([("name", Schema::string())], &["name"])),
            )],
            &[],
        );

        let error = schema
            .validate(&json!({ "tags": [{ "name": "a" }, { "name": true }] }))
            .unwrap_err();
        assert_eq!(field_of(error), Some("tags[1].name".to_string()));
    }

    #[test]
    fn test_check_rejects_bad_pattern() {
        let schema = Schema::object(
            [(
                "code",
                Schema::String {
                    enum_values: None,
                    pattern: Some("([".to_string()),
                },
            )],
            &[],
        );
        assert!(schema.check().is_err());
        assert!(title_schema().check().is_ok());
    }

    #[test]
    fn test_patterns_compile_once() {
        let pattern = "^cached-[0-9]{4}$";
        let schema = Schema::object(
            [(
                "code",
                Schema::String {
                    enum_values: None,
                    pattern: Some(pattern.to_string()),
                },
            )],
            &[],
        );

        for n in 0..50 {
            let value = json!({ "code": format!("cached-{:04}", n) });
            assert!(schema.validate(&value).is_ok());
        }
        assert!(schema.validate(&json!({ "code": "cached-x" })).is_err());
        assert!(pattern_cache().contains_key(pattern));
        assert!(!pattern_cache().contains_key("(["));
    }
}
