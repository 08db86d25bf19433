//! Schema registry: document validation and lookup tables
//!
//! Schemas are JSON-shaped descriptors recognizing `required` and
//! `properties` (per-field `type`, `minLength`, `maxLength`, `pattern`,
//! `minimum`, `maximum`). Validating against an unregistered schema succeeds
//! with a warning rather than failing — the registry is open-world.
//!
//! Lookup tables are registered process-locally and replicated into the
//! distributed store under `lookup:{table}:{key}` so other gateway instances
//! resolve the same values; the local copy is authoritative when present.

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::CounterStore;
use crate::error::{Error, Result};

/// Machine codes carried on validation errors
pub mod codes {
    pub const REQUIRED_FIELD_MISSING: &str = "REQUIRED_FIELD_MISSING";
    pub const TYPE_MISMATCH: &str = "TYPE_MISMATCH";
    pub const MIN_LENGTH: &str = "MIN_LENGTH";
    pub const MAX_LENGTH: &str = "MAX_LENGTH";
    pub const PATTERN_MISMATCH: &str = "PATTERN_MISMATCH";
    pub const MINIMUM: &str = "MINIMUM";
    pub const MAXIMUM: &str = "MAXIMUM";
    pub const NOT_INTEGER: &str = "NOT_INTEGER";
}

/// A single validation failure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    /// Path of the offending field (`$.x`)
    pub path: String,

    /// Human-readable message
    pub message: String,

    /// Machine code from [`codes`]
    pub code: String,

    /// The offending value (for length checks, the actual length)
    pub actual_value: serde_json::Value,
}

/// The outcome of validating a document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Per-field constraints, compiled at registration
#[derive(Debug, Clone)]
struct FieldConstraints {
    type_name: Option<String>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    pattern: Option<Regex>,
    minimum: Option<f64>,
    maximum: Option<f64>,
}

/// A compiled schema
#[derive(Debug, Clone)]
struct CompiledSchema {
    required: Vec<String>,
    properties: HashMap<String, FieldConstraints>,
}

/// Registry of schemas and lookup tables
pub struct SchemaRegistry {
    schemas: DashMap<String, Arc<CompiledSchema>>,
    lookup_tables: DashMap<String, HashMap<String, String>>,
    store: Arc<dyn CounterStore>,
}

impl SchemaRegistry {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            schemas: DashMap::new(),
            lookup_tables: DashMap::new(),
            store,
        }
    }

    /// Register (or replace) a schema from its JSON descriptor
    ///
    /// Constraint patterns compile here; a bad regex rejects the whole
    /// registration.
    pub fn register_schema(&self, name: &str, descriptor: &serde_json::Value) -> Result<()> {
        let required = descriptor
            .get("required")
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut properties = HashMap::new();
        if let Some(props) = descriptor.get("properties").and_then(|v| v.as_object()) {
            for (field, spec) in props {
                let pattern = match spec.get("pattern").and_then(|v| v.as_str()) {
                    Some(raw) => Some(Regex::new(raw).map_err(|e| {
                        Error::SchemaRegistration(format!(
                            "Schema '{}', field '{}': bad pattern: {}",
                            name, field, e
                        ))
                    })?),
                    None => None,
                };

                properties.insert(
                    field.clone(),
                    FieldConstraints {
                        type_name: spec
                            .get("type")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                        min_length: spec
                            .get("minLength")
                            .and_then(|v| v.as_u64())
                            .map(|v| v as usize),
                        max_length: spec
                            .get("maxLength")
                            .and_then(|v| v.as_u64())
                            .map(|v| v as usize),
                        pattern,
                        minimum: spec.get("minimum").and_then(|v| v.as_f64()),
                        maximum: spec.get("maximum").and_then(|v| v.as_f64()),
                    },
                );
            }
        }

        self.schemas
            .insert(name.to_string(), Arc::new(CompiledSchema { required, properties }));
        Ok(())
    }

    /// Register (or replace) a lookup table, replicating it into the store
    pub async fn register_lookup_table(
        &self,
        name: &str,
        mappings: HashMap<String, String>,
    ) -> Result<()> {
        for (key, value) in &mappings {
            // Replication is best-effort; the local copy stays authoritative
            if let Err(e) = self
                .store
                .set(&lookup_key(name, key), value, None)
                .await
            {
                tracing::warn!(table = name, key, "Lookup table replication failed: {}", e);
            }
        }
        self.lookup_tables.insert(name.to_string(), mappings);
        Ok(())
    }

    /// Validate a document against a registered schema
    ///
    /// Pure over the document and the registered schema: same inputs, same
    /// result.
    pub fn validate(&self, document: &serde_json::Value, schema_name: &str) -> ValidationResult {
        let Some(schema) = self.schemas.get(schema_name).map(|s| s.clone()) else {
            tracing::warn!(schema = schema_name, "Validation against unknown schema");
            let mut result = ValidationResult::ok();
            result
                .warnings
                .push(format!("Schema '{}' is not registered", schema_name));
            return result;
        };

        let mut errors = Vec::new();

        for field in &schema.required {
            if document.get(field).is_none() {
                errors.push(ValidationError {
                    path: field_path(field),
                    message: format!("Required field '{}' is missing", field),
                    code: codes::REQUIRED_FIELD_MISSING.to_string(),
                    actual_value: serde_json::Value::Null,
                });
            }
        }

        for (field, constraints) in &schema.properties {
            let Some(value) = document.get(field) else {
                continue;
            };
            check_field(field, value, constraints, &mut errors);
        }

        ValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings: Vec::new(),
        }
    }

    /// Resolve a value through a named lookup table
    ///
    /// Checks the process-local table first, then the distributed store; a
    /// miss returns `None` and logs a warning.
    pub async fn lookup(&self, source_value: &str, table: &str) -> Option<String> {
        if let Some(entry) = self.lookup_tables.get(table) {
            if let Some(value) = entry.get(source_value) {
                return Some(value.clone());
            }
        }

        match self.store.get(&lookup_key(table, source_value)).await {
            Ok(Some(value)) => Some(value),
            Ok(None) => {
                tracing::warn!(table, key = source_value, "Lookup miss");
                None
            }
            Err(e) => {
                tracing::warn!(table, key = source_value, "Lookup store error: {}", e);
                None
            }
        }
    }
}

fn check_field(
    field: &str,
    value: &serde_json::Value,
    constraints: &FieldConstraints,
    errors: &mut Vec<ValidationError>,
) {
    use serde_json::Value;

    if let Some(expected) = &constraints.type_name {
        let matches = match expected.as_str() {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.as_f64().map(|n| n.fract() == 0.0).unwrap_or(false),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            "null" => value.is_null(),
            _ => true,
        };
        if !matches {
            let code = if expected == "integer" && value.is_number() {
                codes::NOT_INTEGER
            } else {
                codes::TYPE_MISMATCH
            };
            errors.push(ValidationError {
                path: field_path(field),
                message: format!("Expected {} but found {}", expected, kind_of(value)),
                code: code.to_string(),
                actual_value: value.clone(),
            });
            return;
        }
    }

    if let Some(s) = value.as_str() {
        let length = s.chars().count();
        if let Some(min) = constraints.min_length {
            if length < min {
                errors.push(ValidationError {
                    path: field_path(field),
                    message: format!("Length {} is below the minimum of {}", length, min),
                    code: codes::MIN_LENGTH.to_string(),
                    actual_value: Value::from(length),
                });
            }
        }
        if let Some(max) = constraints.max_length {
            if length > max {
                errors.push(ValidationError {
                    path: field_path(field),
                    message: format!("Length {} exceeds the maximum of {}", length, max),
                    code: codes::MAX_LENGTH.to_string(),
                    actual_value: Value::from(length),
                });
            }
        }
        if let Some(pattern) = &constraints.pattern {
            if !pattern.is_match(s) {
                errors.push(ValidationError {
                    path: field_path(field),
                    message: format!("Value does not match pattern '{}'", pattern.as_str()),
                    code: codes::PATTERN_MISMATCH.to_string(),
                    actual_value: value.clone(),
                });
            }
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = constraints.minimum {
            if n < min {
                errors.push(ValidationError {
                    path: field_path(field),
                    message: format!("Value {} is below the minimum of {}", n, min),
                    code: codes::MINIMUM.to_string(),
                    actual_value: value.clone(),
                });
            }
        }
        if let Some(max) = constraints.maximum {
            if n > max {
                errors.push(ValidationError {
                    path: field_path(field),
                    message: format!("Value {} exceeds the maximum of {}", n, max),
                    code: codes::MAXIMUM.to_string(),
                    actual_value: value.clone(),
                });
            }
        }
    }
}

fn field_path(field: &str) -> String {
    format!("$.{}", field)
}

fn kind_of(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn lookup_key(table: &str, key: &str) -> String {
    format!("lookup:{}:{}", table, key)
}
