//! Payload transformation between published and internal schemas
//!
//! A mapping is registered for a `(source, target)` schema pair and lists
//! per-field operators over path-addressed values. Transforming a document
//! with no registered (or inactive) mapping returns it unchanged.

pub mod path;

use chrono::DateTime;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use crate::error::{Error, Result};
use crate::schema::{SchemaRegistry, ValidationResult};
use path::JsonPath;

/// `$.path` tokens inside a Concat template
static CONCAT_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\.[A-Za-z0-9_-]+)+").expect("concat token regex is valid")
});

/// How a field's value is produced from the source document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FieldOperator {
    /// Deep-copy the source value
    Direct,
    /// Emit the argument as a string value
    Constant { value: String },
    /// Format a timestamp or decimal source value; pass anything else through
    Format { format: String },
    /// Translate through an inline key → value table; pass through on miss
    Map { values: HashMap<String, String> },
    /// Translate through a named lookup table
    Lookup { table: String },
    /// Minimal expression; the default strategy emits the expression literal
    Computed { expression: String },
    /// Template in which each `$.path` token is replaced by the stringified
    /// source value at that path
    Concat { template: String },
}

/// A single field mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    /// Logical field name
    pub field: String,

    /// Source path (`$.status`)
    pub source_path: String,

    /// Target path (`$.statuscode`)
    pub target_path: String,

    /// Operator producing the target value
    pub operator: FieldOperator,

    /// Written when the operator produces null
    #[serde(default)]
    pub default_value: Option<Value>,

    /// A null result aborts the transform when set
    #[serde(default)]
    pub required: bool,
}

/// A registered source → target mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaMapping {
    pub source: String,
    pub target: String,
    pub fields: Vec<FieldMapping>,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// A field mapping with its paths pre-parsed
struct CompiledField {
    mapping: FieldMapping,
    source: JsonPath,
    target: JsonPath,
}

struct CompiledMapping {
    active: bool,
    fields: Vec<CompiledField>,
}

/// Payload transformer
pub struct PayloadTransformer {
    mappings: DashMap<(String, String), Arc<CompiledMapping>>,
    schemas: Arc<SchemaRegistry>,
}

impl PayloadTransformer {
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            mappings: DashMap::new(),
            schemas,
        }
    }

    /// Register (or replace) a mapping
    ///
    /// All paths parse here; a path the walker cannot address rejects the
    /// whole registration.
    pub fn register_mapping(&self, mapping: SchemaMapping) -> Result<()> {
        let mut fields = Vec::with_capacity(mapping.fields.len());
        for field in mapping.fields {
            let source = JsonPath::parse(&field.source_path)?;
            let target = JsonPath::parse(&field.target_path)?;
            fields.push(CompiledField {
                mapping: field,
                source,
                target,
            });
        }

        self.mappings.insert(
            (mapping.source.clone(), mapping.target.clone()),
            Arc::new(CompiledMapping {
                active: mapping.active,
                fields,
            }),
        );
        Ok(())
    }

    /// Remove a mapping
    pub fn unregister_mapping(&self, source: &str, target: &str) -> bool {
        self.mappings
            .remove(&(source.to_string(), target.to_string()))
            .is_some()
    }

    /// Whether an active mapping exists for the pair
    pub fn has_mapping(&self, source: &str, target: &str) -> bool {
        self.mappings
            .get(&(source.to_string(), target.to_string()))
            .map(|m| m.active)
            .unwrap_or(false)
    }

    /// Transform an inbound request payload
    pub async fn transform_request(&self, document: &Value, source: &str, target: &str) -> Result<Value> {
        self.transform(document, source, target).await
    }

    /// Transform an upstream response payload
    pub async fn transform_response(&self, document: &Value, source: &str, target: &str) -> Result<Value> {
        self.transform(document, source, target).await
    }

    /// Validate a document against a registered schema (delegates)
    pub fn validate(&self, document: &Value, schema_name: &str) -> ValidationResult {
        self.schemas.validate(document, schema_name)
    }

    async fn transform(&self, document: &Value, source: &str, target: &str) -> Result<Value> {
        let Some(mapping) = self
            .mappings
            .get(&(source.to_string(), target.to_string()))
            .map(|m| m.clone())
        else {
            return Ok(document.clone());
        };
        if !mapping.active {
            return Ok(document.clone());
        }

        let mut output = Value::Object(serde_json::Map::new());
        for field in &mapping.fields {
            let produced = self.apply(document, field).await;
            let produced = match produced {
                Some(value) if !value.is_null() => Some(value),
                _ => None,
            };

            match produced {
                Some(value) => field.target.set(&mut output, value)?,
                None => {
                    if let Some(default) = &field.mapping.default_value {
                        field.target.set(&mut output, default.clone())?;
                    } else if field.mapping.required {
                        return Err(Error::Transform {
                            path: field.source.as_str().to_string(),
                            message: format!(
                                "Required field '{}' resolved to null",
                                field.mapping.field
                            ),
                        });
                    }
                }
            }
        }

        Ok(output)
    }

    async fn apply(&self, document: &Value, field: &CompiledField) -> Option<Value> {
        match &field.mapping.operator {
            FieldOperator::Direct => field.source.get(document).cloned(),

            FieldOperator::Constant { value } => Some(Value::String(value.clone())),

            FieldOperator::Format { format } => {
                let value = field.source.get(document)?;
                Some(apply_format(value, format))
            }

            FieldOperator::Map { values } => {
                let value = field.source.get(document)?;
                match values.get(&stringify(value)) {
                    Some(mapped) => Some(Value::String(mapped.clone())),
                    None => Some(value.clone()),
                }
            }

            FieldOperator::Lookup { table } => {
                let value = field.source.get(document)?;
                self.schemas
                    .lookup(&stringify(value), table)
                    .await
                    .map(Value::String)
            }

            FieldOperator::Computed { expression } => Some(Value::String(expression.clone())),

            FieldOperator::Concat { template } => {
                let result = CONCAT_TOKEN.replace_all(template, |captures: &regex::Captures<'_>| {
                    JsonPath::parse(&captures[0])
                        .ok()
                        .and_then(|p| p.get(document).map(|v| stringify(v)))
                        .unwrap_or_default()
                });
                Some(Value::String(result.into_owned()))
            }
        }
    }
}

/// Format a timestamp or decimal source value
///
/// Timestamps use chrono format specifiers; decimals use the number of
/// digits after `.` in the format as precision. Anything else passes
/// through.
fn apply_format(value: &Value, format: &str) -> Value {
    if let Some(s) = value.as_str() {
        if let Ok(timestamp) = DateTime::parse_from_rfc3339(s) {
            return Value::String(timestamp.format(format).to_string());
        }
        if let Ok(number) = s.parse::<f64>() {
            return Value::String(format_decimal(number, format));
        }
        return value.clone();
    }
    if let Some(number) = value.as_f64() {
        return Value::String(format_decimal(number, format));
    }
    value.clone()
}

fn format_decimal(number: f64, format: &str) -> String {
    let precision = format
        .rsplit_once('.')
        .map(|(_, frac)| frac.chars().filter(char::is_ascii_digit).count())
        .unwrap_or(0);
    format!("{:.*}", precision, number)
}

/// Stringify a value for table keys and templates
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCounterStore;
    use serde_json::json;

    async fn transformer() -> PayloadTransformer {
        let schemas = Arc::new(SchemaRegistry::new(Arc::new(MemoryCounterStore::new())));
        let mut customers = HashMap::new();
        customers.insert("CUST001".to_string(), "account-guid-001".to_string());
        schemas
            .register_lookup_table("customers", customers)
            .await
            .unwrap();
        PayloadTransformer::new(schemas)
    }

    fn field(
        name: &str,
        source: &str,
        target: &str,
        operator: FieldOperator,
    ) -> FieldMapping {
        FieldMapping {
            field: name.to_string(),
            source_path: source.to_string(),
            target_path: target.to_string(),
            operator,
            default_value: None,
            required: false,
        }
    }

    fn erp_to_crm() -> SchemaMapping {
        let mut status_values = HashMap::new();
        status_values.insert("Active".to_string(), "1".to_string());

        SchemaMapping {
            source: "erp.project".to_string(),
            target: "crm.project".to_string(),
            fields: vec![
                field("name", "$.projectNumber", "$.name", FieldOperator::Direct),
                field(
                    "statuscode",
                    "$.status",
                    "$.statuscode",
                    FieldOperator::Map {
                        values: status_values,
                    },
                ),
                field(
                    "customerid",
                    "$.customerId",
                    "$.customerid",
                    FieldOperator::Lookup {
                        table: "customers".to_string(),
                    },
                ),
            ],
            active: true,
        }
    }

    #[tokio::test]
    async fn test_erp_to_crm_transform() {
        let transformer = transformer().await;
        transformer.register_mapping(erp_to_crm()).unwrap();

        let input = json!({
            "projectNumber": "P-1",
            "status": "Active",
            "customerId": "CUST001",
        });
        let output = transformer
            .transform_request(&input, "erp.project", "crm.project")
            .await
            .unwrap();

        assert_eq!(
            output,
            json!({
                "name": "P-1",
                "statuscode": "1",
                "customerid": "account-guid-001",
            })
        );
    }

    #[tokio::test]
    async fn test_missing_mapping_passes_through() {
        let transformer = transformer().await;
        let input = json!({ "untouched": true });
        let output = transformer
            .transform_request(&input, "a", "b")
            .await
            .unwrap();
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn test_inactive_mapping_passes_through() {
        let transformer = transformer().await;
        let mut mapping = erp_to_crm();
        mapping.active = false;
        transformer.register_mapping(mapping).unwrap();

        let input = json!({ "projectNumber": "P-1" });
        let output = transformer
            .transform_request(&input, "erp.project", "crm.project")
            .await
            .unwrap();
        assert_eq!(output, input);
        assert!(!transformer.has_mapping("erp.project", "crm.project"));
    }

    #[tokio::test]
    async fn test_required_null_aborts() {
        let transformer = transformer().await;
        let mut mapping = erp_to_crm();
        mapping.fields[0].required = true;
        transformer.register_mapping(mapping).unwrap();

        let input = json!({ "status": "Active", "customerId": "CUST001" });
        let err = transformer
            .transform_request(&input, "erp.project", "crm.project")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transform { .. }));
    }

    #[tokio::test]
    async fn test_default_fills_null() {
        let transformer = transformer().await;
        let mut mapping = erp_to_crm();
        mapping.fields[1].default_value = Some(json!("0"));
        transformer.register_mapping(mapping).unwrap();

        let input = json!({ "projectNumber": "P-2", "customerId": "CUST001" });
        let output = transformer
            .transform_request(&input, "erp.project", "crm.project")
            .await
            .unwrap();
        assert_eq!(output["statuscode"], json!("0"));
    }

    #[tokio::test]
    async fn test_map_miss_passes_through() {
        let transformer = transformer().await;
        transformer.register_mapping(erp_to_crm()).unwrap();

        let input = json!({
            "projectNumber": "P-3",
            "status": "Paused",
            "customerId": "CUST001",
        });
        let output = transformer
            .transform_request(&input, "erp.project", "crm.project")
            .await
            .unwrap();
        assert_eq!(output["statuscode"], json!("Paused"));
    }

    #[tokio::test]
    async fn test_constant_computed_and_concat() {
        let transformer = transformer().await;
        transformer
            .register_mapping(SchemaMapping {
                source: "in".to_string(),
                target: "out".to_string(),
                fields: vec![
                    field(
                        "origin",
                        "$",
                        "$.origin",
                        FieldOperator::Constant {
                            value: "gateway".to_string(),
                        },
                    ),
                    field(
                        "expr",
                        "$",
                        "$.expr",
                        FieldOperator::Computed {
                            expression: "$.first".to_string(),
                        },
                    ),
                    field(
                        "fullName",
                        "$",
                        "$.fullName",
                        FieldOperator::Concat {
                            template: "$.first $.last".to_string(),
                        },
                    ),
                ],
                active: true,
            })
            .unwrap();

        let input = json!({ "first": "Ada", "last": "Lovelace" });
        let output = transformer
            .transform_request(&input, "in", "out")
            .await
            .unwrap();

        assert_eq!(output["origin"], json!("gateway"));
        // Computed emits the expression literal by default
        assert_eq!(output["expr"], json!("$.first"));
        assert_eq!(output["fullName"], json!("Ada Lovelace"));
    }

    #[tokio::test]
    async fn test_format_operator() {
        let transformer = transformer().await;
        transformer
            .register_mapping(SchemaMapping {
                source: "in".to_string(),
                target: "out".to_string(),
                fields: vec![
                    field(
                        "day",
                        "$.when",
                        "$.day",
                        FieldOperator::Format {
                            format: "%Y-%m-%d".to_string(),
                        },
                    ),
                    field(
                        "amount",
                        "$.amount",
                        "$.amount",
                        FieldOperator::Format {
                            format: "0.00".to_string(),
                        },
                    ),
                    field(
                        "passthrough",
                        "$.note",
                        "$.note",
                        FieldOperator::Format {
                            format: "0.00".to_string(),
                        },
                    ),
                ],
                active: true,
            })
            .unwrap();

        let input = json!({
            "when": "2024-01-02T03:04:05Z",
            "amount": "12.3456",
            "note": "not a number",
        });
        let output = transformer
            .transform_request(&input, "in", "out")
            .await
            .unwrap();

        assert_eq!(output["day"], json!("2024-01-02"));
        assert_eq!(output["amount"], json!("12.35"));
        assert_eq!(output["note"], json!("not a number"));
    }

    #[tokio::test]
    async fn test_direct_round_trip_is_bijective() {
        let transformer = transformer().await;
        transformer
            .register_mapping(SchemaMapping {
                source: "a".to_string(),
                target: "b".to_string(),
                fields: vec![
                    field("x", "$.x", "$.inner.x", FieldOperator::Direct),
                    field("y", "$.y", "$.inner.y", FieldOperator::Direct),
                ],
                active: true,
            })
            .unwrap();
        transformer
            .register_mapping(SchemaMapping {
                source: "b".to_string(),
                target: "a".to_string(),
                fields: vec![
                    field("x", "$.inner.x", "$.x", FieldOperator::Direct),
                    field("y", "$.inner.y", "$.y", FieldOperator::Direct),
                ],
                active: true,
            })
            .unwrap();

        let original = json!({ "x": 1, "y": ["a", "b"] });
        let forward = transformer.transform_request(&original, "a", "b").await.unwrap();
        let back = transformer.transform_request(&forward, "b", "a").await.unwrap();
        assert_eq!(back, original);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_paths() {
        let transformer = transformer().await;
        let err = transformer.register_mapping(SchemaMapping {
            source: "a".to_string(),
            target: "b".to_string(),
            fields: vec![field("x", "x.y", "$.x", FieldOperator::Direct)],
            active: true,
        });
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_unregister_mapping() {
        let transformer = transformer().await;
        transformer.register_mapping(erp_to_crm()).unwrap();
        assert!(transformer.has_mapping("erp.project", "crm.project"));
        assert!(transformer.unregister_mapping("erp.project", "crm.project"));
        assert!(!transformer.has_mapping("erp.project", "crm.project"));
    }
}
