//! Path selectors over JSON documents
//!
//! Paths are `$`-rooted and descend with `.field` or numeric array indices:
//! `$.order.lines.0.sku`. Unsupported constructs are rejected when a path is
//! parsed, which mapping registration does up front.

use serde_json::Value;

use crate::error::{Error, Result};

/// One step of a parsed path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed, validated path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parse a `$`-rooted dotted path
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw.strip_prefix('$').ok_or_else(|| Error::Transform {
            path: raw.to_string(),
            message: "Path must start with '$'".to_string(),
        })?;

        let mut segments = Vec::new();
        if !rest.is_empty() {
            let rest = rest.strip_prefix('.').ok_or_else(|| Error::Transform {
                path: raw.to_string(),
                message: "Expected '.' after '$'".to_string(),
            })?;

            for part in rest.split('.') {
                if part.is_empty() {
                    return Err(Error::Transform {
                        path: raw.to_string(),
                        message: "Empty path segment".to_string(),
                    });
                }
                if part.chars().all(|c| c.is_ascii_digit()) {
                    segments.push(Segment::Index(part.parse().map_err(|_| {
                        Error::Transform {
                            path: raw.to_string(),
                            message: format!("Index '{}' is out of range", part),
                        }
                    })?));
                } else if part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                {
                    segments.push(Segment::Key(part.to_string()));
                } else {
                    return Err(Error::Transform {
                        path: raw.to_string(),
                        message: format!("Unsupported path segment '{}'", part),
                    });
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The original path text
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Read the value at this path, if present
    pub fn get<'a>(&self, document: &'a Value) -> Option<&'a Value> {
        let mut current = document;
        for segment in &self.segments {
            current = match segment {
                Segment::Key(key) => current.get(key)?,
                Segment::Index(index) => current.get(index)?,
            };
        }
        Some(current)
    }

    /// Write a value at this path
    ///
    /// Missing intermediate containers are created (objects for keys, arrays
    /// for indices). Array writes may overwrite an existing slot or append at
    /// the current length; skipping past the end is an error.
    pub fn set(&self, document: &mut Value, value: Value) -> Result<()> {
        if self.segments.is_empty() {
            *document = value;
            return Ok(());
        }

        let mut current = document;
        for (position, segment) in self.segments.iter().enumerate() {
            let last = position == self.segments.len() - 1;
            match segment {
                Segment::Key(key) => {
                    if !current.is_object() {
                        if current.is_null() {
                            *current = Value::Object(serde_json::Map::new());
                        } else {
                            return Err(self.write_error(format!(
                                "Cannot descend into {} with key '{}'",
                                kind_of(current),
                                key
                            )));
                        }
                    }
                    let object = current.as_object_mut().expect("checked above");
                    if last {
                        object.insert(key.clone(), value);
                        return Ok(());
                    }
                    current = object.entry(key.clone()).or_insert(Value::Null);
                }
                Segment::Index(index) => {
                    if !current.is_array() {
                        if current.is_null() {
                            *current = Value::Array(Vec::new());
                        } else {
                            return Err(self.write_error(format!(
                                "Cannot index into {} with {}",
                                kind_of(current),
                                index
                            )));
                        }
                    }
                    let array = current.as_array_mut().expect("checked above");
                    if *index > array.len() {
                        return Err(self.write_error(format!(
                            "Index {} is past the end of an array of length {}",
                            index,
                            array.len()
                        )));
                    }
                    if *index == array.len() {
                        array.push(Value::Null);
                    }
                    if last {
                        array[*index] = value;
                        return Ok(());
                    }
                    current = &mut array[*index];
                }
            }
        }

        unreachable!("loop returns on the last segment")
    }

    fn write_error(&self, message: String) -> Error {
        Error::Transform {
            path: self.raw.clone(),
            message,
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
