//! Payload schema registry.
//!
//! Event payloads are free-form JSON objects at the store boundary. When a
//! schema is registered for an event type, every update that carries a
//! payload must validate before the row is touched; types without a schema
//! accept any payload. The registry is built at startup and read-only
//! afterwards.

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// FieldKind
// ---------------------------------------------------------------------------

/// JSON value kinds a schema field can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
    /// Present with any value, including null.
    Any,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::Any => "any",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
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
}

// ---------------------------------------------------------------------------
// SchemaViolation
// ---------------------------------------------------------------------------

/// Why a payload failed validation. Never retried by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("payload is missing required field `{field}`")]
    MissingField { field: String },
    #[error("payload field `{field}` must be {expected}, got {actual}")]
    WrongKind {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("payload carries unknown field `{field}`")]
    UnknownField { field: String },
}

// ---------------------------------------------------------------------------
// PayloadSchema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    kind: FieldKind,
    required: bool,
}

/// Declarative validator for one event type's payload.
///
/// Required fields must be present and match their kind; optional fields
/// must match their kind when present (null counts as absent for optional
/// fields). `deny_unknown_fields` closes the schema to undeclared keys.
#[derive(Debug, Clone, Default)]
pub struct PayloadSchema {
    fields: Vec<FieldSpec>,
    deny_unknown: bool,
}

impl PayloadSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn deny_unknown_fields(mut self) -> Self {
        self.deny_unknown = true;
        self
    }

    pub fn validate(&self, payload: &Map<String, Value>) -> Result<(), SchemaViolation> {
        for field in &self.fields {
            match payload.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(SchemaViolation::MissingField {
                        field: field.name.clone(),
                    });
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    if !field.kind.matches(value) {
                        return Err(SchemaViolation::WrongKind {
                            field: field.name.clone(),
                            expected: field.kind.as_str(),
                            actual: FieldKind::kind_of(value),
                        });
                    }
                }
            }
        }
        if self.deny_unknown {
            for key in payload.keys() {
                if !self.fields.iter().any(|field| field.name == *key) {
                    return Err(SchemaViolation::UnknownField { field: key.clone() });
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SchemaRegistry
// ---------------------------------------------------------------------------

/// Maps event types to their optional payload schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, PayloadSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_type: impl Into<String>, schema: PayloadSchema) {
        self.schemas.insert(event_type.into(), schema);
    }

    pub fn get(&self, event_type: &str) -> Option<&PayloadSchema> {
        self.schemas.get(event_type)
    }

    /// Validate `payload` for `event_type`. A missing schema accepts any
    /// payload.
    pub fn validate(
        &self,
        event_type: &str,
        payload: &Map<String, Value>,
    ) -> Result<(), SchemaViolation> {
        match self.schemas.get(event_type) {
            Some(schema) => schema.validate(payload),
            None => Ok(()),
        }
    }
}
