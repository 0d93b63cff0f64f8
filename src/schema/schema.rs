use std::collections::HashMap;
use serde_json::Value;
use crate::core::decimal::Decimal;
use crate::core::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Number,
    Decimal,   // JSON number or decimal string
    Boolean,
    Array,
    Object,
}

/// Constraint on one (possibly nested) field of a document body.
///
/// `path` segments are separated by `.`; a segment ending in `[]` applies
/// the rest of the path to every element of that array.
#[derive(Debug, Clone)]
pub struct FieldDefinition {
    pub path: String,
    pub field_type: FieldType,
    pub required: bool,
    pub min: Option<Decimal>,
}

impl FieldDefinition {
    pub fn required(path: &str, field_type: FieldType) -> Self {
        FieldDefinition {
            path: path.to_string(),
            field_type,
            required: true,
            min: None,
        }
    }

    pub fn optional(path: &str, field_type: FieldType) -> Self {
        FieldDefinition {
            required: false,
            ..FieldDefinition::required(path, field_type)
        }
    }

    pub fn with_min(mut self, min: Decimal) -> Self {
        self.min = Some(min);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CollectionSchema {
    pub collection: String,
    pub fields: Vec<FieldDefinition>,
}

impl CollectionSchema {
    pub fn new(collection: &str) -> Self {
        CollectionSchema {
            collection: collection.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, definition: FieldDefinition) -> Self {
        self.fields.push(definition);
        self
    }

    pub fn validate(&self, body: &Value) -> Result<()> {
        if !body.is_object() {
            return Err(Error::validation(format!(
                "{} document body must be an object",
                self.collection
            )));
        }
        for field in &self.fields {
            let segments: Vec<&str> = field.path.split('.').collect();
            check_path(body, &segments, field, &self.collection, "")?;
        }
        Ok(())
    }
}

fn check_path(value: &Value, segments: &[&str], field: &FieldDefinition, collection: &str, at: &str) -> Result<()> {
    let Some((head, rest)) = segments.split_first() else {
        return check_value(value, field, collection, at);
    };

    let (name, fan_out) = match head.strip_suffix("[]") {
        Some(name) => (name, true),
        None => (*head, false),
    };
    let here = if at.is_empty() { name.to_string() } else { format!("{}.{}", at, name) };

    let child = match value.get(name) {
        Some(Value::Null) | None => {
            if field.required {
                return Err(Error::validation(format!("{}: missing required field '{}'", collection, here)));
            }
            return Ok(());
        }
        Some(child) => child,
    };

    if !fan_out {
        return check_path(child, rest, field, collection, &here);
    }

    let Value::Array(items) = child else {
        return Err(Error::validation(format!("{}: '{}' must be an array", collection, here)));
    };
    for (i, item) in items.iter().enumerate() {
        check_path(item, rest, field, collection, &format!("{}[{}]", here, i))?;
    }
    Ok(())
}

fn check_value(value: &Value, field: &FieldDefinition, collection: &str, at: &str) -> Result<()> {
    let type_error = || {
        Error::validation(format!("{}: '{}' must be {:?}, got {}", collection, at, field.field_type, value))
    };

    let numeric = match field.field_type {
        FieldType::Text => return if value.is_string() { Ok(()) } else { Err(type_error()) },
        FieldType::Boolean => return if value.is_boolean() { Ok(()) } else { Err(type_error()) },
        FieldType::Array => return if value.is_array() { Ok(()) } else { Err(type_error()) },
        FieldType::Object => return if value.is_object() { Ok(()) } else { Err(type_error()) },
        FieldType::Integer => {
            let i = value.as_i64().ok_or_else(type_error)?;
            Decimal::from_i64(i).map_err(|_| type_error())?
        }
        FieldType::Number => {
            let n = value.as_f64().ok_or_else(type_error)?;
            Decimal::from_f64(n).map_err(|_| type_error())?
        }
        FieldType::Decimal => serde_json::from_value::<Decimal>(value.clone()).map_err(|_| type_error())?,
    };

    if let Some(min) = field.min {
        if numeric < min {
            return Err(Error::validation(format!(
                "{}: '{}' is {}, below the minimum of {}",
                collection, at, numeric, min
            )));
        }
    }
    Ok(())
}

/// Collection name to schema lookup used by the document store.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, CollectionSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry::default()
    }

    pub fn register(&mut self, schema: CollectionSchema) {
        self.schemas.insert(schema.collection.clone(), schema);
    }

    /// Collections without a registered schema accept any object body.
    pub fn validate(&self, collection: &str, body: &Value) -> Result<()> {
        if collection.is_empty() {
            return Err(Error::validation("collection name must not be empty"));
        }
        match self.schemas.get(collection) {
            Some(schema) => schema.validate(body),
            None if body.is_object() => Ok(()),
            None => Err(Error::validation(format!("{} document body must be an object", collection))),
        }
    }
}
