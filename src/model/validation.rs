//! Field validation run before every save.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

use super::definition::{EntityDefinition, FieldDefinition, FieldType};
use super::record::Record;
use crate::error::ValidationErrors;

/// Validate the dirty fields of `record`. Clean fields were valid when
/// they were loaded and are not checked again.
pub fn validate(definition: &EntityDefinition, record: &Record) -> Result<(), ValidationErrors> {
  let mut errors = ValidationErrors::new();
  let null = Value::Null;

  for name in record.dirty_fields() {
    let Some(field) = definition.field(name) else {
      errors.add(name, "is not part of the model definition");
      continue;
    };

    let value = record.get(name).unwrap_or(&null);
    if let Err(message) = validate_field(field, value) {
      errors.add(name, message);
    }
  }

  if errors.is_empty() {
    Ok(())
  } else {
    Err(errors)
  }
}

pub fn validate_field(field: &FieldDefinition, value: &Value) -> Result<(), String> {
  if value.is_null() {
    if !field.nullable {
      return Err("can not be null".into());
    }
  } else {
    check_type(field, value)?;
  }

  for validator in &field.validators {
    validator(value)?;
  }
  Ok(())
}

fn check_type(field: &FieldDefinition, value: &Value) -> Result<(), String> {
  let length = field.effective_length();

  match field.field_type {
    FieldType::String | FieldType::Email | FieldType::Ip => {
      let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      };
      if exceeds(&text, length) {
        return Err("invalid length".into());
      }
    }
    FieldType::Number | FieldType::Id | FieldType::Int => {
      let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return Err("invalid number".into()),
      };
      let integral = matches!(field.field_type, FieldType::Id | FieldType::Int);
      let parsed = if integral {
        text.parse::<i64>().is_ok()
      } else {
        text.parse::<f64>().map(f64::is_finite).unwrap_or(false)
      };
      if !parsed {
        return Err("invalid number".into());
      }
      if exceeds(&text, length) {
        return Err("invalid length".into());
      }
    }
    FieldType::Date => {
      if !value.as_str().map(is_date).unwrap_or(false) {
        return Err("invalid date".into());
      }
    }
    FieldType::Bool => match value {
      Value::Bool(_) => {}
      Value::Number(n) if matches!(n.as_i64(), Some(0) | Some(1)) => {}
      _ => return Err("invalid boolean".into()),
    },
  }
  Ok(())
}

fn exceeds(text: &str, length: Option<usize>) -> bool {
  length.map(|max| text.chars().count() > max).unwrap_or(false)
}

fn is_date(text: &str) -> bool {
  DateTime::parse_from_rfc3339(text).is_ok()
    || NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").is_ok()
    || NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
}
