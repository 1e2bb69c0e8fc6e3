//! In-memory row with dirty tracking.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Number, Value};

use super::definition::{EntityDefinition, FieldType};
use crate::db::{RecordId, Row};

/// One row of an entity.
///
/// Setters record the field in a dirty set so a save only writes what
/// changed. Resolved associations live beside the column values and are
/// never persisted.
#[derive(Clone)]
pub struct Record {
  definition: Arc<EntityDefinition>,
  values: BTreeMap<String, Value>,
  dirty: BTreeSet<String>,
  associations: BTreeMap<String, Option<Record>>,
}

impl Record {
  /// A new, unsaved record with no values.
  pub fn new(definition: Arc<EntityDefinition>) -> Self {
    Self {
      definition,
      values: BTreeMap::new(),
      dirty: BTreeSet::new(),
      associations: BTreeMap::new(),
    }
  }

  /// Build a clean record from a backing-store row.
  pub fn from_row(definition: Arc<EntityDefinition>, row: Row) -> Self {
    let mut values = BTreeMap::new();
    for (column, value) in row {
      let value = match definition.field(&column) {
        Some(field) => coerce(field.field_type, value),
        None => value,
      };
      values.insert(column, value);
    }
    Self {
      definition,
      values,
      dirty: BTreeSet::new(),
      associations: BTreeMap::new(),
    }
  }

  /// Build a clean record from a cached hash, whose values are all strings.
  pub fn from_hash(definition: Arc<EntityDefinition>, hash: HashMap<String, String>) -> Self {
    let row: Row = hash
      .into_iter()
      .map(|(k, v)| (k, Value::String(v)))
      .collect();
    Self::from_row(definition, row)
  }

  pub fn definition(&self) -> &Arc<EntityDefinition> {
    &self.definition
  }

  pub fn id(&self) -> Option<RecordId> {
    self.values.get("id").and_then(as_record_id)
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.values.get(field).filter(|v| !v.is_null())
  }

  pub fn get_str(&self, field: &str) -> Option<&str> {
    self.get(field).and_then(Value::as_str)
  }

  pub fn get_i64(&self, field: &str) -> Option<i64> {
    self.get(field).and_then(as_record_id)
  }

  /// Read a foreign id, accepting both numbers and numeric strings.
  pub fn foreign_id(&self, field: &str) -> Option<RecordId> {
    self.get_i64(field)
  }

  /// Write a value and mark the field dirty. A field with a set transform
  /// stores the transformed value.
  pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
    let field = field.into();
    let mut value = value.into();
    if let Some(transform) = self.definition.field(&field).and_then(|f| f.setter.as_ref()) {
      value = transform(value);
    }
    self.dirty.insert(field.clone());
    self.values.insert(field, value);
    self
  }

  pub fn is_dirty(&self) -> bool {
    !self.dirty.is_empty()
  }

  pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
    self.dirty.iter().map(String::as_str)
  }

  /// Values of the dirty fields, missing ones as null.
  pub fn dirty_row(&self) -> Row {
    self
      .dirty
      .iter()
      .map(|f| (f.clone(), self.values.get(f).cloned().unwrap_or(Value::Null)))
      .collect()
  }

  pub(crate) fn mark_clean(&mut self) {
    self.dirty.clear();
  }

  pub(crate) fn set_id(&mut self, id: Option<RecordId>) {
    match id {
      Some(id) => self.values.insert("id".to_string(), Value::from(id)),
      None => self.values.insert("id".to_string(), Value::Null),
    };
  }

  /// The flattened field map stored as the per-id cache hash. Null fields
  /// are left out; they read back as absent.
  pub fn to_hash(&self) -> Vec<(String, String)> {
    self
      .values
      .iter()
      .filter_map(|(field, value)| {
        let text = match value {
          Value::Null => return None,
          Value::String(s) => s.clone(),
          Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
          Value::Number(n) => n.to_string(),
          other => other.to_string(),
        };
        Some((field.clone(), text))
      })
      .collect()
  }

  pub fn to_row(&self) -> Row {
    self
      .values
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect()
  }

  /// The resolved association, `None` both when unresolved and when the
  /// reference dangles. See [`Record::is_attached`].
  pub fn association(&self, name: &str) -> Option<&Record> {
    self.associations.get(name).and_then(Option::as_ref)
  }

  pub fn is_attached(&self, name: &str) -> bool {
    self.associations.contains_key(name)
  }

  pub(crate) fn attach(&mut self, name: &str, record: Option<Record>) {
    self.associations.insert(name.to_string(), record);
  }
}

impl PartialEq for Record {
  fn eq(&self, other: &Self) -> bool {
    self.definition.table == other.definition.table
      && self.values == other.values
      && self.associations == other.associations
  }
}

impl fmt::Debug for Record {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Record")
      .field("table", &self.definition.table)
      .field("values", &self.values)
      .field("dirty", &self.dirty)
      .field("associations", &self.associations)
      .finish()
  }
}

impl Serialize for Record {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(self.values.len() + self.associations.len()))?;
    for (field, value) in &self.values {
      map.serialize_entry(field, value)?;
    }
    for (name, record) in &self.associations {
      map.serialize_entry(name, record)?;
    }
    map.end()
  }
}

fn as_record_id(value: &Value) -> Option<RecordId> {
  match value {
    Value::Number(n) => n.as_i64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

/// Bring a stored value back to the field's type. Cache hashes hand back
/// strings for everything; unparseable values are left untouched.
fn coerce(field_type: FieldType, value: Value) -> Value {
  let text = match &value {
    Value::String(text) => text,
    Value::Number(n) if field_type == FieldType::Bool => return Value::Bool(n.as_i64() != Some(0)),
    _ => return value,
  };

  match field_type {
    FieldType::Id | FieldType::Int => text
      .trim()
      .parse::<i64>()
      .map(Value::from)
      .unwrap_or(value),
    FieldType::Number => match text.trim().parse::<i64>() {
      Ok(i) => Value::from(i),
      Err(_) => text
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(value),
    },
    FieldType::Bool => match text.as_str() {
      "1" | "true" => Value::Bool(true),
      "0" | "false" => Value::Bool(false),
      _ => value,
    },
    _ => value,
  }
}
