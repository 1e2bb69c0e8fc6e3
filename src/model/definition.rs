//! Static per-entity metadata.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::Record;
use crate::db::sanitize::validate_identifier;
use crate::db::RecordId;
use crate::error::{Error, Result};
use crate::key::{SortDirection, SortSpec};
use crate::model::RecordStore;
use crate::request::AsyncRequest;

/// Semantic type of a field. Drives validation, coercion of cached values,
/// and whether sorted views compare lexically or numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
  Id,
  Int,
  Number,
  String,
  Email,
  Ip,
  Date,
  Bool,
}

impl FieldType {
  /// Length limit applied when the field does not set one.
  pub fn default_length(self) -> Option<usize> {
    match self {
      FieldType::Email => Some(256),
      FieldType::Id => Some(10),
      FieldType::Ip => Some(15),
      _ => None,
    }
  }

  /// Whether cache-side sorting compares values as strings.
  pub fn sorts_alpha(self) -> bool {
    matches!(
      self,
      FieldType::String | FieldType::Email | FieldType::Ip | FieldType::Date
    )
  }
}

pub type CustomValidator = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// Rewrites a value on its way into [`Record::set`].
pub type SetTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Final stage of every save request. Receives the stored record and must
/// resolve or fail the request.
pub type SaveHook = Arc<dyn Fn(Record, AsyncRequest<Record>) + Send + Sync>;

/// Final stage of every delete request. Receives the id the record had.
pub type DeleteHook = Arc<dyn Fn(Option<RecordId>, AsyncRequest<()>) + Send + Sync>;

/// A foreign id field that resolves into another entity.
#[derive(Clone)]
pub struct Association {
  /// Attribute the resolved record is attached under.
  pub attach_as: String,
  pub target: Arc<dyn RecordStore>,
}

#[derive(Clone)]
pub struct FieldDefinition {
  pub name: String,
  pub field_type: FieldType,
  pub nullable: bool,
  pub length: Option<usize>,
  pub validators: Vec<CustomValidator>,
  pub association: Option<Association>,
  pub setter: Option<SetTransform>,
}

impl FieldDefinition {
  pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
    Self {
      name: name.into(),
      field_type,
      nullable: false,
      length: None,
      validators: Vec::new(),
      association: None,
      setter: None,
    }
  }

  pub fn nullable(mut self) -> Self {
    self.nullable = true;
    self
  }

  pub fn length(mut self, length: usize) -> Self {
    self.length = Some(length);
    self
  }

  pub fn validate_with<F>(mut self, validator: F) -> Self
  where
    F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
  {
    self.validators.push(Arc::new(validator));
    self
  }

  /// Transform every value assigned through [`Record::set`]. The field is
  /// still marked dirty. Values loaded from a store are not transformed.
  pub fn set_with<F>(mut self, transform: F) -> Self
  where
    F: Fn(Value) -> Value + Send + Sync + 'static,
  {
    self.setter = Some(Arc::new(transform));
    self
  }

  /// Mark this field as a reference to `target`, attached as `attach_as` on preload.
  pub fn associate(mut self, attach_as: impl Into<String>, target: Arc<dyn RecordStore>) -> Self {
    self.association = Some(Association {
      attach_as: attach_as.into(),
      target,
    });
    self
  }

  pub fn effective_length(&self) -> Option<usize> {
    self.length.or_else(|| self.field_type.default_length())
  }
}

impl fmt::Debug for FieldDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FieldDefinition")
      .field("name", &self.name)
      .field("field_type", &self.field_type)
      .field("nullable", &self.nullable)
      .field("length", &self.length)
      .field("validators", &self.validators.len())
      .field("setter", &self.setter.is_some())
      .field(
        "association",
        &self.association.as_ref().map(|a| {
          format!("{} -> {}", a.attach_as, a.target.definition().table)
        }),
      )
      .finish()
  }
}

/// Table name, fields, named sort presets and lifecycle hooks for one
/// entity type.
pub struct EntityDefinition {
  pub table: String,
  fields: Vec<FieldDefinition>,
  sorts: HashMap<String, SortSpec>,
  on_save: Option<SaveHook>,
  on_delete: Option<DeleteHook>,
}

impl fmt::Debug for EntityDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EntityDefinition")
      .field("table", &self.table)
      .field("fields", &self.fields)
      .field("sorts", &self.sorts)
      .field("on_save", &self.on_save.is_some())
      .field("on_delete", &self.on_delete.is_some())
      .finish()
  }
}

impl EntityDefinition {
  pub fn builder(table: impl Into<String>) -> EntityDefinitionBuilder {
    EntityDefinitionBuilder {
      table: table.into(),
      fields: Vec::new(),
      sorts: HashMap::new(),
      on_save: None,
      on_delete: None,
    }
  }

  pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
    self.fields.iter().find(|f| f.name == name)
  }

  pub fn fields(&self) -> &[FieldDefinition] {
    &self.fields
  }

  pub fn sort(&self, name: &str) -> Option<&SortSpec> {
    self.sorts.get(name)
  }

  /// Append the save hook, if any, as the last stage of `request`.
  pub(crate) fn with_save_hook(&self, request: AsyncRequest<Record>) -> AsyncRequest<Record> {
    match &self.on_save {
      Some(hook) => {
        let hook = hook.clone();
        request.add_stage(move |record, request| hook(record, request))
      }
      None => request,
    }
  }

  /// Append the delete hook, if any, as the last stage of `request`.
  pub(crate) fn with_delete_hook(
    &self,
    request: AsyncRequest<()>,
    id: Option<RecordId>,
  ) -> AsyncRequest<()> {
    match &self.on_delete {
      Some(hook) => {
        let hook = hook.clone();
        request.add_stage(move |(), request| hook(id, request))
      }
      None => request,
    }
  }
}

pub struct EntityDefinitionBuilder {
  table: String,
  fields: Vec<FieldDefinition>,
  sorts: HashMap<String, SortSpec>,
  on_save: Option<SaveHook>,
  on_delete: Option<DeleteHook>,
}

impl EntityDefinitionBuilder {
  pub fn field(mut self, field: FieldDefinition) -> Self {
    self.fields.push(field);
    self
  }

  pub fn sort(mut self, name: impl Into<String>, field: impl Into<String>, direction: SortDirection) -> Self {
    self.sorts.insert(name.into(), SortSpec::new(field, direction));
    self
  }

  pub fn on_save<F>(mut self, hook: F) -> Self
  where
    F: Fn(Record, AsyncRequest<Record>) + Send + Sync + 'static,
  {
    self.on_save = Some(Arc::new(hook));
    self
  }

  pub fn on_delete<F>(mut self, hook: F) -> Self
  where
    F: Fn(Option<RecordId>, AsyncRequest<()>) + Send + Sync + 'static,
  {
    self.on_delete = Some(Arc::new(hook));
    self
  }

  pub fn build(self) -> Result<Arc<EntityDefinition>> {
    validate_identifier(&self.table)
      .map_err(|e| Error::configuration(format!("table {:?}: {}", self.table, e)))?;

    let mut seen = std::collections::HashSet::new();
    for field in &self.fields {
      validate_identifier(&field.name)
        .map_err(|e| Error::configuration(format!("field {:?}: {}", field.name, e)))?;
      if !seen.insert(field.name.as_str()) {
        return Err(Error::configuration(format!(
          "field {} is defined twice on {}",
          field.name, self.table
        )));
      }
    }

    match self.fields.iter().find(|f| f.name == "id") {
      Some(id) if id.field_type == FieldType::Id => {}
      _ => {
        return Err(Error::configuration(format!(
          "{} must define an `id` field of type Id",
          self.table
        )))
      }
    }

    for (name, sort) in &self.sorts {
      if !seen.contains(sort.field.as_str()) {
        return Err(Error::configuration(format!(
          "sort preset {} orders by unknown field {}",
          name, sort.field
        )));
      }
    }

    Ok(Arc::new(EntityDefinition {
      table: self.table,
      fields: self.fields,
      sorts: self.sorts,
      on_save: self.on_save,
      on_delete: self.on_delete,
    }))
  }
}
