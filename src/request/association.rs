//! Batched association resolution ("preload").

use std::collections::{BTreeSet, HashMap};

use super::AsyncRequest;
use crate::db::RecordId;
use crate::error::{Error, Result};
use crate::model::Record;

/// A request value whose records can carry resolved associations.
///
/// Implemented for the shapes model requests deliver; the shape is kept
/// when the association stage hands the value on.
pub trait Associable: Send + 'static {
  /// Referenced ids, one per record slot.
  fn foreign_ids(&self, field: &str) -> Vec<Option<RecordId>>;

  /// Attach the resolved target (or `None`) to every record.
  fn attach_resolved(&mut self, field: &str, attach_as: &str, resolved: &HashMap<RecordId, Record>);
}

fn attach_one(record: &mut Record, field: &str, attach_as: &str, resolved: &HashMap<RecordId, Record>) {
  let target = record
    .foreign_id(field)
    .and_then(|id| resolved.get(&id))
    .cloned();
  if target.is_none() && record.foreign_id(field).is_some() {
    tracing::warn!(
      table = %record.definition().table,
      field,
      id = ?record.foreign_id(field),
      "association references a missing record"
    );
  }
  record.attach(attach_as, target);
}

impl Associable for Record {
  fn foreign_ids(&self, field: &str) -> Vec<Option<RecordId>> {
    vec![self.foreign_id(field)]
  }

  fn attach_resolved(&mut self, field: &str, attach_as: &str, resolved: &HashMap<RecordId, Record>) {
    attach_one(self, field, attach_as, resolved);
  }
}

impl Associable for Option<Record> {
  fn foreign_ids(&self, field: &str) -> Vec<Option<RecordId>> {
    self.iter().map(|r| r.foreign_id(field)).collect()
  }

  fn attach_resolved(&mut self, field: &str, attach_as: &str, resolved: &HashMap<RecordId, Record>) {
    if let Some(record) = self {
      attach_one(record, field, attach_as, resolved);
    }
  }
}

impl Associable for Vec<Record> {
  fn foreign_ids(&self, field: &str) -> Vec<Option<RecordId>> {
    self.iter().map(|r| r.foreign_id(field)).collect()
  }

  fn attach_resolved(&mut self, field: &str, attach_as: &str, resolved: &HashMap<RecordId, Record>) {
    for record in self.iter_mut() {
      attach_one(record, field, attach_as, resolved);
    }
  }
}

impl Associable for Vec<Option<Record>> {
  fn foreign_ids(&self, field: &str) -> Vec<Option<RecordId>> {
    self
      .iter()
      .map(|r| r.as_ref().and_then(|r| r.foreign_id(field)))
      .collect()
  }

  fn attach_resolved(&mut self, field: &str, attach_as: &str, resolved: &HashMap<RecordId, Record>) {
    for record in self.iter_mut().flatten() {
      attach_one(record, field, attach_as, resolved);
    }
  }
}

impl<T: Associable> AsyncRequest<T> {
  /// Add a stage that resolves `field` into the associated record for every
  /// delivered record, with one batched load of the target entity.
  ///
  /// Fails immediately when the request carries no entity definition, the
  /// field is unknown, or the field has no association.
  pub fn attach_association(self, field: &str) -> Result<Self> {
    let definition = self.definition().ok_or_else(|| {
      Error::configuration(format!(
        "cannot attach {}: request is not bound to an entity",
        field
      ))
    })?;
    let field_def = definition.field(field).ok_or_else(|| {
      Error::configuration(format!(
        "the field {} is not part of the {} definition",
        field, definition.table
      ))
    })?;
    let association = field_def.association.clone().ok_or_else(|| {
      Error::configuration(format!(
        "the field {} on {} has no association target",
        field, definition.table
      ))
    })?;

    let field = field.to_string();
    Ok(self.add_async_stage(move |mut value: T| async move {
      let ids: Vec<RecordId> = value
        .foreign_ids(&field)
        .into_iter()
        .flatten()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

      let mut resolved = HashMap::with_capacity(ids.len());
      if !ids.is_empty() {
        let loaded = association.target.fetch_many(&ids).await?;
        for record in loaded.into_iter().flatten() {
          if let Some(id) = record.id() {
            resolved.insert(id, record);
          }
        }
      }

      value.attach_resolved(&field, &association.attach_as, &resolved);
      Ok(value)
    }))
  }
}
