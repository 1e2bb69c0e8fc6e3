mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use cachedmodel::cache::CacheConfig;
use cachedmodel::model::FieldDefinition;
use cachedmodel::{
  CacheStore, CachedModel, EntityDefinition, Error, FieldType, InMemoryCacheStore, Model, RecordId,
};
use common::CountingBackend;

fn lowercase(value: Value) -> Value {
  match value {
    Value::String(s) => Value::String(s.trim().to_lowercase()),
    other => other,
  }
}

async fn users_with(definition: Arc<EntityDefinition>) -> (CachedModel, Arc<InMemoryCacheStore>) {
  let db = CountingBackend::new().await;
  let cache = Arc::new(InMemoryCacheStore::new());
  let users = CachedModel::new(
    Model::new(definition, db),
    cache.clone(),
    &CacheConfig::default(),
  );
  (users, cache)
}

#[tokio::test]
async fn test_set_transform_applies_and_marks_dirty() {
  let definition = EntityDefinition::builder("user")
    .field(FieldDefinition::new("id", FieldType::Id))
    .field(FieldDefinition::new("name", FieldType::String))
    .field(FieldDefinition::new("email", FieldType::Email).set_with(lowercase))
    .build()
    .unwrap();
  let (users, cache) = users_with(definition).await;

  let mut user = users.create();
  user.set("name", "Ada").set("email", "  Ada@Example.COM ");
  assert_eq!(user.get_str("email"), Some("ada@example.com"));
  assert_eq!(user.get_str("name"), Some("Ada"));

  let saved = users.save(user).await.unwrap();
  let hash = cache.hgetall("models:user:1").await.unwrap().unwrap();
  assert_eq!(hash.get("email").map(String::as_str), Some("ada@example.com"));

  let loaded = users.load_by_id(saved.id().unwrap()).await.unwrap().unwrap();
  assert_eq!(loaded.get_str("email"), Some("ada@example.com"));
}

#[tokio::test]
async fn test_save_hook_runs_after_persist() {
  let saves = Arc::new(AtomicUsize::new(0));
  let seen = saves.clone();
  let definition = EntityDefinition::builder("user")
    .field(FieldDefinition::new("id", FieldType::Id))
    .field(FieldDefinition::new("name", FieldType::String))
    .field(FieldDefinition::new("email", FieldType::Email).nullable())
    .on_save(move |record, request| {
      assert!(record.id().is_some());
      seen.fetch_add(1, Ordering::SeqCst);
      request.resolve(record);
    })
    .build()
    .unwrap();
  let (users, _cache) = users_with(definition).await;

  let mut user = users.create();
  user.set("name", "grace");
  let saved = users.save(user).await.unwrap();
  assert_eq!(saved.id(), Some(1));
  assert_eq!(saves.load(Ordering::SeqCst), 1);

  // a save with nothing dirty still reaches the hook
  users.save(saved).await.unwrap();
  assert_eq!(saves.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failing_save_hook_fails_the_request() {
  let definition = EntityDefinition::builder("user")
    .field(FieldDefinition::new("id", FieldType::Id))
    .field(FieldDefinition::new("name", FieldType::String))
    .field(FieldDefinition::new("email", FieldType::Email).nullable())
    .on_save(|_, request| request.fail(Error::Request("audit log unavailable".into())))
    .build()
    .unwrap();
  let (users, _cache) = users_with(definition).await;

  let mut user = users.create();
  user.set("name", "linus");
  let result = users.save(user).await;
  assert!(matches!(result, Err(Error::Request(msg)) if msg == "audit log unavailable"));
}

#[tokio::test]
async fn test_delete_hook_receives_old_id() {
  let deleted: Arc<Mutex<Vec<Option<RecordId>>>> = Arc::new(Mutex::new(Vec::new()));
  let seen = deleted.clone();
  let definition = EntityDefinition::builder("user")
    .field(FieldDefinition::new("id", FieldType::Id))
    .field(FieldDefinition::new("name", FieldType::String))
    .field(FieldDefinition::new("email", FieldType::Email).nullable())
    .on_delete(move |id, request| {
      seen.lock().push(id);
      request.resolve(());
    })
    .build()
    .unwrap();
  let (users, cache) = users_with(definition).await;

  let mut user = users.create();
  user.set("name", "barbara");
  let saved = users.save(user).await.unwrap();
  assert!(cache.exists("models:user:1").await.unwrap());

  users.delete(saved).await.unwrap();
  assert_eq!(*deleted.lock(), vec![Some(1)]);
  assert!(!cache.exists("models:user:1").await.unwrap());
}

#[tokio::test]
async fn test_plain_model_runs_hooks() {
  let saves = Arc::new(AtomicUsize::new(0));
  let seen = saves.clone();
  let definition = EntityDefinition::builder("user")
    .field(FieldDefinition::new("id", FieldType::Id))
    .field(FieldDefinition::new("name", FieldType::String).set_with(lowercase))
    .field(FieldDefinition::new("email", FieldType::Email).nullable())
    .on_save(move |record, request| {
      seen.fetch_add(1, Ordering::SeqCst);
      request.resolve(record);
    })
    .build()
    .unwrap();
  let model = Model::new(definition, CountingBackend::new().await);

  let mut user = model.create();
  user.set("name", "KEN");
  let saved = model.save(user).await.unwrap();
  assert_eq!(saved.get_str("name"), Some("ken"));
  assert_eq!(saves.load(Ordering::SeqCst), 1);
}
