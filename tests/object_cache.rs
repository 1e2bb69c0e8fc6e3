mod common;

use common::{fixture, settle};
use serde_json::json;

use cachedmodel::CacheStore;

#[tokio::test]
async fn test_save_then_load_reads_from_cache() {
  let fx = fixture().await;

  let mut user = fx.users.create();
  user.set("name", "aaron");
  let saved = fx.users.save(user).await.unwrap();
  assert_eq!(saved.id(), Some(1));

  let hash = fx.cache.hgetall("models:user:1").await.unwrap().unwrap();
  assert_eq!(hash.get("name").map(String::as_str), Some("aaron"));
  assert_eq!(hash.get("id").map(String::as_str), Some("1"));

  fx.db.reset();
  let loaded = fx.users.load_by_id(1).await.unwrap().unwrap();
  assert_eq!(loaded.get_str("name"), Some("aaron"));
  assert_eq!(fx.db.calls(), 0);
}

#[tokio::test]
async fn test_read_after_write() {
  let fx = fixture().await;
  let ids = fx.seed_users(&["bea"]).await;

  // warm the object cache with the old value
  let mut user = fx.users.load_by_id(ids[0]).await.unwrap().unwrap();
  settle().await;
  assert!(fx.cache.exists("models:user:1").await.unwrap());

  user.set("name", "beatrice");
  fx.users.save(user).await.unwrap();

  let loaded = fx.users.load_by_id(ids[0]).await.unwrap().unwrap();
  assert_eq!(loaded.get_str("name"), Some("beatrice"));
}

#[tokio::test]
async fn test_miss_populates_object_hash() {
  let fx = fixture().await;
  fx.seed_users(&["cy"]).await;

  let first = fx.users.load_by_id(1).await.unwrap().unwrap();
  assert_eq!(fx.db.calls(), 1);
  settle().await;

  fx.db.reset();
  let second = fx.users.load_by_id(1).await.unwrap().unwrap();
  assert_eq!(fx.db.calls(), 0);
  assert_eq!(first, second);
}

#[tokio::test]
async fn test_load_missing_id_is_none() {
  let fx = fixture().await;
  assert!(fx.users.load_by_id(42).await.unwrap().is_none());
  settle().await;
  assert!(!fx.cache.exists("models:user:42").await.unwrap());
}

#[tokio::test]
async fn test_load_many_keeps_input_order() {
  let fx = fixture().await;
  fx.seed_users(&["u1", "u2", "u3", "u4", "u5", "u6", "u7"]).await;

  // one of the two already cached
  fx.users.load_by_id(7).await.unwrap();
  settle().await;
  fx.db.reset();

  let slots = fx.users.load_many(vec![5, 999, 7]).await.unwrap();
  assert_eq!(slots.len(), 3);
  assert_eq!(slots[0].as_ref().and_then(|r| r.get_str("name")), Some("u5"));
  assert!(slots[1].is_none());
  assert_eq!(slots[2].as_ref().and_then(|r| r.get_str("name")), Some("u7"));

  // a single batched query for the two misses
  assert_eq!(fx.db.calls(), 1);
  assert_eq!(fx.db.batches_for("user"), vec![vec![5, 999]]);
}

#[tokio::test]
async fn test_load_many_empty() {
  let fx = fixture().await;
  assert!(fx.users.load_many(Vec::new()).await.unwrap().is_empty());
  assert_eq!(fx.db.calls(), 0);
}

#[tokio::test]
async fn test_load_by_field_caches_mapping() {
  let fx = fixture().await;
  fx.seed_users(&["dora"]).await;

  let user = fx
    .users
    .load_by_field("dora@example.com", "email")
    .await
    .unwrap()
    .unwrap();
  assert_eq!(user.id(), Some(1));
  settle().await;

  assert_eq!(
    fx.cache
      .get("models:user:email:dora@example.com")
      .await
      .unwrap()
      .as_deref(),
    Some("1")
  );

  fx.db.reset();
  let again = fx
    .users
    .load("dora@example.com", "email")
    .await
    .unwrap()
    .unwrap();
  assert_eq!(again.id(), Some(1));
  assert_eq!(fx.db.calls(), 0);
}

#[tokio::test]
async fn test_save_forgets_field_mappings() {
  let fx = fixture().await;
  fx.seed_users(&["eli"]).await;

  let mut user = fx
    .users
    .load_by_field("eli@example.com", "email")
    .await
    .unwrap()
    .unwrap();
  settle().await;

  user.set("email", "eli@elsewhere.org");
  fx.users.save(user).await.unwrap();

  assert!(fx
    .cache
    .get("models:user:email:eli@example.com")
    .await
    .unwrap()
    .is_none());
  assert!(fx
    .users
    .load_by_field("eli@example.com", "email")
    .await
    .unwrap()
    .is_none());
  let moved = fx
    .users
    .load_by_field("eli@elsewhere.org", "email")
    .await
    .unwrap()
    .unwrap();
  assert_eq!(moved.id(), Some(1));
}

#[tokio::test]
async fn test_stale_mapping_falls_back_to_store() {
  let fx = fixture().await;
  fx.seed_users(&["fay", "gus"]).await;

  // a mapping pointing at a record whose email no longer matches
  fx.cache
    .set("models:user:email:gus@example.com", "1", None)
    .await
    .unwrap();

  let user = fx
    .users
    .load_by_field("gus@example.com", "email")
    .await
    .unwrap()
    .unwrap();
  assert_eq!(user.id(), Some(2));
  settle().await;
  assert_eq!(
    fx.cache
      .get("models:user:email:gus@example.com")
      .await
      .unwrap()
      .as_deref(),
    Some("2")
  );
}

#[tokio::test]
async fn test_delete_invalidates() {
  let fx = fixture().await;
  fx.seed_users(&["hal"]).await;

  let user = fx
    .users
    .load_by_field("hal@example.com", "email")
    .await
    .unwrap()
    .unwrap();
  settle().await;
  assert!(fx.cache.exists("models:user:1").await.unwrap());

  fx.users.delete(user).await.unwrap();

  assert!(!fx.cache.exists("models:user:1").await.unwrap());
  assert!(!fx
    .cache
    .exists("models:user:email:hal@example.com")
    .await
    .unwrap());
  assert!(fx.users.load_by_id(1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_validation_error_reaches_dedicated_handler() {
  let fx = fixture().await;

  let mut user = fx.users.create();
  user.set("name", "x".repeat(65));

  let (tx, rx) = tokio::sync::oneshot::channel();
  let _request = fx.users.save(user).on_validation_error(move |errors| {
    let _ = tx.send(errors);
  });

  let errors = rx.await.unwrap();
  assert_eq!(errors.get("name"), Some("invalid length"));
  assert_eq!(fx.db.calls(), 0);
}

#[tokio::test]
async fn test_validation_error_without_handler_is_an_error() {
  let fx = fixture().await;

  let mut user = fx.users.create();
  user.set("name", json!(null));
  let err = fx.users.save(user).await.unwrap_err();
  assert!(err.is_validation());
  assert!(!fx.cache.exists("models:user:1").await.unwrap());
}

#[tokio::test]
async fn test_saving_clean_record_is_a_no_op() {
  let fx = fixture().await;
  fx.seed_users(&["ivy"]).await;

  let user = fx.users.load_by_id(1).await.unwrap().unwrap();
  fx.db.reset();
  let same = fx.users.save(user.clone()).await.unwrap();
  assert_eq!(same, user);
  assert_eq!(fx.db.calls(), 0);
}

#[tokio::test]
async fn test_locate_fills_repeated_ids_from_one_query() {
  let fx = fixture().await;
  fx.seed_users(&["ida", "jo"]).await;
  let model = cachedmodel::Model::new(common::user_definition(), fx.db.clone());

  let slots = model.locate(vec![1, 2, 1, 99, 1]).await.unwrap();
  let got: Vec<Option<&str>> = slots
    .iter()
    .map(|slot| slot.as_ref().and_then(|r| r.get_str("name")))
    .collect();
  assert_eq!(got, vec![Some("ida"), Some("jo"), Some("ida"), None, Some("ida")]);
  assert_eq!(fx.db.batches_for("user"), vec![vec![1, 2, 1, 99, 1]]);
}
