mod common;

use common::{user_definition, SCHEMA};

use cachedmodel::{CacheModelConfig, RecordStore, SortSpec, StoreContext};

#[tokio::test]
async fn test_end_to_end_through_context() {
  let config = CacheModelConfig::from_yaml(
    r#"
database:
  sqlite:
    path: ":memory:"
cache:
  mode: builtin
  key_prefix: models
logging:
  level: warn
"#,
  )
  .unwrap();

  let context = StoreContext::connect(&config).await.unwrap();
  context
    .database("default")
    .unwrap()
    .execute_batch(SCHEMA)
    .await
    .unwrap();
  let users = context.cached_model(user_definition()).unwrap();

  let mut aaron = users.create();
  aaron.set("name", "aaron").set("email", "aaron@example.com");
  let aaron = users.save(aaron).await.unwrap();
  let id = aaron.id().unwrap();

  let cache = context.cache("default").unwrap();
  let hash = cache
    .hgetall(&format!("models:user:{}", id))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(hash.get("name").map(String::as_str), Some("aaron"));
  assert_eq!(hash.get("email").map(String::as_str), Some("aaron@example.com"));

  let mut zoe = users.create();
  zoe.set("name", "zoe");
  let zoe = users.save(zoe).await.unwrap();
  users
    .add_to_collection("all", vec![], zoe.id().unwrap())
    .await
    .unwrap();

  let sorted = users
    .cached_sorted_collection(
      "SELECT id FROM user",
      vec![],
      "all",
      SortSpec::by("name").desc(),
    )
    .await
    .unwrap();
  let names: Vec<&str> = sorted.iter().filter_map(|r| r.get_str("name")).collect();
  assert_eq!(names, vec!["zoe", "aaron"]);

  users.delete(aaron).await.unwrap();
  users
    .remove_from_collection("all", vec![], id)
    .await
    .unwrap();
  let remaining = users
    .cached_sorted_collection(
      "SELECT id FROM user",
      vec![],
      "all",
      SortSpec::by("name").desc(),
    )
    .await
    .unwrap();
  assert_eq!(remaining.len(), 1);
  assert!(users.fetch(&serde_json::json!(id), "id").await.unwrap().is_none());
}

#[tokio::test]
async fn test_plain_model_bypasses_cache() {
  let context = StoreContext::connect(&CacheModelConfig::default())
    .await
    .unwrap();
  context
    .database("default")
    .unwrap()
    .execute_batch(SCHEMA)
    .await
    .unwrap();

  let model = context.model(user_definition()).unwrap();
  let mut user = model.create();
  user.set("name", "nia");
  let saved = model.save(user).await.unwrap();

  let cache = context.cache("default").unwrap();
  assert!(!cache.exists("models:user:1").await.unwrap());

  let loaded = model.load_by_id(saved.id().unwrap()).await.unwrap().unwrap();
  assert_eq!(loaded.get_str("name"), Some("nia"));
  let all = model
    .collection("SELECT * FROM user", vec![])
    .await
    .unwrap();
  assert_eq!(all.len(), 1);
}
