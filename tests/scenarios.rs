//! End-to-end behaviour of the dual-state cache through its public API.

use rescache::{
  Cache, CacheError, CacheOptions, Database, DatabaseRegistry, Draft, Patch, RecordId, Refreshed,
  Resource, ResourceActions,
};
use serde_json::{json, Value};

fn todos() -> ResourceActions {
  let cache = Cache::new(Database::open_in_memory("scenarios").unwrap());
  cache.resource("todos", &CacheOptions::default()).unwrap()
}

fn patch(value: Value) -> Patch {
  serde_json::from_value(value).unwrap()
}

fn draft(value: Value) -> Draft {
  serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn store_then_refresh_round_trips() {
  let todos = todos();
  let stored = todos
    .store(draft(json!({"id": "1", "name": "A", "tags": ["x"], "meta": {"n": 1}})))
    .await
    .unwrap();

  let refreshed = todos.refresh(Some(&"1".into())).await.unwrap().into_one();
  assert_eq!(refreshed, Some(stored.clone()));
  assert_eq!(
    serde_json::to_value(&stored).unwrap(),
    json!({"id": "1", "name": "A", "tags": ["x"], "meta": {"n": 1}})
  );
}

#[tokio::test]
async fn update_merges_fields() {
  let todos = todos();
  todos
    .store(draft(json!({"id": 1, "name": "A", "done": false})))
    .await
    .unwrap();
  todos
    .update(&RecordId::Int(1), patch(json!({"done": true})))
    .await
    .unwrap();

  let record = todos.refresh_one(&RecordId::Int(1)).await.unwrap().unwrap();
  assert_eq!(
    serde_json::to_value(&record).unwrap(),
    json!({"id": 1, "name": "A", "done": true})
  );
}

#[tokio::test]
async fn baseline_captured_once_per_sync_cycle() {
  let todos = todos();
  todos.store(draft(json!({"id": "1", "name": "A"}))).await.unwrap();
  todos.sync(&["1".into()]).await.unwrap();

  todos.update(&"1".into(), patch(json!({"name": "B"}))).await.unwrap();
  todos.update(&"1".into(), patch(json!({"name": "C"}))).await.unwrap();
  let entries = todos.get_cache().await.unwrap();
  assert_eq!(
    entries[0].remote,
    Some(Some(Resource::new("1").with_field("name", "A")))
  );

  // A new cycle starts from the synced value.
  todos.sync(&["1".into()]).await.unwrap();
  todos.update(&"1".into(), patch(json!({"name": "D"}))).await.unwrap();
  let entries = todos.get_cache().await.unwrap();
  assert_eq!(
    entries[0].remote,
    Some(Some(Resource::new("1").with_field("name", "C")))
  );
}

#[tokio::test]
async fn destroy_hides_record_until_sync() {
  let todos = todos();
  todos.store(draft(json!({"id": "1", "name": "A"}))).await.unwrap();
  todos.store(draft(json!({"id": "2", "name": "B"}))).await.unwrap();
  todos.sync(&["1".into(), "2".into()]).await.unwrap();

  todos.destroy(&"1".into()).await.unwrap();

  assert_eq!(todos.refresh_one(&"1".into()).await.unwrap(), None);
  let remaining = todos.refresh(None).await.unwrap();
  assert_eq!(
    remaining,
    Refreshed::Many(vec![Resource::new("2").with_field("name", "B")])
  );

  let entries = todos.get_cache().await.unwrap();
  let destroyed = entries.iter().find(|e| e.id == RecordId::from("1")).unwrap();
  assert!(destroyed.is_pending_destroy());
  assert_eq!(
    destroyed.remote,
    Some(Some(Resource::new("1").with_field("name", "A")))
  );

  todos.sync(&["1".into()]).await.unwrap();
  let entries = todos.get_cache().await.unwrap();
  assert!(entries.iter().all(|e| e.id != RecordId::from("1")));
}

#[tokio::test]
async fn concrete_update_and_sync_scenario() {
  let todos = todos();
  todos.store(draft(json!({"id": "1", "name": "A"}))).await.unwrap();
  assert_eq!(
    serde_json::to_value(todos.refresh_one(&"1".into()).await.unwrap()).unwrap(),
    json!({"id": "1", "name": "A"})
  );

  // Acknowledge the creation so the next edit diffs against server state.
  todos.sync(&["1".into()]).await.unwrap();
  todos.update(&"1".into(), patch(json!({"name": "B"}))).await.unwrap();
  assert_eq!(
    serde_json::to_value(todos.get_cache().await.unwrap()).unwrap(),
    json!([{"id": "1", "local": {"id": "1", "name": "B"}, "remote": {"id": "1", "name": "A"}}])
  );

  todos.sync(&["1".into()]).await.unwrap();
  assert_eq!(
    serde_json::to_value(todos.get_cache().await.unwrap()).unwrap(),
    json!([{"id": "1", "local": {"id": "1", "name": "B"}}])
  );
}

#[tokio::test]
async fn literal_store_update_sync_sequence() {
  let todos = todos();
  todos.store(draft(json!({"id": "1", "name": "A"}))).await.unwrap();
  todos.update(&"1".into(), patch(json!({"name": "B"}))).await.unwrap();

  // The server has never seen the record, so its baseline is the tombstone.
  assert_eq!(
    serde_json::to_value(todos.get_cache().await.unwrap()).unwrap(),
    json!([{"id": "1", "local": {"id": "1", "name": "B"}, "remote": null}])
  );

  todos.sync(&["1".into()]).await.unwrap();
  assert_eq!(
    serde_json::to_value(todos.get_cache().await.unwrap()).unwrap(),
    json!([{"id": "1", "local": {"id": "1", "name": "B"}}])
  );
}

#[tokio::test]
async fn working_view_orders_integer_ids_numerically() {
  let todos = todos();
  for id in [2, 10, 1, -5] {
    todos.store(draft(json!({"id": id}))).await.unwrap();
  }
  todos.store(draft(json!({"id": "a"}))).await.unwrap();

  let expected = vec![
    RecordId::Int(-5),
    RecordId::Int(1),
    RecordId::Int(2),
    RecordId::Int(10),
    RecordId::from("a"),
  ];
  let refreshed: Vec<RecordId> = todos
    .refresh_all()
    .await
    .unwrap()
    .into_iter()
    .map(|r| r.id)
    .collect();
  assert_eq!(refreshed, expected);

  let cached: Vec<RecordId> = todos
    .get_cache()
    .await
    .unwrap()
    .into_iter()
    .map(|e| e.id)
    .collect();
  assert_eq!(cached, expected);
}

#[tokio::test]
async fn unsynced_creation_keeps_tombstone_baseline() {
  let todos = todos();
  todos.store(draft(json!({"id": "1", "name": "A"}))).await.unwrap();
  todos.update(&"1".into(), patch(json!({"name": "B"}))).await.unwrap();

  let entries = todos.get_cache().await.unwrap();
  assert!(entries[0].is_pending_create());
  assert_eq!(
    serde_json::to_value(&entries).unwrap(),
    json!([{"id": "1", "local": {"id": "1", "name": "B"}, "remote": null}])
  );
}

#[tokio::test]
async fn batch_destroy_and_query() {
  let todos = todos();
  todos
    .batch_store(vec![
      draft(json!({"id": "1"})),
      draft(json!({"id": "2"})),
      draft(json!({"id": "3"})),
    ])
    .await
    .unwrap();

  todos.batch_destroy(&["1".into(), "2".into()]).await.unwrap();
  let remaining = todos.refresh_all().await.unwrap();
  assert_eq!(remaining, vec![Resource::new("3")]);

  let err = todos.query(&json!({})).await.unwrap_err();
  assert!(matches!(err, CacheError::Unsupported(_)));
}

#[tokio::test]
async fn registry_handles_share_state() {
  let dir = tempfile::tempdir().unwrap();
  let registry = DatabaseRegistry::new(dir.path());
  let options = CacheOptions::default();

  let writer = Cache::new(registry.open("app").unwrap())
    .resource("todos", &options)
    .unwrap();
  writer.store(draft(json!({"id": "1", "name": "A"}))).await.unwrap();

  let reader = Cache::new(registry.open("app").unwrap())
    .resource("todos", &options)
    .unwrap();
  assert_eq!(
    reader.refresh_one(&"1".into()).await.unwrap(),
    Some(Resource::new("1").with_field("name", "A"))
  );

  // Closing drops the registry's handle; reopening reads the file back.
  registry.close_all().unwrap();
  drop(writer);
  drop(reader);
  let reopened = Cache::new(registry.open("app").unwrap())
    .resource("todos", &options)
    .unwrap();
  assert_eq!(reopened.get_cache().await.unwrap().len(), 1);
}
