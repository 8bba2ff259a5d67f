//! Integration tests for JSON document persistence.

mod common;

use common::{CORRELATION_ID, Dummy, persistence_config, test_url};
use pg_persistence::persistence::{
    IndexKey, IndexOptions, JsonPostgresPersistence, PagingParams, SchemaManager,
};
use serde_json::{Map, Value, json};

fn define_documents(schema: &mut SchemaManager) {
    schema.ensure_document_table(None, None);
    let index = format!("{}_key", schema.table().table);
    schema.ensure_index(&index, &[IndexKey::asc("(data->'key')")], IndexOptions::default());
}

#[tokio::test]
async fn test_document_crud_operations() {
    let Some(url) = test_url() else { return };

    let table = "dummies_json";
    let mut persistence = JsonPostgresPersistence::<Dummy>::documents(table)
        .with_schema(define_documents);
    persistence.configure(&persistence_config(&url, table));
    persistence.open(CORRELATION_ID).await.unwrap();
    persistence.clear(CORRELATION_ID).await.unwrap();

    let dummy1 = persistence
        .create(CORRELATION_ID, &Dummy::new("A", "Content 1"))
        .await
        .unwrap()
        .unwrap();
    let id1 = dummy1.id.clone().unwrap();
    persistence
        .create(CORRELATION_ID, &Dummy::new("B", "Content 2"))
        .await
        .unwrap();
    persistence
        .create(CORRELATION_ID, &Dummy::new("A", "Content 3"))
        .await
        .unwrap();

    let found = persistence
        .get_one_by_id(CORRELATION_ID, &id1)
        .await
        .unwrap();
    assert_eq!(found, Some(dummy1.clone()));

    let page = persistence
        .get_page_by_filter(
            CORRELATION_ID,
            Some("data->>'key'='A'"),
            &PagingParams::new(Some(0), Some(10), true),
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(page.data.len(), 2);
    assert_eq!(page.total, Some(2));

    // Partial update merges into the stored document
    let updated = persistence
        .update_partially(CORRELATION_ID, &id1, json!({"content": "Merged"}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.key, "A");
    assert_eq!(updated.content.as_deref(), Some("Merged"));

    let mut changed = updated.clone();
    changed.key = "C".to_string();
    let updated = persistence
        .update(CORRELATION_ID, &changed)
        .await
        .unwrap();
    assert_eq!(updated, Some(changed));

    persistence.delete_by_id(CORRELATION_ID, &id1).await.unwrap();
    let count = persistence
        .get_count_by_filter(CORRELATION_ID, Some("data->>'key'='A'"))
        .await
        .unwrap();
    assert_eq!(count, 1);

    persistence.close(CORRELATION_ID).await.unwrap();
}

#[tokio::test]
async fn test_map_entity_partial_update() {
    let Some(url) = test_url() else { return };

    let table = "dummies_json_map";
    let mut persistence = JsonPostgresPersistence::<Map<String, Value>>::documents(table)
        .with_schema(define_documents);
    persistence.configure(&persistence_config(&url, table));
    persistence.open(CORRELATION_ID).await.unwrap();
    persistence.clear(CORRELATION_ID).await.unwrap();

    let item = json!({"id": "1", "a": 1, "b": 2})
        .as_object()
        .cloned()
        .unwrap();
    persistence.set(CORRELATION_ID, &item).await.unwrap();

    let updated = persistence
        .update_partially(CORRELATION_ID, &"1".to_string(), json!({"b": 5}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.get("a"), Some(&json!(1)));
    assert_eq!(updated.get("b"), Some(&json!(5)));

    let stored = persistence
        .get_one_by_id(CORRELATION_ID, &"1".to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, updated);

    // Map entities without an id get a generated one
    let created = persistence
        .create(CORRELATION_ID, &json!({"a": 3}).as_object().cloned().unwrap())
        .await
        .unwrap()
        .unwrap();
    let id = created.get("id").and_then(Value::as_str).unwrap();
    assert_eq!(id.len(), 32);

    // Missing ids are reported as None, not as an error
    let missing = persistence
        .update_partially(CORRELATION_ID, &"missing".to_string(), json!({"b": 1}))
        .await
        .unwrap();
    assert!(missing.is_none());

    persistence.close(CORRELATION_ID).await.unwrap();
}
