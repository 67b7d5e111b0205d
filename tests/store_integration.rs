//! Vector store integration tests: atomic replace, hybrid search, stats

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use skema::chunk::{ObjectType, SchemaChunk};
use skema::store::{SearchOptions, StoreConfig, VectorStore};

fn unit(index: usize, dimension: usize) -> Vec<f32> {
    let mut v = vec![0.0; dimension];
    v[index] = 1.0;
    v
}

#[allow(clippy::too_many_arguments)]
fn chunk(
    id: &str,
    object_type: ObjectType,
    name: &str,
    content: &str,
    summary: &str,
    embedding: Vec<f32>,
    indexed_at_secs: i64,
) -> SchemaChunk {
    SchemaChunk {
        id: id.to_string(),
        source_id: "db1".to_string(),
        object_type,
        object_name: name.to_string(),
        schema_name: "dbo".to_string(),
        content: content.to_string(),
        summary: summary.to_string(),
        embedding,
        indexed_at: Utc.timestamp_opt(indexed_at_secs, 0).unwrap(),
    }
}

fn store(temp: &TempDir) -> VectorStore {
    VectorStore::new(StoreConfig::new(temp.path().join("data"))).unwrap()
}

fn sample_chunks() -> Vec<SchemaChunk> {
    vec![
        chunk(
            "a",
            ObjectType::Table,
            "Orders",
            "Table dbo.Orders\nColumns: Id (int) PK; CustomerId (int)",
            "Orders placed by customers.",
            unit(0, 4),
            1_700_000_000,
        ),
        chunk(
            "b",
            ObjectType::Table,
            "Customers",
            "Table dbo.Customers\nColumns: Id (int) PK; Email (nvarchar, nullable)",
            "Customer master data.",
            unit(1, 4),
            1_700_000_000,
        ),
        chunk(
            "c",
            ObjectType::StoredProcedure,
            "GetOrderTotal",
            "Stored procedure dbo.GetOrderTotal\nParameters: OrderId (int, IN)\n\nDefinition:\nSELECT SUM(Amount)",
            "Computes the total amount of one order.",
            unit(2, 4),
            1_700_000_100,
        ),
    ]
}

#[tokio::test]
async fn test_replace_all_is_atomic_snapshot() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);

    let v1 = vec![
        chunk("a", ObjectType::Table, "Old1", "Table dbo.Old1", "", unit(0, 4), 1),
        chunk("b", ObjectType::Table, "Old2", "Table dbo.Old2", "", unit(1, 4), 1),
    ];
    store.replace_all("db1", &v1).await.unwrap();

    let v2 = vec![chunk(
        "c",
        ObjectType::View,
        "Fresh",
        "View dbo.Fresh",
        "",
        unit(2, 4),
        2,
    )];
    store.replace_all("db1", &v2).await.unwrap();

    let all = store.get_all("db1", 100).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, "c");
    assert_eq!(all[0].object_name, "Fresh");

    // The lexical index was rebuilt too: old content no longer matches
    let results = store
        .search(
            "db1",
            &unit(2, 4),
            &SearchOptions::new(10).with_query_text("Old1"),
        )
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.chunk.id == "c"));
}

#[tokio::test]
async fn test_get_all_respects_limit() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    store.replace_all("db1", &sample_chunks()).await.unwrap();

    assert_eq!(store.get_all("db1", 2).await.unwrap().len(), 2);
    assert_eq!(store.get_all("db1", 100).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_missing_source_is_empty_not_error() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);

    assert!(store.get_all("ghost", 10).await.unwrap().is_empty());
    assert!(store
        .search("ghost", &unit(0, 4), &SearchOptions::new(10))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(store.stats("ghost").await.unwrap().total_chunks, 0);
    store.clear("ghost").await.unwrap();
}

#[tokio::test]
async fn test_vector_only_search_ranks_by_similarity() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    store.replace_all("db1", &sample_chunks()).await.unwrap();

    let results = store
        .search("db1", &unit(2, 4), &SearchOptions::new(2))
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].chunk.id, "c");
    assert!((results[0].score - 1.0).abs() < 1e-6);
    assert!(results[0].score > results[1].score);
}

#[tokio::test]
async fn test_hybrid_search_boosts_lexical_match() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    store.replace_all("db1", &sample_chunks()).await.unwrap();

    // The query vector points at Orders, but the query text names the
    // procedure; fusion must rank the procedure at least as a strong result
    let results = store
        .search(
            "db1",
            &unit(0, 4),
            &SearchOptions::new(3).with_query_text("GetOrderTotal"),
        )
        .await
        .unwrap();

    assert!(!results.is_empty());
    let ids: Vec<&str> = results.iter().map(|r| r.chunk.id.as_str()).collect();
    assert!(ids.contains(&"c"), "lexical match missing from fusion: {:?}", ids);
    assert!(ids.contains(&"a"), "semantic match missing from fusion: {:?}", ids);
}

#[tokio::test]
async fn test_hybrid_falls_back_when_lexical_finds_nothing() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    store.replace_all("db1", &sample_chunks()).await.unwrap();

    let vector_only = store
        .search("db1", &unit(1, 4), &SearchOptions::new(2))
        .await
        .unwrap();
    let fallback = store
        .search(
            "db1",
            &unit(1, 4),
            &SearchOptions::new(2).with_query_text("zzzqqq nonexistent"),
        )
        .await
        .unwrap();

    let ids = |results: &[skema::store::ScoredChunk]| {
        results.iter().map(|r| r.chunk.id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&vector_only), ids(&fallback));
    assert_eq!(fallback[0].chunk.id, "b");
}

#[tokio::test]
async fn test_type_filter_narrows_results() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    store.replace_all("db1", &sample_chunks()).await.unwrap();

    let results = store
        .search(
            "db1",
            &unit(0, 4),
            &SearchOptions::new(10).with_type_filter(ObjectType::StoredProcedure),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.id, "c");
}

#[tokio::test]
async fn test_stats_full_scan() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);

    let mut chunks = sample_chunks();
    chunks[1].summary = String::new();
    chunks[2].embedding = Vec::new();
    store.replace_all("db1", &chunks).await.unwrap();

    let stats = store.stats("db1").await.unwrap();
    assert_eq!(stats.total_chunks, 3);
    assert_eq!(stats.table_chunks, 2);
    assert_eq!(stats.procedure_chunks, 1);
    assert_eq!(stats.view_chunks, 0);
    assert_eq!(stats.function_chunks, 0);
    assert_eq!(stats.chunks_with_summary, 2);
    assert_eq!(stats.chunks_with_embedding, 2);
    assert_eq!(
        stats.last_indexed_at,
        Some(Utc.timestamp_opt(1_700_000_100, 0).unwrap())
    );
}

#[tokio::test]
async fn test_clear_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    store.replace_all("db1", &sample_chunks()).await.unwrap();

    store.clear("db1").await.unwrap();
    store.clear("db1").await.unwrap();

    assert!(store.get_all("db1", 10).await.unwrap().is_empty());
    assert_eq!(store.stats("db1").await.unwrap().total_chunks, 0);
    assert!(store.list_sources().unwrap().is_empty());
}

#[tokio::test]
async fn test_collections_are_isolated_per_source() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);

    store.replace_all("prod", &sample_chunks()).await.unwrap();
    let mut other = sample_chunks();
    other.truncate(1);
    other[0].id = "x".to_string();
    store.replace_all("staging", &other).await.unwrap();

    assert_eq!(store.get_all("prod", 10).await.unwrap().len(), 3);
    assert_eq!(store.get_all("staging", 10).await.unwrap().len(), 1);
    assert_eq!(
        store.list_sources().unwrap(),
        vec!["prod".to_string(), "staging".to_string()]
    );

    store.clear("staging").await.unwrap();
    assert_eq!(store.get_all("prod", 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_chunk_round_trip_preserves_fields() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    store.replace_all("db1", &sample_chunks()).await.unwrap();

    let all = store.get_all("db1", 10).await.unwrap();
    let orders = all.iter().find(|c| c.id == "a").unwrap();

    assert_eq!(orders.source_id, "db1");
    assert_eq!(orders.object_type, ObjectType::Table);
    assert_eq!(orders.qualified_name(), "dbo.Orders");
    assert_eq!(orders.summary, "Orders placed by customers.");
    assert_eq!(orders.embedding, unit(0, 4));
    assert_eq!(
        orders.indexed_at,
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    );
}
