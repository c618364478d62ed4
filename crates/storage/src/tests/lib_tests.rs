use super::*;
use futures::StreamExt;
use serde_json::json;
use std::time::Duration;

fn profile_path(id: &str) -> DocPath {
    DocPath::new("users", id)
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn writes_bump_version_and_read_back() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let path = profile_path("alice");

    assert!(storage.get(&path).await.expect("get").is_none());
    let first = storage
        .set(&path, json!({"id": "alice", "blocked": []}))
        .await
        .expect("first write");
    let second = storage
        .set(&path, json!({"id": "alice", "blocked": ["bob"]}))
        .await
        .expect("second write");
    assert_eq!(first, 1);
    assert_eq!(second, 2);

    let doc = storage.get(&path).await.expect("get").expect("exists");
    assert_eq!(doc.version, 2);
    assert_eq!(doc.body["blocked"], json!(["bob"]));
}

#[tokio::test]
async fn versioned_write_rejects_stale_token() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let path = profile_path("alice");
    let version = storage.set(&path, json!({"n": 1})).await.expect("seed");

    storage
        .set_if_version(&path, json!({"n": 2}), version)
        .await
        .expect("fresh token applies");

    let err = storage
        .set_if_version(&path, json!({"n": 3}), version)
        .await
        .expect_err("stale token must conflict");
    assert!(matches!(
        err,
        StoreError::Conflict {
            expected: 1,
            actual: 2,
            ..
        }
    ));
    let doc = storage.get(&path).await.expect("get").expect("exists");
    assert_eq!(doc.body, json!({"n": 2}));
}

#[tokio::test]
async fn versioned_write_on_missing_document_is_not_found() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let err = storage
        .set_if_version(&profile_path("ghost"), json!({}), 1)
        .await
        .expect_err("missing");
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn array_union_skips_existing_values_and_remove_drops_all_equal() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let path = profile_path("alice");
    storage
        .set(&path, json!({"blocked": ["bob"]}))
        .await
        .expect("seed");

    storage
        .array_union(&path, "blocked", vec![json!("bob"), json!("carol")])
        .await
        .expect("union");
    let doc = storage.get(&path).await.expect("get").expect("exists");
    assert_eq!(doc.body["blocked"], json!(["bob", "carol"]));

    storage
        .array_remove(&path, "blocked", vec![json!("bob")])
        .await
        .expect("remove");
    let doc = storage.get(&path).await.expect("get").expect("exists");
    assert_eq!(doc.body["blocked"], json!(["carol"]));
}

#[tokio::test]
async fn array_ops_create_missing_field_but_require_document() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let path = DocPath::new("chats", "c1");

    let err = storage
        .array_union(&path, "messages", vec![json!({"id": "m1"})])
        .await
        .expect_err("missing document");
    assert!(matches!(err, StoreError::NotFound(_)));

    storage.set(&path, json!({})).await.expect("seed");
    storage
        .array_union(&path, "messages", vec![json!({"id": "m1"})])
        .await
        .expect("union");
    let doc = storage.get(&path).await.expect("get").expect("exists");
    assert_eq!(doc.body["messages"], json!([{"id": "m1"}]));
}

#[tokio::test]
async fn query_eq_matches_field_value() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .set(&profile_path("a"), json!({"id": "a", "username": "alice"}))
        .await
        .expect("a");
    storage
        .set(&profile_path("b"), json!({"id": "b", "username": "bob"}))
        .await
        .expect("b");

    let found = storage
        .query_eq("users", "username", &json!("bob"))
        .await
        .expect("query");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "b");
}

#[tokio::test]
async fn subscription_delivers_current_state_then_changes() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let path = DocPath::new("chats", "c1");
    storage.set(&path, json!({"messages": []})).await.expect("seed");

    let mut snapshots = storage.subscribe(&path);
    let first = snapshots
        .next()
        .await
        .expect("initial")
        .expect("ok")
        .expect("exists");
    assert_eq!(first.version, 1);

    storage
        .set(&DocPath::new("chats", "other"), json!({}))
        .await
        .expect("unrelated write");
    storage
        .array_union(&path, "messages", vec![json!({"id": "m1"})])
        .await
        .expect("append");

    let second = tokio::time::timeout(Duration::from_secs(2), snapshots.next())
        .await
        .expect("timely")
        .expect("item")
        .expect("ok")
        .expect("exists");
    assert_eq!(second.version, 2);
    assert_eq!(second.body["messages"], json!([{"id": "m1"}]));
}

#[tokio::test]
async fn subscription_reports_absent_document_as_none() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut snapshots = storage.subscribe(&DocPath::new("chats", "nope"));
    let first = snapshots.next().await.expect("initial").expect("ok");
    assert!(first.is_none());
}

#[tokio::test]
async fn uploaded_blob_resolves_under_base_url() {
    let storage = Storage::new("sqlite::memory:")
        .await
        .expect("db")
        .with_blob_base_url("https://cdn.example.test/bucket")
        .expect("base url");

    let blob = storage
        .upload("cat photo.png", b"png-bytes".to_vec())
        .await
        .expect("upload");
    assert!(blob.0.starts_with("images/"));
    assert!(blob.0.ends_with("_cat photo.png"));

    let url = storage.resolve(&blob).await.expect("resolve");
    assert!(url.starts_with("https://cdn.example.test/bucket/images%2F"));
    assert!(url.ends_with("_cat%20photo.png"));

    let bytes = storage.load_blob(&blob.0).await.expect("load").expect("exists");
    assert_eq!(bytes, b"png-bytes");
}

#[tokio::test]
async fn blob_names_cannot_escape_their_url_segment() {
    let storage = Storage::new("sqlite::memory:")
        .await
        .expect("db")
        .with_blob_base_url("https://cdn.example.test/bucket/")
        .expect("base url");

    for name in ["report#2.pdf", "what?.png", "../../etc/passwd"] {
        let blob = storage
            .upload(name, b"bytes".to_vec())
            .await
            .expect("upload");
        let key_name = blob.0.strip_prefix("images/").expect("images prefix");
        assert!(!key_name.contains('/'), "{}", blob.0);

        let resolved = storage.resolve(&blob).await.expect("resolve");
        let url = Url::parse(&resolved).expect("valid url");
        assert_eq!(url.fragment(), None, "{resolved}");
        assert_eq!(url.query(), None, "{resolved}");
        let segments: Vec<&str> = url.path_segments().expect("segments").collect();
        assert_eq!(segments.len(), 2, "{resolved}");
        assert_eq!(segments[0], "bucket");

        let decoded = urlencoding::decode(segments[1]).expect("utf-8");
        assert_eq!(decoded, blob.0);
        let stored = storage.load_blob(&decoded).await.expect("load");
        assert_eq!(stored, Some(b"bytes".to_vec()));
    }
}

#[tokio::test]
async fn resolving_unknown_blob_is_not_found() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let err = storage
        .resolve(&BlobRef("images/missing".into()))
        .await
        .expect_err("missing");
    assert!(matches!(err, StoreError::NotFound(_)));
}
