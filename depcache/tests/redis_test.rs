//! Tests against a running Redis.
//!
//! Run with: cargo test -- --ignored
//! The destination is read from `REDIS_URL` (default `redis://127.0.0.1:6379/15`).

use depcache::*;
use std::time::Duration;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string())
}

async fn client() -> Client {
    let config = RedisConfig::builder()
        .url(redis_url())
        .dependency_mode(true)
        .build();
    Client::connect(config).await.unwrap()
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_tag_invalidation() {
    let client = client().await;
    let key = unique("user-michael");
    let (tag, other) = (unique("user"), unique("profile"));

    client.set(&key, "{}", &[tag.as_str(), other.as_str()]).await.unwrap();
    assert_eq!(client.dependency_members(&tag).await.unwrap(), vec![key.clone()]);

    assert_eq!(client.kill_by_dependency(&[tag.as_str()]).await.unwrap(), 2);
    assert!(!client.exists(&key).await.unwrap());
    assert_eq!(client.dependency_members(&other).await.unwrap(), vec![key.clone()]);
    assert_eq!(client.kill_by_dependency(&[other.as_str()]).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_lock_handoff() {
    let client = client().await;
    let name = unique("lock");

    assert!(client.write_lock(&name, "s1", 10).await.unwrap());
    assert!(client.write_lock(&name, "s2", 10).await.unwrap_err().is_lock_mismatch());
    assert!(client.release_lock(&name, "s2").await.unwrap_err().is_lock_mismatch());
    assert!(client.release_lock(&name, "s1").await.unwrap());
    assert!(client.write_lock(&name, "s2", 10).await.unwrap());
    assert!(client.release_lock(&name, "s2").await.unwrap());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_lock_refresh() {
    let client = client().await;
    let name = unique("lock");

    assert!(client.write_lock(&name, "s", 1).await.unwrap());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(client.write_lock(&name, "s", 1).await.unwrap());
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(client.exists(&name).await.unwrap());
    client.release_lock(&name, "s").await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_ttl_expiry() {
    let client = client().await;
    let key = unique("ttl");

    client
        .set_with_ttl(&key, "v", Duration::from_secs(2), &[])
        .await
        .unwrap();
    assert_eq!(client.get(&key).await.unwrap(), "v");
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(client.get(&key).await.unwrap_err().is_nil());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_script_reload_after_flush() {
    let client = client().await;
    let tag = unique("tag");
    let key = unique("k");

    let mut conn = client.get_connection().await.unwrap();
    conn.request(&Command::new("SCRIPT").arg("FLUSH")).await.unwrap();
    drop(conn);

    client.set(&key, "v", &[tag.as_str()]).await.unwrap();
    assert_eq!(client.kill_by_dependency(&[tag.as_str()]).await.unwrap(), 2);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_json_round_trip() {
    let client = client().await;
    let key = unique("json");

    client
        .set_json(&key, &vec![1, 2, 3], Some(Duration::from_secs(30)), &[])
        .await
        .unwrap();
    let loaded: Vec<i32> = client.get_json(&key).await.unwrap();
    assert_eq!(loaded, vec![1, 2, 3]);
    client.delete_without_dependency(&[key.as_str()]).await.unwrap();
}
