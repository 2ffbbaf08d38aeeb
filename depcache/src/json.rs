//! JSON values on top of the string commands.

use depcache_redis::ManageConnection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::client::Client;
use crate::error::{CacheError, CacheResult};

impl<M: ManageConnection> Client<M> {
    /// Read and decode a JSON value. A missing key is the nil error.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> CacheResult<T> {
        let raw = self.get_bytes(key).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Encode `value` as JSON and store it, with an optional TTL, linked to
    /// `tags`.
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> CacheResult<()> {
        let payload = serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.store_encoded(key, payload, ttl, tags).await
    }

    /// Return the cached value for `key`, or compute it with `factory` and
    /// cache it.
    ///
    /// With `background_set` enabled the store runs in a spawned task and
    /// its failure is only logged; otherwise it completes before this
    /// returns and its error is reported.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let profile: Profile = client
    ///     .get_or_set_json("profile:23", Some(Duration::from_secs(300)), &["user-23"], || {
    ///         load_profile(23)
    ///     })
    ///     .await?;
    /// ```
    pub async fn get_or_set_json<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        tags: &[&str],
        factory: F,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        match self.get_json(key).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_nil() => debug!(key = key, "Cache miss"),
            Err(CacheError::Deserialization(reason)) => {
                warn!(key = key, reason = %reason, "Discarding undecodable cached value");
            }
            Err(e) => return Err(e),
        }

        let value = factory().await?;
        let payload = serde_json::to_vec(&value).map_err(|e| CacheError::Serialization(e.to_string()))?;

        if self.config().background_set {
            let client = self.clone();
            let key = key.to_string();
            let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
            tokio::spawn(async move {
                let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
                if let Err(e) = client.store_encoded(&key, payload, ttl, &tags).await {
                    warn!(key = %key, error = %e, "Background cache store failed");
                }
            });
        } else {
            self.store_encoded(key, payload, ttl, tags).await?;
        }

        Ok(value)
    }

    async fn store_encoded(
        &self,
        key: &str,
        payload: Vec<u8>,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> CacheResult<()> {
        match ttl {
            Some(ttl) => self.set_with_ttl(key, payload, ttl, tags).await,
            None => self.set(key, payload, tags).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Client;
    use crate::memory::{MemoryManager, MemoryStore};
    use depcache_redis::RedisConfig;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: u32,
        name: String,
    }

    async fn client(store: &MemoryStore, background_set: bool) -> Client<MemoryManager> {
        let config = RedisConfig::builder()
            .url("redis://memory")
            .background_set(background_set)
            .build();
        Client::with_manager(store.manager(), config).await.unwrap()
    }

    fn michael() -> Profile {
        Profile {
            id: 23,
            name: "michael".into(),
        }
    }

    #[tokio::test]
    async fn test_json_round_trip_with_tags() {
        let store = MemoryStore::new();
        let client = client(&store, false).await;

        client.set_json("profile", &michael(), None, &["user-23"]).await.unwrap();
        let loaded: Profile = client.get_json("profile").await.unwrap();
        assert_eq!(loaded, michael());
        assert_eq!(client.dependency_members("user-23").await.unwrap(), vec!["profile"]);
    }

    #[tokio::test]
    async fn test_get_or_set_calls_factory_once() {
        let store = MemoryStore::new();
        let client = client(&store, false).await;
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let profile: Profile = client
                .get_or_set_json("profile", None, &[], || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(michael())
                })
                .await
                .unwrap();
            assert_eq!(profile, michael());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_set_replaces_undecodable_value() {
        let store = MemoryStore::new();
        let client = client(&store, false).await;
        client.set("profile", "not json", &[]).await.unwrap();

        let profile: Profile = client
            .get_or_set_json("profile", None, &[], || async { Ok(michael()) })
            .await
            .unwrap();
        assert_eq!(profile, michael());
        let stored: Profile = client.get_json("profile").await.unwrap();
        assert_eq!(stored, michael());
    }

    #[tokio::test]
    async fn test_background_set_stores_eventually() {
        let store = MemoryStore::new();
        let client = client(&store, true).await;

        let profile: Profile = client
            .get_or_set_json("profile", None, &["user-23"], || async { Ok(michael()) })
            .await
            .unwrap();
        assert_eq!(profile, michael());

        for _ in 0..100 {
            if client.exists("profile").await.unwrap() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let stored: Profile = client.get_json("profile").await.unwrap();
        assert_eq!(stored, michael());
    }

    #[tokio::test]
    async fn test_factory_error_is_returned() {
        let store = MemoryStore::new();
        let client = client(&store, false).await;

        let err = client
            .get_or_set_json::<Profile, _, _>("profile", None, &[], || async {
                Err(crate::CacheError::Serialization("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(!client.exists("profile").await.unwrap());
    }
}
