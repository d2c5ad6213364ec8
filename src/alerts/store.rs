use crate::error::StoreError;
use crate::BoxFuture;
use chrono::{DateTime, Utc};
use log::info;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Key-value store whose entries expire after a TTL
///
/// Backs the notification silence records. Implementations must be shareable
/// across tasks.
pub trait ExpiringStore: Send + Sync {
    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Store `value` under `key` only if the key is absent; `true` when stored
    ///
    /// The default is a plain exists-then-set. Two concurrent callers can both
    /// see the key as absent and both get `true`; stores with an atomic
    /// primitive override this.
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            if self.exists(key).await? {
                return Ok(false);
            }
            self.set(key, value, ttl).await?;
            Ok(true)
        })
    }
}

/// Redis-backed store using `SET NX EX` for atomic set-if-absent
#[derive(Clone)]
pub struct RedisExpiringStore {
    connection: ConnectionManager,
}

impl RedisExpiringStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        info!("Connected to silence store at {}", url);
        Ok(Self { connection })
    }

    fn ttl_seconds(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

impl ExpiringStore for RedisExpiringStore {
    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            let exists: bool = redis::cmd("EXISTS")
                .arg(key)
                .query_async(&mut connection)
                .await?;
            Ok(exists)
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(Self::ttl_seconds(ttl))
                .query_async(&mut connection)
                .await?;
            Ok(())
        })
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            // Nil reply means the key already existed
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(Self::ttl_seconds(ttl))
                .query_async(&mut connection)
                .await?;
            Ok(reply.is_some())
        })
    }
}

/// In-process store for single-instance deployments and tests
///
/// Expired entries are dropped lazily on access.
#[derive(Debug, Default)]
pub struct InMemoryExpiringStore {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl InMemoryExpiringStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check for a live entry as of `now`
    pub fn exists_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge_expired(&mut entries, now);
        entries.contains_key(key)
    }

    pub fn set_at(&self, key: &str, value: &str, ttl: Duration, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), (value.to_string(), Self::expiry(now, ttl)));
    }

    /// Atomic set-if-absent as of `now`
    pub fn set_if_absent_at(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge_expired(&mut entries, now);
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.to_string(), (value.to_string(), Self::expiry(now, ttl)));
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
    }

    fn purge_expired(entries: &mut HashMap<String, (String, DateTime<Utc>)>, now: DateTime<Utc>) {
        entries.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

impl ExpiringStore for InMemoryExpiringStore {
    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move { Ok(self.exists_at(key, Utc::now())) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.set_at(key, value, ttl, Utc::now());
            Ok(())
        })
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move { Ok(self.set_if_absent_at(key, value, ttl, Utc::now())) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_expire_after_ttl() {
        let store = InMemoryExpiringStore::new();
        let now = Utc::now();
        store.set_at("silence:1:a", "1", Duration::from_secs(60), now);

        assert!(store.exists_at("silence:1:a", now + chrono::Duration::seconds(59)));
        assert!(!store.exists_at("silence:1:a", now + chrono::Duration::seconds(61)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_set_if_absent_at() {
        let store = InMemoryExpiringStore::new();
        let now = Utc::now();
        let ttl = Duration::from_secs(3600);

        assert!(store.set_if_absent_at("k", "1", ttl, now));
        assert!(!store.set_if_absent_at("k", "1", ttl, now + chrono::Duration::minutes(30)));
        assert!(store.set_if_absent_at("k", "1", ttl, now + chrono::Duration::minutes(61)));
    }

    #[tokio::test]
    async fn test_async_interface() {
        let store = InMemoryExpiringStore::new();
        assert!(!store.exists("k").await.unwrap());
        assert!(store
            .set_if_absent("k", "1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(store.exists("k").await.unwrap());
        assert!(!store
            .set_if_absent("k", "1", Duration::from_secs(60))
            .await
            .unwrap());
    }

    /// Store that only implements the required methods, exercising the
    /// default exists-then-set path
    #[derive(Default)]
    struct PlainStore {
        inner: InMemoryExpiringStore,
    }

    impl ExpiringStore for PlainStore {
        fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
            self.inner.exists(key)
        }

        fn set<'a>(
            &'a self,
            key: &'a str,
            value: &'a str,
            ttl: Duration,
        ) -> BoxFuture<'a, Result<(), StoreError>> {
            self.inner.set(key, value, ttl)
        }
    }

    #[tokio::test]
    async fn test_default_set_if_absent() {
        let store = PlainStore::default();
        let ttl = Duration::from_secs(60);
        assert!(store.set_if_absent("k", "1", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "1", ttl).await.unwrap());
        assert!(store.set_if_absent("other", "1", ttl).await.unwrap());
    }
}
