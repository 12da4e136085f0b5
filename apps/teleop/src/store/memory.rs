use super::{DataStore, StoreConnector, StoreError, StoreSession};
use async_trait::async_trait;
use authority_proto::DataStoreCredentials;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct StoreWrite {
    pub path: String,
    /// `None` for a removal.
    pub value: Option<Value>,
}

/// In-process store used by tests and offline runs. Failures and latency can
/// be injected to exercise the health and teardown paths.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Value>>,
    log: Mutex<Vec<StoreWrite>>,
    failing: AtomicBool,
    hanging: AtomicBool,
    latency: Mutex<Option<Duration>>,
    attempts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.values.lock().get(path).cloned()
    }

    /// Every applied write in order.
    pub fn writes(&self) -> Vec<StoreWrite> {
        self.log.lock().clone()
    }

    pub fn writes_to(&self, path: &str) -> Vec<StoreWrite> {
        self.log
            .lock()
            .iter()
            .filter(|write| write.path == path)
            .cloned()
            .collect()
    }

    /// Calls to `set`/`remove`, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Writes never complete while set.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    async fn gate(&self) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Network("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.gate().await?;
        self.values.lock().insert(path.to_string(), value.clone());
        self.log.lock().push(StoreWrite {
            path: path.to_string(),
            value: Some(value),
        });
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.gate().await?;
        self.values.lock().remove(path);
        self.log.lock().push(StoreWrite {
            path: path.to_string(),
            value: None,
        });
        Ok(())
    }
}

/// Hands out the same [`MemoryStore`] for every session.
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    refuse: AtomicBool,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            refuse: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    /// Make subsequent sign-ins fail.
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(
        &self,
        credentials: &DataStoreCredentials,
    ) -> Result<StoreSession, StoreError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(StoreError::SignIn("sign-in refused".into()));
        }
        if credentials.endpoint.trim().is_empty() {
            return Err(StoreError::InvalidConfig("empty endpoint".into()));
        }
        Ok(StoreSession {
            store: self.store.clone(),
            operator_id: format!("anon-{}", Uuid::new_v4().simple()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_overwrites_and_remove_clears() {
        let store = MemoryStore::new();
        store.set("a/b", json!({"v": 1})).await.unwrap();
        store.set("a/b", json!({"v": 2})).await.unwrap();
        assert_eq!(store.get("a/b"), Some(json!({"v": 2})));
        store.remove("a/b").await.unwrap();
        assert_eq!(store.get("a/b"), None);
        assert_eq!(store.writes_to("a/b").len(), 3);
    }

    #[tokio::test]
    async fn injected_failures_are_counted_but_not_logged() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(store.set("x", json!(1)).await.is_err());
        assert_eq!(store.attempts(), 1);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn connector_issues_distinct_operator_ids() {
        let connector = MemoryConnector::new(MemoryStore::new());
        let creds = DataStoreCredentials {
            endpoint: "mem://".into(),
            ..DataStoreCredentials::default()
        };
        let first = connector.connect(&creds).await.unwrap();
        let second = connector.connect(&creds).await.unwrap();
        assert_ne!(first.operator_id, second.operator_id);

        connector.set_refusing(true);
        assert!(connector.connect(&creds).await.is_err());
    }
}
