use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{OffsetStore, check_monotonic};
use crate::Result;
use crate::message::{Offset, StreamKey};

/// In-memory [OffsetStore]. Committed offsets are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    // the write lock makes compare-and-set atomic for concurrent committers of the same key.
    offsets: RwLock<HashMap<StreamKey, Offset>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with an already committed offset.
    pub fn with_offset(self, key: StreamKey, offset: Offset) -> Self {
        self.offsets.write().insert(key, offset);
        self
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn get(&self, key: &StreamKey) -> Result<Option<Offset>> {
        Ok(self.offsets.read().get(key).copied())
    }

    async fn commit(&self, key: &StreamKey, offset: Offset) -> Result<()> {
        let mut offsets = self.offsets.write();
        check_monotonic(key, offsets.get(key).copied(), offset)?;
        offsets.insert(key.clone(), offset);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::Error;

    #[tokio::test]
    async fn test_get_and_commit() {
        let store = MemoryOffsetStore::new();
        let key = StreamKey::new("topic", 0, "client").unwrap();

        assert_eq!(store.get(&key).await.unwrap(), None);

        store.commit(&key, 10).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(10));

        // equal offsets are accepted, flushes can repeat without new records
        store.commit(&key, 10).await.unwrap();
        store.commit(&key, 12).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn test_stale_commit_rejected() {
        let key = StreamKey::new("topic", 0, "client").unwrap();
        let store = MemoryOffsetStore::new().with_offset(key.clone(), 40);

        let err = store.commit(&key, 12).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StaleCommit {
                stored: 40,
                attempted: 12,
                ..
            }
        ));
        assert_eq!(store.get(&key).await.unwrap(), Some(40));
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let store = Arc::new(MemoryOffsetStore::new());
        let a = StreamKey::new("topic", 0, "client-a").unwrap();
        let b = StreamKey::new("topic", 0, "client-b").unwrap();
        let c = StreamKey::new("topic", 1, "client-a").unwrap();

        store.commit(&a, 5).await.unwrap();
        store.commit(&b, 1).await.unwrap();

        assert_eq!(store.get(&a).await.unwrap(), Some(5));
        assert_eq!(store.get(&b).await.unwrap(), Some(1));
        assert_eq!(store.get(&c).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_commits_never_regress() {
        let store = Arc::new(MemoryOffsetStore::new());
        let key = StreamKey::new("topic", 0, "client").unwrap();

        let mut handles = Vec::new();
        for offset in 0..50 {
            let store = Arc::clone(&store);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let _ = store.commit(&key, offset).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get(&key).await.unwrap(), Some(49));
    }
}
