//! In-memory [`DuplicateIndex`] for tests and ephemeral runs.
//!
//! A [`BkTree`] behind `std::sync::RwLock`. Lookups take the read lock;
//! inserts take the write lock for both the nearest-neighbour check and
//! the write, which makes insert-or-fetch atomic.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::IndexError;
use crate::models::{DuplicateKey, DuplicateRecord};

use super::bktree::BkTree;
use super::{DuplicateIndex, MAX_SIMILARITY_THRESHOLD};

/// In-memory duplicate index. Contents are lost when dropped.
pub struct InMemoryIndex {
    tree: RwLock<BkTree<DuplicateRecord>>,
    threshold: u32,
}

impl InMemoryIndex {
    /// # Panics
    ///
    /// Panics if `threshold` exceeds [`MAX_SIMILARITY_THRESHOLD`].
    pub fn new(threshold: u32) -> Self {
        assert!(
            threshold <= MAX_SIMILARITY_THRESHOLD,
            "similarity threshold must be <= {}",
            MAX_SIMILARITY_THRESHOLD
        );
        Self {
            tree: RwLock::new(BkTree::new()),
            threshold,
        }
    }

    /// Snapshot of all records in insertion order.
    pub fn records(&self) -> Result<Vec<DuplicateRecord>, IndexError> {
        let tree = self.tree.read().map_err(|_| poisoned())?;
        Ok(tree.values().cloned().collect())
    }
}

fn poisoned() -> IndexError {
    IndexError::Unavailable("index lock poisoned".to_string())
}

#[async_trait]
impl DuplicateIndex for InMemoryIndex {
    async fn lookup(&self, key: &DuplicateKey) -> Result<Option<DuplicateRecord>, IndexError> {
        let tree = self.tree.read().map_err(|_| poisoned())?;
        Ok(tree
            .nearest_where(&key.fingerprint, self.threshold, |r| r.admits(key))
            .map(|(record, _)| record.clone()))
    }

    async fn insert(
        &self,
        key: &DuplicateKey,
        document_id: &str,
    ) -> Result<DuplicateRecord, IndexError> {
        let mut tree = self.tree.write().map_err(|_| poisoned())?;
        if let Some((existing, _)) =
            tree.nearest_where(&key.fingerprint, self.threshold, |r| r.admits(key))
        {
            return Ok(existing.clone());
        }
        let record = DuplicateRecord {
            fingerprint: key.fingerprint,
            identity: key.identity.clone(),
            document_id: document_id.to_string(),
            first_seen: Utc::now(),
        };
        tree.insert(key.fingerprint, record.clone());
        Ok(record)
    }

    async fn len(&self) -> Result<usize, IndexError> {
        Ok(self.tree.read().map_err(|_| poisoned())?.len())
    }

    fn threshold(&self) -> u32 {
        self.threshold
    }
}
