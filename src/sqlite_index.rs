//! SQLite-backed [`DuplicateIndex`].
//!
//! Records are persisted in `duplicate_records` and mirrored in an
//! in-memory [`BkTree`] that is rebuilt from the table when the index is
//! opened. Lookups are answered from the tree under a read lock. Inserts
//! hold the write lock across the nearest-neighbour check, the SQL commit,
//! and the tree update, so lookup-then-insert is serialized for every key
//! and a cluster can never receive two records for the same holder.
//!
//! An unknown identity is stored as `''` and read back as `None`.
//!
//! The tree is only updated after the row is committed. A failed commit
//! leaves both the table and the tree untouched.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;

use docsift_core::error::IndexError;
use docsift_core::fingerprint::Fingerprint;
use docsift_core::index::bktree::BkTree;
use docsift_core::index::{DuplicateIndex, MAX_SIMILARITY_THRESHOLD};
use docsift_core::models::{DuplicateKey, DuplicateRecord};

/// SQLite implementation of the [`DuplicateIndex`] trait.
pub struct SqliteIndex {
    pool: SqlitePool,
    tree: RwLock<BkTree<DuplicateRecord>>,
    threshold: u32,
}

fn unavailable(err: impl std::fmt::Display) -> IndexError {
    IndexError::Unavailable(err.to_string())
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DuplicateRecord, IndexError> {
    let document_id: String = row.try_get("document_id").map_err(unavailable)?;
    let fingerprint: String = row.try_get("fingerprint").map_err(unavailable)?;
    let identity: String = row.try_get("identity").map_err(unavailable)?;
    let first_seen_ms: i64 = row.try_get("first_seen").map_err(unavailable)?;

    let fingerprint: Fingerprint = fingerprint.parse().map_err(unavailable)?;
    let first_seen = DateTime::<Utc>::from_timestamp_millis(first_seen_ms).ok_or_else(|| {
        unavailable(format!(
            "record {} has an invalid timestamp {}",
            document_id, first_seen_ms
        ))
    })?;

    Ok(DuplicateRecord {
        fingerprint,
        identity: (!identity.is_empty()).then_some(identity),
        document_id,
        first_seen,
    })
}

fn stored_identity(key: &DuplicateKey) -> &str {
    key.identity.as_deref().unwrap_or("")
}

impl SqliteIndex {
    /// Load every stored record and build the search tree.
    ///
    /// The schema must already exist (see [`crate::migrate`]).
    pub async fn open(pool: SqlitePool, threshold: u32) -> Result<Self> {
        if threshold > MAX_SIMILARITY_THRESHOLD {
            bail!(
                "similarity threshold must be <= {}",
                MAX_SIMILARITY_THRESHOLD
            );
        }

        let rows = sqlx::query(
            "SELECT document_id, fingerprint, identity, first_seen FROM duplicate_records ORDER BY first_seen, rowid",
        )
        .fetch_all(&pool)
        .await?;

        let mut tree = BkTree::new();
        for row in &rows {
            let record = record_from_row(row)?;
            tree.insert(record.fingerprint, record);
        }

        tracing::info!(records = tree.len(), threshold, "duplicate index loaded");

        Ok(Self {
            pool,
            tree: RwLock::new(tree),
            threshold,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn ensure_reachable(&self) -> Result<(), IndexError> {
        if self.pool.is_closed() {
            return Err(IndexError::Unavailable(
                "database pool is closed".to_string(),
            ));
        }
        Ok(())
    }

    async fn fetch_by_key(&self, key: &DuplicateKey) -> Result<Option<DuplicateRecord>, IndexError> {
        let row = sqlx::query(
            "SELECT document_id, fingerprint, identity, first_seen FROM duplicate_records WHERE fingerprint = ? AND identity = ?",
        )
        .bind(key.fingerprint.to_string())
        .bind(stored_identity(key))
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        row.as_ref().map(record_from_row).transpose()
    }
}

#[async_trait]
impl DuplicateIndex for SqliteIndex {
    async fn lookup(&self, key: &DuplicateKey) -> Result<Option<DuplicateRecord>, IndexError> {
        self.ensure_reachable()?;
        let tree = self.tree.read().await;
        Ok(tree
            .nearest_where(&key.fingerprint, self.threshold, |r| r.admits(key))
            .map(|(record, _)| record.clone()))
    }

    async fn insert(
        &self,
        key: &DuplicateKey,
        document_id: &str,
    ) -> Result<DuplicateRecord, IndexError> {
        let mut tree = self.tree.write().await;
        self.ensure_reachable()?;

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

        let result = sqlx::query(
            r#"
            INSERT INTO duplicate_records (document_id, fingerprint, identity, first_seen)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(fingerprint, identity) DO NOTHING
            "#,
        )
        .bind(&record.document_id)
        .bind(record.fingerprint.to_string())
        .bind(stored_identity(key))
        .bind(record.first_seen.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            // Another writer committed this exact key after the tree was
            // built.
            let existing = self.fetch_by_key(key).await?.ok_or_else(|| {
                IndexError::Unavailable("conflicting record vanished".to_string())
            })?;
            tree.insert(existing.fingerprint, existing.clone());
            return Ok(existing);
        }

        tree.insert(record.fingerprint, record.clone());
        Ok(record)
    }

    async fn len(&self) -> Result<usize, IndexError> {
        Ok(self.tree.read().await.len())
    }

    fn threshold(&self) -> u32 {
        self.threshold
    }
}
