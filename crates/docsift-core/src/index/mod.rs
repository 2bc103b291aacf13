//! Duplicate index abstraction.
//!
//! The [`DuplicateIndex`] trait is the only cross-request shared mutable
//! resource in docsift. It answers "has this document been seen before?"
//! for a [`DuplicateKey`] and records first sightings.
//!
//! # Contract
//!
//! - A record matches a key when their fingerprints lie within the
//!   similarity threshold and [`DuplicateRecord::admits`] the key, i.e.
//!   their identity numbers do not conflict.
//! - [`lookup`](DuplicateIndex::lookup) returns the closest matching record
//!   (earliest inserted on ties), or `None`.
//! - [`insert`](DuplicateIndex::insert) is insert-or-fetch: when a record
//!   already matches it is returned unchanged, so at most one record exists
//!   per similarity cluster and identity.
//! - The check and the write inside `insert` are atomic with respect to
//!   concurrent inserts of the same or a near fingerprint.
//! - Records are never evicted.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod bktree;
pub mod memory;

use async_trait::async_trait;

use crate::error::IndexError;
use crate::models::{DuplicateKey, DuplicateRecord};

/// Largest similarity threshold accepted by the shipped indexes. Beyond
/// half the hash width, unrelated images start to match each other.
pub const MAX_SIMILARITY_THRESHOLD: u32 = 32;

/// Persistent set of previously seen fingerprints.
#[async_trait]
pub trait DuplicateIndex: Send + Sync {
    /// Closest record matching `key`, if any.
    async fn lookup(&self, key: &DuplicateKey) -> Result<Option<DuplicateRecord>, IndexError>;

    /// Record `document_id` as the first sighting of `key`, or return the
    /// record that already covers it.
    async fn insert(&self, key: &DuplicateKey, document_id: &str)
        -> Result<DuplicateRecord, IndexError>;

    /// Number of stored records.
    async fn len(&self) -> Result<usize, IndexError>;

    /// Hamming distance at or below which two fingerprints are duplicates.
    fn threshold(&self) -> u32;
}
