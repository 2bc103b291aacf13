//! Schema migrations for the duplicate index.
//!
//! `duplicate_records` holds one row per similarity cluster and identity.
//! The fingerprint is stored as 16 hex digits (a `u64` does not fit
//! SQLite's signed `INTEGER` without reinterpretation). `identity` is the
//! holder's `field:value` identity number, or `''` when none was read; it is
//! `NOT NULL` so that `UNIQUE(fingerprint, identity)` also covers records
//! without one, which makes `INSERT ... ON CONFLICT DO NOTHING` a second
//! guard against two rows for the same key.
//!
//! Databases created before the identity column existed are rebuilt in
//! place; their rows keep an unknown identity.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const CREATE_DUPLICATE_RECORDS: &str = r#"
    CREATE TABLE IF NOT EXISTS duplicate_records (
        document_id TEXT PRIMARY KEY,
        fingerprint TEXT NOT NULL,
        identity TEXT NOT NULL DEFAULT '',
        first_seen INTEGER NOT NULL,
        UNIQUE (fingerprint, identity)
    )
"#;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply all migrations on an open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(CREATE_DUPLICATE_RECORDS).execute(pool).await?;

    let has_identity: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('duplicate_records') WHERE name = 'identity'",
    )
    .fetch_one(pool)
    .await?;
    if has_identity == 0 {
        add_identity_column(pool).await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_duplicate_records_first_seen ON duplicate_records(first_seen)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Rebuild a fingerprint-only table with the identity column. The old
/// `UNIQUE(fingerprint)` constraint cannot be dropped in place.
async fn add_identity_column(pool: &SqlitePool) -> Result<()> {
    tracing::info!("adding identity column to duplicate_records");
    let mut tx = pool.begin().await?;
    sqlx::query("ALTER TABLE duplicate_records RENAME TO duplicate_records_v1")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DROP INDEX IF EXISTS idx_duplicate_records_first_seen")
        .execute(&mut *tx)
        .await?;
    sqlx::query(CREATE_DUPLICATE_RECORDS)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO duplicate_records (document_id, fingerprint, identity, first_seen) \
         SELECT document_id, fingerprint, '', first_seen FROM duplicate_records_v1",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("DROP TABLE duplicate_records_v1")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let pool = memory_pool().await;
        apply(&pool).await.unwrap();
        apply(&pool).await.unwrap();

        // Same fingerprint, different holders: two rows.
        for (id, identity) in [("a", "pan_number:ABCPS1234K"), ("b", "pan_number:BQRPM7781L")] {
            sqlx::query(
                "INSERT INTO duplicate_records (document_id, fingerprint, identity, first_seen) VALUES (?, '00000000000000ff', ?, 0)",
            )
            .bind(id)
            .bind(identity)
            .execute(&pool)
            .await
            .unwrap();
        }
        let dup = sqlx::query(
            "INSERT INTO duplicate_records (document_id, fingerprint, identity, first_seen) VALUES ('c', '00000000000000ff', 'pan_number:ABCPS1234K', 0)",
        )
        .execute(&pool)
        .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn test_fingerprint_only_table_is_upgraded() {
        let pool = memory_pool().await;
        sqlx::query(
            "CREATE TABLE duplicate_records (document_id TEXT PRIMARY KEY, fingerprint TEXT NOT NULL UNIQUE, first_seen INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO duplicate_records (document_id, fingerprint, first_seen) VALUES ('old', '00000000000000ff', 5)",
        )
        .execute(&pool)
        .await
        .unwrap();

        apply(&pool).await.unwrap();

        let (id, identity, first_seen): (String, String, i64) = sqlx::query_as(
            "SELECT document_id, identity, first_seen FROM duplicate_records",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!((id.as_str(), identity.as_str(), first_seen), ("old", "", 5));

        sqlx::query(
            "INSERT INTO duplicate_records (document_id, fingerprint, identity, first_seen) VALUES ('new', '00000000000000ff', 'voter_id:ABC1234567', 6)",
        )
        .execute(&pool)
        .await
        .unwrap();
    }
}
