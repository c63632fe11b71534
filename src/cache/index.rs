//! Persisted cache index (SQLite)
//!
//! Maps fingerprints to artifact paths. Rows are only ever written after the
//! artifact has been renamed into place, so a row never points at a partial file.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::{FromRow, SqliteConnection};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::Fingerprint;

/// Indexed artifact
#[derive(Debug, Clone, FromRow)]
pub struct IndexEntry {
    /// Hex fingerprint
    pub fingerprint: String,
    /// Artifact path
    pub path: String,
    /// Artifact size when it was stored
    pub size_bytes: i64,
    /// Producing stage ("raw" / "normalized")
    pub kind: String,
    /// Unix timestamp of the store
    pub created_at: i64,
}

impl IndexEntry {
    /// Artifact path as a `PathBuf`
    pub fn artifact_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

/// SQLite-backed fingerprint index
#[derive(Debug, Clone)]
pub struct CacheIndex {
    pool: SqlitePool,
}

impl CacheIndex {
    /// Open the index, creating it if needed
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create cache directory: {}",
                    e
                )))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse index path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to open cache index: {}",
                e
            )))
        })?;

        let index = Self { pool };
        if let Err(e) = index.run_migrations().await {
            index.pool.close().await;
            return Err(e);
        }
        Ok(index)
    }

    /// Open the index; an unreadable index is discarded and recreated empty
    pub async fn open_or_recover(path: &Path) -> Result<Self> {
        match Self::open(path).await {
            Ok(index) => Ok(index),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "cache index is unreadable, starting with an empty cache"
                );
                remove_index_files(path).await?;
                Self::open(path).await
            }
        }
    }

    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        let current_version: Option<i64> =
            sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        if current_version.unwrap_or(0) < 1 {
            Self::migrate_v1(&mut conn).await?;
        }

        Ok(())
    }

    /// Migration v1: entries table
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("Applying cache index migration v1");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                fingerprint TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                kind TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create cache_entries table: {}",
                e
            )))
        })?;

        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (1, ?)")
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration v1: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Fetch the entry for `fingerprint`
    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<IndexEntry>> {
        sqlx::query_as::<_, IndexEntry>(
            r#"
            SELECT fingerprint, path, size_bytes, kind, created_at
            FROM cache_entries
            WHERE fingerprint = ?
            "#,
        )
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to look up {}: {}",
                fingerprint.short(),
                e
            )))
        })
    }

    /// Insert or fully replace the entry for `fingerprint`
    pub async fn put(
        &self,
        fingerprint: &Fingerprint,
        path: &Path,
        size_bytes: u64,
        kind: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cache_entries (fingerprint, path, size_bytes, kind, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(path.to_string_lossy().into_owned())
        .bind(size_bytes as i64)
        .bind(kind)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to store {}: {}",
                fingerprint.short(),
                e
            )))
        })?;
        Ok(())
    }

    /// Remove the entry for `fingerprint`
    pub async fn remove(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE fingerprint = ?")
            .bind(fingerprint.as_str())
            .execute(&self.pool)
            .await
            .map_err(Error::Sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove every entry, returning how many were removed
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await
            .map_err(Error::Sqlx)?;
        Ok(result.rows_affected())
    }

    /// Number of indexed entries
    pub async fn count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Sqlx)
    }

    /// All indexed entries, oldest first
    pub async fn entries(&self) -> Result<Vec<IndexEntry>> {
        sqlx::query_as::<_, IndexEntry>(
            r#"
            SELECT fingerprint, path, size_bytes, kind, created_at
            FROM cache_entries
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Sqlx)
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Delete the index file and its WAL side files
async fn remove_index_files(path: &Path) -> Result<()> {
    let mut candidates = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        candidates.push(PathBuf::from(side));
    }
    for candidate in candidates {
        match tokio::fs::remove_file(&candidate).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to discard unreadable index {}: {}",
                    candidate.display(),
                    e
                ))));
            }
        }
    }
    Ok(())
}
