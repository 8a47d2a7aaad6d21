use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, TransactionBehavior};
use tempfile::TempDir;
use tokio_rusqlite::Connection;

use async_trait::async_trait;

use crate::backend::{format_number, parse_number, Backend, ZsetAdmission};
use crate::clock::Clock;
use crate::types::Result;

/// Everything lives in one table. Plain values use the empty member;
/// sorted sets get one row per member. Rows with `expires_at <= now` are
/// invisible to reads and reaped opportunistically.
const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS store (
        key        TEXT NOT NULL,
        member     TEXT NOT NULL DEFAULT '',
        value      BLOB,
        score      REAL,
        expires_at REAL NOT NULL,
        PRIMARY KEY (key, member)
    );
    CREATE INDEX IF NOT EXISTS store_key_score ON store (key, score);
";

/// Embedded SQL backend over a single SQLite file.
///
/// Multi-step operations run inside immediate-mode transactions, which is
/// the atomicity the limiter algorithms rely on. Without an explicit path
/// the database lives in a temporary directory that is removed when the
/// backend is dropped.
pub struct SqlBackend {
    conn: Connection,
    clock: Arc<dyn Clock>,
    _ephemeral: Option<TempDir>,
}

impl fmt::Debug for SqlBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlBackend")
            .field("ephemeral", &self._ephemeral.is_some())
            .finish_non_exhaustive()
    }
}

impl SqlBackend {
    /// Open (and create if necessary) the store at `db`, or an ephemeral
    /// file when `db` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub async fn open(db: Option<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let (path, ephemeral) = match db {
            Some(path) => (path, None),
            None => {
                let dir = tempfile::tempdir()?;
                (dir.path().join("floodgate.db"), Some(dir))
            }
        };
        let conn = Connection::open(path).await?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(SqlBackend {
            conn,
            clock,
            _ephemeral: ephemeral,
        })
    }

    /// Wrap an existing connection instead of opening a file; the schema
    /// is created if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub async fn with_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(SqlBackend {
            conn,
            clock,
            _ephemeral: None,
        })
    }

    fn now(&self) -> f64 {
        self.clock.now()
    }
}

#[async_trait]
impl Backend for SqlBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        let now = self.now();
        let value = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT value FROM store WHERE key = ?1 AND member = '' AND expires_at > ?2",
                )?;
                let mut rows = stmt.query(params![key, now])?;
                match rows.next()? {
                    Some(row) => Ok(row.get::<_, Option<Vec<u8>>>(0)?),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let key = key.to_string();
        let value = value.to_vec();
        let expires_at = self.now() + ttl.as_secs_f64();
        self.conn
            .call(move |conn| {
                conn.prepare_cached(
                    "INSERT INTO store (key, member, value, score, expires_at)
                     VALUES (?1, '', ?2, NULL, ?3)
                     ON CONFLICT (key, member) DO UPDATE
                     SET value = excluded.value, expires_at = excluded.expires_at",
                )?
                .execute(params![key, value, expires_at])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                conn.prepare_cached("DELETE FROM store WHERE key = ?1 AND member = ''")?
                    .execute(params![key])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn incr(&self, key: &str, delta: f64, ttl: Duration) -> Result<f64> {
        let key = key.to_string();
        let now = self.now();
        let fresh_expiry = now + ttl.as_secs_f64();
        let value = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current: Option<(Vec<u8>, f64)> = tx
                    .prepare_cached(
                        "SELECT value, expires_at FROM store WHERE key = ?1 AND member = ''",
                    )?
                    .query_row(params![key], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let (next, expires_at) = match current {
                    Some((bytes, expires_at)) if expires_at > now => {
                        (parse_number(&bytes) + delta, expires_at)
                    }
                    _ => (delta, fresh_expiry),
                };
                tx.prepare_cached(
                    "INSERT INTO store (key, member, value, score, expires_at)
                     VALUES (?1, '', ?2, NULL, ?3)
                     ON CONFLICT (key, member) DO UPDATE
                     SET value = excluded.value, expires_at = excluded.expires_at",
                )?
                .execute(params![key, format_number(next).into_bytes(), expires_at])?;
                tx.commit()?;
                Ok(next)
            })
            .await?;
        Ok(value)
    }

    async fn cas(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        let key = key.to_string();
        let expected = expected.map(<[u8]>::to_vec);
        let new = new.to_vec();
        let now = self.now();
        let expires_at = now + ttl.as_secs_f64();
        let swapped = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current: Option<Vec<u8>> = tx
                    .prepare_cached(
                        "SELECT value FROM store
                         WHERE key = ?1 AND member = '' AND expires_at > ?2",
                    )?
                    .query_row(params![key, now], |row| row.get(0))
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                if current != expected {
                    return Ok(false);
                }
                tx.prepare_cached(
                    "INSERT INTO store (key, member, value, score, expires_at)
                     VALUES (?1, '', ?2, NULL, ?3)
                     ON CONFLICT (key, member) DO UPDATE
                     SET value = excluded.value, expires_at = excluded.expires_at",
                )?
                .execute(params![key, new, expires_at])?;
                tx.commit()?;
                Ok(true)
            })
            .await?;
        Ok(swapped)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str, ttl: Duration) -> Result<()> {
        let key = key.to_string();
        let member = member.to_string();
        let expires_at = self.now() + ttl.as_secs_f64();
        self.conn
            .call(move |conn| {
                conn.prepare_cached(
                    "INSERT INTO store (key, member, value, score, expires_at)
                     VALUES (?1, ?2, NULL, ?3, ?4)
                     ON CONFLICT (key, member) DO UPDATE
                     SET score = excluded.score, expires_at = excluded.expires_at",
                )?
                .execute(params![key, member, score, expires_at])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, lo: f64, hi: f64) -> Result<u64> {
        let key = key.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let removed = conn
                    .prepare_cached(
                        "DELETE FROM store
                         WHERE key = ?1 AND member != '' AND score >= ?2 AND score <= ?3",
                    )?
                    .execute(params![key, lo, hi])?;
                Ok(removed as u64)
            })
            .await?;
        Ok(removed)
    }

    async fn zcount(&self, key: &str, lo: f64, hi: f64) -> Result<u64> {
        let key = key.to_string();
        let now = self.now();
        let count = self
            .conn
            .call(move |conn| {
                let count: i64 = conn
                    .prepare_cached(
                        "SELECT COUNT(*) FROM store
                         WHERE key = ?1 AND member != ''
                           AND score >= ?2 AND score <= ?3 AND expires_at > ?4",
                    )?
                    .query_row(params![key, lo, hi, now], |row| row.get(0))?;
                Ok(count as u64)
            })
            .await?;
        Ok(count)
    }

    async fn zfirst(&self, key: &str) -> Result<Option<f64>> {
        let key = key.to_string();
        let now = self.now();
        let oldest = self
            .conn
            .call(move |conn| {
                let oldest: Option<f64> = conn
                    .prepare_cached(
                        "SELECT MIN(score) FROM store
                         WHERE key = ?1 AND member != '' AND expires_at > ?2",
                    )?
                    .query_row(params![key, now], |row| row.get(0))?;
                Ok(oldest)
            })
            .await?;
        Ok(oldest)
    }

    async fn zprunecard_insert(
        &self,
        key: &str,
        cutoff: f64,
        limit: u64,
        score: f64,
        member: &str,
        ttl: Duration,
    ) -> Result<ZsetAdmission> {
        let key = key.to_string();
        let member = member.to_string();
        let now = self.now();
        let expires_at = now + ttl.as_secs_f64();
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.prepare_cached(
                    "DELETE FROM store
                     WHERE key = ?1 AND member != ''
                       AND (score <= ?2 OR expires_at <= ?3)",
                )?
                .execute(params![key, cutoff, now])?;
                let count: i64 = tx
                    .prepare_cached("SELECT COUNT(*) FROM store WHERE key = ?1 AND member != ''")?
                    .query_row(params![key], |row| row.get(0))?;
                let outcome = if (count as u64) < limit {
                    tx.prepare_cached(
                        "INSERT INTO store (key, member, value, score, expires_at)
                         VALUES (?1, ?2, NULL, ?3, ?4)
                         ON CONFLICT (key, member) DO UPDATE
                         SET score = excluded.score, expires_at = excluded.expires_at",
                    )?
                    .execute(params![key, member, score, expires_at])?;
                    ZsetAdmission::Inserted
                } else {
                    let oldest: Option<f64> = tx
                        .prepare_cached(
                            "SELECT MIN(score) FROM store WHERE key = ?1 AND member != ''",
                        )?
                        .query_row(params![key], |row| row.get(0))?;
                    ZsetAdmission::Full {
                        oldest: oldest.unwrap_or(score),
                    }
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await?;
        Ok(outcome)
    }

    async fn clear(&self, prefix: &str) -> Result<()> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        self.conn
            .call(move |conn| {
                conn.prepare_cached("DELETE FROM store WHERE key LIKE ?1 ESCAPE '\\'")?
                    .execute(params![pattern])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // reap anything that expired; the file itself (when ephemeral) is
        // removed when the TempDir is dropped with the backend
        let now = self.now();
        self.conn
            .call(move |conn| {
                conn.prepare_cached("DELETE FROM store WHERE expires_at <= ?1")?
                    .execute(params![now])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ManualClock;

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let clock = Arc::new(ManualClock::new(100.0));

        let backend = SqlBackend::open(Some(path.clone()), clock.clone())
            .await
            .unwrap();
        backend
            .set("k", b"persisted", Duration::from_secs(600))
            .await
            .unwrap();
        drop(backend);

        let reopened = SqlBackend::open(Some(path), clock).await.unwrap();
        assert_eq!(
            reopened.get("k").await.unwrap().as_deref(),
            Some(&b"persisted"[..])
        );
    }

    #[tokio::test]
    async fn test_expired_rows_are_invisible() {
        let clock = Arc::new(ManualClock::new(100.0));
        let backend = SqlBackend::open(None, clock.clone()).await.unwrap();
        backend.set("k", b"v", Duration::from_secs(1)).await.unwrap();
        backend
            .zadd("z", 1.0, "m", Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(2.0);
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(
            backend
                .zcount("z", f64::NEG_INFINITY, f64::INFINITY)
                .await
                .unwrap(),
            0
        );
        assert_eq!(backend.zfirst("z").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cas_on_expired_key_treats_it_as_absent() {
        let clock = Arc::new(ManualClock::new(100.0));
        let backend = SqlBackend::open(None, clock.clone()).await.unwrap();
        backend.set("k", b"old", Duration::from_secs(1)).await.unwrap();
        clock.advance(2.0);
        assert!(!backend.cas("k", Some(b"old"), b"new", Duration::from_secs(5)).await.unwrap());
        assert!(backend.cas("k", None, b"new", Duration::from_secs(5)).await.unwrap());
    }
}
