use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// Handle to the loan database.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `path` may be `:memory:` for a private in-memory database, served by
    /// a single pooled connection.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process has the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Migration` if the schema cannot be created.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // SEC-010: Create the database file user-only before SQLite touches it
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::OpenOptionsExt;
            let db_path = std::path::Path::new(path);
            if !db_path.exists() {
                if let Some(parent) = db_path.parent().filter(|p| p.exists()) {
                    tracing::debug!(path = %parent.display(), "Pre-creating database file");
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite will report the error at connect_with.
                }
            }
        }

        // busy_timeout=5000: wait up to 5 seconds for a refresh transaction to
        // release its lock before reporting SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        // `:memory:` is a shared-cache database, where a reader hitting an
        // open write transaction fails at once with SQLITE_LOCKED instead of
        // waiting. One connection makes readers queue on the pool instead.
        let max_connections = if path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::Other(e) => DatabaseError::Migration(e.to_string()),
            locked => locked,
        })?;
        Ok(db)
    }

    /// Create the schema if it does not exist yet.
    ///
    /// Both statements are idempotent, so re-running on an existing database
    /// is a no-op. They run in one transaction so a half-created schema is
    /// never left behind.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Records of the last successful refresh. `date` holds ISO 8601
        // calendar dates so lexical comparison is calendar comparison.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                name TEXT NOT NULL,
                url TEXT,
                date TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_date ON records(date)")
            .execute(&mut *tx)
            .await?;

        // Key-value settings; holds the `lastupdate` marker
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT UNIQUE,
                value TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    /// Close all pooled connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_creates_tables() {
        let db = Database::open(":memory:").await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(names, vec!["config", "records"]);
    }

    #[tokio::test]
    async fn test_reopen_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loans.db");
        let path = path.to_str().unwrap();

        let db = Database::open(path).await.unwrap();
        sqlx::query("INSERT INTO records (name, url, date) VALUES ('Kept', NULL, '2024-01-01')")
            .execute(&db.pool)
            .await
            .unwrap();
        db.close().await;

        // Second open must not wipe or fail on the existing schema
        let db = Database::open(path).await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_new_database_file_is_user_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private.db");
        let _db = Database::open(path.to_str().unwrap()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
