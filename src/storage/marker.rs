use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use sqlx::{Executor, Sqlite};

use super::schema::Database;
use super::types::{DatabaseError, TIMESTAMP_FORMAT};

/// Key of the last-update marker in the `config` table.
pub const LAST_UPDATE_KEY: &str = "lastupdate";

/// Insert or overwrite one `config` entry.
///
/// Generic over the executor so the marker can be written on the refresh
/// transaction itself.
pub(crate) async fn upsert_config<'e, E>(executor: E, key: &str, value: &str) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO config (key, value)
        VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
    "#,
    )
    .bind(key)
    .bind(value)
    .execute(executor)
    .await?;

    Ok(())
}

impl Database {
    // ========================================================================
    // Config Operations
    // ========================================================================

    /// Get a single `config` value by key.
    pub async fn get_config(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT value FROM config WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.and_then(|(value,)| value))
    }

    // ========================================================================
    // Last-Update Marker
    // ========================================================================

    /// Time of the last successful refresh, if there ever was one.
    ///
    /// A marker that cannot be parsed is reported as absent, which makes the
    /// next throttle check allow a refresh that overwrites it.
    pub async fn last_update(&self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let Some(raw) = self.get_config(LAST_UPDATE_KEY).await? else {
            return Ok(None);
        };

        match NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT) {
            Ok(stamp) => Ok(Some(stamp.and_utc())),
            Err(e) => {
                tracing::warn!(value = %raw, error = %e, "Ignoring unparseable last-update marker");
                Ok(None)
            }
        }
    }

    /// Whether a refresh is due at `now`.
    ///
    /// Due when no marker exists, or when at least `interval` has passed since
    /// the marker. A marker in the future (clock moved backwards) is not due
    /// until the clock catches up.
    pub async fn needs_refresh(
        &self,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let due = match self.last_update().await? {
            None => true,
            Some(last) => now.signed_duration_since(last) >= interval,
        };
        tracing::debug!(due = due, interval_mins = interval.num_minutes(), "Throttle check");
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use chrono::TimeZone;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_no_marker_before_first_refresh() {
        let db = test_db().await;
        assert_eq!(db.last_update().await.unwrap(), None);
        assert!(db.needs_refresh(Duration::minutes(10), at(12, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_marker_round_trips_to_the_second() {
        let db = test_db().await;
        db.replace_records(&[], at(9, 30)).await.unwrap();
        assert_eq!(db.last_update().await.unwrap(), Some(at(9, 30)));
        assert_eq!(
            db.get_config(LAST_UPDATE_KEY).await.unwrap().as_deref(),
            Some("2024-06-10 09:30:00")
        );
    }

    #[tokio::test]
    async fn test_needs_refresh_respects_interval() {
        let db = test_db().await;
        db.replace_records(&[], at(12, 0)).await.unwrap();

        let interval = Duration::minutes(10);
        assert!(!db.needs_refresh(interval, at(12, 0)).await.unwrap());
        assert!(!db.needs_refresh(interval, at(12, 9)).await.unwrap());
        assert!(db.needs_refresh(interval, at(12, 10)).await.unwrap());
        assert!(db.needs_refresh(interval, at(13, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_marker_is_singleton() {
        let db = test_db().await;
        db.replace_records(&[], at(8, 0)).await.unwrap();
        db.replace_records(&[], at(9, 0)).await.unwrap();

        let rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM config WHERE key = ?")
            .bind(LAST_UPDATE_KEY)
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(rows.0, 1);
        assert_eq!(db.last_update().await.unwrap(), Some(at(9, 0)));
    }

    #[tokio::test]
    async fn test_garbage_marker_counts_as_absent() {
        let db = test_db().await;
        upsert_config(&db.pool, LAST_UPDATE_KEY, "not a timestamp")
            .await
            .unwrap();

        assert_eq!(db.last_update().await.unwrap(), None);
        assert!(db.needs_refresh(Duration::minutes(10), at(12, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_marker_in_future_is_not_due() {
        let db = test_db().await;
        db.replace_records(&[], at(15, 0)).await.unwrap();
        assert!(!db.needs_refresh(Duration::minutes(10), at(12, 0)).await.unwrap());
    }
}
