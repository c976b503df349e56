use chrono::{DateTime, Days, NaiveDate, Utc};
use sqlx::{QueryBuilder, SqliteConnection};

use super::marker::{upsert_config, LAST_UPDATE_KEY};
use super::schema::Database;
use super::types::{DatabaseError, DueCounts, Record, RecordRow, DATE_FORMAT, TIMESTAMP_FORMAT};

/// Rows per multi-row INSERT; 3 columns * 100 stays well under SQLite's
/// 999 parameter limit.
const BATCH_SIZE: usize = 100;

impl Database {
    // ========================================================================
    // Record Set Replacement
    // ========================================================================

    /// Replace the whole record set and stamp the last-update marker.
    ///
    /// Runs in one `BEGIN EXCLUSIVE` transaction: the table is cleared, every
    /// record is inserted in the given order, and the marker is set to
    /// `updated_at`. If any step fails the transaction is rolled back, so
    /// readers only ever observe the previous complete set or the new
    /// complete set, and the marker keeps its previous value.
    ///
    /// # Returns
    ///
    /// The number of records stored.
    pub async fn replace_records(
        &self,
        records: &[Record],
        updated_at: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let stamp = updated_at.format(TIMESTAMP_FORMAT).to_string();
        let mut tx = self.pool.begin_with("BEGIN EXCLUSIVE").await?;

        // Roll back eagerly so the lock is gone before the error reaches the
        // caller; dropping `tx` (cancellation) rolls back as well.
        if let Err(e) = write_record_set(&mut *tx, records, &stamp).await {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "Rollback of record replacement failed");
            }
            return Err(e.into());
        }

        tx.commit().await?;

        tracing::debug!(records = records.len(), updated_at = %stamp, "Record set replaced");
        Ok(records.len())
    }

    // ========================================================================
    // Record Queries
    // ========================================================================

    /// All stored records, earliest due date first.
    pub async fn records(&self) -> Result<Vec<Record>, DatabaseError> {
        let rows: Vec<RecordRow> =
            sqlx::query_as("SELECT name, url, date FROM records ORDER BY date, name, rowid")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(title, url, date)| {
                let due_date = NaiveDate::parse_from_str(&date, DATE_FORMAT).map_err(|_| {
                    DatabaseError::InvalidValue(format!("due date '{}' of '{}'", date, title))
                })?;
                Ok(Record {
                    title,
                    url,
                    due_date,
                })
            })
            .collect()
    }

    /// Number of stored records.
    pub async fn record_count(&self) -> Result<u64, DatabaseError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0.max(0) as u64)
    }

    /// Bucket the stored records by due date relative to `today`.
    ///
    /// Boundaries are half-open and exclusive of each other:
    ///
    /// - `ok`: due after `today + soon_days`
    /// - `soon`: due after `today`, up to and including `today + soon_days`
    /// - `critical`: due exactly `today`
    /// - `late`: due before `today`
    ///
    /// All four counts come from a single statement, so they describe one
    /// consistent snapshot even while a refresh is committing.
    pub async fn due_counts_on(
        &self,
        today: NaiveDate,
        soon_days: u32,
    ) -> Result<DueCounts, DatabaseError> {
        let horizon = today
            .checked_add_days(Days::new(u64::from(soon_days)))
            .unwrap_or(NaiveDate::MAX);
        let today = today.format(DATE_FORMAT).to_string();
        let horizon = horizon.format(DATE_FORMAT).to_string();

        let (ok, soon, critical, late): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(CASE WHEN date > ? THEN 1 END),
                COUNT(CASE WHEN date > ? AND date <= ? THEN 1 END),
                COUNT(CASE WHEN date = ? THEN 1 END),
                COUNT(CASE WHEN date < ? THEN 1 END)
            FROM records
        "#,
        )
        .bind(&horizon)
        .bind(&today)
        .bind(&horizon)
        .bind(&today)
        .bind(&today)
        .fetch_one(&self.pool)
        .await?;

        Ok(DueCounts {
            ok: ok.max(0) as u64,
            soon: soon.max(0) as u64,
            critical: critical.max(0) as u64,
            late: late.max(0) as u64,
        })
    }
}

/// Clear-then-insert plus marker upsert, all on the open transaction.
async fn write_record_set(
    conn: &mut SqliteConnection,
    records: &[Record],
    stamp: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM records").execute(&mut *conn).await?;

    for chunk in records.chunks(BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("INSERT INTO records (name, url, date) ");

        builder.push_values(chunk, |mut b, record| {
            b.push_bind(&record.title)
                .push_bind(&record.url)
                .push_bind(record.due_date.format(DATE_FORMAT).to_string());
        });

        builder.build().execute(&mut *conn).await?;
    }

    upsert_config(&mut *conn, LAST_UPDATE_KEY, stamp).await
}
