use chrono::NaiveDate;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("The loan database is locked by another process. Please try again later.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A stored value could not be decoded (hand-edited or foreign database)
    #[error("Stored value is not valid: {0}")]
    InvalidValue(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A borrowed item as stored after a successful refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub title: String,
    pub url: Option<String>,
    pub due_date: NaiveDate,
}

/// Number of stored records per due-date bucket.
///
/// The four buckets partition the record set, so `total()` always equals the
/// number of stored records at the time of the query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DueCounts {
    /// Due later than the "soon" window
    pub ok: u64,
    /// Due after today but within the "soon" window
    pub soon: u64,
    /// Due today
    pub critical: u64,
    /// Due date already passed
    pub late: u64,
}

impl DueCounts {
    pub fn total(&self) -> u64 {
        self.ok + self.soon + self.critical + self.late
    }
}

impl std::fmt::Display for DueCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ok={} soon={} critical={} late={}",
            self.ok, self.soon, self.critical, self.late
        )
    }
}

/// Internal row type for record queries: (name, url, date)
pub(crate) type RecordRow = (String, Option<String>, String);

/// Format used for due dates in the `records.date` column.
///
/// ISO 8601 calendar dates compare lexically in calendar order, which the
/// count queries rely on.
pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

/// Format used for the last-update marker (matches SQLite `datetime('now')`).
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
