//! Refresh orchestration.
//!
//! A refresh fetches the loan feed, parses it while the body streams in,
//! turns every entry into a [`Record`] and replaces the stored record set in
//! one transaction. Any failure leaves the store exactly as it was.

use chrono::Utc;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{Config, ConfigError};
use crate::feed::{
    DateError, DateExtractor, Entries, FeedEntry, FeedFetcher, FeedParser, FetchError, ParseError,
};
use crate::storage::{Database, DatabaseError, DueCounts, Record};

// ============================================================================
// Error Types
// ============================================================================

/// Why a single feed entry cannot become a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    #[error("missing title")]
    MissingTitle,
    #[error("missing link")]
    MissingLink,
    #[error("missing description")]
    MissingDescription,
    #[error("no usable due date in description: {0}")]
    Date(#[from] DateError),
}

/// A failed refresh attempt. The store is unchanged in every case.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("Feed retrieval failed: {0}")]
    FetchFailed(#[from] FetchError),

    #[error("Feed document is malformed: {0}")]
    MalformedDocument(#[from] ParseError),

    #[error("Feed entry {index} is invalid: {source}")]
    InvalidEntry {
        /// 0-based position of the entry in the feed
        index: usize,
        #[source]
        source: EntryError,
    },

    #[error("Storage failure: {0}")]
    StorageFailed(#[from] DatabaseError),
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The last successful refresh is more recent than the interval.
    Skipped,
    /// The record set was replaced with this many records.
    Refreshed { records: usize },
}

/// Result of [`Refresher::poll`].
#[derive(Debug)]
pub struct PollReport {
    /// Counts read after the refresh attempt, successful or not
    pub counts: DueCounts,
    pub refresh: Result<RefreshOutcome, RefreshError>,
}

// ============================================================================
// Refresher
// ============================================================================

/// Knobs of the refresh cycle.
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub feed_url: String,
    /// Minimum time between two retrievals
    pub interval: chrono::Duration,
    /// Size of the "soon" window in days
    pub soon_days: u32,
    /// Deadline for retrieving and parsing the whole document
    pub fetch_timeout: std::time::Duration,
}

impl RefreshSettings {
    /// Settings for `feed_url` with the configuration defaults.
    pub fn new(feed_url: impl Into<String>) -> Self {
        let defaults = Config::default();
        Self {
            feed_url: feed_url.into(),
            interval: defaults.refresh_interval(),
            soon_days: defaults.soon_days,
            fetch_timeout: defaults.fetch_timeout(),
        }
    }

    /// Settings from a loaded configuration; fails without a valid feed URL.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let feed_url = config.require_feed_url()?;
        Ok(Self {
            feed_url: feed_url.into(),
            interval: config.refresh_interval(),
            soon_days: config.soon_days,
            fetch_timeout: config.fetch_timeout(),
        })
    }
}

/// Drives refreshes against one store and one feed.
///
/// Refreshes are single-flight: concurrent calls queue on an internal lock
/// that covers the throttle check, the retrieval and the commit. Count
/// queries do not take the lock.
pub struct Refresher {
    db: Database,
    fetcher: FeedFetcher,
    dates: DateExtractor,
    settings: RefreshSettings,
    in_flight: Mutex<()>,
}

impl Refresher {
    pub fn new(db: Database, fetcher: FeedFetcher, settings: RefreshSettings) -> Self {
        Self {
            db,
            fetcher,
            dates: DateExtractor::default(),
            settings,
            in_flight: Mutex::new(()),
        }
    }

    /// Use a different month table for date extraction.
    pub fn with_dates(mut self, dates: DateExtractor) -> Self {
        self.dates = dates;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Refresh unless the last successful refresh is younger than the
    /// interval.
    pub async fn refresh_if_due(&self) -> Result<RefreshOutcome, RefreshError> {
        let _guard = self.in_flight.lock().await;

        if !self
            .db
            .needs_refresh(self.settings.interval, Utc::now())
            .await?
        {
            tracing::debug!(url = %self.settings.feed_url, "Refresh not due, skipping");
            return Ok(RefreshOutcome::Skipped);
        }

        self.run().await
    }

    /// Refresh regardless of the throttle.
    pub async fn refresh(&self) -> Result<RefreshOutcome, RefreshError> {
        let _guard = self.in_flight.lock().await;
        self.run().await
    }

    /// Counts per due-date bucket for today (UTC). Never refreshes.
    pub async fn due_counts(&self) -> Result<DueCounts, RefreshError> {
        let today = Utc::now().date_naive();
        Ok(self
            .db
            .due_counts_on(today, self.settings.soon_days)
            .await?)
    }

    /// Refresh if due (or always, with `force`), then read the counts.
    ///
    /// A failed refresh is logged and returned inside the report; the counts
    /// then describe the previous, unchanged record set. Only a failure to
    /// read the counts fails the call.
    pub async fn poll(&self, force: bool) -> Result<PollReport, RefreshError> {
        let refresh = if force {
            self.refresh().await
        } else {
            self.refresh_if_due().await
        };

        if let Err(e) = &refresh {
            tracing::warn!(error = %e, "Refresh failed, reporting stored counts");
        }

        let counts = self.due_counts().await?;
        Ok(PollReport { counts, refresh })
    }

    async fn run(&self) -> Result<RefreshOutcome, RefreshError> {
        let url = &self.settings.feed_url;
        tracing::info!(url = %url, "Refreshing loan feed");

        let entries = tokio::time::timeout(self.settings.fetch_timeout, self.fetch_entries())
            .await
            .map_err(|_| RefreshError::FetchFailed(FetchError::Timeout))??;

        // Validate everything before the store is touched
        let records = entries
            .enumerate()
            .map(|(index, entry)| {
                validate_entry(entry, &self.dates)
                    .map_err(|source| RefreshError::InvalidEntry { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let stored = self.db.replace_records(&records, Utc::now()).await?;

        tracing::info!(url = %url, records = stored, "Loan feed refreshed");
        Ok(RefreshOutcome::Refreshed { records: stored })
    }

    async fn fetch_entries(&self) -> Result<Entries, RefreshError> {
        let mut body = self.fetcher.open(&self.settings.feed_url).await?;
        let mut parser = FeedParser::new();
        let mut received = 0usize;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            received += chunk.len();
            parser.feed(&chunk)?;
        }
        parser.finish()?;

        tracing::debug!(bytes = received, "Feed document parsed");
        Ok(parser.entries()?)
    }
}

/// Turn a parsed entry into a record.
///
/// Title, link and description are required; a value that is empty after
/// trimming counts as missing. The due date is the first date phrase in the
/// description.
pub fn validate_entry(entry: FeedEntry, dates: &DateExtractor) -> Result<Record, EntryError> {
    let title = required(entry.title).ok_or(EntryError::MissingTitle)?;
    let link = required(entry.link).ok_or(EntryError::MissingLink)?;
    let description = required(entry.description).ok_or(EntryError::MissingDescription)?;
    let due_date = dates.extract(&description)?;

    Ok(Record {
        title,
        url: Some(link),
        due_date,
    })
}

fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
