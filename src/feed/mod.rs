//! Feed retrieval and interpretation.
//!
//! - [`fetcher`] - HTTP GET with redirect, size limit, streamed body
//! - [`parser`] - Push parser turning body chunks into feed entries
//! - [`date`] - Due-date extraction from entry descriptions
//!
//! The pieces do not know about each other; the refresh orchestrator feeds
//! fetcher chunks into the parser and entry descriptions into the extractor.

mod date;
mod fetcher;
mod parser;

pub use date::{DateError, DateExtractor, MonthTable};
pub use fetcher::{FeedBody, FeedFetcher, FetchError, MAX_FEED_SIZE};
pub use parser::{Entries, FeedEntry, FeedParser, ParseError};
