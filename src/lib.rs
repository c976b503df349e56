//! Due-date tracking for borrowed library items.
//!
//! The library publishes the current loans of an account as an RSS feed. A
//! [`refresh::Refresher`] periodically mirrors that feed into a local SQLite
//! store, and [`refresh::Refresher::due_counts`] summarizes the loans as
//! ok / soon / critical / late.

pub mod config;
pub mod feed;
pub mod refresh;
pub mod storage;
