//! Integration tests for the refresh lifecycle: fetch, parse, validate, commit.
//!
//! Each test runs a wiremock server as the library catalog and its own
//! in-memory SQLite database. Due dates are generated relative to today so
//! the bucket counts are stable whenever the tests run.

use std::time::Duration;

use chrono::{Datelike, Days, NaiveDate, Utc};
use loanwatch::feed::{FeedFetcher, FetchError, MAX_FEED_SIZE};
use loanwatch::refresh::{EntryError, RefreshError, RefreshOutcome, RefreshSettings, Refresher};
use loanwatch::storage::{Database, DueCounts};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mär", "Apr", "Mai", "Jun", "Jul", "Aug", "Sep", "Okt", "Nov", "Dez",
];

fn german_date(date: NaiveDate) -> String {
    format!("{} {} {}", date.day(), MONTHS[date.month0() as usize], date.year())
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn item(title: &str, due: NaiveDate) -> String {
    format!(
        "<item><title>{}</title><link>https://katalog.example.org/titel/{}</link>\
         <description>Ausgeliehen, Leihfrist bis {}</description></item>",
        title,
        title.to_lowercase(),
        german_date(due)
    )
}

fn feed(items: &[String]) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<rss version=\"2.0\"><channel>\
         <title>Konto</title>{}</channel></rss>",
        items.concat()
    )
}

/// One item per bucket: ok, soon, critical, late.
fn four_bucket_feed() -> String {
    let today = today();
    feed(&[
        item("Faust", today + Days::new(30)),
        item("Werther", today + Days::new(2)),
        item("Kabale", today),
        item("Woyzeck", today - Days::new(3)),
    ])
}

async fn refresher(server: &MockServer) -> Refresher {
    refresher_with(server, |s| s).await
}

async fn refresher_with(
    server: &MockServer,
    adjust: impl FnOnce(RefreshSettings) -> RefreshSettings,
) -> Refresher {
    let db = Database::open(":memory:").await.unwrap();
    let fetcher = FeedFetcher::new(MAX_FEED_SIZE).unwrap();
    let settings = adjust(RefreshSettings::new(format!("{}/rss", server.uri())));
    Refresher::new(db, fetcher, settings)
}

async fn mount_feed(server: &MockServer, body: String) {
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("Content-Type", "application/rss+xml"),
        )
        .mount(server)
        .await;
}

// ============================================================================
// Successful Refresh
// ============================================================================

#[tokio::test]
async fn test_refresh_counts_every_entry_once() {
    let server = MockServer::start().await;
    mount_feed(&server, four_bucket_feed()).await;

    let refresher = refresher(&server).await;
    assert_eq!(
        refresher.refresh().await.unwrap(),
        RefreshOutcome::Refreshed { records: 4 }
    );

    let counts = refresher.due_counts().await.unwrap();
    assert_eq!(
        counts,
        DueCounts {
            ok: 1,
            soon: 1,
            critical: 1,
            late: 1,
        }
    );
    assert_eq!(counts.total(), 4);
}

#[tokio::test]
async fn test_poll_refreshes_then_reports() {
    let server = MockServer::start().await;
    mount_feed(&server, four_bucket_feed()).await;

    let report = refresher(&server).await.poll(false).await.unwrap();
    assert!(matches!(
        report.refresh,
        Ok(RefreshOutcome::Refreshed { records: 4 })
    ));
    assert_eq!(report.counts.to_string(), "ok=1 soon=1 critical=1 late=1");
}

#[tokio::test]
async fn test_same_feed_twice_is_idempotent() {
    let server = MockServer::start().await;
    mount_feed(&server, four_bucket_feed()).await;

    let refresher = refresher(&server).await;
    refresher.refresh().await.unwrap();
    let first_counts = refresher.due_counts().await.unwrap();
    let first_records = refresher.database().records().await.unwrap();

    refresher.refresh().await.unwrap();
    assert_eq!(refresher.due_counts().await.unwrap(), first_counts);
    assert_eq!(refresher.database().records().await.unwrap(), first_records);
}

#[tokio::test]
async fn test_empty_feed_clears_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(four_bucket_feed()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_feed(&server, feed(&[])).await;

    let refresher = refresher(&server).await;
    refresher.refresh().await.unwrap();
    assert_eq!(
        refresher.refresh().await.unwrap(),
        RefreshOutcome::Refreshed { records: 0 }
    );
    assert_eq!(refresher.due_counts().await.unwrap(), DueCounts::default());
}

// ============================================================================
// Throttling
// ============================================================================

#[tokio::test]
async fn test_two_polls_within_interval_fetch_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(four_bucket_feed()))
        .expect(1)
        .mount(&server)
        .await;

    let refresher = refresher(&server).await;
    let first = refresher.poll(false).await.unwrap();
    let second = refresher.poll(false).await.unwrap();

    assert!(matches!(first.refresh, Ok(RefreshOutcome::Refreshed { .. })));
    assert!(matches!(second.refresh, Ok(RefreshOutcome::Skipped)));
    assert_eq!(first.counts, second.counts);
}

#[tokio::test]
async fn test_forced_poll_ignores_throttle() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(four_bucket_feed()))
        .expect(2)
        .mount(&server)
        .await;

    let refresher = refresher(&server).await;
    refresher.poll(false).await.unwrap();
    let forced = refresher.poll(true).await.unwrap();
    assert!(matches!(forced.refresh, Ok(RefreshOutcome::Refreshed { .. })));
}

#[tokio::test]
async fn test_concurrent_refreshes_are_single_flight() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(four_bucket_feed())
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let refresher = refresher(&server).await;
    let (a, b) = tokio::join!(refresher.refresh_if_due(), refresher.refresh_if_due());

    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, RefreshOutcome::Skipped));
    assert_eq!(
        outcomes,
        vec![RefreshOutcome::Refreshed { records: 4 }, RefreshOutcome::Skipped]
    );
}

// ============================================================================
// Failed Refresh Leaves State Unchanged
// ============================================================================

#[tokio::test]
async fn test_missing_description_on_first_refresh_leaves_store_empty() {
    let server = MockServer::start().await;
    let today = today();
    let body = feed(&[
        item("Faust", today + Days::new(10)),
        item("Werther", today + Days::new(11)),
        item("Kabale", today + Days::new(12)),
        "<item><title>Woyzeck</title><link>https://katalog.example.org/titel/woyzeck</link></item>"
            .to_string(),
    ]);
    mount_feed(&server, body).await;

    let refresher = refresher(&server).await;
    match refresher.refresh().await {
        Err(RefreshError::InvalidEntry { index, source }) => {
            assert_eq!(index, 3);
            assert_eq!(source, EntryError::MissingDescription);
        }
        other => panic!("Expected InvalidEntry, got {:?}", other),
    }

    assert_eq!(refresher.database().record_count().await.unwrap(), 0);
    assert_eq!(refresher.database().last_update().await.unwrap(), None);
    assert_eq!(refresher.due_counts().await.unwrap(), DueCounts::default());
}

#[tokio::test]
async fn test_invalid_entry_on_later_refresh_keeps_previous_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(four_bucket_feed()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    let today = today();
    mount_feed(
        &server,
        feed(&[
            item("Faust", today + Days::new(10)),
            "<item><title>Ohne Datum</title><link>https://k/1</link>\
             <description>bald</description></item>"
                .to_string(),
        ]),
    )
    .await;

    let refresher = refresher(&server).await;
    refresher.refresh().await.unwrap();
    let records = refresher.database().records().await.unwrap();
    let marker = refresher.database().last_update().await.unwrap();

    let err = refresher.refresh().await.unwrap_err();
    assert!(matches!(err, RefreshError::InvalidEntry { index: 1, .. }));

    assert_eq!(refresher.database().records().await.unwrap(), records);
    assert_eq!(refresher.database().last_update().await.unwrap(), marker);
}

#[tokio::test]
async fn test_malformed_document_leaves_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(four_bucket_feed()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_feed(&server, "<rss><channel><item><title>Abgeschnitten".to_string()).await;

    let refresher = refresher(&server).await;
    refresher.refresh().await.unwrap();
    let records = refresher.database().records().await.unwrap();

    let err = refresher.refresh().await.unwrap_err();
    assert!(matches!(err, RefreshError::MalformedDocument(_)), "got {:?}", err);
    assert_eq!(refresher.database().records().await.unwrap(), records);
}

#[tokio::test]
async fn test_http_error_leaves_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(four_bucket_feed()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let refresher = refresher(&server).await;
    refresher.refresh().await.unwrap();
    let marker = refresher.database().last_update().await.unwrap();

    let report = refresher.poll(true).await.unwrap();
    assert!(matches!(
        report.refresh,
        Err(RefreshError::FetchFailed(FetchError::HttpStatus(404)))
    ));
    assert_eq!(report.counts.total(), 4);
    assert_eq!(refresher.database().last_update().await.unwrap(), marker);
}

#[tokio::test]
async fn test_oversized_feed_is_fetch_failure() {
    let server = MockServer::start().await;
    mount_feed(&server, four_bucket_feed()).await;

    let db = Database::open(":memory:").await.unwrap();
    let fetcher = FeedFetcher::new(64).unwrap();
    let refresher = Refresher::new(
        db,
        fetcher,
        RefreshSettings::new(format!("{}/rss", server.uri())),
    );

    assert!(matches!(
        refresher.refresh().await,
        Err(RefreshError::FetchFailed(FetchError::ResponseTooLarge { limit: 64 }))
    ));
    assert_eq!(refresher.database().record_count().await.unwrap(), 0);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancelled_refresh_leaves_store_and_next_refresh_runs() {
    let server = MockServer::start().await;
    let today = today();

    // 1st request: initial state; 2nd: stalls; afterwards: new state
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(feed(&[item("Faust", today)])),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(four_bucket_feed())
                .set_delay(Duration::from_secs(10)),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_feed(&server, four_bucket_feed()).await;

    let refresher = refresher(&server).await;
    refresher.refresh().await.unwrap();
    let records = refresher.database().records().await.unwrap();
    let marker = refresher.database().last_update().await.unwrap();

    let cancelled = tokio::time::timeout(Duration::from_millis(200), refresher.refresh()).await;
    assert!(cancelled.is_err(), "refresh should have been cancelled");

    assert_eq!(refresher.database().records().await.unwrap(), records);
    assert_eq!(refresher.database().last_update().await.unwrap(), marker);

    assert_eq!(
        refresher.refresh().await.unwrap(),
        RefreshOutcome::Refreshed { records: 4 }
    );
}

#[tokio::test]
async fn test_fetch_timeout_reports_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(four_bucket_feed())
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let refresher = refresher_with(&server, |s| RefreshSettings {
        fetch_timeout: Duration::from_millis(200),
        ..s
    })
    .await;

    let report = refresher.poll(false).await.unwrap();
    assert!(matches!(
        report.refresh,
        Err(RefreshError::FetchFailed(FetchError::Timeout))
    ));
    assert_eq!(report.counts, DueCounts::default());
}
