use futures::stream::{BoxStream, StreamExt};
use reqwest::redirect::Policy;
use thiserror::Error;

/// Default cap on the response body.
pub const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Maximum number of redirect hops followed for one request.
const MAX_REDIRECTS: usize = 10;

/// Errors that can occur while retrieving the feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Retrieval exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the size limit
    #[error("Response too large (limit {limit} bytes)")]
    ResponseTooLarge { limit: usize },
}

/// Body chunks of an opened feed response.
pub type FeedBody = BoxStream<'static, Result<Vec<u8>, FetchError>>;

/// Redirect policy with loop detection and a hop limit.
fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error(format!("Too many redirects (max {})", MAX_REDIRECTS));
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

/// HTTP transport for the loan feed.
///
/// Opens a GET request and hands back the body as a stream of chunks, so
/// the caller can parse while bytes arrive. The size limit is enforced on
/// the stream itself.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl FeedFetcher {
    /// Build a fetcher with its own HTTP client.
    pub fn new(max_bytes: usize) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(redirect_policy())
            .user_agent(concat!("loanwatch/", env!("CARGO_PKG_VERSION")))
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(client, max_bytes))
    }

    /// Use an existing client (custom TLS or proxy settings, tests).
    pub fn with_client(client: reqwest::Client, max_bytes: usize) -> Self {
        Self { client, max_bytes }
    }

    /// Send the request and return the body stream.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Network`] - Connection, TLS or redirect errors
    /// - [`FetchError::HttpStatus`] - Non-2xx HTTP response
    /// - [`FetchError::ResponseTooLarge`] - Declared Content-Length over the limit
    ///
    /// Items of the returned stream fail with `Network` when the connection
    /// breaks and with `ResponseTooLarge` once the limit is crossed; the
    /// stream should not be polled after an error.
    pub async fn open(&self, url: &str) -> Result<FeedBody, FetchError> {
        let response = self.client.get(url).send().await?;

        // EDGE-002: Validate HTTP status before reading the body
        let status = response.status();
        if !status.is_success() {
            tracing::debug!(url = %url, status = %status, "Feed request rejected");
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let limit = self.max_bytes;

        // Fast path: check Content-Length header
        if let Some(len) = response.content_length() {
            if len > limit as u64 {
                return Err(FetchError::ResponseTooLarge { limit });
            }
        }

        let mut received = 0usize;
        let body = response.bytes_stream().map(move |chunk| {
            let chunk = chunk?;
            received = received.saturating_add(chunk.len());
            if received > limit {
                return Err(FetchError::ResponseTooLarge { limit });
            }
            tracing::trace!(chunk = chunk.len(), received = received, "Feed chunk");
            Ok(Vec::from(chunk))
        });

        Ok(body.boxed())
    }
}
