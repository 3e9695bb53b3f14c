use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const MAX_RETRIES: u32 = 3;
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while retrieving a source document.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    #[error("Response too large")]
    ResponseTooLarge,
    /// Received fewer bytes than Content-Length announced
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Reading a local source file failed
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Request behavior for source fetches.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(2),
        }
    }
}

/// Retrieves the raw bytes of a source document.
///
/// `location` is read from disk when it names an existing file, and fetched
/// over HTTP otherwise.
///
/// # Behavior
///
/// - Each attempt, body included, is bounded by `options.timeout`
/// - HTTP 429 and 5xx responses are retried with exponential backoff (3 retries)
/// - Other non-2xx responses fail immediately
/// - Bodies over 10MB are rejected, short bodies are retried
pub async fn fetch_bytes(
    client: &reqwest::Client,
    location: &str,
    options: FetchOptions,
) -> Result<Vec<u8>, FetchError> {
    if is_local_file(location).await {
        return read_local(location).await;
    }

    let mut retry_count = 0;

    loop {
        // One deadline covers the headers and the body of this attempt
        let deadline = tokio::time::Instant::now() + options.timeout;
        let timed_out = |_: tokio::time::error::Elapsed| FetchError::Timeout(options.timeout);

        let response = tokio::time::timeout_at(deadline, client.get(location).send())
            .await
            .map_err(timed_out)?
            .map_err(FetchError::Network)?;

        let status = response.status();
        let retryable = status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error();

        if retryable {
            if retry_count >= MAX_RETRIES {
                return Err(if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    FetchError::RateLimited(MAX_RETRIES)
                } else {
                    FetchError::HttpStatus(status.as_u16())
                });
            }

            let delay = options.retry_backoff * 2u32.pow(retry_count);
            tracing::warn!(
                source = %location,
                status = %status,
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Source request failed, backing off"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
            continue;
        }

        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let body = tokio::time::timeout_at(deadline, read_limited_bytes(response, MAX_FEED_SIZE))
            .await
            .map_err(timed_out)?;

        match body {
            Ok(bytes) => return Ok(bytes),
            Err(FetchError::IncompleteResponse { expected, received })
                if retry_count < MAX_RETRIES =>
            {
                let delay = options.retry_backoff * 2u32.pow(retry_count);
                tracing::debug!(
                    source = %location,
                    expected = expected,
                    received = received,
                    attempt = retry_count + 1,
                    "Retrying incomplete download"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn is_local_file(location: &str) -> bool {
    if location.starts_with("http://") || location.starts_with("https://") {
        return false;
    }
    tokio::fs::metadata(Path::new(location))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn read_local(location: &str) -> Result<Vec<u8>, FetchError> {
    let io_err = |source| FetchError::Io {
        path: location.to_string(),
        source,
    };

    let metadata = tokio::fs::metadata(location).await.map_err(io_err)?;
    if metadata.len() > MAX_FEED_SIZE as u64 {
        return Err(FetchError::ResponseTooLarge);
    }
    tokio::fs::read(location).await.map_err(io_err)
}

/// Reads a response body, enforcing `limit` and Content-Length completeness.
pub(crate) async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use wiremock::matchers::{any, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// A server that announces 100 body bytes, sends 4, then goes quiet.
    pub(crate) async fn stalled_body_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 100\r\n\r\n<rss",
                        )
                        .await;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                });
            }
        });
        format!("http://{}/", addr)
    }

    const BODY: &str = "<rss version=\"2.0\"><channel></channel></rss>";

    fn fast() -> FetchOptions {
        FetchOptions {
            timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/releases.rss"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
            .mount(&server)
            .await;

        let url = format!("{}/releases.rss", server.uri());
        let bytes = fetch_bytes(&reqwest::Client::new(), &url, fast())
            .await
            .unwrap();
        assert_eq!(bytes, BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_fetch_404_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = fetch_bytes(&reqwest::Client::new(), &server.uri(), fast())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)));
    }

    #[tokio::test]
    async fn test_fetch_500_retries_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4) // Initial request + 3 retries
            .mount(&server)
            .await;

        let err = fetch_bytes(&reqwest::Client::new(), &server.uri(), fast())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(500)));
    }

    #[tokio::test]
    async fn test_fetch_429_exhausts_as_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = fetch_bytes(&reqwest::Client::new(), &server.uri(), fast())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RateLimited(3)));
    }

    #[tokio::test]
    async fn test_fetch_503_then_success() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
            .mount(&server)
            .await;

        let bytes = fetch_bytes(&reqwest::Client::new(), &server.uri(), fast())
            .await
            .unwrap();
        assert_eq!(bytes, BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let options = FetchOptions {
            timeout: Duration::from_millis(50),
            retry_backoff: Duration::from_millis(10),
        };
        let err = fetch_bytes(&reqwest::Client::new(), &server.uri(), options)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_fetch_local_file() {
        let dir = std::env::temp_dir().join("applereleases_fetch_local");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("releases.rss");
        std::fs::write(&file, BODY).unwrap();

        let bytes = fetch_bytes(&reqwest::Client::new(), file.to_str().unwrap(), fast())
            .await
            .unwrap();
        assert_eq!(bytes, BODY.as_bytes());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_fetch_missing_local_path_is_treated_as_url() {
        let err = fetch_bytes(
            &reqwest::Client::new(),
            "/definitely/not/here.rss",
            fast(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)));
    }

    #[tokio::test]
    async fn test_stalled_body_times_out() {
        let url = stalled_body_server().await;
        let options = FetchOptions {
            timeout: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(10),
        };

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            fetch_bytes(&reqwest::Client::new(), &url, options),
        )
        .await
        .expect("fetch must give up on its own");
        assert!(matches!(result, Err(FetchError::Timeout(_))));
    }
}
