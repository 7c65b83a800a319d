//! HTTP seam used by the transfer engines.
//!
//! Engines talk to the network only through [`HttpClient`], so tests drive
//! them with in-memory servers. [`ReqwestClient`] is the production client.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, COOKIE, RANGE};
use tracing::debug;

use ferry_protocol::wire::Header;

/// Errors from HTTP exchanges.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("connection closed before the transfer completed")]
    UnexpectedEof,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Boxed future returned by [`HttpClient`] methods.
pub type HttpFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, HttpError>> + Send + 'a>>;

/// Body of a download response, yielded in arbitrary-sized pieces.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, HttpError>> + Send>>;

/// Response to a ranged GET.
pub struct RangeBody {
    /// `true` when the server honoured the range (`206`), `false` when it
    /// sent the whole resource (`200`).
    pub partial: bool,
    pub stream: ByteStream,
}

/// Response to a POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostResponse {
    pub status: u16,
    pub body: String,
}

impl PostResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Network operations needed by downloads and uploads.
pub trait HttpClient: Send + Sync {
    /// Asks for the size of the resource at `url` (`HEAD`, `Content-Length`).
    ///
    /// Returns `Ok(None)` when the server answers without a length.
    fn probe_length<'a>(&'a self, url: &'a str) -> HttpFuture<'a, Option<u64>>;

    /// Requests the resource from byte `offset` onwards.
    fn get_range<'a>(&'a self, url: &'a str, offset: u64) -> HttpFuture<'a, RangeBody>;

    /// Sends `body` with the given headers.
    fn post<'a>(&'a self, url: &'a str, headers: Vec<Header>, body: Bytes) -> HttpFuture<'a, PostResponse>;
}

/// Supplies the `Cookie` header for outbound requests.
pub trait CookieProvider: Send + Sync {
    fn cookie_header(&self, url: &str) -> Option<String>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestClient {
    http: reqwest::Client,
    cookies: Option<Arc<dyn CookieProvider>>,
}

impl ReqwestClient {
    /// Creates a client with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Result<Self, HttpError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            cookies: None,
        })
    }

    /// Attaches cookies from `provider` to every request.
    pub fn with_cookies(mut self, provider: Arc<dyn CookieProvider>) -> Self {
        self.cookies = Some(provider);
        self
    }

    fn with_cookie(&self, url: &str, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.cookies.as_ref().and_then(|c| c.cookie_header(url)) {
            Some(cookie) => req.header(COOKIE, cookie),
            None => req,
        }
    }
}

impl HttpClient for ReqwestClient {
    fn probe_length<'a>(&'a self, url: &'a str) -> HttpFuture<'a, Option<u64>> {
        Box::pin(async move {
            let resp = self.with_cookie(url, self.http.head(url)).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(HttpError::Status(status.as_u16()));
            }

            // Read the header directly; the body of a HEAD response is empty.
            let length = resp
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            debug!(url, ?length, "probed content length");
            Ok(length)
        })
    }

    fn get_range<'a>(&'a self, url: &'a str, offset: u64) -> HttpFuture<'a, RangeBody> {
        Box::pin(async move {
            let req = self.http.get(url).header(RANGE, format!("bytes={offset}-"));
            let resp = self.with_cookie(url, req).send().await?;
            let partial = match resp.status() {
                StatusCode::PARTIAL_CONTENT => true,
                StatusCode::OK => false,
                other => return Err(HttpError::Status(other.as_u16())),
            };
            let stream = resp.bytes_stream().map_err(HttpError::from);
            Ok(RangeBody {
                partial,
                stream: Box::pin(stream),
            })
        })
    }

    fn post<'a>(&'a self, url: &'a str, headers: Vec<Header>, body: Bytes) -> HttpFuture<'a, PostResponse> {
        Box::pin(async move {
            let mut req = self.http.post(url);
            for (name, value) in headers {
                req = req.header(name, value);
            }
            let resp = self.with_cookie(url, req).body(body).send().await?;
            let status = resp.status().as_u16();
            let body = resp.text().await?;
            Ok(PostResponse { status, body })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Starts a one-shot HTTP server that replies with `response` and hands
    /// back the raw request it received.
    async fn mock_server(response: String) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}/file");
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 16 * 1024];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let _ = tx.send(String::from_utf8_lossy(&buf[..n]).into_owned());
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (url, rx)
    }

    fn client() -> ReqwestClient {
        ReqwestClient::new(Duration::from_secs(5)).unwrap()
    }

    struct StaticCookie;

    impl CookieProvider for StaticCookie {
        fn cookie_header(&self, _url: &str) -> Option<String> {
            Some("session=abc".into())
        }
    }

    #[tokio::test]
    async fn probe_reads_content_length() {
        let (url, request) = mock_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 5000\r\nConnection: close\r\n\r\n".into(),
        )
        .await;

        let length = client().probe_length(&url).await.unwrap();
        assert_eq!(length, Some(5000));

        let request = request.await.unwrap();
        assert!(request.starts_with("HEAD /file"));
    }

    #[tokio::test]
    async fn probe_rejects_error_status() {
        let (url, _request) = mock_server(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".into(),
        )
        .await;

        let err = client().probe_length(&url).await.unwrap_err();
        assert!(matches!(err, HttpError::Status(404)));
    }

    #[tokio::test]
    async fn get_range_sends_range_header() {
        let (url, request) = mock_server(
            "HTTP/1.1 206 Partial Content\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello"
                .into(),
        )
        .await;

        let body = client().get_range(&url, 2500).await.unwrap();
        assert!(body.partial);

        let chunks: Vec<Bytes> = body.stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(chunks.concat(), b"hello");

        let request = request.await.unwrap().to_ascii_lowercase();
        assert!(request.contains("range: bytes=2500-"));
    }

    #[tokio::test]
    async fn get_range_full_response_is_not_partial() {
        let (url, _request) = mock_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\nabc".into(),
        )
        .await;

        let body = client().get_range(&url, 0).await.unwrap();
        assert!(!body.partial);
    }

    #[tokio::test]
    async fn post_sends_headers_and_cookie() {
        let (url, request) = mock_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 26\r\nConnection: close\r\n\r\nRESOURCEID:r1;BEFORE:0\r\nok"
                .into(),
        )
        .await;

        let client = client().with_cookies(Arc::new(StaticCookie));
        let headers = ferry_protocol::wire::handshake_headers(None, "a.txt", 10);
        let resp = client.post(&url, headers, Bytes::new()).await.unwrap();
        assert!(resp.is_ok());
        assert_eq!(ferry_protocol::wire::first_line(&resp.body), "RESOURCEID:r1;BEFORE:0");

        let request = request.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("post /file"));
        assert!(request.contains("actionname: hand"));
        assert!(request.contains("filesize: 10"));
        assert!(request.contains("cookie: session=abc"));
    }
}
