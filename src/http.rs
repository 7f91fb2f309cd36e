//! HTTP Module
//! The two wire surfaces of the proxy: the minimal HTTP/1.1 the player speaks
//! to the loopback listener, and the ranged GETs sent to the origin.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::io;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::error::ProxyError;

/// Requests with a longer header block are dropped.
pub const MAX_REQUEST_HEADER: usize = 16 * 1024;

// Never forwarded to the origin: the host is the loopback listener, range and
// encoding are always set by the proxy.
const NOT_FORWARDED: [&str; 5] = ["host", "range", "accept-encoding", "connection", "content-length"];

/// A request from the player, e.g. `GET /http://cdn/a.mp3 HTTP/1.1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub method: String,
    /// Origin URL taken from the request target
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// First byte asked for; 0 without a `Range` header
    pub range_start: u64,
}

impl ClientRequest {
    /// Parses a header block. Returns `None` for anything that isn't a request
    /// for an absolute http(s) URL.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut lines = raw.lines();
        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let target = request_line.next()?;

        let target = target.trim_start_matches('/');
        let url = if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            let decoded = urlencoding::decode(target).ok()?;
            if !decoded.starts_with("http://") && !decoded.starts_with("https://") {
                return None;
            }
            decoded.into_owned()
        };

        let headers: Vec<(String, String)> = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        let mut request = Self {
            method,
            url,
            headers,
            range_start: 0,
        };
        request.range_start = request.header("range").and_then(parse_range_start).unwrap_or(0);
        Some(request)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Headers worth passing on to the origin.
    pub fn forwarded_headers(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|(name, _)| !NOT_FORWARDED.iter().any(|skip| name.eq_ignore_ascii_case(skip)))
            .cloned()
            .collect()
    }
}

/// Reads one request header block from the player. `Ok(None)` if the
/// connection closes first, the block is too large or it doesn't parse.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<ClientRequest>> {
    let mut raw = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        raw.extend_from_slice(&chunk[..n]);
        if let Some(end) = header_end(&raw) {
            let text = String::from_utf8_lossy(&raw[..end]);
            return Ok(ClientRequest::parse(&text));
        }
        if raw.len() > MAX_REQUEST_HEADER {
            log::warn!("Dropping request with a header over {} bytes", MAX_REQUEST_HEADER);
            return Ok(None);
        }
    }
}

fn header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n"))
}

/// `bytes=100-` or `bytes=100-199` gives 100. Suffix ranges aren't supported.
pub fn parse_range_start(value: &str) -> Option<u64> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, _) = spec.split_once('-')?;
    start.trim().parse().ok()
}

/// Total size of the resource an origin response belongs to: the total in
/// `Content-Range`, else `Content-Length`.
pub fn content_size(headers: &HeaderMap) -> Option<u64> {
    if let Some(range) = headers.get(CONTENT_RANGE).and_then(|v| v.to_str().ok()) {
        return range.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok());
    }
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// First byte of a `Content-Range: bytes s-e/total` header.
pub fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let range = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (start, _) = range.trim().strip_prefix("bytes")?.trim().split_once('-')?;
    start.trim().parse().ok()
}

/// Header the player gets for bytes `start..total`. A start at or past the
/// end gets a 416 with no body.
pub fn response_header(start: u64, total: u64) -> String {
    if start >= total {
        return format!(
            "HTTP/1.1 416 Range Not Satisfiable\r\n\
             Content-Length: 0\r\n\
             Connection: close\r\n\
             Content-Range: bytes */{}\r\n\
             \r\n",
            total
        );
    }
    let end = total.saturating_sub(1);
    format!(
        "HTTP/1.1 206 Partial Content\r\n\
         Content-Type: audio/mpeg\r\n\
         Content-Length: {}\r\n\
         Connection: keep-alive\r\n\
         Accept-Ranges: bytes\r\n\
         Content-Range: bytes {}-{}/{}\r\n\
         \r\n",
        total.saturating_sub(start),
        start,
        end,
        total
    )
}

/// HTTP client for the origin server. Cheap to clone.
#[derive(Clone)]
pub struct OriginClient {
    client: Client,
    read_timeout: Duration,
}

impl OriginClient {
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout())
            .no_proxy()
            .build()
            .map_err(ProxyError::Request)?;
        Ok(Self {
            client,
            read_timeout: config.read_timeout(),
        })
    }

    /// GET `url` from byte `start` on. Fails on any status but 200 and 206.
    pub async fn open(
        &self,
        url: &str,
        forwarded: &[(String, String)],
        start: u64,
        cancel: &CancellationToken,
    ) -> Result<OriginStream, ProxyError> {
        let mut headers = HeaderMap::new();
        for (name, value) in forwarded {
            if NOT_FORWARDED.iter().any(|skip| name.eq_ignore_ascii_case(skip)) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }

        let request = self
            .client
            .get(url)
            .headers(headers)
            .header(RANGE, format!("bytes={}-", start))
            .header(ACCEPT_ENCODING, "identity");

        log::debug!("Origin GET {} from {}", url, start);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            sent = tokio::time::timeout(self.read_timeout, request.send()) => {
                sent.map_err(|_| ProxyError::Timeout)?.map_err(ProxyError::from_reqwest)?
            }
        };

        let status = response.status();
        let position = match status {
            StatusCode::PARTIAL_CONTENT => content_range_start(response.headers()).unwrap_or(start),
            StatusCode::OK => 0,
            _ => {
                return Err(ProxyError::Status {
                    status,
                    url: url.to_string(),
                })
            }
        };
        let total_size = content_size(response.headers());

        Ok(OriginStream {
            body: Box::pin(response.bytes_stream()),
            pending: Bytes::new(),
            position,
            total_size,
            read_timeout: self.read_timeout,
        })
    }
}

type BodyStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Body of an origin response, read in caller-sized pieces.
pub struct OriginStream {
    body: BodyStream,
    pending: Bytes,
    position: u64,
    total_size: Option<u64>,
    read_timeout: Duration,
}

impl OriginStream {
    /// Logical offset of the next byte `read` returns
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Declared size of the whole resource
    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    /// Reads up to `buf.len()` bytes. `Ok(0)` at the end of the body.
    pub async fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize, ProxyError> {
        if buf.is_empty() || !self.fill(cancel).await? {
            return Ok(0);
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        self.position += n as u64;
        Ok(n)
    }

    /// Discards bytes until `position() == target`. Used when the origin
    /// ignored the range and started from 0.
    pub async fn skip_to(&mut self, target: u64, cancel: &CancellationToken) -> Result<(), ProxyError> {
        if target < self.position {
            return Err(ProxyError::UnexpectedRange {
                expected: target,
                actual: self.position,
            });
        }
        while self.position < target {
            if !self.fill(cancel).await? {
                return Err(ProxyError::UnexpectedRange {
                    expected: target,
                    actual: self.position,
                });
            }
            let n = (target - self.position).min(self.pending.len() as u64) as usize;
            let _ = self.pending.split_to(n);
            self.position += n as u64;
        }
        Ok(())
    }

    // False at the end of the body.
    async fn fill(&mut self, cancel: &CancellationToken) -> Result<bool, ProxyError> {
        while self.pending.is_empty() {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                next = tokio::time::timeout(self.read_timeout, self.body.next()) => {
                    next.map_err(|_| ProxyError::Timeout)?
                }
            };
            match next {
                Some(Ok(bytes)) => self.pending = bytes,
                Some(Err(e)) => return Err(ProxyError::from_reqwest(e)),
                None => return Ok(false),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_player_request() {
        let raw = "GET /http://cdn.example.com/a/track01.mp3?sig=1 HTTP/1.1\r\n\
                   Host: 127.0.0.1:4000\r\n\
                   Range: bytes=1024-\r\n\
                   User-Agent: player/2.0\r\n\r\n";
        let request = ClientRequest::parse(raw).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.url, "http://cdn.example.com/a/track01.mp3?sig=1");
        assert_eq!(request.range_start, 1024);
        assert_eq!(request.header("user-agent"), Some("player/2.0"));
        assert_eq!(
            request.forwarded_headers(),
            vec![("User-Agent".to_string(), "player/2.0".to_string())]
        );
    }

    #[test]
    fn accepts_encoded_target() {
        let raw = "GET /https%3A%2F%2Fcdn.example.com%2Fa.mp3 HTTP/1.1\r\n\r\n";
        let request = ClientRequest::parse(raw).unwrap();
        assert_eq!(request.url, "https://cdn.example.com/a.mp3");
        assert_eq!(request.range_start, 0);
    }

    #[rstest]
    #[case("GET /favicon.ico HTTP/1.1\r\n\r\n")]
    #[case("GET\r\n\r\n")]
    #[case("")]
    fn rejects_non_proxy_requests(#[case] raw: &str) {
        assert_eq!(ClientRequest::parse(raw), None);
    }

    #[rstest]
    #[case("bytes=0-", Some(0))]
    #[case("bytes=500-999", Some(500))]
    #[case(" bytes=42- ", Some(42))]
    #[case("bytes=-500", None)]
    #[case("items=1-2", None)]
    fn range_start(#[case] value: &str, #[case] expected: Option<u64>) {
        assert_eq!(parse_range_start(value), expected);
    }

    #[test]
    fn synthesized_header() {
        assert_eq!(
            response_header(300, 1000),
            "HTTP/1.1 206 Partial Content\r\n\
             Content-Type: audio/mpeg\r\n\
             Content-Length: 700\r\n\
             Connection: keep-alive\r\n\
             Accept-Ranges: bytes\r\n\
             Content-Range: bytes 300-999/1000\r\n\r\n"
        );
    }

    #[rstest]
    #[case(1000, 1000)]
    #[case(1200, 1000)]
    fn range_past_the_end_is_unsatisfiable(#[case] start: u64, #[case] total: u64) {
        assert_eq!(
            response_header(start, total),
            "HTTP/1.1 416 Range Not Satisfiable\r\n\
             Content-Length: 0\r\n\
             Connection: close\r\n\
             Content-Range: bytes */1000\r\n\r\n"
        );
    }

    #[test]
    fn size_from_origin_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("700"));
        assert_eq!(content_size(&headers), Some(700));
        assert_eq!(content_range_start(&headers), None);

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 300-999/1000"));
        assert_eq!(content_size(&headers), Some(1000));
        assert_eq!(content_range_start(&headers), Some(300));

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 0-99/*"));
        assert_eq!(content_size(&headers), None);
    }

    #[tokio::test]
    async fn reads_request_across_chunks() {
        let raw = b"GET /http://cdn.example.com/a.mp3 HTTP/1.1\r\nRange: bytes=7-\r\n\r\n".to_vec();
        let (mut client, mut server) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(&raw).await.unwrap();
            client
        });
        let request = read_request(&mut server).await.unwrap().unwrap();
        assert_eq!(request.range_start, 7);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn closed_connection_yields_nothing() {
        let mut partial: &[u8] = b"GET /http://cdn.example.com/a.mp3 HTTP/1.1\r\n";
        assert_eq!(read_request(&mut partial).await.unwrap(), None);
    }
}
