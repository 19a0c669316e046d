//! 单连接单请求的 HTTP/1.x 报文读取：先读到头部结束，再按 Content-Length 读取请求体。

use axum::body::Body as AxumBody;
use axum::http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, Version};
use bytes::{Bytes, BytesMut};
use memchr::memmem;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;

#[derive(Clone, Copy, Debug)]
pub struct FrameLimits {
    pub max_header_bytes: usize,
    pub max_body_bytes: u64,
    /// 两次读取之间允许的最长空闲时间；只要持续有数据到达，请求就不会超时。
    pub idle_timeout: Duration,
}

#[derive(Debug)]
pub enum FrameError {
    /// 对端在完整请求到达前关闭连接。
    ConnectionClosed,
    Io(io::Error),
    Timeout,
    Malformed(String),
    HeaderTooLarge,
    BodyTooLarge,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::ConnectionClosed => f.write_str("connection closed before request completed"),
            FrameError::Io(err) => write!(f, "read failed: {err}"),
            FrameError::Timeout => f.write_str("connection idle while reading request"),
            FrameError::Malformed(reason) => write!(f, "malformed request: {reason}"),
            FrameError::HeaderTooLarge => f.write_str("request head too large"),
            FrameError::BodyTooLarge => f.write_str("request body too large"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        FrameError::Io(err)
    }
}

#[derive(Debug, PartialEq)]
pub struct RawRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawRequest {
    /// 转换为路由层使用的 `http::Request`。
    pub fn into_http_request(self) -> Request<AxumBody> {
        let mut request = Request::new(AxumBody::from(self.body));
        *request.method_mut() = self.method;
        *request.uri_mut() = self.uri;
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers;
        request
    }
}

/// 从流中读取一个完整请求。
pub async fn read_request<R>(reader: &mut R, limits: &FrameLimits) -> Result<RawRequest, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let finder = memmem::Finder::new(HEAD_TERMINATOR);
    let mut scanned: usize = 0;

    let head_len = loop {
        // 终止符可能跨越两次读取
        let from = scanned.saturating_sub(HEAD_TERMINATOR.len() - 1);
        if let Some(idx) = finder.find(&buf[from..]) {
            break from + idx + HEAD_TERMINATOR.len();
        }
        if buf.len() > limits.max_header_bytes {
            return Err(FrameError::HeaderTooLarge);
        }
        scanned = buf.len();
        buf.reserve(READ_CHUNK);
        if read_some(reader, &mut buf, limits.idle_timeout).await? == 0 {
            return Err(FrameError::ConnectionClosed);
        }
    };
    if head_len > limits.max_header_bytes {
        return Err(FrameError::HeaderTooLarge);
    }

    let (method, uri, version, headers) = parse_head(&buf[..head_len])?;
    if headers.contains_key(TRANSFER_ENCODING) {
        return Err(FrameError::Malformed("transfer-encoding is not supported".into()));
    }

    let mut body = buf.split_off(head_len);
    let body = match content_length(&headers)? {
        None if !body.is_empty() => {
            return Err(FrameError::Malformed("body without content-length".into()));
        }
        None => Bytes::new(),
        Some(length) if length > limits.max_body_bytes => return Err(FrameError::BodyTooLarge),
        Some(length) => {
            let length = usize::try_from(length).map_err(|_| FrameError::BodyTooLarge)?;
            while body.len() < length {
                body.reserve((length - body.len()).min(64 * READ_CHUNK));
                if read_some(reader, &mut body, limits.idle_timeout).await? == 0 {
                    return Err(FrameError::ConnectionClosed);
                }
            }
            body.truncate(length);
            body.freeze()
        }
    };

    Ok(RawRequest {
        method,
        uri,
        version,
        headers,
        body,
    })
}

async fn read_some<R>(reader: &mut R, buf: &mut BytesMut, idle: Duration) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin,
{
    match time::timeout(idle, reader.read_buf(buf)).await {
        Ok(read) => Ok(read?),
        Err(_) => Err(FrameError::Timeout),
    }
}

fn parse_head(head: &[u8]) -> Result<(Method, Uri, Version, HeaderMap), FrameError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut header_storage);
    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(FrameError::Malformed("incomplete request head".into()));
        }
        Err(httparse::Error::TooManyHeaders) => return Err(FrameError::HeaderTooLarge),
        Err(err) => return Err(FrameError::Malformed(err.to_string())),
    }

    let method = parsed
        .method
        .ok_or_else(|| FrameError::Malformed("missing method".into()))
        .and_then(|value| {
            Method::from_bytes(value.as_bytes())
                .map_err(|_| FrameError::Malformed("invalid method".into()))
        })?;
    let uri = parsed
        .path
        .ok_or_else(|| FrameError::Malformed("missing request target".into()))
        .and_then(|value| {
            value
                .parse::<Uri>()
                .map_err(|_| FrameError::Malformed("invalid request target".into()))
        })?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(FrameError::Malformed("unsupported http version".into())),
    };

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| FrameError::Malformed("invalid header name".into()))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| FrameError::Malformed("invalid header value".into()))?;
        headers.append(name, value);
    }

    Ok((method, uri, version, headers))
}

/// 解析 Content-Length；多个取值必须一致。
fn content_length(headers: &HeaderMap) -> Result<Option<u64>, FrameError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .map(str::trim)
            .filter(|value| !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| FrameError::Malformed("invalid content-length".into()))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(FrameError::Malformed("conflicting content-length".into()));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}
