//! 将路由层响应序列化为 HTTP/1.1 报文（带 Content-Length，写完即关闭连接）。

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use axum::http::{HeaderValue, Response, header};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use httpdate::fmt_http_date;
use std::io;
use std::time::SystemTime;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// 写出响应。已声明 Content-Length 的响应体按流写出，否则先收集再计算长度。
pub async fn write_response<W>(
    writer: &mut W,
    response: Response<AxumBody>,
    head_only: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (mut parts, body) = response.into_parts();
    parts
        .headers
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    parts.headers.remove(header::TRANSFER_ENCODING);
    if let Ok(value) = HeaderValue::from_str(&fmt_http_date(SystemTime::now())) {
        parts.headers.insert(header::DATE, value);
    }

    let declared_length = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            parts.status.as_u16(),
            parts.status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );

    match declared_length {
        Some(length) => {
            write_headers(&mut head, &parts.headers);
            writer.write_all(&head).await?;
            if !head_only {
                let mut remaining = length;
                let mut data_stream = BodyExt::into_data_stream(body);
                while let Some(chunk) = data_stream.next().await {
                    let chunk = chunk.map_err(|err: AxumError| io::Error::other(err.to_string()))?;
                    let take = chunk.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    writer.write_all(&chunk[..take]).await?;
                    remaining -= take as u64;
                    if remaining == 0 {
                        break;
                    }
                }
            }
        }
        None => {
            let bytes = body
                .collect()
                .await
                .map_err(|err| io::Error::other(err.to_string()))?
                .to_bytes();
            parts
                .headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            write_headers(&mut head, &parts.headers);
            writer.write_all(&head).await?;
            if !head_only {
                writer.write_all(&bytes).await?;
            }
        }
    }

    writer.flush().await
}

fn write_headers(head: &mut Vec<u8>, headers: &axum::http::HeaderMap) {
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
}
