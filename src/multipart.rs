//! `multipart/form-data` 上传解析：文本字段与单个文件分段。

use bytes::Bytes;
use memchr::memmem;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum MultipartError {
    NotMultipart,
    MissingBoundary,
    BoundaryNotFound,
    MalformedPart,
    EmptyFilename,
    MissingFile,
}

impl fmt::Display for MultipartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            MultipartError::NotMultipart => "content type is not multipart/form-data",
            MultipartError::MissingBoundary => "multipart boundary is missing",
            MultipartError::BoundaryNotFound => "multipart boundary not found in body",
            MultipartError::MalformedPart => "malformed multipart part",
            MultipartError::EmptyFilename => "filename is empty",
            MultipartError::MissingFile => "no file part in upload",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for MultipartError {}

#[derive(Debug)]
pub struct FilePart {
    pub field_name: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

#[derive(Debug)]
pub struct MultipartForm {
    pub fields: HashMap<String, String>,
    pub file: FilePart,
}

impl MultipartForm {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// 从 Content-Type 中提取 boundary，支持带引号的写法。
pub fn boundary_from_content_type(content_type: &str) -> Result<String, MultipartError> {
    let mut params = split_params(content_type).into_iter();
    let media_type = params.next().unwrap_or_default();
    if !media_type.trim().eq_ignore_ascii_case("multipart/form-data") {
        return Err(MultipartError::NotMultipart);
    }
    params
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| unquote(value.trim()))
        .filter(|boundary| !boundary.is_empty())
        .ok_or(MultipartError::MissingBoundary)
}

/// 解析整个请求体。只接受第一个带 `filename` 的分段作为上传文件。
pub fn parse(body: &Bytes, boundary: &str) -> Result<MultipartForm, MultipartError> {
    if boundary.is_empty() {
        return Err(MultipartError::MissingBoundary);
    }
    let dash_boundary = format!("--{boundary}");
    let delimiter = format!("\r\n--{boundary}");
    let delimiter_finder = memmem::Finder::new(delimiter.as_bytes());

    let mut pos = if body.starts_with(dash_boundary.as_bytes()) {
        dash_boundary.len()
    } else {
        delimiter_finder
            .find(body)
            .map(|idx| idx + delimiter.len())
            .ok_or(MultipartError::BoundaryNotFound)?
    };

    let mut fields = HashMap::new();
    let mut file: Option<FilePart> = None;

    loop {
        let rest = &body[pos..];
        if rest.starts_with(b"--") {
            break;
        }
        let padding = rest
            .iter()
            .take_while(|b| **b == b' ' || **b == b'\t')
            .count();
        if !rest[padding..].starts_with(b"\r\n") {
            return Err(MultipartError::MalformedPart);
        }
        let part_start = pos + padding + 2;

        let next_delimiter = delimiter_finder
            .find(&body[part_start..])
            .map(|idx| part_start + idx)
            .ok_or(MultipartError::BoundaryNotFound)?;

        let (headers, data_start) = if body[part_start..].starts_with(b"\r\n") {
            (&body[part_start..part_start], part_start + 2)
        } else {
            let header_end = memmem::find(&body[part_start..], b"\r\n\r\n")
                .map(|idx| part_start + idx)
                .filter(|end| *end <= next_delimiter)
                .ok_or(MultipartError::MalformedPart)?;
            (&body[part_start..header_end], header_end + 4)
        };
        if data_start > next_delimiter {
            return Err(MultipartError::MalformedPart);
        }

        let part = PartHeaders::parse(headers)?;
        let data = body.slice(data_start..next_delimiter);
        match part.filename {
            Some(filename) if file.is_none() => {
                if filename.is_empty() {
                    return Err(MultipartError::EmptyFilename);
                }
                file = Some(FilePart {
                    field_name: part.name,
                    filename,
                    content_type: part.content_type,
                    data,
                });
            }
            Some(_) => {}
            None => {
                fields.insert(part.name, String::from_utf8_lossy(&data).into_owned());
            }
        }

        pos = next_delimiter + delimiter.len();
    }

    let file = file.ok_or(MultipartError::MissingFile)?;
    Ok(MultipartForm { fields, file })
}

struct PartHeaders {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
}

impl PartHeaders {
    fn parse(block: &[u8]) -> Result<Self, MultipartError> {
        let text = std::str::from_utf8(block).map_err(|_| MultipartError::MalformedPart)?;
        let mut disposition = None;
        let mut content_type = None;

        for line in text.split("\r\n").filter(|line| !line.is_empty()) {
            let (name, value) = line.split_once(':').ok_or(MultipartError::MalformedPart)?;
            let name = name.trim();
            if name.eq_ignore_ascii_case("content-disposition") {
                disposition = Some(value.trim());
            } else if name.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim().to_string());
            }
        }

        let mut params = split_params(disposition.ok_or(MultipartError::MalformedPart)?).into_iter();
        if !params
            .next()
            .is_some_and(|kind| kind.trim().eq_ignore_ascii_case("form-data"))
        {
            return Err(MultipartError::MalformedPart);
        }

        let mut name = None;
        let mut filename = None;
        for param in params {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = unquote(value.trim());
            match key.trim().to_ascii_lowercase().as_str() {
                "name" => name = Some(value),
                "filename" => filename = Some(value),
                _ => {}
            }
        }

        Ok(Self {
            name: name.unwrap_or_default(),
            filename,
            content_type,
        })
    }
}

/// 按 `;` 切分参数，忽略引号内的分号；引号内 `\` 转义下一个字符。
fn split_params(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (idx, ch) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                parts.push(&value[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

/// 去掉外层引号并还原 `\"`、`\\` 转义；其余反斜杠原样保留。
fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
    else {
        return value.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\'
            && let Some(&(next @ ('"' | '\\'))) = chars.peek()
        {
            out.push(next);
            chars.next();
            continue;
        }
        out.push(ch);
    }
    out
}
