//! 上传、下载、查看与目录操作处理器。

use axum::body::Body as AxumBody;
use axum::extract::rejection::FormRejection;
use axum::extract::{Extension, Form, Path as RoutePath, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use httpdate::fmt_http_date;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::http::{dashboard_location, found};
use crate::multipart::{self, boundary_from_content_type};
use crate::storage::{Storage, normalize_dir};

#[derive(Deserialize)]
pub(crate) struct DeleteFileForm {
    path: Option<String>,
    filename: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct FolderForm {
    path: Option<String>,
    foldername: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct FileQuery {
    file: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Inline,
    Attachment,
}

fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
    value
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{field} is required")))
}

fn form_error(err: FormRejection) -> ApiError {
    ApiError::BadRequest(err.body_text())
}

/// 上传文件：解析 multipart 请求体，写入 `path` 字段指定的目录。
pub async fn upload(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let boundary = boundary_from_content_type(content_type)?;
    let form = multipart::parse(&body, &boundary)?;
    let dir = normalize_dir(form.field("path").unwrap_or("/"))?;

    let target = storage
        .write_file(&username, &dir, &form.file.filename, &form.file.data)
        .await?;
    info!(
        username,
        path = %target.display(),
        field = form.file.field_name,
        content_type = form.file.content_type.as_deref().unwrap_or("-"),
        size = form.file.data.len(),
        "upload file"
    );
    Ok(found(&dashboard_location(&dir)))
}

/// 删除文件。
pub async fn delete_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    form: Result<Form<DeleteFileForm>, FormRejection>,
) -> Result<Response, ApiError> {
    let Form(form) = form.map_err(form_error)?;
    let dir = normalize_dir(form.path.as_deref().unwrap_or("/"))?;
    let filename = required(form.filename, "filename")?;

    storage.delete_file(&username, &dir, &filename).await?;
    info!(username, dir, filename, "delete file");
    Ok(found(&dashboard_location(&dir)))
}

/// 新建目录。
pub async fn create_folder(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    form: Result<Form<FolderForm>, FormRejection>,
) -> Result<Response, ApiError> {
    let Form(form) = form.map_err(form_error)?;
    let dir = normalize_dir(form.path.as_deref().unwrap_or("/"))?;
    let foldername = required(form.foldername, "foldername")?;

    storage.create_dir(&username, &dir, &foldername).await?;
    info!(username, dir, foldername, "create folder");
    Ok(found(&dashboard_location(&dir)))
}

/// 递归删除目录。
pub async fn delete_folder(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    form: Result<Form<FolderForm>, FormRejection>,
) -> Result<Response, ApiError> {
    let Form(form) = form.map_err(form_error)?;
    let dir = normalize_dir(form.path.as_deref().unwrap_or("/"))?;
    let foldername = required(form.foldername, "foldername")?;

    storage.delete_dir(&username, &dir, &foldername).await?;
    info!(username, dir, foldername, "delete folder");
    Ok(found(&dashboard_location(&dir)))
}

/// 在浏览器中直接查看文件。
pub async fn view_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let file = required(query.file, "file")?;
    serve_user_file(&storage, &username, &file, Disposition::Inline).await
}

/// 以附件形式下载文件。
pub async fn download_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let file = required(query.file, "file")?;
    serve_user_file(&storage, &username, &file, Disposition::Attachment).await
}

/// `/user_files/<owner>/<path>` 静态访问，仅限本人。
pub async fn user_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    RoutePath((owner, path)): RoutePath<(String, String)>,
) -> Result<Response, ApiError> {
    if owner != username {
        return Err(ApiError::Forbidden("Forbidden".into()));
    }
    serve_user_file(&storage, &username, &path, Disposition::Inline).await
}

fn is_script(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("php"))
}

async fn serve_user_file(
    storage: &Storage,
    username: &str,
    relative: &str,
    disposition: Disposition,
) -> Result<Response, ApiError> {
    if is_script(relative) {
        return Err(ApiError::Forbidden("Forbidden".into()));
    }
    let target = storage.resolve_user_path(username, relative, false).await?;
    let metadata = fs::metadata(&target).await.map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => ApiError::NotFound("Not Found".into()),
        _ => ApiError::Internal(err.to_string()),
    })?;
    if metadata.is_dir() {
        return Err(ApiError::BadRequest("path is not a file".into()));
    }

    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mime = mime_guess::from_path(&target).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(metadata.len()),
    );
    if let Ok(modified) = metadata.modified()
        && let Ok(value) = HeaderValue::from_str(&fmt_http_date(modified))
    {
        response_headers.insert(header::LAST_MODIFIED, value);
    }
    if disposition == Disposition::Attachment {
        response_headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&attachment_header(&name))
                .map_err(|_| ApiError::Internal("invalid content disposition".into()))?,
        );
    }

    let file = File::open(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    info!(username, path = relative, size = metadata.len(), "serve file");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// ASCII 回退名加 RFC 5987 编码名。
fn attachment_header(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        utf8_percent_encode(name, NON_ALPHANUMERIC)
    )
}
