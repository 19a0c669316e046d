//! 统一的处理器错误类型与转换。

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use std::io::ErrorKind;
use tracing::warn;

use crate::multipart::MultipartError;
use crate::storage::StorageError;
use crate::users::UserStoreError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    /// 携带 HTML 片段，直接展示给浏览器。
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Unauthorized(html) => (StatusCode::UNAUTHORIZED, Html(html)).into_response(),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::Internal(msg) => {
                warn!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            StorageError::InvalidName => ApiError::BadRequest("invalid name".into()),
            StorageError::Occupied => {
                ApiError::Conflict("a folder with that name already exists".into())
            }
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound("not found".into()),
                ErrorKind::AlreadyExists => ApiError::Conflict("already exists".into()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(error: MultipartError) -> Self {
        ApiError::BadRequest(error.to_string())
    }
}

impl From<UserStoreError> for ApiError {
    fn from(error: UserStoreError) -> Self {
        match error {
            UserStoreError::InvalidUsername => ApiError::BadRequest("invalid username".into()),
            UserStoreError::EmptyPassword => ApiError::BadRequest("password is required".into()),
            UserStoreError::AlreadyExists => ApiError::Conflict("user already exists".into()),
            UserStoreError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}
