//! 注册、登录、登出处理与会话校验中间件。

use axum::extract::rejection::FormRejection;
use axum::extract::{Extension, Form};
use axum::http::{HeaderMap, Request};
use axum::response::{IntoResponse, Response};
use axum::{body::Body as AxumBody, middleware};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use cookie::time::Duration as CookieDuration;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::SESSION_COOKIE_NAME;
use crate::error::ApiError;
use crate::http::{RequestScheme, dashboard_location, found, is_https_request};
use crate::session::SharedSessions;
use crate::storage::Storage;
use crate::users::UserStore;

const LOGIN_FAILED_HTML: &str =
    "<h1>Unauthorized</h1><p>Incorrect username or password.</p><p><a href=\"/login\">Try again</a></p>";

/// 已登录用户，由 [`require_session`] 写入请求扩展。
#[derive(Clone, Debug)]
pub struct CurrentUser(pub String);

#[derive(Deserialize)]
pub(crate) struct CredentialsForm {
    username: Option<String>,
    password: Option<String>,
}

impl CredentialsForm {
    fn into_parts(self) -> Result<(String, String), ApiError> {
        match (self.username, self.password) {
            (Some(username), Some(password)) if !username.is_empty() => Ok((username, password)),
            _ => Err(ApiError::BadRequest("username and password are required".into())),
        }
    }
}

/// 根据会话 Cookie 解析当前用户。
pub fn current_user(sessions: &SharedSessions, jar: &CookieJar) -> Option<CurrentUser> {
    let cookie = jar.get(SESSION_COOKIE_NAME)?;
    sessions.lookup(cookie.value()).map(CurrentUser)
}

/// 会话 Cookie；`Max-Age` 与服务端空闲超时一致。
fn session_cookie(token: String, ttl: Duration, secure: bool) -> Cookie<'static> {
    let max_age = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    Cookie::build((SESSION_COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(CookieDuration::seconds(max_age))
        .build()
}

/// 会话中间件：未登录时重定向到登录页；已登录时重新下发 Cookie，
/// 使浏览器端的过期时间随每次访问顺延。
pub async fn require_session(
    Extension(sessions): Extension<SharedSessions>,
    Extension(scheme): Extension<RequestScheme>,
    jar: CookieJar,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Response {
    let Some(user) = current_user(&sessions, &jar) else {
        return found("/login");
    };
    let refreshed = jar.get(SESSION_COOKIE_NAME).map(|cookie| {
        session_cookie(
            cookie.value().to_string(),
            sessions.ttl(),
            is_https_request(req.headers(), scheme),
        )
    });

    req.extensions_mut().insert(user);
    let response = next.run(req).await;
    match refreshed {
        Some(cookie) => (jar.add(cookie), response).into_response(),
        None => response,
    }
}

/// 登录：校验凭据，创建会话并写入 Cookie。
pub async fn login(
    Extension(users): Extension<Arc<UserStore>>,
    Extension(sessions): Extension<SharedSessions>,
    Extension(scheme): Extension<RequestScheme>,
    headers: HeaderMap,
    jar: CookieJar,
    form: Result<Form<CredentialsForm>, FormRejection>,
) -> Result<(CookieJar, Response), ApiError> {
    let Form(form) = form.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let (username, password) = form.into_parts()?;

    if !users.authenticate(&username, &password).await? {
        warn!(username, "login failed");
        return Err(ApiError::Unauthorized(LOGIN_FAILED_HTML.into()));
    }

    let token = sessions.create(&username);
    let cookie = session_cookie(token, sessions.ttl(), is_https_request(&headers, scheme));
    info!(username, "login succeeded");
    Ok((jar.add(cookie), found(&dashboard_location("/"))))
}

/// 注册：写入凭据文件并创建用户目录。
pub async fn register(
    Extension(users): Extension<Arc<UserStore>>,
    Extension(storage): Extension<Arc<Storage>>,
    form: Result<Form<CredentialsForm>, FormRejection>,
) -> Result<Response, ApiError> {
    let Form(form) = form.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let (username, password) = form.into_parts()?;

    users.register(&username, &password).await?;
    storage
        .ensure_user_root(&username)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    info!(username, "user registered");
    Ok(found("/login"))
}

/// 登出：清理会话并删除 Cookie。
pub async fn logout(
    Extension(sessions): Extension<SharedSessions>,
    jar: CookieJar,
) -> impl IntoResponse {
    if let Some(cookie) = jar.get(SESSION_COOKIE_NAME) {
        sessions.remove(cookie.value());
    }

    (
        jar.remove(Cookie::build(SESSION_COOKIE_NAME).path("/").build()),
        found("/"),
    )
}
