//! 路由表与公共中间件。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::auth;
use crate::files;
use crate::http::{self, resolve_client_ip};
use crate::pages;
use crate::session::SharedSessions;
use crate::storage::Storage;
use crate::users::UserStore;

/// 构建应用路由。调用方需另外注入 `Extension<RequestScheme>`。
pub fn build_router(
    storage: Arc<Storage>,
    users: Arc<UserStore>,
    sessions: SharedSessions,
) -> Router {
    let protected = Router::new()
        .route("/dashboard", get(pages::dashboard))
        .route(
            "/upload",
            post(files::upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/delete_file", post(files::delete_file))
        .route("/create_folder", post(files::create_folder))
        .route("/delete_folder", post(files::delete_folder))
        .route("/view_file", get(files::view_file))
        .route("/download_file", get(files::download_file))
        .route("/user_files/{owner}/{*path}", get(files::user_file))
        .route_layer(middleware::from_fn(auth::require_session));

    Router::new()
        .route("/", get(pages::index))
        .route("/login", get(pages::login_page).post(auth::login))
        .route("/register", get(pages::register_page).post(auth::register))
        .route("/logout", post(auth::logout))
        .merge(protected)
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(Extension(storage))
        .layer(Extension(users))
        .layer(Extension(sessions))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}
