//! 欢迎页、登录/注册表单与仪表盘的 HTML 生成。

use axum::extract::{Extension, Query};
use axum::response::{Html, IntoResponse, Response};
use axum_extra::extract::CookieJar;
use htmlescape::{encode_attribute, encode_minimal};
use percent_encoding::utf8_percent_encode;
use serde::Deserialize;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::debug;

use crate::auth::{CurrentUser, current_user};
use crate::error::ApiError;
use crate::http::{QUERY_VALUE, dashboard_location, found};
use crate::session::SharedSessions;
use crate::storage::{FileEntry, Storage, StorageError, normalize_dir, parent_dir};

const STYLE: &str = r#"<style>
body { font-family: sans-serif; margin: 2em auto; max-width: 960px; color: #222; }
table { border-collapse: collapse; width: 100%; margin: 1em 0; }
th, td { text-align: left; padding: 6px 10px; border-bottom: 1px solid #ddd; }
form.inline { display: inline; }
.actions a { margin-right: 8px; }
.panel { border: 1px solid #ddd; padding: 1em; margin: 1em 0; }
</style>"#;

const WELCOME_BODY: &str = r#"<h1>Welcome</h1>
<p>Store your files and reach them from anywhere.</p>
<p><a href="/login">Login</a> | <a href="/register">Register</a></p>"#;

const LOGIN_BODY: &str = r#"<h1>Login</h1>
<form action="/login" method="post">
<p><label>Username <input type="text" name="username" required></label></p>
<p><label>Password <input type="password" name="password" required></label></p>
<p><button type="submit">Login</button></p>
</form>
<p>No account yet? <a href="/register">Register</a></p>"#;

const REGISTER_BODY: &str = r#"<h1>Register</h1>
<form action="/register" method="post">
<p><label>Username <input type="text" name="username" required></label></p>
<p><label>Password <input type="password" name="password" required></label></p>
<p><button type="submit">Register</button></p>
</form>
<p>Already registered? <a href="/login">Login</a></p>"#;

fn layout(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n{STYLE}\n</head>\n<body>\n{body}\n</body>\n</html>\n",
        encode_minimal(title)
    )
}

/// 首页：已登录跳转仪表盘，否则展示欢迎页。
pub async fn index(Extension(sessions): Extension<SharedSessions>, jar: CookieJar) -> Response {
    if current_user(&sessions, &jar).is_some() {
        return found(&dashboard_location("/"));
    }
    Html(layout("Welcome", WELCOME_BODY)).into_response()
}

pub async fn login_page() -> Html<String> {
    Html(layout("Login", LOGIN_BODY))
}

pub async fn register_page() -> Html<String> {
    Html(layout("Register", REGISTER_BODY))
}

#[derive(Deserialize)]
pub(crate) struct DashboardQuery {
    path: Option<String>,
}

/// 仪表盘：列出当前目录并提供上传、新建与删除表单。
pub async fn dashboard(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    Query(query): Query<DashboardQuery>,
) -> Result<Html<String>, ApiError> {
    let dir = normalize_dir(query.path.as_deref().unwrap_or("/"))?;
    let entries = match storage.list_dir(&username, &dir).await {
        Ok(entries) => entries,
        Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    debug!(username, dir, count = entries.len(), "render dashboard");
    Ok(Html(render_dashboard(&username, &dir, &entries)))
}

/// 生成仪表盘 HTML；文本经 HTML 转义，链接中的路径经百分号编码。
pub fn render_dashboard(username: &str, dir: &str, entries: &[FileEntry]) -> String {
    let dir_attr = encode_attribute(dir);
    let mut body = String::new();
    let _ = writeln!(body, "<h1>Welcome, {}!</h1>", encode_minimal(username));
    let _ = writeln!(
        body,
        "<form class=\"inline\" action=\"/logout\" method=\"post\"><button type=\"submit\">Logout</button></form>"
    );
    let _ = writeln!(body, "<h2>Current directory: {}</h2>", encode_minimal(dir));

    if let Some(parent) = parent_dir(dir) {
        let _ = writeln!(
            body,
            "<p><a href=\"{}\">Go Back</a></p>",
            dashboard_location(&parent)
        );
    }

    if entries.is_empty() {
        let _ = writeln!(body, "<p>No files or folders in this directory.</p>");
    } else {
        let _ = writeln!(
            body,
            "<table>\n<tr><th>Name</th><th>Size</th><th>Modified</th><th>Actions</th></tr>"
        );
        for entry in entries {
            let name_text = encode_minimal(&entry.name);
            let name_attr = encode_attribute(&entry.name);
            let modified = entry.modified.as_deref().unwrap_or("-");
            if entry.is_dir {
                let link = dashboard_location(&format!("{dir}{}/", entry.name));
                let _ = writeln!(
                    body,
                    "<tr><td><a href=\"{}\">{name_text}/</a></td><td>-</td><td>{modified}</td><td class=\"actions\">\
<form class=\"inline\" action=\"/delete_folder\" method=\"post\">\
<input type=\"hidden\" name=\"path\" value=\"{dir_attr}\">\
<input type=\"hidden\" name=\"foldername\" value=\"{name_attr}\">\
<button type=\"submit\">Delete</button></form></td></tr>",
                    link
                );
            } else {
                let file = utf8_percent_encode(&format!("{dir}{}", entry.name), QUERY_VALUE).to_string();
                let _ = writeln!(
                    body,
                    "<tr><td>{name_text}</td><td>{}</td><td>{modified}</td><td class=\"actions\">\
<a href=\"/view_file?file={file}\">View</a>\
<a href=\"/download_file?file={file}\">Download</a>\
<form class=\"inline\" action=\"/delete_file\" method=\"post\">\
<input type=\"hidden\" name=\"path\" value=\"{dir_attr}\">\
<input type=\"hidden\" name=\"filename\" value=\"{name_attr}\">\
<button type=\"submit\">Delete</button></form></td></tr>",
                    format_size(entry.size)
                );
            }
        }
        let _ = writeln!(body, "</table>");
    }

    let _ = writeln!(
        body,
        "<div class=\"panel\"><h3>Upload a file</h3>\
<form action=\"/upload\" method=\"post\" enctype=\"multipart/form-data\">\
<input type=\"hidden\" name=\"path\" value=\"{dir_attr}\">\
<input type=\"file\" name=\"file\" required> <button type=\"submit\">Upload</button></form></div>"
    );
    let _ = writeln!(
        body,
        "<div class=\"panel\"><h3>Create a folder</h3>\
<form action=\"/create_folder\" method=\"post\">\
<input type=\"hidden\" name=\"path\" value=\"{dir_attr}\">\
<input type=\"text\" name=\"foldername\" required> <button type=\"submit\">Create</button></form></div>"
    );

    layout("Dashboard", &body)
}

fn format_size(size: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if size < 1024 {
        return format!("{size} B");
    }
    let mut value = size as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
