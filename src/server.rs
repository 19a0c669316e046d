//! 连接接收循环：每个连接一个任务，读取一个请求、路由、写回响应后关闭。

use axum::Router;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, warn};

use crate::request::{FrameError, FrameLimits, read_request};
use crate::response::write_response;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug)]
pub struct ConnectionSettings {
    pub limits: FrameLimits,
    pub handshake_timeout: Duration,
}

/// 明文 HTTP 接收循环。
pub async fn serve_http(
    listener: TcpListener,
    app: Router,
    settings: ConnectionSettings,
) -> io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let app = app.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, app, settings).await;
        });
    }
}

/// HTTPS 接收循环：握手完成后复用同一套请求处理。
pub async fn serve_https(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    settings: ConnectionSettings,
) -> io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            match time::timeout(settings.handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => handle_connection(tls_stream, peer, app, settings).await,
                Ok(Err(err)) => debug!(%peer, error = %err, "tls handshake failed"),
                Err(_) => debug!(%peer, "tls handshake timed out"),
            }
        });
    }
}

/// 处理单个连接上的唯一请求。
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    app: Router,
    settings: ConnectionSettings,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let raw = match read_request(&mut stream, &settings.limits).await {
        Ok(raw) => raw,
        Err(err) => {
            reject(&mut stream, peer, err).await;
            return;
        }
    };

    let head_only = raw.method == Method::HEAD;
    let mut request = raw.into_http_request();
    request.extensions_mut().insert(ConnectInfo(peer));
    let response = match app.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };

    if let Err(err) = write_response(&mut stream, response, head_only).await {
        debug!(%peer, error = %err, "failed to write response");
    }
    let _ = stream.shutdown().await;
}

async fn reject<S>(stream: &mut S, peer: SocketAddr, err: FrameError)
where
    S: AsyncWrite + Unpin,
{
    let status = match &err {
        FrameError::Malformed(_) => StatusCode::BAD_REQUEST,
        FrameError::HeaderTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
        FrameError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        FrameError::ConnectionClosed | FrameError::Io(_) | FrameError::Timeout => {
            debug!(%peer, error = %err, "dropping connection");
            return;
        }
    };
    debug!(%peer, error = %err, status = status.as_u16(), "rejecting request");
    let body = status.canonical_reason().unwrap_or("Bad Request");
    let response = (status, body).into_response();
    if write_response(stream, response, false).await.is_ok() {
        let _ = stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Extension;
    use memchr::memmem;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    use crate::app::build_router;
    use crate::http::RequestScheme;
    use crate::session::{MemorySessionStore, SharedSessions};
    use crate::storage::Storage;
    use crate::users::UserStore;

    struct Reply {
        status: u16,
        head: String,
        body: Vec<u8>,
    }

    impl Reply {
        fn header(&self, name: &str) -> Option<&str> {
            self.head.lines().skip(1).find_map(|line| {
                let (key, value) = line.split_once(':')?;
                key.eq_ignore_ascii_case(name).then(|| value.trim())
            })
        }
    }

    fn test_app(root: &Path, scheme: RequestScheme) -> Router {
        let storage = Arc::new(Storage::new(root.join("user_files")));
        std::fs::create_dir_all(root.join("user_files")).expect("storage root");
        let users = Arc::new(UserStore::new(root.join("users.txt")));
        let sessions: SharedSessions = Arc::new(MemorySessionStore::new(Duration::from_secs(1800)));
        build_router(storage, users, sessions).layer(Extension(scheme))
    }

    fn test_settings(idle_timeout: Duration) -> ConnectionSettings {
        ConnectionSettings {
            limits: FrameLimits {
                max_header_bytes: 16 * 1024,
                max_body_bytes: 1024 * 1024,
                idle_timeout,
            },
            handshake_timeout: Duration::from_secs(5),
        }
    }

    async fn start_server(root: &Path) -> SocketAddr {
        start_server_with_idle(root, Duration::from_secs(5)).await
    }

    async fn start_server_with_idle(root: &Path, idle_timeout: Duration) -> SocketAddr {
        let app = test_app(root, RequestScheme::Http);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(serve_http(listener, app, test_settings(idle_timeout)));
        addr
    }

    async fn send(addr: SocketAddr, request: &[u8]) -> Reply {
        send_segments(addr, &[request]).await
    }

    async fn send_segments(addr: SocketAddr, segments: &[&[u8]]) -> Reply {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        for segment in segments {
            stream.write_all(segment).await.expect("write");
            stream.flush().await.expect("flush");
        }
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.expect("read");
        parse_reply(raw)
    }

    fn parse_reply(raw: Vec<u8>) -> Reply {
        let split = memmem::find(&raw, b"\r\n\r\n").expect("response head");
        let head = String::from_utf8(raw[..split].to_vec()).expect("utf8 head");
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("status code");
        Reply {
            status,
            head,
            body: raw[split + 4..].to_vec(),
        }
    }

    fn form_post(path: &str, body: &str, cookie: Option<&str>) -> Vec<u8> {
        let cookie = cookie
            .map(|token| format!("Cookie: session_id={token}\r\n"))
            .unwrap_or_default();
        format!(
            "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/x-www-form-urlencoded\r\n{cookie}Content-Length: {}\r\n\r\n{body}",
            body.len()
        )
        .into_bytes()
    }

    fn get(path: &str, cookie: Option<&str>) -> Vec<u8> {
        let cookie = cookie
            .map(|token| format!("Cookie: session_id={token}\r\n"))
            .unwrap_or_default();
        format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{cookie}\r\n").into_bytes()
    }

    fn upload(dir: &str, filename: &str, data: &[u8], cookie: &str) -> Vec<u8> {
        let boundary = "----filedockTestBoundary";
        let mut body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"path\"\r\n\r\n{dir}\r\n--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let mut request = format!(
            "POST /upload HTTP/1.1\r\nHost: localhost\r\nCookie: session_id={cookie}\r\nContent-Type: multipart/form-data; boundary={boundary}\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(&body);
        request
    }

    async fn register_and_login(addr: SocketAddr, username: &str, password: &str) -> String {
        let credentials = format!("username={username}&password={password}");
        let reply = send(addr, &form_post("/register", &credentials, None)).await;
        assert_eq!(reply.status, 302);
        assert_eq!(reply.header("location"), Some("/login"));

        let reply = send(addr, &form_post("/login", &credentials, None)).await;
        assert_eq!(reply.status, 302);
        let cookie = reply.header("set-cookie").expect("set-cookie").to_string();
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Path=/"));
        cookie
            .strip_prefix("session_id=")
            .and_then(|rest| rest.split(';').next())
            .expect("session token")
            .to_string()
    }

    #[tokio::test]
    async fn register_login_upload_and_read_back() {
        let temp = tempdir().expect("tempdir");
        let addr = start_server(temp.path()).await;
        let token = register_and_login(addr, "alice", "pw1").await;

        let payload = b"hello\r\n--not-a-boundary\r\nworld";
        let request = upload("/", "hello.txt", payload, &token);
        let (head, body) = request.split_at(request.len() / 2);
        let reply = send_segments(addr, &[head, body]).await;
        assert_eq!(reply.status, 302);
        assert_eq!(reply.header("location"), Some("/dashboard?path=/"));

        let reply = send(addr, &get("/user_files/alice/hello.txt", Some(&token))).await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, payload);
        assert_eq!(reply.header("connection"), Some("close"));

        let reply = send(addr, &get("/dashboard?path=/", Some(&token))).await;
        assert_eq!(reply.status, 200);
        let refreshed = reply.header("set-cookie").expect("refreshed cookie");
        assert!(refreshed.starts_with(&format!("session_id={token}")));
        assert!(refreshed.contains("Max-Age=1800"));
        let page = String::from_utf8(reply.body).expect("utf8");
        assert!(page.contains("Welcome, alice!"));
        assert!(page.contains("hello.txt"));

        let reply = send(addr, &get("/download_file?file=/hello.txt", Some(&token))).await;
        assert_eq!(reply.status, 200);
        assert!(reply
            .header("content-disposition")
            .is_some_and(|value| value.starts_with("attachment")));
        assert_eq!(reply.body, payload);
    }

    #[tokio::test]
    async fn folders_can_be_created_and_removed() {
        let temp = tempdir().expect("tempdir");
        let addr = start_server(temp.path()).await;
        let token = register_and_login(addr, "bob", "pw").await;

        let reply = send(
            addr,
            &form_post("/create_folder", "path=%2F&foldername=reports", Some(&token)),
        )
        .await;
        assert_eq!(reply.status, 302);
        assert!(temp.path().join("user_files/bob/reports").is_dir());

        let reply = send(addr, &upload("/reports/", "q1.csv", b"a,b\n", &token)).await;
        assert_eq!(reply.header("location"), Some("/dashboard?path=/reports/"));

        let reply = send(
            addr,
            &form_post("/delete_file", "path=%2Freports%2F&filename=q1.csv", Some(&token)),
        )
        .await;
        assert_eq!(reply.status, 302);
        assert!(!temp.path().join("user_files/bob/reports/q1.csv").exists());

        let reply = send(
            addr,
            &form_post("/delete_folder", "path=%2F&foldername=reports", Some(&token)),
        )
        .await;
        assert_eq!(reply.status, 302);
        assert!(!temp.path().join("user_files/bob/reports").exists());
    }

    #[tokio::test]
    async fn traversal_upload_is_rejected_without_writing() {
        let temp = tempdir().expect("tempdir");
        let addr = start_server(temp.path()).await;
        let token = register_and_login(addr, "carol", "pw").await;

        let reply = send(addr, &upload("/", "../../etc/passwd", b"x", &token)).await;
        assert_eq!(reply.status, 400);
        let reply = send(addr, &upload("/../dave/", "a.txt", b"x", &token)).await;
        assert_eq!(reply.status, 400);
        assert!(!temp.path().join("etc").exists());
        assert!(!temp.path().join("user_files/dave").exists());
    }

    #[tokio::test]
    async fn protected_routes_redirect_without_session() {
        let temp = tempdir().expect("tempdir");
        let addr = start_server(temp.path()).await;

        let reply = send(addr, &get("/dashboard", None)).await;
        assert_eq!(reply.status, 302);
        assert_eq!(reply.header("location"), Some("/login"));

        let reply = send(addr, &get("/dashboard", Some("forged-token"))).await;
        assert_eq!(reply.header("location"), Some("/login"));

        let reply = send(addr, &get("/", None)).await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.header("x-frame-options"), Some("DENY"));
    }

    #[tokio::test]
    async fn logout_invalidates_session() {
        let temp = tempdir().expect("tempdir");
        let addr = start_server(temp.path()).await;
        let token = register_and_login(addr, "erin", "pw").await;

        let reply = send(addr, &get("/", Some(&token))).await;
        assert_eq!(reply.header("location"), Some("/dashboard?path=/"));

        let reply = send(addr, &form_post("/logout", "", Some(&token))).await;
        assert_eq!(reply.status, 302);
        assert_eq!(reply.header("location"), Some("/"));

        let reply = send(addr, &get("/dashboard", Some(&token))).await;
        assert_eq!(reply.header("location"), Some("/login"));
    }

    #[tokio::test]
    async fn wrong_password_and_other_users_files_are_refused() {
        let temp = tempdir().expect("tempdir");
        let addr = start_server(temp.path()).await;
        let token = register_and_login(addr, "frank", "right").await;
        register_and_login(addr, "grace", "pw").await;

        let reply = send(addr, &form_post("/login", "username=frank&password=wrong", None)).await;
        assert_eq!(reply.status, 401);
        assert!(reply.header("set-cookie").is_none());

        let reply = send(addr, &get("/user_files/grace/anything.txt", Some(&token))).await;
        assert_eq!(reply.status, 403);

        let reply = send(addr, &form_post("/register", "username=frank&password=x", None)).await;
        assert_eq!(reply.status, 409);
    }

    #[tokio::test]
    async fn malformed_and_unknown_requests() {
        let temp = tempdir().expect("tempdir");
        let addr = start_server(temp.path()).await;

        let reply = send(addr, b"NOT-HTTP\r\n\r\n").await;
        assert_eq!(reply.status, 400);

        let reply = send(addr, b"POST /login HTTP/1.1\r\nHost: x\r\n\r\nusername=a").await;
        assert_eq!(reply.status, 400);

        let reply = send(addr, &get("/no/such/page", None)).await;
        assert_eq!(reply.status, 404);
        assert_eq!(reply.body, b"Not Found");
    }

    #[tokio::test]
    async fn files_and_folders_sharing_a_name_are_client_errors() {
        let temp = tempdir().expect("tempdir");
        let addr = start_server(temp.path()).await;
        let token = register_and_login(addr, "heidi", "pw").await;

        let reply = send(addr, &upload("/", "a.txt", b"x", &token)).await;
        assert_eq!(reply.status, 302);
        let reply = send(addr, &get("/dashboard?path=/a.txt", Some(&token))).await;
        assert_eq!(reply.status, 400);

        let reply = send(
            addr,
            &form_post("/create_folder", "path=%2F&foldername=docs", Some(&token)),
        )
        .await;
        assert_eq!(reply.status, 302);
        let reply = send(addr, &upload("/", "docs", b"x", &token)).await;
        assert_eq!(reply.status, 409);
        assert!(temp.path().join("user_files/heidi/docs").is_dir());
    }

    #[tokio::test]
    async fn slow_client_is_served_while_bytes_keep_arriving() {
        let temp = tempdir().expect("tempdir");
        let addr = start_server_with_idle(temp.path(), Duration::from_millis(500)).await;

        let request = form_post("/login", "username=ivan&password=pw", None);
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        for chunk in request.chunks(8) {
            stream.write_all(chunk).await.expect("write");
            stream.flush().await.expect("flush");
            time::sleep(Duration::from_millis(100)).await;
        }
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.expect("read");
        // 用户不存在，但请求已被完整读取并路由
        assert_eq!(parse_reply(raw).status, 401);
    }

    #[tokio::test]
    async fn idle_client_is_dropped_without_response() {
        let temp = tempdir().expect("tempdir");
        let addr = start_server_with_idle(temp.path(), Duration::from_millis(100)).await;

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(b"POST /login HTTP/1.1\r\nContent-Length: 20\r\n\r\nuser")
            .await
            .expect("write");
        let mut raw = Vec::new();
        let read = time::timeout(Duration::from_secs(5), stream.read_to_end(&mut raw)).await;
        assert!(read.is_ok(), "server should close an idle connection");
        assert!(raw.is_empty());
    }

    async fn send_tls(addr: SocketAddr, connector: &TlsConnector, request: &[u8]) -> (Reply, Vec<u8>) {
        let tcp = TcpStream::connect(addr).await.expect("connect");
        let name = ServerName::try_from("127.0.0.1").expect("server name");
        let mut stream = connector.connect(name, tcp).await.expect("tls handshake");
        let alpn = stream.get_ref().1.alpn_protocol().unwrap_or_default().to_vec();
        stream.write_all(request).await.expect("write");
        stream.flush().await.expect("flush");
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.expect("read");
        (parse_reply(raw), alpn)
    }

    #[tokio::test]
    async fn https_listener_serves_http11_with_secure_cookie() {
        let temp = tempdir().expect("tempdir");
        let generated = crate::tls::self_signed("127.0.0.1".parse().unwrap()).expect("certificate");
        let acceptor = crate::tls::acceptor_from_pem(
            generated.cert.pem().into_bytes(),
            generated.key_pair.serialize_pem().into_bytes(),
        )
        .await
        .expect("acceptor");
        let app = test_app(temp.path(), RequestScheme::Https);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(serve_https(listener, acceptor, app, test_settings(Duration::from_secs(5))));

        let mut roots = RootCertStore::empty();
        roots.add(generated.cert.der().clone()).expect("trust certificate");
        let mut client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        client.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let connector = TlsConnector::from(Arc::new(client));

        let (reply, alpn) = send_tls(addr, &connector, &get("/", None)).await;
        assert_eq!(reply.status, 200);
        assert_eq!(alpn, b"http/1.1");

        let credentials = "username=judy&password=pw";
        let (reply, _) = send_tls(addr, &connector, &form_post("/register", credentials, None)).await;
        assert_eq!(reply.status, 302);
        let (reply, _) = send_tls(addr, &connector, &form_post("/login", credentials, None)).await;
        assert_eq!(reply.status, 302);
        let cookie = reply.header("set-cookie").expect("set-cookie");
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("HttpOnly"));
    }
}
