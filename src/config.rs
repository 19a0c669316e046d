//! CLI 参数与服务默认配置。

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const SESSION_COOKIE_NAME: &str = "session_id";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 60;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_BODY_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const MAX_USERNAME_LEN: usize = 63;

/// 命令行与环境变量配置。
#[derive(Parser, Debug)]
#[command(name = "filedock", version = VERSION_INFO, about = "Filedock file hosting server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "FILEDOCK_STORAGE_DIR",
        default_value = "user_files",
        help = "Root directory for per-user files"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'u',
        long,
        env = "FILEDOCK_USERS_FILE",
        default_value = "users.txt",
        help = "Credentials file"
    )]
    pub users_file: String,
    #[arg(
        short = 'b',
        long,
        env = "FILEDOCK_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "FILEDOCK_HTTP_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "FILEDOCK_HTTPS_PORT",
        default_value_t = 8443,
        help = "HTTPS port"
    )]
    pub https_port: u16,
    #[arg(long, env = "FILEDOCK_NO_HTTPS", help = "Disable the HTTPS listener")]
    pub no_https: bool,
    #[arg(short = 'c', long, env = "FILEDOCK_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "FILEDOCK_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "FILEDOCK_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Session inactivity timeout in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "FILEDOCK_MAX_HEADER_BYTES",
        default_value_t = DEFAULT_MAX_HEADER_BYTES,
        help = "Max request head size in bytes"
    )]
    pub max_header_bytes: usize,
    #[arg(
        long,
        env = "FILEDOCK_MAX_BODY_BYTES",
        default_value_t = DEFAULT_MAX_BODY_BYTES,
        help = "Max request body size in bytes"
    )]
    pub max_body_bytes: u64,
    #[arg(
        long,
        env = "FILEDOCK_REQUEST_TIMEOUT_SECS",
        default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS,
        help = "Seconds a connection may stay silent during the TLS handshake or between reads of a request"
    )]
    pub request_timeout_secs: u64,
}
