//! TLS 证书加载与自签名生成。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::{CertifiedKey, generate_simple_self_signed};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::fs;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::Args;

/// 构建 TLS 接收器，仅协商 HTTP/1.1。
///
/// 未配置证书时生成自签名证书，证书与私钥只保存在内存中。
pub async fn build_tls_acceptor(args: &Args, host: IpAddr) -> io::Result<TlsAcceptor> {
    let (cert, key) = if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        (fs::read(cert).await?, fs::read(key).await?)
    } else {
        let generated = self_signed(host)?;
        info!(%host, "using generated self-signed certificate");
        (
            generated.cert.pem().into_bytes(),
            generated.key_pair.serialize_pem().into_bytes(),
        )
    };
    acceptor_from_pem(cert, key).await
}

/// 为监听地址生成自签名证书；非回环地址额外包含 `localhost`。
pub fn self_signed(host: IpAddr) -> io::Result<CertifiedKey> {
    let mut names = vec![host.to_string()];
    if !host.is_loopback() {
        names.push("localhost".to_string());
    }
    generate_simple_self_signed(names).map_err(|err| io::Error::other(err.to_string()))
}

pub async fn acceptor_from_pem(cert: Vec<u8>, key: Vec<u8>) -> io::Result<TlsAcceptor> {
    let rustls = RustlsConfig::from_pem(cert, key).await?;
    let mut server_config = (*rustls.get_inner()).clone();
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
