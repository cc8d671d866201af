//! Tor control-port client: the circuit-rotation half of the
//! anonymization policy. Retrying fetchers request a fresh identity
//! between attempts.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const CONTROL_ADDR: &str = "127.0.0.1:9051";

/// Ask the local Tor daemon for a new circuit (`SIGNAL NEWNYM`).
/// Failures are reported but never fatal; the caller just retries on the
/// old circuit.
pub async fn request_new_identity() -> Result<(), String> {
    let connect = tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(CONTROL_ADDR));
    let mut stream = match connect.await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(format!("Tor control port error: {e}")),
        Err(_) => return Err("Tor control port error: connect timeout".into()),
    };

    let mut buf = [0u8; 1024];

    stream
        .write_all(b"AUTHENTICATE\r\n")
        .await
        .map_err(|e| format!("Tor control port error: {e}"))?;
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| format!("Tor control port error: {e}"))?;
    let resp = String::from_utf8_lossy(&buf[..n]);
    if !resp.starts_with("250") {
        return Err(format!("Tor auth failed: {}", resp.trim()));
    }

    stream
        .write_all(b"SIGNAL NEWNYM\r\n")
        .await
        .map_err(|e| format!("Tor control port error: {e}"))?;
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| format!("Tor control port error: {e}"))?;
    let resp = String::from_utf8_lossy(&buf[..n]);
    if !resp.starts_with("250") {
        return Err(format!("Tor NEWNYM failed: {}", resp.trim()));
    }

    tracing::info!("tor identity renewed");
    Ok(())
}

/// Rotate the circuit and pause before the next attempt. Used between
/// retries of blocked fetches (401/403/503 through the proxy).
pub async fn rotate_and_wait() {
    if let Err(e) = request_new_identity().await {
        tracing::warn!(error = %e, "tor identity rotation failed");
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
}

/// Normalize a SOCKS url for remote DNS resolution (socks5h).
pub fn socks5h(proxy: &str) -> String {
    proxy.replace("socks5://", "socks5h://")
}

/// Build a client routed through the given proxy, if any.
pub fn proxied_client(proxy: Option<&str>, timeout: Duration) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent("Mozilla/5.0");
    if let Some(proxy) = proxy {
        if let Ok(proxy) = reqwest::Proxy::all(socks5h(proxy)) {
            builder = builder.proxy(proxy);
        }
    }
    builder.build().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks5h_rewrites_scheme() {
        assert_eq!(socks5h("socks5://127.0.0.1:9050"), "socks5h://127.0.0.1:9050");
        assert_eq!(socks5h("socks5h://x:1"), "socks5h://x:1");
    }
}
