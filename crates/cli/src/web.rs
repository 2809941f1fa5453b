//! Static web terminal.
//!
//! A minimal HTTP/1.1 loop that serves one HTML page. The page speaks the
//! framed control protocol over a WebSocket opened straight at the forwarded
//! daemon port; nothing is proxied here.

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

const PAGE: &str = include_str!("web_terminal.html");

/// Serves the terminal page forever on `http_port`.
pub async fn serve(daemon_port: u16, http_port: u16) -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", http_port)).await?;
    info!(http_port, daemon_port, "web terminal at http://127.0.0.1:{http_port}/");

    let body = PAGE.replace("__DAEMON_PORT__", &daemon_port.to_string());
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    );

    loop {
        let (mut stream, peer) = listener.accept().await?;
        debug!(%peer, "page request");
        let response = response.clone();
        tokio::spawn(async move {
            // Drain the request head; the reply is the same for every path.
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}
