//! Local credential-injecting relay.
//!
//! Chrome takes a `--proxy-server` switch but has no switch for proxy
//! credentials. Each account with an authenticated upstream therefore gets a
//! small relay: Chrome talks plain HTTP-proxy protocol to 127.0.0.1:{port},
//! and the relay replays every request head against the upstream with a
//! `Proxy-Authorization` header attached, then splices the byte streams.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use super::ProxySettings;

/// Local listen ports are handed out from 18080..48080, wrapping around.
const PORT_BASE: u32 = 18080;
const PORT_RANGE: u32 = 30000;

static PORT_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Caps on a request/response head, whoever the peer is.
const MAX_HEAD_LINES: usize = 100;
const MAX_LINE_BYTES: usize = 8192;

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Allocate a unique local port for a relay.
pub fn allocate_port() -> u16 {
    let offset = PORT_COUNTER.fetch_add(1, Ordering::Relaxed) % PORT_RANGE;
    (PORT_BASE + offset) as u16
}

/// `Proxy-Authorization` value for the given credentials.
pub fn auth_header(username: &str, password: &str) -> String {
    let raw = format!("{}:{}", username, password);
    let encoded = base64::engine::general_purpose::STANDARD.encode(raw.as_bytes());
    format!("Basic {}", encoded)
}

/// A running relay for one account's upstream proxy. Dropping it stops the
/// accept loop; connections already spliced run to completion.
pub struct ProxyRelay {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ProxyRelay {
    /// Bind a local port and start serving connections against `upstream`.
    pub async fn start(upstream: &ProxySettings) -> Result<Self, std::io::Error> {
        let port = allocate_port();
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;

        let upstream_addr = upstream.upstream_addr();
        let auth = auth_header(&upstream.username, &upstream.password);
        info!("[Relay] 127.0.0.1:{} -> {}", port, upstream_addr);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let upstream_addr = upstream_addr.clone();
                            let auth = auth.clone();
                            tokio::spawn(async move {
                                if let Err(e) = relay_client(stream, &upstream_addr, &auth).await {
                                    debug!("[Relay] Connection ended: {}", e);
                                }
                            });
                        }
                        Err(e) => error!("[Relay] Accept failed: {}", e),
                    }
                }
            }
            debug!("[Relay] Accept loop on port {} stopped", port);
        });

        Ok(Self {
            port,
            shutdown: Some(shutdown_tx),
        })
    }

    /// Address to hand to Chrome's `--proxy-server` switch.
    pub fn local_addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ProxyRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serve one Chrome connection end to end.
///
/// Only the first request head is rewritten. CONNECT tunnels carry a single
/// logical request anyway; plain HTTP requests get a `Proxy-Connection:
/// close` so the upstream hangs up after one exchange and every request
/// arrives here fresh, with credentials.
async fn relay_client(
    client: TcpStream,
    upstream_addr: &str,
    auth: &str,
) -> Result<(), std::io::Error> {
    let mut client = BufReader::new(client);

    let mut request_line = String::new();
    if client.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    let head = read_head(&mut client).await?;
    let is_connect = request_line.starts_with("CONNECT ");

    debug!("[Relay] {} via {}", request_line.trim(), upstream_addr);

    let mut upstream =
        tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(upstream_addr))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream connect timed out")
            })??;

    upstream.write_all(request_line.as_bytes()).await?;
    for line in &head {
        let lower = line.to_ascii_lowercase();
        // whatever the client thought about auth or keep-alive, we decide
        if lower.starts_with("proxy-authorization:") || lower.starts_with("proxy-connection:") {
            continue;
        }
        upstream.write_all(line.as_bytes()).await?;
    }
    upstream
        .write_all(format!("Proxy-Authorization: {}\r\n", auth).as_bytes())
        .await?;
    if !is_connect {
        upstream.write_all(b"Proxy-Connection: close\r\n").await?;
    }
    upstream.write_all(b"\r\n").await?;
    upstream.flush().await?;

    // From here both directions are opaque bytes. The upstream's response
    // head (the CONNECT verdict included) flows back to Chrome untouched,
    // and bytes the client pipelined behind its head are still sitting in
    // the BufReader, so splicing through it loses nothing.
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;

    Ok(())
}

/// Read header lines up to the blank separator.
async fn read_head(
    reader: &mut BufReader<TcpStream>,
) -> Result<Vec<String>, std::io::Error> {
    let mut lines = Vec::new();
    for _ in 0..MAX_HEAD_LINES {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            return Ok(lines);
        }
        if line.len() > MAX_LINE_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "header line too long",
            ));
        }
        lines.push(line);
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "too many header lines",
    ))
}
