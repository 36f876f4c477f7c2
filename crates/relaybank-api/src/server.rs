//! [`ApiServer`] – JSON control API for the relay bank.
//!
//! Listens on `0.0.0.0:8080` (configurable via [`ApiServer::with_addr`] and
//! [`ApiServer::with_port`]).  One request per connection; every response
//! closes the connection.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use relaybank_kernel::SwitchEngine;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::http::{ParseError, Response, read_request};
use crate::routes;

/// Default TCP port for the API server.
pub const DEFAULT_PORT: u16 = 8080;

/// How long a client may take to deliver its request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// ApiServer
// ---------------------------------------------------------------------------

/// HTTP server exposing a [`SwitchEngine`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use relaybank_api::ApiServer;
/// use relaybank_hal::{default_bank, ChannelRegistry, SimLineDriver};
/// use relaybank_kernel::SwitchEngine;
///
/// #[tokio::main]
/// async fn main() {
///     let registry = ChannelRegistry::new(default_bank()).unwrap();
///     let engine = Arc::new(SwitchEngine::new(registry, Box::new(SimLineDriver::new())));
///     engine.initialize().unwrap();
///     ApiServer::new(engine)
///         .with_port(8080)
///         .run()
///         .await
///         .expect("api server failed");
/// }
/// ```
pub struct ApiServer {
    engine: Arc<SwitchEngine>,
    addr: IpAddr,
    port: u16,
    request_timeout: Duration,
}

impl ApiServer {
    /// Create a server for `engine` on `0.0.0.0:`[`DEFAULT_PORT`].
    pub fn new(engine: Arc<SwitchEngine>) -> Self {
        Self {
            engine,
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the listening address (builder-style).
    pub fn with_addr(mut self, addr: IpAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Override how long a connection may stay silent before it is answered
    /// with 408 and closed (builder-style).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Bind and serve forever.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the listener cannot bind.
    pub async fn run(self) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Bind and serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the listener cannot bind.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.socket_addr();
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "relay API listening");
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept connections on an already bound `listener` until `shutdown`
    /// resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("relay API stopping");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let engine = Arc::clone(&self.engine);
                        let timeout = self.request_timeout;
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, engine, timeout).await {
                                debug!(%peer, error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                },
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<SwitchEngine>,
    timeout: Duration,
) -> io::Result<()> {
    let request_id = Uuid::new_v4();
    let span = info_span!("request", %request_id, %peer);

    async move {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let Ok(parsed) = tokio::time::timeout(timeout, read_request(&mut reader)).await else {
            warn!(?timeout, "client sent no complete request in time");
            let response = Response::json(
                408,
                serde_json::json!({ "error": "request timed out", "kind": "request_timeout" }),
            );
            write_half.write_all(&response.to_bytes()).await?;
            return write_half.shutdown().await;
        };

        let response = match parsed {
            Ok(req) => {
                debug!(method = %req.method, path = %req.path, "request");
                let resp = routes::dispatch(&engine, &req).await;
                info!(method = %req.method, path = %req.path, status = resp.status, "handled");
                resp
            }
            Err(ParseError::TooLarge) => Response::json(
                413,
                serde_json::json!({ "error": ParseError::TooLarge.to_string(), "kind": "payload_too_large" }),
            ),
            Err(ParseError::Malformed(reason)) => {
                warn!(%reason, "malformed request");
                Response::json(
                    400,
                    serde_json::json!({ "error": reason, "kind": "bad_request" }),
                )
            }
            Err(ParseError::Io(e)) => return Err(e),
        };

        write_half.write_all(&response.to_bytes()).await?;
        write_half.shutdown().await
    }
    .instrument(span)
    .await
}
