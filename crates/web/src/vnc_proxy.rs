//! VNC session proxy
//!
//! Bridges a client frame stream (a noVNC WebSocket in production) to the
//! TCP port of a registered endpoint. Payload bytes are relayed opaquely in
//! both directions; the proxy never looks inside the RFB stream.
//!
//! A session ends as soon as either relay direction finishes or the session
//! is cancelled. The sibling direction is dropped at that point, both
//! streams are closed and the live-session entry is released, exactly once.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};
use vncdesk_common::{EndpointStatus, Error};

use crate::activity::{actions, ActivityLog};
use crate::registry::ConnectionRegistry;
use crate::sessions::LiveSessions;

const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on closing the client side during teardown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// One unit on the client side of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Data(Bytes),
    Close(CloseReason),
}

/// Why a session stream was closed. Codes are stable for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Session ran and ended normally
    Normal,
    /// Server is shutting down or the session was terminated
    Shutdown,
    /// Token does not name a known endpoint. Permanent.
    NotFound,
    /// Endpoint is not active or has no address. Re-check status before retrying.
    NotActive,
    /// Endpoint could not be dialed. Retry later.
    Unreachable,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Shutdown => 1001,
            Self::NotActive => 4003,
            Self::NotFound => 4004,
            Self::Unreachable => 4502,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Normal => "Session ended",
            Self::Shutdown => "Session terminated",
            Self::NotActive => "Connection not active",
            Self::NotFound => "Connection not found",
            Self::Unreachable => "Target unreachable",
        }
    }
}

/// Which side ended a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndedBy {
    Client,
    ClientError,
    Endpoint,
    EndpointError,
    Cancelled,
}

impl fmt::Display for EndedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client closed"),
            Self::ClientError => write!(f, "client stream error"),
            Self::Endpoint => write!(f, "endpoint closed"),
            Self::EndpointError => write!(f, "endpoint stream error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of one `open` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub close: CloseReason,
    /// Set when the relay ran
    pub ended_by: Option<EndedBy>,
    pub bytes_to_endpoint: u64,
    pub bytes_to_client: u64,
}

impl SessionOutcome {
    fn rejected(close: CloseReason) -> Self {
        Self {
            close,
            ended_by: None,
            bytes_to_endpoint: 0,
            bytes_to_client: 0,
        }
    }
}

/// Session proxy settings
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub dial_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            buffer_size: RELAY_BUFFER_SIZE,
        }
    }
}

/// Per-process session proxy. Cheap to clone.
#[derive(Clone)]
pub struct SessionProxy {
    registry: ConnectionRegistry,
    activity: ActivityLog,
    sessions: LiveSessions,
    config: ProxyConfig,
}

impl SessionProxy {
    pub fn new(
        registry: ConnectionRegistry,
        activity: ActivityLog,
        sessions: LiveSessions,
        config: ProxyConfig,
    ) -> Self {
        Self {
            registry,
            activity,
            sessions,
            config,
        }
    }

    pub fn sessions(&self) -> &LiveSessions {
        &self.sessions
    }

    /// Bridge a noVNC WebSocket to the endpoint named by `token`
    pub async fn bridge(&self, token: &str, socket: WebSocket, origin: Option<&str>) -> SessionOutcome {
        let (ws_write, ws_read) = socket.split();

        let client_rx = ws_read.filter_map(|msg| {
            futures::future::ready(match msg {
                Ok(Message::Binary(data)) => Some(Ok(ClientFrame::Data(Bytes::from(data)))),
                // Some WebSocket clients send text for the RFB version
                Ok(Message::Text(text)) => Some(Ok(ClientFrame::Data(Bytes::from(text.into_bytes())))),
                Ok(Message::Close(_)) => Some(Ok(ClientFrame::Close(CloseReason::Normal))),
                // Ping is answered by axum
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
                Err(e) => Some(Err(e)),
            })
        });
        let client_tx = ws_write.with(|frame: ClientFrame| {
            futures::future::ready(Ok::<_, axum::Error>(frame.into_message()))
        });

        self.open(token, client_rx, client_tx, origin).await
    }

    /// Run one session to completion.
    ///
    /// Never dials when the token is unknown, the endpoint is not active, it
    /// has no address or the session is cancelled first. Always closes
    /// `client_tx` before returning. Store calls run on the blocking pool.
    pub async fn open<R, W, E>(
        &self,
        token: &str,
        mut client_rx: R,
        mut client_tx: W,
        origin: Option<&str>,
    ) -> SessionOutcome
    where
        R: Stream<Item = Result<ClientFrame, E>> + Unpin + Send,
        W: Sink<ClientFrame> + Unpin + Send,
        W::Error: fmt::Display,
        E: fmt::Display,
    {
        let lookup_id = token.to_string();
        let lookup = self
            .registry
            .blocking(move |registry| registry.lookup(&lookup_id))
            .await;
        let endpoint = match lookup {
            Ok(endpoint) => endpoint,
            Err(e) => {
                if e.is_store_error() {
                    warn!("Registry lookup for {} failed, rejecting session: {}", token, e);
                } else {
                    info!("Rejecting session for unknown endpoint {}", token);
                }
                close_client(&mut client_tx, CloseReason::NotFound).await;
                return SessionOutcome::rejected(CloseReason::NotFound);
            }
        };

        let address = match (endpoint.status, endpoint.dial_address()) {
            (EndpointStatus::Active, Some(address)) => address.to_string(),
            (status, _) => {
                info!(
                    "Rejecting session for endpoint {} (status {}, address {:?})",
                    token, status, endpoint.address
                );
                close_client(&mut client_tx, CloseReason::NotActive).await;
                return SessionOutcome::rejected(CloseReason::NotActive);
            }
        };

        let guard = self.sessions.register(token, origin);
        let target = format!("{}:{}", address, endpoint.port);
        debug!("Session {} connecting to VNC server at {}", guard.session_id(), target);

        let dialed = tokio::select! {
            biased;
            _ = guard.cancelled() => None,
            result = self.dial(&address, endpoint.port) => Some(result),
        };
        let stream = match dialed {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                warn!("Session {}: {}", guard.session_id(), e);
                self.activity
                    .record(
                        token,
                        actions::VNC_CONNECT_FAILED,
                        &format!("Failed to reach VNC server at {}", target),
                        origin,
                    )
                    .await;
                close_client(&mut client_tx, CloseReason::Unreachable).await;
                return SessionOutcome::rejected(CloseReason::Unreachable);
            }
            None => {
                info!("Session {} cancelled before it was bridged", guard.session_id());
                close_client(&mut client_tx, CloseReason::Shutdown).await;
                return SessionOutcome::rejected(CloseReason::Shutdown);
            }
        };

        info!("Session {} bridged to {}", guard.session_id(), target);
        // Relaying starts without waiting for the log write
        let start_logged = self.activity.record_detached(
            token,
            actions::SESSION_START,
            &format!("WebSocket VNC session started to {}", target),
            origin,
        );

        let (mut vnc_read, mut vnc_write) = stream.into_split();
        let mut bytes_to_endpoint = 0u64;
        let mut bytes_to_client = 0u64;

        let ended_by = {
            let client_to_vnc =
                forward_client_to_vnc(&mut client_rx, &mut vnc_write, &mut bytes_to_endpoint);
            let vnc_to_client = forward_vnc_to_client(
                &mut vnc_read,
                &mut client_tx,
                &mut bytes_to_client,
                self.config.buffer_size,
            );

            // First direction to finish ends both; the other is dropped here.
            tokio::select! {
                ended = client_to_vnc => ended,
                ended = vnc_to_client => ended,
                _ = guard.cancelled() => EndedBy::Cancelled,
            }
        };

        let _ = tokio::time::timeout(CLOSE_TIMEOUT, vnc_write.shutdown()).await;
        drop(vnc_write);
        drop(vnc_read);

        let close = if ended_by == EndedBy::Cancelled {
            CloseReason::Shutdown
        } else {
            CloseReason::Normal
        };
        close_client(&mut client_tx, close).await;
        drop(client_rx);
        guard.release();

        info!(
            "Session {} ended: {} ({} bytes to endpoint, {} bytes to client)",
            guard.session_id(),
            ended_by,
            bytes_to_endpoint,
            bytes_to_client
        );
        let _ = start_logged.await;
        self.activity
            .record(
                token,
                actions::SESSION_END,
                &format!(
                    "WebSocket VNC session ended: {} ({} bytes sent, {} bytes received)",
                    ended_by, bytes_to_endpoint, bytes_to_client
                ),
                origin,
            )
            .await;

        SessionOutcome {
            close,
            ended_by: Some(ended_by),
            bytes_to_endpoint,
            bytes_to_client,
        }
    }

    async fn dial(&self, address: &str, port: u16) -> Result<TcpStream, Error> {
        let unreachable = |reason: String| Error::Unreachable {
            target: format!("{}:{}", address, port),
            reason,
        };

        match tokio::time::timeout(self.config.dial_timeout, TcpStream::connect((address, port)))
            .await
        {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(unreachable(e.to_string())),
            Err(_) => Err(unreachable(format!(
                "connect timed out after {:?}",
                self.config.dial_timeout
            ))),
        }
    }
}

impl ClientFrame {
    fn into_message(self) -> Message {
        match self {
            ClientFrame::Data(data) => Message::Binary(data.to_vec()),
            ClientFrame::Close(reason) => Message::Close(Some(CloseFrame {
                code: reason.code(),
                reason: Cow::Borrowed(reason.reason()),
            })),
        }
    }
}

/// Forward client frames to the VNC server
async fn forward_client_to_vnc<R, E>(
    client_rx: &mut R,
    vnc_write: &mut OwnedWriteHalf,
    forwarded: &mut u64,
) -> EndedBy
where
    R: Stream<Item = Result<ClientFrame, E>> + Unpin,
    E: fmt::Display,
{
    while let Some(frame) = client_rx.next().await {
        match frame {
            Ok(ClientFrame::Data(data)) => {
                trace!("Client->VNC: {} bytes", data.len());
                if let Err(e) = vnc_write.write_all(&data).await {
                    debug!("Write to VNC server failed: {}", e);
                    return EndedBy::EndpointError;
                }
                *forwarded += data.len() as u64;
            }
            Ok(ClientFrame::Close(_)) => {
                debug!("Client closed session");
                return EndedBy::Client;
            }
            Err(e) => {
                debug!("Client stream error: {}", e);
                return EndedBy::ClientError;
            }
        }
    }
    EndedBy::Client
}

/// Forward VNC server bytes to the client
async fn forward_vnc_to_client<W>(
    vnc_read: &mut OwnedReadHalf,
    client_tx: &mut W,
    forwarded: &mut u64,
    buffer_size: usize,
) -> EndedBy
where
    W: Sink<ClientFrame> + Unpin,
    W::Error: fmt::Display,
{
    let mut buffer = vec![0u8; buffer_size.max(1)];

    loop {
        let n = match vnc_read.read(&mut buffer).await {
            Ok(0) => {
                debug!("VNC server closed connection");
                return EndedBy::Endpoint;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("Read from VNC server failed: {}", e);
                return EndedBy::EndpointError;
            }
        };

        trace!("VNC->Client: {} bytes", n);
        if let Err(e) = client_tx
            .send(ClientFrame::Data(Bytes::copy_from_slice(&buffer[..n])))
            .await
        {
            debug!("Send to client failed: {}", e);
            return EndedBy::ClientError;
        }
        *forwarded += n as u64;
    }
}

/// Send a close frame and close the sink. Errors from an already closed
/// client are expected here and ignored.
async fn close_client<W>(client_tx: &mut W, reason: CloseReason)
where
    W: Sink<ClientFrame> + Unpin,
{
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
        let _ = client_tx.send(ClientFrame::Close(reason)).await;
        let _ = client_tx.close().await;
    })
    .await;
}
