// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Inbound listener for client libraries.
//!
//! Requests are `cmd: u32 BE`, `length: u32 BE` (header included), then the body.
//! Responses are `status: u32 BE`, `length: u32 BE` (header included), then the
//! payload. `SendMessage` is fire-and-forget and never answered.

use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::CatAgent;
use crate::config::ServerConfig;
use crate::errors::{DecodeError, ServerError};

const HEADER_LEN: usize = 8;
/// Largest request body accepted. Bigger frames close the connection.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;
const UNIX_SCHEME: &str = "unix://";
const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    CreateMessageId = 1,
    SendMessage = 2,
}

impl Command {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Command::CreateMessageId),
            2 => Some(Command::SendMessage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    MsgReadHeaderErr = 1,
    MsgReadMessageErr = 2,
    NotFoundCmd = 3,
    BadDomain = 4,
}

impl From<&DecodeError> for Status {
    fn from(error: &DecodeError) -> Self {
        match error {
            DecodeError::MissingHeaderField(_) => Status::MsgReadHeaderErr,
            _ => Status::MsgReadMessageErr,
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    read: Option<Duration>,
    write: Option<Duration>,
}

impl Timeouts {
    fn from_config(config: &ServerConfig) -> Self {
        let millis = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        Timeouts {
            read: millis(config.read_timeout_millis),
            write: millis(config.write_timeout_millis),
        }
    }
}

pub struct Server {
    listener: Listener,
    agent: Arc<CatAgent>,
    timeouts: Timeouts,
}

impl Server {
    /// Binds `config.addr`. A `unix://` address removes any stale socket file first.
    pub async fn bind(config: &ServerConfig, agent: Arc<CatAgent>) -> Result<Self, ServerError> {
        let bind_error = |source| ServerError::Bind {
            addr: config.addr.clone(),
            source,
        };

        let listener = if let Some(path) = config.addr.strip_prefix(UNIX_SCHEME) {
            bind_unix(path).map_err(bind_error)?
        } else {
            Listener::Tcp(TcpListener::bind(&config.addr).await.map_err(bind_error)?)
        };
        info!("Server listening on {}", config.addr);

        Ok(Server {
            listener,
            agent,
            timeouts: Timeouts::from_config(config),
        })
    }

    /// Bound TCP address, `None` for a Unix socket.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(..) => None,
        }
    }

    /// Accepts connections until `cancel_token` fires, then stops accepting and gives
    /// open connections a few seconds to finish their current request.
    pub async fn serve(self, cancel_token: CancellationToken) {
        let mut connections = JoinSet::new();
        let mut backoff = ACCEPT_BACKOFF_INITIAL;

        loop {
            let accepted = tokio::select! {
                () = cancel_token.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => continue,
                accepted = self.accept() => accepted,
            };

            match accepted {
                Ok(stream) => {
                    backoff = ACCEPT_BACKOFF_INITIAL;
                    let agent = Arc::clone(&self.agent);
                    let timeouts = self.timeouts;
                    let cancel = cancel_token.clone();
                    match stream {
                        Stream::Tcp(stream, peer) => {
                            connections.spawn(serve_connection(stream, peer, agent, timeouts, cancel));
                        }
                        #[cfg(unix)]
                        Stream::Unix(stream) => {
                            connections.spawn(serve_connection(
                                stream,
                                "unix".to_string(),
                                agent,
                                timeouts,
                                cancel,
                            ));
                        }
                    }
                }
                Err(e) => {
                    error!("Accept error: {}, retrying in {:?}", e, backoff);
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = cancel_token.cancelled() => break,
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
            }
        }

        info!(
            "Server shutting down, waiting for {} connections",
            connections.len()
        );
        let drained = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections still open after {:?}, aborting them",
                connections.len(),
                SHUTDOWN_DEADLINE
            );
            connections.shutdown().await;
        }

        #[cfg(unix)]
        if let Listener::Unix(_, path) = &self.listener {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("Failed to remove socket file {}: {}", path.display(), e);
            }
        }
        info!("Server exit");
    }

    async fn accept(&self) -> io::Result<Stream> {
        match &self.listener {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok(Stream::Tcp(stream, peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok(Stream::Unix(stream))
            }
        }
    }
}

enum Stream {
    Tcp(tokio::net::TcpStream, String),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

#[cfg(unix)]
fn bind_unix(path: &str) -> io::Result<Listener> {
    let path = PathBuf::from(path);
    match std::fs::remove_file(&path) {
        Ok(()) => debug!("Removed stale socket file {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(Listener::Unix(UnixListener::bind(&path)?, path))
}

#[cfg(not(unix))]
fn bind_unix(_path: &str) -> io::Result<Listener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Unix sockets are not supported on this platform",
    ))
}

#[derive(Debug)]
struct Request {
    cmd: u32,
    body: Vec<u8>,
}

async fn serve_connection<S>(
    mut stream: S,
    peer: String,
    agent: Arc<CatAgent>,
    timeouts: Timeouts,
    cancel_token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Connection from {} accepted", peer);
    loop {
        let request = tokio::select! {
            () = cancel_token.cancelled() => break,
            request = with_timeout(timeouts.read, read_request(&mut stream)) => request,
        };
        let request = match request {
            Ok(request) => request,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("Connection from {} closed", peer);
                break;
            }
            Err(e) => {
                error!("Read request from {} error: {}", peer, e);
                break;
            }
        };

        let response = match Command::from_u32(request.cmd) {
            Some(Command::CreateMessageId) => create_message_id(&agent, &request.body),
            Some(Command::SendMessage) => {
                if let Err(e) = agent.handle_send_message(&request.body) {
                    error!(
                        "Send message from {} rejected with status {:?}: {}",
                        peer,
                        Status::from(&e),
                        e
                    );
                }
                continue;
            }
            None => {
                debug!("Unknown command {} from {}", request.cmd, peer);
                (Status::NotFoundCmd, Vec::new())
            }
        };

        let (status, payload) = response;
        if let Err(e) = with_timeout(timeouts.write, write_response(&mut stream, status, &payload)).await
        {
            error!("Send response to {} error: {}", peer, e);
            break;
        }
    }
    let _ = stream.shutdown().await;
}

fn create_message_id(agent: &CatAgent, body: &[u8]) -> (Status, Vec<u8>) {
    if body.is_empty() {
        return (Status::BadDomain, Vec::new());
    }
    let domain = String::from_utf8_lossy(body);
    (Status::Ok, agent.create_message_id(&domain).into_bytes())
}

async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Request> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let cmd = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

    let body_len = length.saturating_sub(HEADER_LEN);
    if body_len > MAX_BODY_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("request body of {body_len} bytes exceeds {MAX_BODY_LEN}"),
        ));
    }

    let mut body = vec![0; body_len];
    if !body.is_empty() {
        reader.read_exact(&mut body).await?;
    }
    Ok(Request { cmd, body })
}

#[allow(clippy::cast_possible_truncation)]
async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: Status,
    payload: &[u8],
) -> io::Result<()> {
    let length = (HEADER_LEN + payload.len()) as u32;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(status as u32).to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    future: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"))?,
        None => future.await,
    }
}
