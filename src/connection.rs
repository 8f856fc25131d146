//! Upstream connection management for AMI

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::{
    command::AmiCommand,
    constants::{DEFAULT_TIMEOUT_MS, LOGIN_SUCCESS_LINE, POST_LOGIN_LINES, SOCKET_BUF_SIZE},
    error::{BridgeError, BridgeResult},
    protocol::AmiParser,
};

/// Login credentials for the manager interface.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(host: &str, port: u16) -> BridgeResult<TcpStream> {
    let tcp_result = timeout(
        Duration::from_millis(DEFAULT_TIMEOUT_MS),
        TcpStream::connect((host, port)),
    )
    .await;

    match tcp_result {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established");
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(BridgeError::connection(format!(
                "cannot connect to {}:{}: {}",
                host, port, e
            )))
        }
        Err(_) => {
            warn!(
                "[CONNECT] TCP connect timed out after {}ms",
                DEFAULT_TIMEOUT_MS
            );
            Err(BridgeError::Timeout {
                timeout_ms: DEFAULT_TIMEOUT_MS,
            })
        }
    }
}

/// Read one line during the handshake, leaving later bytes in `parser`.
async fn recv_line<S: AsyncRead + Unpin>(
    stream: &mut S,
    parser: &mut AmiParser,
    read_buffer: &mut [u8],
) -> BridgeResult<String> {
    loop {
        if let Some(line) = parser.next_line() {
            trace!("[RECV] Handshake line {:?}", line);
            return Ok(line);
        }

        let read_result = timeout(
            Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stream.read(read_buffer),
        )
        .await;

        let bytes_read = match read_result {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(BridgeError::Io(e)),
            Err(_) => {
                return Err(BridgeError::Timeout {
                    timeout_ms: DEFAULT_TIMEOUT_MS,
                })
            }
        };

        if bytes_read == 0 {
            return Err(BridgeError::ConnectionClosed);
        }
        parser.add_data(&read_buffer[..bytes_read])?;
    }
}

/// Perform the AMI login handshake on `stream`.
///
/// Reads the banner, sends `Action:Login`, requires the exact reply line
/// `Response: Success`, then discards the two greeting lines that follow.
/// Returns the banner. Bytes received beyond the handshake stay in `parser`.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    parser: &mut AmiParser,
    credentials: &Credentials,
) -> BridgeResult<String> {
    let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];

    debug!("[AUTH] Waiting for banner");
    let banner = recv_line(stream, parser, &mut read_buffer)
        .await
        .map_err(|e| BridgeError::connection(format!("failed to read banner: {}", e)))?;
    info!("[AUTH] Connected: {}", banner.trim());

    let login = AmiCommand::login(&credentials.username, &credentials.secret);
    debug!("[AUTH] Sending {:?}", login);
    stream
        .write_all(
            login
                .to_wire_format()?
                .as_bytes(),
        )
        .await
        .map_err(BridgeError::Io)?;

    let reply = recv_line(stream, parser, &mut read_buffer).await?;
    if reply.trim() != LOGIN_SUCCESS_LINE {
        return Err(BridgeError::AuthenticationFailed {
            reply: reply
                .trim()
                .to_string(),
        });
    }

    for _ in 0..POST_LOGIN_LINES {
        let line = recv_line(stream, parser, &mut read_buffer)
            .await
            .map_err(|e| {
                BridgeError::connection(format!("connection lost after login: {}", e))
            })?;
        trace!("[AUTH] Discarding greeting line {:?}", line);
    }

    debug!("[AUTH] Authentication successful");
    Ok(banner)
}

/// An authenticated upstream connection, ready to be split between the
/// router (reader) and the dispatcher (writer).
pub struct AmiConnection<R, W> {
    reader: R,
    writer: W,
    parser: AmiParser,
    banner: String,
}

impl<R, W> std::fmt::Debug for AmiConnection<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiConnection")
            .field("banner", &self.banner)
            .field("buffered", &self.parser.buffered_len())
            .finish()
    }
}

impl AmiConnection<OwnedReadHalf, OwnedWriteHalf> {
    /// Connect to the manager interface and log in.
    ///
    /// Any failure here is fatal for the bridge: there is no reconnection.
    pub async fn connect(host: &str, port: u16, credentials: &Credentials) -> BridgeResult<Self> {
        info!("[CONNECT] Connecting to AMI at {}:{}", host, port);

        let mut stream = tcp_connect_with_timeout(host, port).await?;
        let mut parser = AmiParser::new();
        let banner = handshake(&mut stream, &mut parser, credentials).await?;

        info!("[CONNECT] Successfully connected and authenticated to AMI");
        let (reader, writer) = stream.into_split();
        Ok(Self::from_parts(reader, writer, parser, banner))
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> AmiConnection<R, W> {
    /// Assemble a connection from an already-authenticated transport.
    pub fn from_parts(reader: R, writer: W, parser: AmiParser, banner: String) -> Self {
        Self {
            reader,
            writer,
            parser,
            banner,
        }
    }

    /// Greeting line sent by the server on connect.
    pub fn banner(&self) -> &str {
        &self.banner
    }

    /// Split into reader, writer and the parser holding any unread bytes.
    pub fn into_parts(self) -> (R, W, AmiParser) {
        (self.reader, self.writer, self.parser)
    }
}
