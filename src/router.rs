//! Event router: the only reader on the upstream connection

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, trace, warn};

use crate::{
    constants::{READ_BACKOFF_MS, SOCKET_BUF_SIZE},
    correlation::{PendingReplies, ReplyPart, ReplyTracker},
    error::{BridgeError, BridgeResult},
    event::EventRecord,
    protocol::AmiParser,
    registry::{Delivery, SessionRegistry},
};

/// Reads records off the upstream and delivers them to sessions.
pub struct EventRouter<R> {
    reader: R,
    parser: AmiParser,
    registry: Arc<SessionRegistry>,
    pending: Arc<PendingReplies>,
    replies: ReplyTracker,
}

impl<R: AsyncRead + Unpin> EventRouter<R> {
    /// `parser` may already hold bytes read past the login handshake.
    pub fn new(
        reader: R,
        parser: AmiParser,
        registry: Arc<SessionRegistry>,
        pending: Arc<PendingReplies>,
    ) -> Self {
        Self {
            reader,
            parser,
            registry,
            pending,
            replies: ReplyTracker::new(),
        }
    }

    /// Run until the connection closes or fails.
    ///
    /// Never returns `Ok`: upstream EOF is [`BridgeError::ConnectionClosed`].
    /// A panic inside the loop is reported as an error instead of unwinding
    /// through the task.
    pub async fn run(self) -> BridgeResult<()> {
        let result = std::panic::AssertUnwindSafe(self.run_inner());
        match futures_util::FutureExt::catch_unwind(result).await {
            Ok(result) => result,
            Err(_) => {
                error!("[ROUTER] Reader task panicked");
                Err(BridgeError::connection("router task panicked"))
            }
        }
    }

    async fn run_inner(mut self) -> BridgeResult<()> {
        let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];
        info!("[ROUTER] Started");

        loop {
            // Drain everything already buffered before touching the socket.
            match self.parser.parse_record() {
                Ok(Some(record)) => {
                    self.deliver(record)
                        .await;
                    continue;
                }
                Ok(None) => {}
                Err(BridgeError::MalformedLine { line }) => {
                    warn!("[ROUTER] Skipping malformed line {:?}", line);
                    continue;
                }
                Err(e) => return Err(e),
            }

            match self
                .reader
                .read(&mut read_buffer)
                .await
            {
                Ok(0) => {
                    info!("[ROUTER] Connection closed (EOF)");
                    return Err(BridgeError::ConnectionClosed);
                }
                Ok(n) => {
                    trace!("[ROUTER] Read {} bytes", n);
                    self.parser
                        .add_data(&read_buffer[..n])?;
                }
                Err(e) if is_transient(&e) => {
                    trace!("[ROUTER] Transient read error: {}", e);
                    tokio::time::sleep(Duration::from_millis(READ_BACKOFF_MS)).await;
                }
                Err(e) => {
                    warn!("[ROUTER] Read error: {}", e);
                    return Err(BridgeError::Io(e));
                }
            }
        }
    }

    async fn deliver(&mut self, record: EventRecord) {
        debug!("[ROUTER] Record {:?}", record.fields());
        let part = ReplyPart::of(&record);
        if let Delivery::Correlated(session) = self
            .registry
            .route(record)
            .await
        {
            if self
                .replies
                .observe(session.token(), part)
            {
                self.pending
                    .resolve(session.token(), &session)
                    .await;
            }
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::TimedOut
    )
}
