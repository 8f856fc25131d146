//! Command dispatcher: the only writer on the upstream connection

use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    command::AmiCommand,
    correlation::{CorrelationPolicy, PendingReplies, ReplySender},
    error::{BridgeError, BridgeResult},
    registry::SessionRegistry,
};

/// A command waiting in the dispatcher queue together with its caller's reply channel.
#[derive(Debug)]
pub struct QueuedCommand {
    pub command: AmiCommand,
    pub reply: Option<ReplySender>,
}

impl QueuedCommand {
    /// Queue-stop sentinel.
    pub fn stop() -> Self {
        Self {
            command: AmiCommand::stop(),
            reply: None,
        }
    }
}

/// Drains the command queue and writes one frame at a time.
pub struct CommandDispatcher<W> {
    writer: W,
    registry: Arc<SessionRegistry>,
    pending: Arc<PendingReplies>,
    policy: CorrelationPolicy,
}

impl<W: AsyncWrite + Unpin> CommandDispatcher<W> {
    pub fn new(
        writer: W,
        registry: Arc<SessionRegistry>,
        pending: Arc<PendingReplies>,
        policy: CorrelationPolicy,
    ) -> Self {
        Self {
            writer,
            registry,
            pending,
            policy,
        }
    }

    /// Run until the queue closes or the stop sentinel arrives.
    ///
    /// A failed write ends the loop with [`BridgeError::DispatchWrite`];
    /// every outstanding waiter is dropped so callers stop waiting.
    pub async fn run(mut self, mut queue: mpsc::Receiver<QueuedCommand>) -> BridgeResult<()> {
        info!("[DISPATCH] Started with {:?} correlation", self.policy);

        while let Some(queued) = queue
            .recv()
            .await
        {
            if queued
                .command
                .is_stop()
            {
                info!("[DISPATCH] Stop requested");
                return Ok(());
            }

            if let Err(e) = self
                .dispatch(queued)
                .await
            {
                if e.is_fatal() {
                    error!("[DISPATCH] {}", e);
                    self.pending
                        .clear()
                        .await;
                    return Err(e);
                }
                warn!("[DISPATCH] {}", e);
            }
        }

        info!("[DISPATCH] Command queue closed");
        Ok(())
    }

    async fn dispatch(&mut self, queued: QueuedCommand) -> BridgeResult<()> {
        let QueuedCommand { command, reply } = queued;

        let frame = match command.to_wire_format() {
            Ok(frame) => frame,
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                return Ok(());
            }
        };
        let id = command
            .action_id()
            .unwrap_or_default()
            .to_string();

        debug!("[DISPATCH] Sending {:?}", command);

        match self.policy {
            CorrelationPolicy::Acknowledge { .. } => {
                // Register before writing: the reply may beat us back otherwise.
                if let Some(reply) = reply {
                    if id.is_empty() {
                        let _ = reply.send(Err(BridgeError::protocol(
                            "command without ActionID cannot be acknowledged",
                        )));
                    } else {
                        self.pending
                            .register(&id, reply)
                            .await;
                    }
                }
                self.write_frame(&frame)
                    .await?;
            }
            CorrelationPolicy::Settle(interval) => {
                self.write_frame(&frame)
                    .await?;
                tokio::time::sleep(interval).await;
                if let Some(reply) = reply {
                    let result = self
                        .registry
                        .find(&id)
                        .await
                        .ok_or(BridgeError::UnknownSession { token: id });
                    let _ = reply.send(result);
                }
            }
        }
        Ok(())
    }

    async fn write_frame(&mut self, frame: &str) -> BridgeResult<()> {
        self.writer
            .write_all(frame.as_bytes())
            .await
            .map_err(BridgeError::DispatchWrite)?;
        self.writer
            .flush()
            .await
            .map_err(BridgeError::DispatchWrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::sync::oneshot;

    async fn read_available(reader: &mut tokio::io::DuplexStream, want: usize) -> String {
        let mut buf = vec![0u8; want];
        reader
            .read_exact(&mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn test_frames_written_in_submission_order() {
        let (writer, mut upstream) = tokio::io::duplex(4096);
        let registry = Arc::new(SessionRegistry::new());
        let pending = Arc::new(PendingReplies::new());
        let dispatcher = CommandDispatcher::new(
            writer,
            registry,
            pending,
            CorrelationPolicy::default(),
        );

        let (tx, rx) = mpsc::channel(8);
        for n in 0..3 {
            tx.send(QueuedCommand {
                command: AmiCommand::new("Ping").with_action_id(format!("T{}", n)),
                reply: None,
            })
            .await
            .unwrap();
        }
        tx.send(QueuedCommand::stop())
            .await
            .unwrap();

        dispatcher
            .run(rx)
            .await
            .unwrap();

        let expected = "Action:Ping\r\nActionID:T0\r\n\r\n\
                        Action:Ping\r\nActionID:T1\r\n\r\n\
                        Action:Ping\r\nActionID:T2\r\n\r\n";
        assert_eq!(read_available(&mut upstream, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_acknowledge_registers_waiter() {
        let (writer, _upstream) = tokio::io::duplex(4096);
        let registry = Arc::new(SessionRegistry::new());
        let session = registry
            .register("T1", "one")
            .await;
        let pending = Arc::new(PendingReplies::new());
        let dispatcher = CommandDispatcher::new(
            writer,
            registry,
            pending.clone(),
            CorrelationPolicy::default(),
        );

        let (tx, rx) = mpsc::channel(8);
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(QueuedCommand {
            command: AmiCommand::new("Status").with_action_id("T1"),
            reply: Some(reply_tx),
        })
        .await
        .unwrap();
        drop(tx);
        dispatcher
            .run(rx)
            .await
            .unwrap();

        assert_eq!(pending.len().await, 1);
        assert!(pending
            .resolve("T1", &session)
            .await);
        let got = reply_rx
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&got, &session));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_hands_out_session_after_interval() {
        let (writer, mut upstream) = tokio::io::duplex(4096);
        let registry = Arc::new(SessionRegistry::new());
        registry
            .register("T1", "one")
            .await;
        let dispatcher = CommandDispatcher::new(
            writer,
            registry,
            Arc::new(PendingReplies::new()),
            CorrelationPolicy::Settle(Duration::from_millis(500)),
        );

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(dispatcher.run(rx));

        let (reply_tx, mut reply_rx) = oneshot::channel();
        tx.send(QueuedCommand {
            command: AmiCommand::new("Status").with_action_id("T1"),
            reply: Some(reply_tx),
        })
        .await
        .unwrap();

        let frame = "Action:Status\r\nActionID:T1\r\n\r\n";
        assert_eq!(read_available(&mut upstream, frame.len()).await, frame);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(reply_rx
            .try_recv()
            .is_err());

        let session = reply_rx
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.token(), "T1");

        tx.send(QueuedCommand::stop())
            .await
            .unwrap();
        task.await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_reports_unknown_session() {
        let (writer, _upstream) = tokio::io::duplex(4096);
        let dispatcher = CommandDispatcher::new(
            writer,
            Arc::new(SessionRegistry::new()),
            Arc::new(PendingReplies::new()),
            CorrelationPolicy::Settle(Duration::from_millis(10)),
        );

        let (tx, rx) = mpsc::channel(8);
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(QueuedCommand {
            command: AmiCommand::new("Status").with_action_id("nobody"),
            reply: Some(reply_tx),
        })
        .await
        .unwrap();
        drop(tx);
        dispatcher
            .run(rx)
            .await
            .unwrap();

        assert!(matches!(
            reply_rx.await.unwrap(),
            Err(BridgeError::UnknownSession { token }) if token == "nobody"
        ));
    }

    #[tokio::test]
    async fn test_invalid_command_fails_caller_only() {
        let (writer, mut upstream) = tokio::io::duplex(4096);
        let dispatcher = CommandDispatcher::new(
            writer,
            Arc::new(SessionRegistry::new()),
            Arc::new(PendingReplies::new()),
            CorrelationPolicy::default(),
        );

        let (tx, rx) = mpsc::channel(8);
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(QueuedCommand {
            command: AmiCommand::new("Ping")
                .with_action_id("T1")
                .field("X", "a\r\nAction:Logoff"),
            reply: Some(reply_tx),
        })
        .await
        .unwrap();
        tx.send(QueuedCommand {
            command: AmiCommand::new("Ping").with_action_id("T2"),
            reply: None,
        })
        .await
        .unwrap();
        drop(tx);
        dispatcher
            .run(rx)
            .await
            .unwrap();

        assert!(matches!(
            reply_rx.await.unwrap(),
            Err(BridgeError::Protocol { .. })
        ));
        let frame = "Action:Ping\r\nActionID:T2\r\n\r\n";
        assert_eq!(read_available(&mut upstream, frame.len()).await, frame);
    }

    #[tokio::test]
    async fn test_write_failure_is_fatal() {
        let (writer, upstream) = tokio::io::duplex(64);
        drop(upstream);
        let pending = Arc::new(PendingReplies::new());
        let dispatcher = CommandDispatcher::new(
            writer,
            Arc::new(SessionRegistry::new()),
            pending.clone(),
            CorrelationPolicy::default(),
        );

        let (tx, rx) = mpsc::channel(8);
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(QueuedCommand {
            command: AmiCommand::new("Ping").with_action_id("T1"),
            reply: Some(reply_tx),
        })
        .await
        .unwrap();

        let result = dispatcher
            .run(rx)
            .await;
        assert!(matches!(result, Err(BridgeError::DispatchWrite(_))));
        assert!(reply_rx.await.is_err(), "waiter must be released");
        assert!(pending
            .is_empty()
            .await);
    }
}
