//! The bridge context: command queue, session registry and background tasks

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::{
    command::AmiCommand,
    connection::AmiConnection,
    constants::{DEFAULT_COMMAND_QUEUE_SIZE, DEFAULT_EVICT_PERIOD_SECS, DEFAULT_IDLE_TIMEOUT_SECS},
    correlation::{CorrelationPolicy, PendingReplies, ReplyReceiver, DEFAULT_REPLY_TIMEOUT},
    dispatcher::{CommandDispatcher, QueuedCommand},
    error::{BridgeError, BridgeResult},
    evictor::run_evictor,
    registry::SessionRegistry,
    router::EventRouter,
    session::{SerializedEvents, Session},
};

/// Tunables fixed when the bridge starts.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// How callers learn their results are available.
    pub correlation: CorrelationPolicy,
    /// Upper bound on a caller's wait for its results.
    pub reply_timeout: Duration,
    /// Capacity of the command queue.
    pub queue_size: usize,
    /// Period between idle sweeps.
    pub evict_period: Duration,
    /// Idle time after which a session is evicted.
    pub idle_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            correlation: CorrelationPolicy::default(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            queue_size: DEFAULT_COMMAND_QUEUE_SIZE,
            evict_period: Duration::from_secs(DEFAULT_EVICT_PERIOD_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

/// Shared context handed to every caller-facing request.
///
/// Owns the sending side of the command queue and the session registry.
/// The upstream socket itself is owned by the router and dispatcher tasks.
#[derive(Debug)]
pub struct Bridge {
    registry: Arc<SessionRegistry>,
    commands: mpsc::Sender<QueuedCommand>,
    options: BridgeOptions,
}

/// Handles of the long-running tasks started by [`Bridge::start`].
#[derive(Debug)]
pub struct BridgeTasks {
    router: JoinHandle<BridgeResult<()>>,
    dispatcher: JoinHandle<BridgeResult<()>>,
    evictor: JoinHandle<BridgeResult<()>>,
}

impl Bridge {
    /// Spawn the router, dispatcher and evictor over an authenticated connection.
    pub fn start<R, W>(
        connection: AmiConnection<R, W>,
        options: BridgeOptions,
    ) -> (Arc<Self>, BridgeTasks)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let registry = Arc::new(SessionRegistry::new());
        let pending = Arc::new(PendingReplies::new());
        let (commands, queue) = mpsc::channel(
            options
                .queue_size
                .max(1),
        );

        let (reader, writer, parser) = connection.into_parts();

        let router = tokio::spawn(
            EventRouter::new(reader, parser, registry.clone(), pending.clone()).run(),
        );
        let dispatcher = tokio::spawn(
            CommandDispatcher::new(writer, registry.clone(), pending, options.correlation)
                .run(queue),
        );
        let evictor = tokio::spawn(run_evictor(
            registry.clone(),
            options.evict_period,
            options.idle_timeout,
        ));

        info!("[BRIDGE] Started with {:?}", options);
        let bridge = Arc::new(Self {
            registry,
            commands,
            options,
        });
        let tasks = BridgeTasks {
            router,
            dispatcher,
            evictor,
        };
        (bridge, tasks)
    }

    /// Session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Options the bridge was started with.
    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Find-or-create a session and set its display name.
    ///
    /// A missing or blank token yields a newly generated one.
    pub async fn register(&self, token: Option<&str>, name: &str) -> Arc<Session> {
        self.registry
            .register(token.unwrap_or_default(), name)
            .await
    }

    /// Queue a command without waiting for its results.
    ///
    /// In settle mode the reply arrives after the settle interval; a caller
    /// waiting behind a backlog may hit the reply timeout first.
    /// Fails fast with [`BridgeError::QueueFull`] when the queue is at capacity.
    pub fn submit(&self, command: AmiCommand) -> BridgeResult<ReplyReceiver> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(QueuedCommand {
            command,
            reply: Some(reply),
        })?;
        Ok(rx)
    }

    fn enqueue(&self, queued: QueuedCommand) -> BridgeResult<()> {
        self.commands
            .try_send(queued)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("[BRIDGE] Command queue full");
                    BridgeError::QueueFull
                }
                mpsc::error::TrySendError::Closed(_) => BridgeError::DispatcherStopped,
            })
    }

    /// Run `action` on behalf of the session `token` and collect its results.
    ///
    /// The command carries `ActionID: <token>`. When a field name repeats,
    /// only its first value is sent. Once the correlation policy
    /// reports the session ready, its buffered records (the command's replies
    /// and any broadcasts) are serialized and cleared, and the session is
    /// marked active.
    pub async fn action<K, V>(
        &self,
        token: &str,
        action: &str,
        fields: impl IntoIterator<Item = (K, V)>,
    ) -> BridgeResult<SerializedEvents>
    where
        K: Into<String>,
        V: AsRef<str>,
    {
        let session = self
            .registry
            .find(token)
            .await
            .ok_or_else(|| BridgeError::UnknownSession {
                token: token
                    .trim()
                    .to_string(),
            })?;

        let mut command = AmiCommand::new(action.trim()).with_action_id(session.token());
        for (key, value) in fields {
            // Repeated keys: the first value wins, as for `token` and `Action`.
            let key: String = key.into();
            if command
                .fields()
                .contains_key(&key)
            {
                continue;
            }
            command.set_field(
                key,
                value
                    .as_ref()
                    .trim(),
            );
        }

        let reply = self.submit(command)?;
        let timeout_ms = self
            .options
            .reply_timeout
            .as_millis() as u64;
        let ready = match timeout(self.options.reply_timeout, reply).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(BridgeError::DispatcherStopped),
            Err(_) => {
                warn!(
                    "[BRIDGE] No reply for {} within {}ms",
                    session.token(),
                    timeout_ms
                );
                return Err(BridgeError::ReplyTimeout {
                    token: session
                        .token()
                        .to_string(),
                    timeout_ms,
                });
            }
        };

        if let CorrelationPolicy::Acknowledge { linger } = self.options.correlation {
            if !linger.is_zero() {
                tokio::time::sleep(linger).await;
            }
        }

        let events = ready
            .take_events_as_string()
            .await;
        ready
            .update_activity()
            .await;
        if let Some(anomaly) = events.anomaly() {
            error!("[BRIDGE] {} for {}", anomaly, ready.token());
        }
        debug!(
            "[BRIDGE] {} answered with {} bytes",
            ready.token(),
            events
                .text
                .len()
        );
        Ok(events)
    }

    /// Ask the dispatcher to stop after the commands already queued.
    pub async fn shutdown(&self) -> BridgeResult<()> {
        self.commands
            .send(QueuedCommand::stop())
            .await
            .map_err(|_| BridgeError::DispatcherStopped)
    }
}

impl BridgeTasks {
    /// Wait for the first task to end and return its outcome.
    ///
    /// The router only ends on connection loss and the dispatcher on a
    /// write failure or stop request; either is the end of the bridge.
    pub async fn wait(&mut self) -> BridgeResult<()> {
        let (name, result) = tokio::select! {
            r = &mut self.router => ("router", r),
            r = &mut self.dispatcher => ("dispatcher", r),
            r = &mut self.evictor => ("evictor", r),
        };
        let outcome = flatten(name, result);
        match &outcome {
            Ok(()) => info!("[BRIDGE] {} task finished", name),
            Err(e) => error!("[BRIDGE] {} task failed: {}", name, e),
        }
        outcome
    }

    /// Abort every task.
    pub fn abort(&self) {
        self.router
            .abort();
        self.dispatcher
            .abort();
        self.evictor
            .abort();
    }
}

impl Drop for BridgeTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

fn flatten(name: &str, result: Result<BridgeResult<()>, JoinError>) -> BridgeResult<()> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(BridgeError::connection(format!("{} task aborted: {}", name, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AmiParser;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn start(options: BridgeOptions) -> (Arc<Bridge>, BridgeTasks, DuplexStream) {
        let (client, upstream) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let connection = AmiConnection::from_parts(reader, writer, AmiParser::new(), String::new());
        let (bridge, tasks) = Bridge::start(connection, options);
        (bridge, tasks, upstream)
    }

    #[test]
    fn test_default_options() {
        let options = BridgeOptions::default();
        assert_eq!(options.correlation, CorrelationPolicy::default());
        assert_eq!(options.queue_size, DEFAULT_COMMAND_QUEUE_SIZE);
        assert_eq!(options.reply_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_action_for_unknown_token_is_rejected_before_queueing() {
        let (bridge, _tasks, _upstream) = start(BridgeOptions::default());
        let err = bridge
            .action(" nobody ", "Ping", Vec::<(String, String)>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnknownSession { token } if token == "nobody"));
    }

    #[tokio::test]
    async fn test_action_refreshes_activity_and_drains_queue() {
        let (bridge, _tasks, mut upstream) = start(BridgeOptions::default());
        let session = bridge
            .register(Some("T1"), "one")
            .await;

        let caller = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .action("T1", "Ping", Vec::<(String, String)>::new())
                    .await
            })
        };

        let expected = "Action:Ping\r\nActionID:T1\r\n\r\n";
        let mut frame = vec![0u8; expected.len()];
        upstream
            .read_exact(&mut frame)
            .await
            .unwrap();
        assert_eq!(frame, expected.as_bytes());
        upstream
            .write_all(b"Response: Success\r\nActionID: T1\r\nPing: Pong\r\n\r\n")
            .await
            .unwrap();

        let events = caller
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            events.text,
            "Response:Success\r\nActionID:T1\r\nPing:Pong\r\n\r\n\r\n"
        );
        assert_eq!(session.pending_events().await, 0);
        assert!(
            session
                .idle_for(tokio::time::Instant::now())
                .await
                < Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn test_repeated_field_keeps_first_value() {
        let (bridge, _tasks, mut upstream) = start(BridgeOptions::default());
        bridge
            .register(Some("T1"), "one")
            .await;

        let caller = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .action(
                        "T1",
                        "Redirect",
                        [("Channel", "SIP/100"), ("Exten", "200"), ("Channel", "SIP/999")],
                    )
                    .await
            })
        };

        let expected = "Action:Redirect\r\nActionID:T1\r\nChannel:SIP/100\r\nExten:200\r\n\r\n";
        let mut frame = vec![0u8; expected.len()];
        upstream
            .read_exact(&mut frame)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(frame).unwrap(), expected);

        upstream
            .write_all(b"Response: Success\r\nActionID: T1\r\nMessage: Redirect successful\r\n\r\n")
            .await
            .unwrap();
        caller
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_dispatcher() {
        let (bridge, mut tasks, _upstream) = start(BridgeOptions::default());
        bridge
            .shutdown()
            .await
            .unwrap();
        assert!(tasks
            .wait()
            .await
            .is_ok());
        assert!(matches!(
            bridge.submit(AmiCommand::new("Ping").with_action_id("T1")),
            Err(BridgeError::DispatcherStopped)
        ));
    }
}
