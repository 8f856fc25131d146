//! HTTP bridge over a single Asterisk Manager Interface (AMI) connection
//!
//! Many independent client sessions issue AMI actions through one persistent,
//! authenticated TCP connection. Replies and events streamed back by Asterisk
//! are routed to the session that caused them (matched by `ActionID`), or
//! broadcast to every session when they carry no correlation id.
//!
//! # Architecture
//!
//! After the login handshake the upstream socket is split:
//! - the [`EventRouter`] owns the read half and delivers decoded records
//!   into per-[`Session`] queues,
//! - the [`CommandDispatcher`] owns the write half and drains a bounded
//!   command queue, one frame at a time.
//!
//! [`Bridge`] is the context object tying these together; HTTP handlers hold
//! an `Arc<Bridge>` and never touch the socket.
//!
//! # Example
//!
//! ```rust,no_run
//! use ami_bridge::{AmiConnection, Bridge, BridgeError, BridgeOptions, Credentials};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BridgeError> {
//!     let credentials = Credentials::new("admin", "secret");
//!     let connection = AmiConnection::connect("127.0.0.1", 5038, &credentials).await?;
//!     let (bridge, mut tasks) = Bridge::start(connection, BridgeOptions::default());
//!
//!     let session = bridge.register(None, "example").await;
//!     let events = bridge
//!         .action(session.token(), "CoreStatus", Vec::<(String, String)>::new())
//!         .await?;
//!     print!("{}", events.text);
//!
//!     bridge.shutdown().await?;
//!     tasks.wait().await
//! }
//! ```

#[macro_use]
mod macros;

pub mod bridge;
pub mod command;
pub mod config;
pub mod connection;
pub mod constants;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod evictor;
pub mod headers;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;

pub use bridge::{Bridge, BridgeOptions, BridgeTasks};
pub use command::AmiCommand;
pub use config::{AmiConfig, BridgeConfig, Config, CorrelationMode, HttpConfig};
pub use connection::{handshake, AmiConnection, Credentials};
pub use constants::DEFAULT_AMI_PORT;
pub use correlation::{CorrelationPolicy, PendingReplies, ReplyPart, ReplyTracker};
pub use dispatcher::{CommandDispatcher, QueuedCommand};
pub use error::{BridgeError, BridgeResult};
pub use event::EventRecord;
pub use evictor::run_evictor;
pub use headers::{AmiField, ParseAmiFieldError};
pub use protocol::AmiParser;
pub use registry::{Delivery, SessionRegistry};
pub use router::EventRouter;
pub use session::{SerializedEvents, Session};
