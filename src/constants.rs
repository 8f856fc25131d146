//! Protocol constants and configuration defaults

/// Default Asterisk Manager Interface port
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Socket buffer size for reading from the TCP stream (64KB)
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Maximum length of a single unterminated line (64KB).
/// AMI lines are short; anything longer means the stream is not AMI.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Wire line terminator for both directions
pub const LINE_TERMINATOR: &str = "\r\n";

/// Action name of the login command
pub const ACTION_LOGIN: &str = "Login";

/// Reserved action that stops the command dispatcher
pub const ACTION_STOP: &str = "STOP";

/// Exact line (after trimming) expected in reply to `Action: Login`
pub const LOGIN_SUCCESS_LINE: &str = "Response: Success";

/// Number of greeting lines the server emits after a successful login
pub const POST_LOGIN_LINES: usize = 2;

/// Connect and handshake timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Fixed wait after a write in settle-correlation mode
pub const DEFAULT_SETTLE_MS: u64 = 500;

/// How long a caller waits for its correlated record in acknowledge mode
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 5000;

/// Router backoff after a transient read failure
pub const READ_BACKOFF_MS: u64 = 10;

/// Capacity of the command queue; a full queue rejects new commands
pub const DEFAULT_COMMAND_QUEUE_SIZE: usize = 256;

/// Period between idle-session sweeps
pub const DEFAULT_EVICT_PERIOD_SECS: u64 = 120;

/// Sessions idle longer than this are evicted
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
