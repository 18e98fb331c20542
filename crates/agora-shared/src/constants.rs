/// Application name
pub const APP_NAME: &str = "Agora";

/// Websocket close code sent when a connection fails validation (RFC 6455 policy violation)
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Websocket close code for an orderly server-side close
pub const CLOSE_NORMAL: u16 = 1000;

/// Number of recent messages replayed to a newly connected member
pub const DEFAULT_HISTORY_LIMIT: u32 = 10;

/// Upper bound for any paginated listing
pub const MAX_PAGE_SIZE: u32 = 100;

/// Maximum message length in characters
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Length of a private room invite code
pub const INVITE_CODE_LEN: usize = 4;

/// Alphabet invite codes are drawn from
pub const INVITE_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// How many times room creation regenerates a colliding invite code
pub const INVITE_CODE_ATTEMPTS: usize = 8;

/// Default access token lifetime in seconds (15 minutes)
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 15 * 60;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8001;
