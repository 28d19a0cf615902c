//! Gateway error types and close-code classification.
//!
//! Every close event is classified into the action the shard takes next:
//! stay offline, hand control back to the caller, re-identify from scratch,
//! fail hard, or resume the session.

use thiserror::Error;

/// Errors surfaced by gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// WebSocket connection or protocol error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Failed to decode a payload.
    #[error("payload decode error: {0}")]
    JsonDecode(String),

    /// The connection was closed with a code that cannot be recovered from.
    #[error("fatal gateway close: code={code}, reason={reason}")]
    FatalClose {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// A request requires an intent the shard was not configured with.
    #[error("the {0} intent is required for this request")]
    MissingIntent(&'static str),

    /// The shard shut down while the operation was pending.
    #[error("shard shut down")]
    Shutdown,

    /// Failed to hand an event to the consumer channel.
    #[error("event channel closed: {0}")]
    ChannelSend(String),

    /// Gateway URL could not be parsed.
    #[error("invalid gateway url: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::JsonDecode(err.to_string())
    }
}

impl<T> From<flume::SendError<T>> for GatewayError {
    fn from(err: flume::SendError<T>) -> Self {
        GatewayError::ChannelSend(err.to_string())
    }
}

/// Close codes sent by the gateway.
///
/// See: <https://discord.com/developers/docs/topics/opcodes-and-status-codes#gateway-gateway-close-event-codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Something went wrong, cause unknown.
    UnknownError = 4000,
    /// Invalid opcode sent.
    UnknownOpcode = 4001,
    /// Invalid payload (decode error).
    DecodeError = 4002,
    /// Payload sent before identifying.
    NotAuthenticated = 4003,
    /// Invalid token.
    AuthenticationFailed = 4004,
    /// Identify sent on an authenticated connection.
    AlreadyAuthenticated = 4005,
    /// Invalid sequence number in a resume.
    InvalidSeq = 4007,
    /// Payloads sent too quickly.
    RateLimited = 4008,
    /// Session timed out.
    SessionTimedOut = 4009,
    /// Invalid shard configuration.
    InvalidShard = 4010,
    /// Too many guilds, sharding required.
    ShardingRequired = 4011,
    /// Invalid API version.
    InvalidApiVersion = 4012,
    /// Invalid intents bitfield.
    InvalidIntents = 4013,
    /// Disallowed (privileged, unapproved) intents.
    DisallowedIntents = 4014,
}

impl CloseCode {
    /// Try to convert a raw close code into this enum.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4000 => Some(CloseCode::UnknownError),
            4001 => Some(CloseCode::UnknownOpcode),
            4002 => Some(CloseCode::DecodeError),
            4003 => Some(CloseCode::NotAuthenticated),
            4004 => Some(CloseCode::AuthenticationFailed),
            4005 => Some(CloseCode::AlreadyAuthenticated),
            4007 => Some(CloseCode::InvalidSeq),
            4008 => Some(CloseCode::RateLimited),
            4009 => Some(CloseCode::SessionTimedOut),
            4010 => Some(CloseCode::InvalidShard),
            4011 => Some(CloseCode::ShardingRequired),
            4012 => Some(CloseCode::InvalidApiVersion),
            4013 => Some(CloseCode::InvalidIntents),
            4014 => Some(CloseCode::DisallowedIntents),
            _ => None,
        }
    }
}

/// Close codes the shard itself uses when tearing down a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ShardCloseCode {
    /// Deliberate full shutdown.
    Shutdown = 3000,
    /// The heartbeat went unacknowledged for a full interval.
    ZombiedConnection = 3010,
    /// The old connection is replaced while resuming.
    ResumeClosingOldConnection = 3024,
    /// Test harness finished; stay offline.
    TestingFinished = 3064,
    /// Shard topology changed; the manager restarts the shard.
    Resharded = 3065,
    /// The old connection is replaced while re-identifying.
    ReIdentifying = 3066,
}

impl ShardCloseCode {
    /// The raw close code.
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Try to convert a raw close code into this enum.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            3000 => Some(ShardCloseCode::Shutdown),
            3010 => Some(ShardCloseCode::ZombiedConnection),
            3024 => Some(ShardCloseCode::ResumeClosingOldConnection),
            3064 => Some(ShardCloseCode::TestingFinished),
            3065 => Some(ShardCloseCode::Resharded),
            3066 => Some(ShardCloseCode::ReIdentifying),
            _ => None,
        }
    }
}

impl From<ShardCloseCode> for u16 {
    fn from(code: ShardCloseCode) -> Self {
        code.code()
    }
}

/// What the shard does after a connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Stay offline without reconnecting.
    Offline,
    /// Go to `Disconnected`; whoever initiated the close drives the next
    /// step (an identify or resume is already in flight).
    Graceful,
    /// The session is unusable; identify from scratch.
    Reidentify,
    /// Unrecoverable; fail the in-flight operation and stay offline.
    Fatal,
    /// Reconnect and resume the session.
    Resume,
}

impl CloseAction {
    /// Classify a close code.
    pub fn classify(code: u16) -> Self {
        match ShardCloseCode::from_code(code) {
            Some(ShardCloseCode::TestingFinished) => return CloseAction::Offline,
            Some(_) => return CloseAction::Graceful,
            None => {}
        }

        match CloseCode::from_code(code) {
            Some(
                CloseCode::UnknownOpcode
                | CloseCode::NotAuthenticated
                | CloseCode::InvalidSeq
                | CloseCode::RateLimited
                | CloseCode::SessionTimedOut,
            ) => CloseAction::Reidentify,
            Some(
                CloseCode::AuthenticationFailed
                | CloseCode::InvalidShard
                | CloseCode::ShardingRequired
                | CloseCode::InvalidApiVersion
                | CloseCode::InvalidIntents
                | CloseCode::DisallowedIntents,
            ) => CloseAction::Fatal,
            // UnknownError, DecodeError, AlreadyAuthenticated and anything
            // unrecognized are worth a resume attempt.
            _ => CloseAction::Resume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_round_trip() {
        assert_eq!(
            CloseCode::from_code(4014),
            Some(CloseCode::DisallowedIntents)
        );
        assert_eq!(CloseCode::from_code(1000), None);
        assert_eq!(CloseCode::DisallowedIntents as u16, 4014);
    }

    #[test]
    fn classify_testing() {
        assert_eq!(CloseAction::classify(3064), CloseAction::Offline);
    }

    #[test]
    fn classify_graceful() {
        for code in [3000, 3010, 3024, 3065, 3066] {
            assert_eq!(CloseAction::classify(code), CloseAction::Graceful);
        }
    }

    #[test]
    fn classify_reidentify() {
        for code in [4001, 4003, 4007, 4008, 4009] {
            assert_eq!(CloseAction::classify(code), CloseAction::Reidentify);
        }
    }

    #[test]
    fn classify_fatal() {
        for code in [4004, 4010, 4011, 4012, 4013, 4014] {
            assert_eq!(CloseAction::classify(code), CloseAction::Fatal);
        }
    }

    #[test]
    fn classify_resumable_default() {
        for code in [4000, 4002, 4005, 1000, 1001, 1006] {
            assert_eq!(CloseAction::classify(code), CloseAction::Resume);
        }
    }
}
