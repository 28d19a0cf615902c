//! Gateway opcodes.

use serde_repr::{Deserialize_repr, Serialize_repr};

/// Operation codes carried in the `op` field of every gateway payload.
///
/// See: <https://discord.com/developers/docs/topics/opcodes-and-status-codes#gateway-gateway-opcodes>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum OpCode {
    /// An event was dispatched. Receive only.
    Dispatch = 0,

    /// Liveness probe. Sent on the negotiated interval, and echoed when the
    /// gateway requests one.
    Heartbeat = 1,

    /// Start a new session. Send only.
    Identify = 2,

    /// Update the client presence. Send only.
    PresenceUpdate = 3,

    /// Join, move between, or leave voice channels. Send only.
    VoiceStateUpdate = 4,

    /// Resume a previous session. Send only.
    Resume = 6,

    /// The gateway wants the client to reconnect and resume. Receive only.
    Reconnect = 7,

    /// Request guild member chunks. Send only.
    RequestGuildMembers = 8,

    /// The session has been invalidated. Receive only.
    InvalidSession = 9,

    /// Sent immediately after connecting; carries the heartbeat interval.
    /// Receive only.
    Hello = 10,

    /// Acknowledges a heartbeat. Receive only.
    HeartbeatAck = 11,
}

impl OpCode {
    /// Whether this opcode only flows from the gateway to the client.
    pub const fn is_receive_only(self) -> bool {
        matches!(
            self,
            OpCode::Dispatch
                | OpCode::Reconnect
                | OpCode::InvalidSession
                | OpCode::Hello
                | OpCode::HeartbeatAck
        )
    }

    /// Whether this opcode only flows from the client to the gateway.
    pub const fn is_send_only(self) -> bool {
        matches!(
            self,
            OpCode::Identify
                | OpCode::PresenceUpdate
                | OpCode::VoiceStateUpdate
                | OpCode::Resume
                | OpCode::RequestGuildMembers
        )
    }
}
