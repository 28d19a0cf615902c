//! Events emitted by a shard.

use crate::opcode::OpCode;
use std::time::Duration;

/// A lifecycle or protocol event, delivered over the shard's event channel.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ShardEvent {
    /// A connection attempt started.
    Connecting,

    /// The WebSocket opened.
    Connected,

    /// An identify attempt started.
    Identifying,

    /// An identify attempt completed with Ready.
    Identified,

    /// The connection closed.
    Disconnected {
        /// Close code the connection ended with.
        code: u16,
    },

    /// Hello was received.
    Hello {
        /// Negotiated heartbeat interval in milliseconds.
        heartbeat_interval: u64,
    },

    /// A heartbeat was transmitted.
    Heartbeat,

    /// The gateway acknowledged a heartbeat.
    HeartbeatAck {
        /// Round-trip time of the last heartbeat, when measured.
        rtt: Option<Duration>,
    },

    /// The gateway asked for a reconnect; a resume follows.
    RequestedReconnect,

    /// The session was invalidated.
    InvalidSession {
        /// Whether the session can be resumed.
        resumable: bool,
    },

    /// A resume attempt completed.
    Resumed,

    /// Any inbound packet, after protocol handling.
    Message(GatewayMessage),
}

/// An inbound packet in decoded form.
#[derive(Debug, Clone)]
pub struct GatewayMessage {
    /// Opcode of the packet.
    pub op: OpCode,

    /// Sequence number, on dispatch events.
    pub seq: Option<u64>,

    /// Event name, on dispatch events.
    pub name: Option<String>,

    /// Raw event data.
    pub data: Option<serde_json::Value>,
}
