//! Gateway payload structures.
//!
//! Inbound payloads are parsed in two stages: the envelope first (with the
//! `d` field deferred via `RawValue`), then the data for the opcodes and
//! dispatch events the shard itself consumes.

use crate::opcode::OpCode;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use vanadium_model::{GuildMember, Intents, Snowflake, User};

/// A raw inbound payload; `d` stays unparsed until dispatch.
#[derive(Debug, Deserialize)]
pub(crate) struct RawGatewayPayload<'a> {
    /// Opcode of the payload.
    pub op: OpCode,

    /// Event data, deferred.
    #[serde(borrow)]
    pub d: Option<&'a serde_json::value::RawValue>,

    /// Sequence number, on dispatch events.
    pub s: Option<u64>,

    /// Event name, on dispatch events.
    pub t: Option<String>,
}

/// An outbound payload envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload<D> {
    /// Opcode of the payload.
    pub op: OpCode,

    /// Event data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<D>,

    /// Sequence number, on dispatch events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,

    /// Event name, on dispatch events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl<D: Serialize> GatewayPayload<D> {
    /// Wrap data in an envelope with only the opcode set.
    pub fn new(op: OpCode, data: D) -> Self {
        Self {
            op,
            d: Some(data),
            s: None,
            t: None,
        }
    }
}

/// Prefix a raw bot token for the `token` fields of Identify and Resume.
pub(crate) fn bot_token(token: &str) -> String {
    if token.starts_with("Bot ") {
        token.to_string()
    } else {
        format!("Bot {token}")
    }
}

/// Data of the Hello payload (op 10).
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    /// Interval in milliseconds at which to send heartbeats.
    pub heartbeat_interval: u64,
}

/// Data of the Identify payload (op 2).
#[derive(Debug, Clone, Serialize)]
pub struct Identify<'a> {
    /// Authentication token, `Bot `-prefixed.
    pub token: Cow<'a, str>,

    /// Connection properties.
    pub properties: ConnectionProperties<'a>,

    /// Whether payload compression is requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,

    /// Member-list threshold for large guilds (50-250).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u8>,

    /// Shard coordinates: `[shard_id, total_shards]`.
    pub shard: [u32; 2],

    /// Gateway intents.
    pub intents: Intents,

    /// Initial presence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<UpdatePresence>,
}

/// Connection properties sent with Identify.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties<'a> {
    /// Operating system.
    pub os: Cow<'a, str>,

    /// Library identifier.
    pub browser: Cow<'a, str>,

    /// Library identifier, device slot.
    pub device: Cow<'a, str>,
}

impl Default for ConnectionProperties<'_> {
    fn default() -> Self {
        Self {
            os: Cow::Owned(std::env::consts::OS.to_string()),
            browser: Cow::Borrowed("vanadium"),
            device: Cow::Borrowed("vanadium"),
        }
    }
}

/// Data of the Resume payload (op 6).
#[derive(Debug, Clone, Serialize)]
pub struct Resume<'a> {
    /// Authentication token, `Bot `-prefixed.
    pub token: Cow<'a, str>,

    /// Session ID from the previous Ready event.
    pub session_id: Cow<'a, str>,

    /// Last sequence number seen, or `0` when none was.
    pub seq: u64,
}

/// Data of the presence update payload (op 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePresence {
    /// Unix millisecond timestamp of when the client went idle.
    pub since: Option<u64>,

    /// Activities to display.
    pub activities: Vec<Activity>,

    /// Status to display.
    pub status: Status,

    /// Whether the client is AFK.
    pub afk: bool,
}

/// An activity shown in a presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    /// Activity name.
    pub name: String,

    /// Activity type.
    #[serde(rename = "type")]
    pub kind: ActivityType,

    /// Stream URL, for the streaming type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Activity type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde_repr::Serialize_repr, serde_repr::Deserialize_repr)]
#[repr(u8)]
pub enum ActivityType {
    /// Playing {name}
    Playing = 0,
    /// Streaming {name}
    Streaming = 1,
    /// Listening to {name}
    Listening = 2,
    /// Watching {name}
    Watching = 3,
    /// {emoji} {name}
    Custom = 4,
    /// Competing in {name}
    Competing = 5,
}

/// Displayed user status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Online.
    #[default]
    Online,
    /// Do not disturb.
    Dnd,
    /// Away.
    Idle,
    /// Shown as offline.
    Invisible,
    /// Offline.
    Offline,
}

/// Data of the voice state update payload (op 4).
#[derive(Debug, Clone, Serialize)]
pub struct VoiceStateUpdate {
    /// Guild to act in.
    pub guild_id: Snowflake,

    /// Channel to join, or `None` to disconnect.
    pub channel_id: Option<Snowflake>,

    /// Whether the client is muted.
    pub self_mute: bool,

    /// Whether the client is deafened.
    pub self_deaf: bool,
}

/// Data of the request guild members payload (op 8).
#[derive(Debug, Clone, Serialize)]
pub struct RequestGuildMembers {
    /// Guild to request members for.
    pub guild_id: Snowflake,

    /// Username prefix filter; empty string matches all members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Maximum number of members, `0` for no limit.
    pub limit: u32,

    /// Whether to include presences.
    pub presences: bool,

    /// Specific members to fetch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<Snowflake>>,

    /// Correlation nonce echoed in each chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Data of the `READY` dispatch event.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyData {
    /// Gateway protocol version.
    #[serde(default)]
    pub v: u8,

    /// The connected user.
    #[serde(default)]
    pub user: Option<User>,

    /// Session ID for resuming.
    pub session_id: String,

    /// Endpoint to reconnect to when resuming.
    pub resume_gateway_url: String,

    /// Shard coordinates, echoed back.
    #[serde(default)]
    pub shard: Option<[u32; 2]>,
}

/// Data of the `GUILD_MEMBERS_CHUNK` dispatch event.
#[derive(Debug, Clone, Deserialize)]
pub struct GuildMembersChunk {
    /// Guild the chunk belongs to.
    pub guild_id: Snowflake,

    /// Members in this chunk.
    #[serde(default)]
    pub members: Vec<GuildMember>,

    /// Index of this chunk, starting at 0.
    pub chunk_index: u32,

    /// Total number of chunks for the request.
    pub chunk_count: u32,

    /// Requested IDs that were not found.
    #[serde(default)]
    pub not_found: Vec<serde_json::Value>,

    /// Nonce of the originating request.
    #[serde(default)]
    pub nonce: Option<String>,
}

/// Build a heartbeat payload (op 1) carrying the last seen sequence number.
pub(crate) fn heartbeat_json(sequence: Option<u64>) -> String {
    match sequence {
        Some(seq) => format!(r#"{{"op":1,"d":{seq}}}"#),
        None => r#"{"op":1,"d":null}"#.to_string(),
    }
}
