//! High-level gateway commands.
//!
//! Presence updates, voice state changes, and member requests all funnel
//! through the shard's send path. Member requests carry a nonce so their
//! chunked responses can be reassembled into one result.

use crate::error::GatewayError;
use crate::opcode::OpCode;
use crate::payload::{
    Activity, GatewayPayload, GuildMembersChunk, RequestGuildMembers, Status, UpdatePresence,
    VoiceStateUpdate,
};
use crate::shard::Shard;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tracing::{debug, trace};
use vanadium_model::{GuildMember, Intents, Snowflake};

/// Options for [`Shard::request_members`].
#[derive(Debug, Clone, Default)]
pub struct RequestMembersOptions {
    /// Username prefix to match; `None` with no limit matches everyone.
    pub query: Option<String>,

    /// Maximum number of members to return; `0` or `None` means no limit.
    pub limit: Option<u32>,

    /// Include presences in the response.
    pub presences: Option<bool>,

    /// Fetch these specific members instead of matching by query.
    pub user_ids: Option<Vec<Snowflake>>,
}

/// Options for [`Shard::join_voice_channel`].
#[derive(Debug, Clone, Copy)]
pub struct VoiceOptions {
    /// Join muted.
    pub self_mute: bool,
    /// Join deafened.
    pub self_deaf: bool,
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self {
            self_mute: false,
            self_deaf: true,
        }
    }
}

/// A member request awaiting its chunked response.
#[derive(Debug)]
pub(crate) struct PendingMemberRequest {
    pub nonce: String,
    pub members: Vec<GuildMember>,
    pub resolver: oneshot::Sender<Vec<GuildMember>>,
}

/// Correlation nonce for a member request.
fn member_nonce(guild_id: Snowflake) -> String {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    format!("{guild_id}-{now_ms}")
}

/// Validate a member request against the configured intents and shape the
/// wire payload.
fn build_member_request(
    intents: Intents,
    guild_id: Snowflake,
    options: &RequestMembersOptions,
    nonce: String,
) -> Result<RequestGuildMembers, GatewayError> {
    // Fetching more than a single member requires the members intent, on
    // any connection that declares intents at all.
    let single = options.limit == Some(1);
    if !intents.is_empty() && !single && !intents.contains(Intents::GUILD_MEMBERS) {
        return Err(GatewayError::MissingIntent("GUILD_MEMBERS"));
    }

    let mut limit = options.limit;
    if let Some(user_ids) = &options.user_ids {
        if !user_ids.is_empty() {
            limit = Some(user_ids.len() as u32);
        }
    }

    let query = match (&options.query, limit) {
        (Some(query), _) => Some(query.clone()),
        (None, Some(limit)) if limit > 0 => None,
        (None, _) => Some(String::new()),
    };

    Ok(RequestGuildMembers {
        guild_id,
        query,
        limit: limit.unwrap_or(0),
        presences: options.presences.unwrap_or(false),
        user_ids: options.user_ids.clone(),
        nonce: Some(nonce),
    })
}

impl Shard {
    /// Update the presence shown for this shard.
    pub async fn edit_status(
        &self,
        activities: Vec<Activity>,
        status: Status,
    ) -> Result<(), GatewayError> {
        let presence = UpdatePresence {
            since: None,
            activities,
            status,
            afk: false,
        };
        self.send(&GatewayPayload::new(OpCode::PresenceUpdate, presence), false)
            .await
    }

    /// Join a voice channel.
    pub async fn join_voice_channel(
        &self,
        guild_id: Snowflake,
        channel_id: Snowflake,
        options: VoiceOptions,
    ) -> Result<(), GatewayError> {
        let update = VoiceStateUpdate {
            guild_id,
            channel_id: Some(channel_id),
            self_mute: options.self_mute,
            self_deaf: options.self_deaf,
        };
        self.send(&GatewayPayload::new(OpCode::VoiceStateUpdate, update), false)
            .await
    }

    /// Disconnect from voice in a guild.
    pub async fn leave_voice_channel(&self, guild_id: Snowflake) -> Result<(), GatewayError> {
        let update = VoiceStateUpdate {
            guild_id,
            channel_id: None,
            self_mute: false,
            self_deaf: false,
        };
        self.send(&GatewayPayload::new(OpCode::VoiceStateUpdate, update), false)
            .await
    }

    /// Request members of a guild.
    ///
    /// With member-request tracking enabled this completes once the last
    /// chunk arrives, with the assembled member list. With tracking
    /// disabled the request is transmitted and the call completes with an
    /// empty list; chunks still arrive as ordinary events.
    ///
    /// # Errors
    /// Fails with [`GatewayError::MissingIntent`] before any traffic when
    /// the request needs the members intent and it is not configured.
    pub async fn request_members(
        &self,
        guild_id: Snowflake,
        options: RequestMembersOptions,
    ) -> Result<Vec<GuildMember>, GatewayError> {
        let nonce = member_nonce(guild_id);
        let request =
            build_member_request(self.0.config.intents, guild_id, &options, nonce.clone())?;
        let payload = GatewayPayload::new(OpCode::RequestGuildMembers, request);

        if !self.0.config.track_member_requests {
            self.send(&payload, false).await?;
            return Ok(Vec::new());
        }

        // Register before transmitting so an immediate chunk correlates.
        let (resolver, result) = oneshot::channel();
        self.0.pending_members.insert(
            nonce.clone(),
            PendingMemberRequest {
                nonce,
                members: Vec::new(),
                resolver,
            },
        );
        self.send(&payload, false).await?;

        result.await.map_err(|_| GatewayError::Shutdown)
    }

    /// Fold a chunk into its pending request; the final chunk resolves it.
    pub(crate) fn handle_members_chunk(&self, chunk: GuildMembersChunk) {
        let Some(nonce) = chunk.nonce.as_deref() else {
            trace!(shard_id = self.0.id, "member chunk without nonce");
            return;
        };

        let done = {
            let Some(mut pending) = self.0.pending_members.get_mut(nonce) else {
                trace!(shard_id = self.0.id, nonce, "member chunk without pending request");
                return;
            };
            pending.members.extend(chunk.members);
            chunk.chunk_index + 1 >= chunk.chunk_count
        };

        if done {
            if let Some((_, request)) = self.0.pending_members.remove(nonce) {
                debug!(
                    shard_id = self.0.id,
                    nonce = %request.nonce,
                    members = request.members.len(),
                    "member request complete"
                );
                let _ = request.resolver.send(request.members);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardConfig;

    fn options() -> RequestMembersOptions {
        RequestMembersOptions::default()
    }

    #[test]
    fn nonce_carries_guild_id() {
        let nonce = member_nonce(Snowflake::new(42));
        assert!(nonce.starts_with("42-"));
        assert!(nonce["42-".len()..].parse::<u128>().is_ok());
    }

    #[test]
    fn unlimited_request_requires_members_intent() {
        let err = build_member_request(Intents::GUILDS, Snowflake::new(1), &options(), "n".into())
            .unwrap_err();
        assert!(matches!(err, GatewayError::MissingIntent("GUILD_MEMBERS")));
    }

    #[test]
    fn single_member_request_needs_no_intent() {
        let request = build_member_request(
            Intents::GUILDS,
            Snowflake::new(1),
            &RequestMembersOptions {
                limit: Some(1),
                ..options()
            },
            "n".into(),
        )
        .unwrap();
        assert_eq!(request.limit, 1);
        // A limited request carries no query.
        assert_eq!(request.query, None);
    }

    #[test]
    fn zero_intents_skips_validation() {
        let request =
            build_member_request(Intents::empty(), Snowflake::new(1), &options(), "n".into())
                .unwrap();
        assert_eq!(request.limit, 0);
        assert_eq!(request.query.as_deref(), Some(""));
        assert!(!request.presences);
    }

    #[test]
    fn user_ids_force_the_limit() {
        let request = build_member_request(
            Intents::GUILD_MEMBERS,
            Snowflake::new(1),
            &RequestMembersOptions {
                limit: Some(50),
                user_ids: Some(vec![Snowflake::new(2), Snowflake::new(3)]),
                ..options()
            },
            "n".into(),
        )
        .unwrap();
        assert_eq!(request.limit, 2);
    }

    #[test]
    fn explicit_query_is_kept() {
        let request = build_member_request(
            Intents::GUILD_MEMBERS,
            Snowflake::new(1),
            &RequestMembersOptions {
                query: Some("van".into()),
                limit: Some(10),
                ..options()
            },
            "n".into(),
        )
        .unwrap();
        assert_eq!(request.query.as_deref(), Some("van"));
        assert_eq!(request.limit, 10);
    }

    #[tokio::test]
    async fn chunks_assemble_by_nonce() {
        let (shard, _events) = crate::shard::Shard::new(
            0,
            ShardConfig::new("T", Intents::GUILD_MEMBERS).with_gateway_url("ws://127.0.0.1:9"),
        );

        let (resolver, result) = oneshot::channel();
        shard.0.pending_members.insert(
            "9-1".to_string(),
            PendingMemberRequest {
                nonce: "9-1".to_string(),
                members: Vec::new(),
                resolver,
            },
        );

        let chunk = |index: u32, user: u64| GuildMembersChunk {
            guild_id: Snowflake::new(9),
            members: vec![serde_json::from_str(&format!(
                r#"{{"user":{{"id":"{user}","username":"u{user}"}}}}"#
            ))
            .unwrap()],
            chunk_index: index,
            chunk_count: 2,
            not_found: Vec::new(),
            nonce: Some("9-1".to_string()),
        };

        shard.handle_members_chunk(chunk(0, 1));
        assert!(shard.0.pending_members.contains_key("9-1"));

        shard.handle_members_chunk(chunk(1, 2));
        assert!(!shard.0.pending_members.contains_key("9-1"));

        let members = result.await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[1].user.as_ref().unwrap().id, Snowflake::new(2));
    }

    #[tokio::test]
    async fn chunk_for_unknown_nonce_is_ignored() {
        let (shard, _events) = crate::shard::Shard::new(
            0,
            ShardConfig::new("T", Intents::GUILD_MEMBERS).with_gateway_url("ws://127.0.0.1:9"),
        );

        shard.handle_members_chunk(GuildMembersChunk {
            guild_id: Snowflake::new(9),
            members: Vec::new(),
            chunk_index: 0,
            chunk_count: 1,
            not_found: Vec::new(),
            nonce: Some("missing".to_string()),
        });
        assert!(shard.0.pending_members.is_empty());
    }

    #[tokio::test]
    async fn missing_intent_fails_before_any_traffic() {
        let (shard, _events) = crate::shard::Shard::new(
            0,
            ShardConfig::new("T", Intents::GUILDS).with_gateway_url("ws://127.0.0.1:9"),
        );

        // The socket is closed; a send would park. The validation error
        // must surface before the send path is entered.
        let err = shard
            .request_members(Snowflake::new(1), RequestMembersOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MissingIntent("GUILD_MEMBERS")));
    }
}
