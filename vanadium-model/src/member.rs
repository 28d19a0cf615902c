//! Guild member types.

use crate::snowflake::Snowflake;
use crate::user::User;
use serde::{Deserialize, Serialize};

/// A member of a guild, as delivered in member-chunk responses.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuildMember {
    /// The user this membership belongs to.
    #[serde(default)]
    pub user: Option<User>,

    /// Guild nickname.
    #[serde(default)]
    pub nick: Option<String>,

    /// Guild avatar hash.
    #[serde(default)]
    pub avatar: Option<String>,

    /// IDs of the member's roles.
    #[serde(default)]
    pub roles: Vec<Snowflake>,

    /// When the user joined the guild (ISO8601).
    #[serde(default)]
    pub joined_at: Option<String>,

    /// When the user started boosting the guild.
    #[serde(default)]
    pub premium_since: Option<String>,

    /// Whether the member is deafened in voice channels.
    #[serde(default)]
    pub deaf: bool,

    /// Whether the member is muted in voice channels.
    #[serde(default)]
    pub mute: bool,

    /// Whether the member has not yet passed membership screening.
    #[serde(default)]
    pub pending: Option<bool>,

    /// When the member's timeout expires (ISO8601).
    #[serde(default)]
    pub communication_disabled_until: Option<String>,
}
