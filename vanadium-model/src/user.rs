use crate::snowflake::Snowflake;
use serde::{Deserialize, Serialize};

/// A Discord user.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct User {
    /// User ID.
    pub id: Snowflake,
    /// Username.
    pub username: String,
    /// Legacy discriminator; `"0"` for migrated accounts.
    #[serde(default)]
    pub discriminator: Option<String>,
    /// Display name, if set.
    #[serde(default)]
    pub global_name: Option<String>,
    /// Avatar hash.
    #[serde(default)]
    pub avatar: Option<String>,
    /// Whether the user is a bot.
    #[serde(default)]
    pub bot: bool,
}
