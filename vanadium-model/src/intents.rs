//! Gateway intents.
//!
//! The intents bitfield selects which event groups the gateway delivers
//! on a connection. Privileged intents must additionally be enabled in the
//! application portal.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Bitfield sent with Identify to select event groups.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Intents: u64 {
        /// Guild create/update/delete, roles, channels.
        const GUILDS = 1 << 0;

        /// Member joins, updates, removes. **Privileged.**
        const GUILD_MEMBERS = 1 << 1;

        /// Guild bans and unbans.
        const GUILD_MODERATION = 1 << 2;

        /// Emoji and sticker updates.
        const GUILD_EMOJIS_AND_STICKERS = 1 << 3;

        /// Integration updates.
        const GUILD_INTEGRATIONS = 1 << 4;

        /// Webhook updates.
        const GUILD_WEBHOOKS = 1 << 5;

        /// Invite create/delete.
        const GUILD_INVITES = 1 << 6;

        /// Voice state updates.
        const GUILD_VOICE_STATES = 1 << 7;

        /// Presence updates. **Privileged.**
        const GUILD_PRESENCES = 1 << 8;

        /// Guild message create/update/delete.
        const GUILD_MESSAGES = 1 << 9;

        /// Guild message reactions.
        const GUILD_MESSAGE_REACTIONS = 1 << 10;

        /// Guild typing indicators.
        const GUILD_MESSAGE_TYPING = 1 << 11;

        /// Direct messages.
        const DIRECT_MESSAGES = 1 << 12;

        /// Direct message reactions.
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;

        /// Direct message typing indicators.
        const DIRECT_MESSAGE_TYPING = 1 << 14;

        /// Message content in message events. **Privileged.**
        const MESSAGE_CONTENT = 1 << 15;

        /// Scheduled events.
        const GUILD_SCHEDULED_EVENTS = 1 << 16;

        /// AutoMod rule configuration.
        const AUTO_MODERATION_CONFIGURATION = 1 << 20;

        /// AutoMod rule execution.
        const AUTO_MODERATION_EXECUTION = 1 << 21;

        /// Poll votes in guilds.
        const GUILD_MESSAGE_POLLS = 1 << 24;

        /// Poll votes in direct messages.
        const DIRECT_MESSAGE_POLLS = 1 << 25;

        /// Every intent that needs no portal approval.
        const NON_PRIVILEGED = Self::GUILDS.bits()
            | Self::GUILD_MODERATION.bits()
            | Self::GUILD_EMOJIS_AND_STICKERS.bits()
            | Self::GUILD_INTEGRATIONS.bits()
            | Self::GUILD_WEBHOOKS.bits()
            | Self::GUILD_INVITES.bits()
            | Self::GUILD_VOICE_STATES.bits()
            | Self::GUILD_MESSAGES.bits()
            | Self::GUILD_MESSAGE_REACTIONS.bits()
            | Self::GUILD_MESSAGE_TYPING.bits()
            | Self::DIRECT_MESSAGES.bits()
            | Self::DIRECT_MESSAGE_REACTIONS.bits()
            | Self::DIRECT_MESSAGE_TYPING.bits()
            | Self::GUILD_SCHEDULED_EVENTS.bits()
            | Self::AUTO_MODERATION_CONFIGURATION.bits()
            | Self::AUTO_MODERATION_EXECUTION.bits()
            | Self::GUILD_MESSAGE_POLLS.bits()
            | Self::DIRECT_MESSAGE_POLLS.bits();

        /// Intents requiring portal approval.
        const PRIVILEGED = Self::GUILD_MEMBERS.bits()
            | Self::GUILD_PRESENCES.bits()
            | Self::MESSAGE_CONTENT.bits();
    }
}

impl Default for Intents {
    fn default() -> Self {
        Self::NON_PRIVILEGED
    }
}

impl Serialize for Intents {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for Intents {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bits = u64::deserialize(deserializer)?;
        Ok(Intents::from_bits_truncate(bits))
    }
}
