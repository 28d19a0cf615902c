//! Vanadium Model - types shared by the Vanadium gateway client
#![deny(unsafe_code)]
//!
//! This crate holds the small set of Discord API entities the gateway
//! surface needs: snowflake identifiers, the intents bitfield, and the
//! user/member records carried by member-chunk responses.

pub mod intents;
pub mod member;
pub mod snowflake;
pub mod user;

pub use intents::Intents;
pub use member::GuildMember;
pub use snowflake::Snowflake;
pub use user::User;
