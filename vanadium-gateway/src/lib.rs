//! Vanadium Gateway - Discord Gateway shard client
#![deny(unsafe_code)]
//!
//! A shard is one persistent WebSocket connection to the gateway. It
//! identifies with the configured credentials, keeps the connection alive
//! through the heartbeat protocol, resumes its session across transient
//! disconnects, re-identifies when the session is irrecoverable, and exposes
//! a narrow send interface with priority queueing and leaky-bucket admission
//! control.
//!
//! # Example
//!
//! ```ignore
//! use vanadium_gateway::{Shard, ShardConfig};
//! use vanadium_model::Intents;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ShardConfig::new("your-token", Intents::default());
//!     let (shard, events) = Shard::new(0, config);
//!
//!     tokio::spawn({
//!         let shard = shard.clone();
//!         async move { shard.identify().await }
//!     });
//!
//!     while let Ok(event) = events.recv_async().await {
//!         println!("{event:?}");
//!     }
//!
//!     Ok(())
//! }
//! ```

mod bucket;
mod command;
mod compression;
pub mod error;
mod event;
mod heartbeat;
mod opcode;
mod payload;
mod queue;
mod ratelimit;
mod shard;
mod waiters;

// Public re-exports
pub use bucket::CommandBucket;
pub use command::{RequestMembersOptions, VoiceOptions};
pub use compression::Inflater;
pub use error::{CloseAction, CloseCode, GatewayError, ShardCloseCode};
pub use event::{GatewayMessage, ShardEvent};
pub use opcode::OpCode;
pub use payload::{
    Activity, ActivityType, ConnectionProperties, GatewayPayload, GuildMembersChunk, Hello,
    Identify, ReadyData, RequestGuildMembers, Resume, Status, UpdatePresence, VoiceStateUpdate,
};
pub use ratelimit::{IdentifyQueue, LocalIdentifyQueue};
pub use shard::{PresenceFactory, Shard, ShardConfig, ShardState};

/// Gateway API version spoken by this crate.
pub const GATEWAY_VERSION: u8 = 10;

/// The primary gateway endpoint. Query parameters are only appended for
/// this endpoint; proxy gateways are dialed as configured.
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";
