//! Client runtime for the Fluxer chat platform: a self-healing gateway
//! connection, a rate-limit aware REST scheduler and voice playback.
//!
//! ```no_run
//! use fluxer::prelude::*;
//! use async_trait::async_trait;
//!
//! struct Handler;
//!
//! #[async_trait]
//! impl EventHandler for Handler {
//!     async fn on_message(&self, ctx: Context, msg: Message) {
//!         if let (Some("!ping"), Some(channel)) = (msg.content.as_deref(), &msg.channel_id) {
//!             let _ = ctx.http.send_message(channel, "pong").await;
//!         }
//!     }
//! }
//!
//! # async fn run() -> ClientResult<()> {
//! let mut client = Client::builder("token").event_handler(Handler).build()?;
//! client.start().await
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod gateway;
pub mod http;
pub mod model;
pub mod rest;
pub mod voice;

pub mod prelude {
    pub use crate::cache::{Cache, MemoryCache};
    pub use crate::client::{Client, ClientBuilder, Context};
    pub use crate::config::ClientConfig;
    pub use crate::error::{ClientError, ClientResult};
    pub use crate::event::EventHandler;
    pub use crate::gateway::Intents;
    pub use crate::model::*;
    pub use crate::voice::{FrameSize, VoiceSession};
}
