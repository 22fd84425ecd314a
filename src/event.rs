use async_trait::async_trait;
use serde_json::Value;

use crate::client::Context;
use crate::model::{Guild, Message, Ready, VoiceStateUpdate};

/// Typed callbacks for gateway dispatches. Every method has an empty
/// default, so implement only what you need.
///
/// Each dispatch gets its own task, started in the order the dispatches
/// arrived, so a handler that plays a whole track doesn't hold up the next
/// command. Within one dispatch, [`on_dispatch`](Self::on_dispatch) finishes
/// before the typed method runs. Use [`Listeners`](crate::gateway::Listeners)
/// when strict ordering matters.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Every dispatch, before the typed method for it.
    async fn on_dispatch(&self, ctx: Context, event: &str, data: &Value) {
        let _ = (ctx, event, data);
    }

    async fn on_ready(&self, ctx: Context, ready: Ready) {
        let _ = (ctx, ready);
    }

    async fn on_resumed(&self, ctx: Context) {
        let _ = ctx;
    }

    async fn on_message(&self, ctx: Context, msg: Message) {
        let _ = (ctx, msg);
    }

    async fn on_guild_create(&self, ctx: Context, guild: Guild) {
        let _ = (ctx, guild);
    }

    async fn on_voice_state_update(&self, ctx: Context, state: VoiceStateUpdate) {
        let _ = (ctx, state);
    }
}
