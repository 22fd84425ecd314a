use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use log::{debug, trace};
use tokio::sync::oneshot;

use crate::model::{VoiceServerUpdate, VoiceStateUpdate};

/// Everything needed to open the voice gateway for one guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceCredentials {
    pub guild_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

#[derive(Default)]
struct PendingJoin {
    state: Option<VoiceStateUpdate>,
    server: Option<VoiceServerUpdate>,
    reply: Option<oneshot::Sender<VoiceCredentials>>,
}

/// Pairs `VOICE_STATE_UPDATE` with `VOICE_SERVER_UPDATE` for joins in
/// flight. Fed synchronously from gateway listeners, so it sits behind a
/// plain mutex.
#[derive(Default)]
pub struct VoiceRegistry {
    user_id: Mutex<Option<String>>,
    pending: Mutex<HashMap<String, PendingJoin>>,
}

impl VoiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Our own user id, learned from READY. State updates for other users
    /// are ignored.
    pub fn set_user_id(&self, user_id: impl Into<String>) {
        *self.user_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(user_id.into());
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Starts waiting for both updates for `guild_id`. A second call for the
    /// same guild replaces the first.
    pub fn register(&self, guild_id: &str) -> oneshot::Receiver<VoiceCredentials> {
        let (reply, rx) = oneshot::channel();
        self.pending().insert(
            guild_id.to_string(),
            PendingJoin {
                reply: Some(reply),
                ..PendingJoin::default()
            },
        );
        rx
    }

    pub fn cancel(&self, guild_id: &str) {
        self.pending().remove(guild_id);
    }

    pub fn on_state_update(&self, update: &VoiceStateUpdate) {
        let Some(guild_id) = update.guild_id.as_deref() else {
            return;
        };
        if self.user_id().is_some_and(|me| me != update.user_id) {
            trace!("Voice state update for another user in {guild_id}");
            return;
        }
        self.fill(guild_id, |join| join.state = Some(update.clone()));
    }

    pub fn on_server_update(&self, update: &VoiceServerUpdate) {
        if update.endpoint.is_none() {
            debug!("Voice server for {} is being reallocated", update.guild_id);
            return;
        }
        self.fill(&update.guild_id, |join| join.server = Some(update.clone()));
    }

    fn fill(&self, guild_id: &str, apply: impl FnOnce(&mut PendingJoin)) {
        let mut pending = self.pending();
        let Some(join) = pending.get_mut(guild_id) else {
            return;
        };
        apply(join);

        let (Some(state), Some(server)) = (&join.state, &join.server) else {
            return;
        };
        let Some(channel_id) = state.channel_id.clone() else {
            debug!("Voice state for {guild_id} has no channel, still waiting");
            return;
        };
        let credentials = VoiceCredentials {
            guild_id: guild_id.to_string(),
            channel_id,
            user_id: state.user_id.clone(),
            session_id: state.session_id.clone(),
            token: server.token.clone(),
            endpoint: server.endpoint.clone().unwrap_or_default(),
        };

        if let Some(join) = pending.remove(guild_id) {
            if let Some(reply) = join.reply {
                debug!("Voice credentials complete for {guild_id}");
                let _ = reply.send(credentials);
            }
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingJoin>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
