use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::cache::Cache;
use crate::config::RestConfig;
use crate::error::ClientResult;
use crate::model::*;
use crate::rest::{HttpBackend, RateLimitedRequestExecutor, ReqwestBackend, Request};

const CACHE_TTL: Duration = Duration::from_secs(300);

/// Typed REST endpoints. Every call goes through the shared
/// [`RateLimitedRequestExecutor`], so these are safe to fire from anywhere.
pub struct Http {
    executor: RateLimitedRequestExecutor,
    cache: Option<Arc<dyn Cache>>,
    token: String,
}

impl Http {
    pub fn new(token: &str, config: &RestConfig) -> ClientResult<Self> {
        let backend = ReqwestBackend::new(token, config)?;
        Ok(Self::with_backend(token, Arc::new(backend), config))
    }

    /// Same as [`new`](Self::new) over any transport.
    pub fn with_backend(token: &str, backend: Arc<dyn HttpBackend>, config: &RestConfig) -> Self {
        Self {
            executor: RateLimitedRequestExecutor::new(backend, config),
            cache: None,
            token: token.to_string(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn get_token(&self) -> &str {
        &self.token
    }

    pub fn executor(&self) -> &RateLimitedRequestExecutor {
        &self.executor
    }

    pub async fn request<T: DeserializeOwned>(&self, request: Request) -> ClientResult<T> {
        self.executor.submit(request).await?.json()
    }

    async fn cached<T>(&self, key: &str, request: Request) -> ClientResult<T>
    where
        T: DeserializeOwned + Serialize,
    {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(key).await {
                match serde_json::from_value(hit) {
                    Ok(value) => {
                        trace!("Cache hit for {key}");
                        return Ok(value);
                    }
                    Err(err) => debug!("Dropping unreadable cache entry {key}: {err}"),
                }
            }
        }

        let value: T = self.request(request).await?;
        if let Some(cache) = &self.cache {
            cache.set(key, serde_json::to_value(&value)?, Some(CACHE_TTL)).await;
        }
        Ok(value)
    }

    pub async fn get_gateway(&self) -> ClientResult<String> {
        let res: GatewayResponse = self.request(Request::get("/gateway")).await?;
        Ok(res.url)
    }

    pub async fn get_gateway_bot(&self) -> ClientResult<GatewayBotResponse> {
        self.request(Request::get("/gateway/bot")).await
    }

    pub async fn get_me(&self) -> ClientResult<User> {
        self.cached("user:@me", Request::get("/users/@me")).await
    }

    pub async fn send_message(&self, channel_id: &str, content: &str) -> ClientResult<Message> {
        let request = Request::post(format!("/channels/{channel_id}/messages"))
            .json(json!({ "content": content }));
        self.request(request).await
    }

    pub async fn delete_message(&self, channel_id: &str, message_id: &str) -> ClientResult<()> {
        let request = Request::delete(format!("/channels/{channel_id}/messages/{message_id}"));
        self.executor.submit(request).await?;
        Ok(())
    }

    pub async fn get_guild(&self, guild_id: &str) -> ClientResult<Guild> {
        self.cached(&format!("guild:{guild_id}"), Request::get(format!("/guilds/{guild_id}")))
            .await
    }

    pub async fn create_channel(
        &self,
        guild_id: &str,
        name: &str,
        kind: ChannelType,
    ) -> ClientResult<Channel> {
        let request = Request::post(format!("/guilds/{guild_id}/channels"))
            .json(json!({ "name": name, "type": kind as u8 }));
        self.request(request).await
    }

    pub async fn ban_member(&self, guild_id: &str, user_id: &str, reason: &str) -> ClientResult<()> {
        let request = Request::put(format!("/guilds/{guild_id}/bans/{user_id}"))
            .json(json!({ "reason": reason }))
            .reason(reason);
        self.executor.submit(request).await?;
        Ok(())
    }
}
