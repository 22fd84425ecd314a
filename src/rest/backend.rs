use async_trait::async_trait;
use log::trace;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use super::request::{Request, Response};
use crate::config::RestConfig;
use crate::error::{ClientError, ClientResult};

const USER_AGENT: &str = concat!("fluxer-runtime/", env!("CARGO_PKG_VERSION"));

/// Puts one request on the wire and hands back whatever came back. Status
/// handling is the scheduler's job, so a 4xx/5xx is still `Ok` here.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: &Request) -> ClientResult<Response>;
}

pub struct ReqwestBackend {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestBackend {
    pub fn new(token: &str, config: &RestConfig) -> ClientResult<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bot {token}"))
            .map_err(|_| ClientError::protocol("token is not a valid header value"))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: &Request) -> ClientResult<Response> {
        let url = format!("{}{}", self.base_url, request.path);
        trace!("{} {} (attempt {})", request.method, url, request.attempt_count);

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await?;
        Ok(Response {
            status,
            headers,
            body,
        })
    }
}
