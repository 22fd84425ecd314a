use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::route::bucket_key;
use crate::error::{ClientError, ClientResult};

const AUDIT_LOG_REASON: &str = "x-audit-log-reason";

/// One outbound REST call. `path` is relative to the API base, starting
/// with `/`.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub headers: HeaderMap,
    pub(crate) bucket_key: String,
    pub(crate) attempt_count: u32,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            bucket_key: bucket_key(&method, &path),
            method,
            path,
            body: None,
            headers: HeaderMap::new(),
            attempt_count: 0,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Shows up in the guild audit log. Percent-encoded so any text is fine;
    /// spaces go out as `%20`, not the form-style `+`.
    pub fn reason(mut self, reason: &str) -> Self {
        // A literal `+` is already `%2B` here, so every `+` left is a space.
        let encoded = url::form_urlencoded::byte_serialize(reason.as_bytes())
            .collect::<String>()
            .replace('+', "%20");
        if let Ok(value) = HeaderValue::from_str(&encoded) {
            self.headers
                .insert(HeaderName::from_static(AUDIT_LOG_REASON), value);
        }
        self
    }

    pub fn bucket_key(&self) -> &str {
        &self.bucket_key
    }

    /// Times this request went over the wire, retries included.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Empty bodies (204) decode as JSON `null`.
    pub fn json<T: DeserializeOwned>(&self) -> ClientResult<T> {
        let body = if self.body.trim().is_empty() {
            "null"
        } else {
            self.body.as_str()
        };
        serde_json::from_str(body).map_err(ClientError::from)
    }
}
