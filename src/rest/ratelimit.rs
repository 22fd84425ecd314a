use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::trace;
use reqwest::header::HeaderMap;
use serde::Deserialize;

use super::request::Response;

/// Used when a 429 carries no usable retry hint at all.
const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(1);

/// The `X-RateLimit-*` family off one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Time left in the current window, from `Reset-After` or derived from
    /// the absolute `Reset` timestamp.
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub global: bool,
    pub scope: Option<String>,
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let reset_after = header_f64(headers, "x-ratelimit-reset-after")
            .and_then(seconds)
            .or_else(|| header_f64(headers, "x-ratelimit-reset").and_then(until_epoch));

        Self {
            limit: header_str(headers, "x-ratelimit-limit").and_then(|v| v.parse().ok()),
            remaining: header_str(headers, "x-ratelimit-remaining").and_then(|v| v.parse().ok()),
            reset_after,
            bucket: header_str(headers, "x-ratelimit-bucket").map(str::to_string),
            global: header_str(headers, "x-ratelimit-global")
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            scope: header_str(headers, "x-ratelimit-scope").map(str::to_string),
        }
    }

    /// How long to hold the bucket when the window is used up. `None` while
    /// requests remain or when the server gave no reset time.
    pub fn exhausted_for(&self) -> Option<Duration> {
        match self.remaining {
            Some(0) => self.reset_after,
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TooManyRequests {
    retry_after: f64,
    #[serde(default)]
    global: bool,
}

/// Scheduler-internal reading of a 429. Always resolved by waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RateLimitCondition {
    Bucket(Duration),
    Global(Duration),
}

impl RateLimitCondition {
    /// Prefers the JSON body, then `Retry-After`, then the bucket reset.
    pub(crate) fn from_response(response: &Response) -> Self {
        let headers = RateLimitHeaders::from_headers(&response.headers);
        let body = serde_json::from_str::<TooManyRequests>(&response.body).ok();
        trace!("429 body: {}", response.body);

        let wait = body
            .as_ref()
            .and_then(|b| seconds(b.retry_after))
            .or_else(|| header_f64(&response.headers, "retry-after").and_then(seconds))
            .or(headers.reset_after)
            .unwrap_or(FALLBACK_RETRY_AFTER);

        let global = body.is_some_and(|b| b.global)
            || headers.global
            || headers.scope.as_deref() == Some("global");

        if global {
            Self::Global(wait)
        } else {
            Self::Bucket(wait)
        }
    }

    pub(crate) fn wait(self) -> Duration {
        match self {
            Self::Bucket(wait) | Self::Global(wait) => wait,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}

fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value.max(0.0)).ok()
}

fn until_epoch(reset_at: f64) -> Option<Duration> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs_f64();
    seconds(reset_at - now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn response(status: u16, pairs: &[(&'static str, &str)], body: &str) -> Response {
        Response {
            status,
            headers: headers(pairs),
            body: body.to_string(),
        }
    }

    #[test]
    fn parses_bucket_headers() {
        let parsed = RateLimitHeaders::from_headers(&headers(&[
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset-after", "1.5"),
            ("x-ratelimit-bucket", "abcd"),
        ]));
        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(0));
        assert_eq!(parsed.bucket.as_deref(), Some("abcd"));
        assert_eq!(parsed.exhausted_for(), Some(Duration::from_millis(1500)));
        assert!(!parsed.global);
    }

    #[test]
    fn absolute_reset_is_converted() {
        let soon = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64() + 30.0;
        let parsed = RateLimitHeaders::from_headers(&headers(&[
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset", &format!("{soon:.3}")),
        ]));
        let wait = parsed.exhausted_for().unwrap();
        assert!(wait > Duration::from_secs(28) && wait <= Duration::from_secs(30));
    }

    #[test]
    fn remaining_requests_mean_no_pause() {
        let parsed = RateLimitHeaders::from_headers(&headers(&[
            ("x-ratelimit-remaining", "3"),
            ("x-ratelimit-reset-after", "1"),
        ]));
        assert_eq!(parsed.exhausted_for(), None);
    }

    #[test]
    fn body_retry_after_wins() {
        let r = response(429, &[("retry-after", "9")], r#"{"retry_after": 0.25, "global": false}"#);
        assert_eq!(
            RateLimitCondition::from_response(&r),
            RateLimitCondition::Bucket(Duration::from_millis(250))
        );
    }

    #[test]
    fn global_flag_from_body_or_headers() {
        let r = response(429, &[], r#"{"retry_after": 2, "global": true}"#);
        assert_eq!(
            RateLimitCondition::from_response(&r),
            RateLimitCondition::Global(Duration::from_secs(2))
        );

        let r = response(429, &[("retry-after", "3"), ("x-ratelimit-scope", "global")], "");
        assert_eq!(
            RateLimitCondition::from_response(&r),
            RateLimitCondition::Global(Duration::from_secs(3))
        );
    }

    #[test]
    fn garbage_falls_back() {
        let r = response(429, &[], "<html>slow down</html>");
        assert_eq!(
            RateLimitCondition::from_response(&r),
            RateLimitCondition::Bucket(FALLBACK_RETRY_AFTER)
        );
        let r = response(429, &[], r#"{"retry_after": -4}"#);
        assert_eq!(RateLimitCondition::from_response(&r).wait(), Duration::ZERO);
    }
}
