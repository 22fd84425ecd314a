//! Rate-limited REST scheduling.
//!
//! [`RateLimitedRequestExecutor`] is the only way requests leave the
//! process. [`Http`](crate::http::Http) wraps it with typed endpoints.

mod backend;
mod bucket;
mod executor;
mod global;
mod ratelimit;
mod request;
mod route;

pub use backend::{HttpBackend, ReqwestBackend};
pub use executor::RateLimitedRequestExecutor;
pub use ratelimit::RateLimitHeaders;
pub use request::{Request, Response};
pub use route::bucket_key;
