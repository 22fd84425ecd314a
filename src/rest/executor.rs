use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use tokio::sync::{mpsc, oneshot};

use super::backend::HttpBackend;
use super::bucket::{Bucket, BucketMap, Job, RetryPolicy};
use super::global::GlobalLimiter;
use super::request::{Request, Response};
use crate::config::RestConfig;
use crate::error::{ClientError, ClientResult};

/// Schedules REST calls through per-route buckets and one global gate.
///
/// Cheap to clone; clones share buckets. Each bucket key gets its own task
/// the first time it is used, so requests on one route run strictly one at
/// a time in submission order while different routes run side by side.
/// A bucket that sits empty for [`RestConfig::bucket_idle_timeout`] shuts
/// its task down and is reopened on the next request.
///
/// ```no_run
/// # async fn demo(executor: fluxer::rest::RateLimitedRequestExecutor) -> fluxer::error::ClientResult<()> {
/// use fluxer::rest::Request;
///
/// let response = executor.submit(Request::get("/users/@me")).await?;
/// println!("{}", response.body);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimitedRequestExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn HttpBackend>,
    global: Arc<GlobalLimiter>,
    retry: RetryPolicy,
    buckets: Arc<BucketMap>,
}

impl RateLimitedRequestExecutor {
    pub fn new(backend: Arc<dyn HttpBackend>, config: &RestConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                global: Arc::new(GlobalLimiter::new(config.global_limit)),
                retry: RetryPolicy {
                    transient_retries: config.transient_retries,
                    transient_delay: config.transient_retry_delay,
                    idle_timeout: config.bucket_idle_timeout,
                },
                buckets: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    /// Resolves with the response once it succeeds, or with
    /// [`ClientError::Api`] / [`ClientError::UpstreamTransient`]. 429s never
    /// reach the caller; they just make this take longer.
    pub async fn submit(&self, request: Request) -> ClientResult<Response> {
        let (reply, response) = oneshot::channel();
        self.enqueue(Job::new(request, reply))?;
        response.await.map_err(|_| ClientError::ShuttingDown)?
    }

    fn enqueue(&self, job: Job) -> ClientResult<()> {
        let key = job.request.bucket_key().to_string();
        let mut buckets = self
            .inner
            .buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let job = match buckets.get(&key) {
            Some(sender) => match sender.send(job) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        debug!("Opening bucket {key}");
        let (sender, jobs) = mpsc::unbounded_channel();
        let bucket = Bucket::new(
            key.clone(),
            self.inner.backend.clone(),
            self.inner.global.clone(),
            self.inner.retry,
            self.inner.buckets.clone(),
        );
        tokio::spawn(bucket.run(jobs));
        sender.send(job).map_err(|_| ClientError::ShuttingDown)?;
        buckets.insert(key, sender);
        Ok(())
    }

    /// `true` while a global 429 is holding every bucket.
    pub fn is_globally_limited(&self) -> bool {
        self.inner.global.paused_until().is_some()
    }

    /// Buckets with a live task.
    pub fn bucket_count(&self) -> usize {
        self.inner
            .buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
