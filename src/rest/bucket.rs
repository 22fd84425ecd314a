use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout_at, Instant};

use super::backend::HttpBackend;
use super::global::GlobalLimiter;
use super::ratelimit::{RateLimitCondition, RateLimitHeaders};
use super::request::{Request, Response};
use crate::error::{ClientError, ClientResult};

/// A submitted request and the caller waiting on it.
pub(crate) struct Job {
    pub(crate) request: Request,
    pub(crate) reply: oneshot::Sender<ClientResult<Response>>,
    transient_failures: u32,
}

impl Job {
    pub(crate) fn new(request: Request, reply: oneshot::Sender<ClientResult<Response>>) -> Self {
        Self {
            request,
            reply,
            transient_failures: 0,
        }
    }

    fn finish(self, result: ClientResult<Response>) {
        // The caller may have given up; nothing to do then.
        let _ = self.reply.send(result);
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) transient_retries: u32,
    pub(crate) transient_delay: Duration,
    /// How long an empty, unpaused bucket lingers before its task exits.
    pub(crate) idle_timeout: Duration,
}

/// Route key to the queue of the task serving it.
pub(crate) type BucketMap = Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>;

/// One route key's queue. Owned by a single task, which is the only thing
/// that ever touches `queue` or the window counters; at most one request
/// from here is on the wire at any time.
pub(crate) struct Bucket {
    key: String,
    queue: VecDeque<Job>,
    paused_until: Option<Instant>,
    limit: Option<u32>,
    server_bucket: Option<String>,
    backend: Arc<dyn HttpBackend>,
    global: Arc<GlobalLimiter>,
    retry: RetryPolicy,
    registry: Arc<BucketMap>,
}

impl Bucket {
    pub(crate) fn new(
        key: String,
        backend: Arc<dyn HttpBackend>,
        global: Arc<GlobalLimiter>,
        retry: RetryPolicy,
        registry: Arc<BucketMap>,
    ) -> Self {
        Self {
            key,
            queue: VecDeque::new(),
            paused_until: None,
            limit: None,
            server_bucket: None,
            backend,
            global,
            retry,
            registry,
        }
    }

    pub(crate) async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        debug!("Bucket {} started", self.key);
        loop {
            if self.queue.is_empty() {
                // A pending pause has to outlive the task, so idling starts
                // once it is over.
                let idle_from = self.paused_until.map_or_else(Instant::now, |until| {
                    until.max(Instant::now())
                });
                match timeout_at(idle_from + self.retry.idle_timeout, jobs.recv()).await {
                    Ok(Some(job)) => self.queue.push_back(job),
                    Ok(None) => break,
                    Err(_) => match self.retire(&mut jobs) {
                        Some(job) => self.queue.push_back(job),
                        None => return,
                    },
                }
            }
            while let Ok(job) = jobs.try_recv() {
                self.queue.push_back(job);
            }

            if let Some(until) = self.paused_until.take() {
                if until > Instant::now() {
                    sleep_until(until).await;
                    // Pick up whatever arrived while paused before sending.
                    continue;
                }
            }

            let Some(mut job) = self.queue.pop_front() else {
                continue;
            };
            if job.reply.is_closed() {
                debug!("Bucket {}: dropping request nobody is waiting for", self.key);
                continue;
            }

            self.global.acquire().await;
            job.request.attempt_count += 1;
            let outcome = self.backend.execute(&job.request).await;
            self.settle(job, outcome);
        }
        debug!("Bucket {} closed", self.key);
    }

    /// Unregisters the bucket unless a job slipped in first. Runs under the
    /// registry lock, which `enqueue` also holds while sending, so nothing
    /// can land in `jobs` after it is closed.
    fn retire(&self, jobs: &mut mpsc::UnboundedReceiver<Job>) -> Option<Job> {
        let mut buckets = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(job) = jobs.try_recv() {
            return Some(job);
        }
        jobs.close();
        if buckets.get(&self.key).is_some_and(mpsc::UnboundedSender::is_closed) {
            buckets.remove(&self.key);
        }
        debug!("Bucket {} idle, closing", self.key);
        None
    }

    fn settle(&mut self, mut job: Job, outcome: ClientResult<Response>) {
        let response = match outcome {
            Ok(response) => response,
            Err(err) => return job.finish(Err(err)),
        };

        let headers = RateLimitHeaders::from_headers(&response.headers);
        self.observe(&headers);
        let attempts = job.request.attempt_count;

        match response.status {
            200..=299 => {
                if let Some(wait) = headers.exhausted_for() {
                    debug!(
                        "Bucket {} used its {} requests, holding for {wait:?}",
                        self.key,
                        self.limit.map_or_else(|| "?".to_string(), |l| l.to_string())
                    );
                    self.pause(wait);
                }
                job.finish(Ok(response));
            }
            429 => {
                let condition = RateLimitCondition::from_response(&response);
                match condition {
                    RateLimitCondition::Global(_) => self.global.pause(condition.wait()),
                    RateLimitCondition::Bucket(_) => {
                        warn!("Rate limited on {}, retrying in {:?}", self.key, condition.wait());
                        self.pause(condition.wait());
                    }
                }
                self.queue.push_front(job);
            }
            status @ (502 | 525) => {
                job.transient_failures += 1;
                if job.transient_failures > self.retry.transient_retries {
                    warn!("{} kept failing with {status}, giving up after {attempts} attempts", self.key);
                    return job.finish(Err(ClientError::UpstreamTransient { status, attempts }));
                }
                info!(
                    "{} returned {status}, retry {}/{}",
                    self.key, job.transient_failures, self.retry.transient_retries
                );
                self.pause(self.retry.transient_delay);
                self.queue.push_front(job);
            }
            status => job.finish(Err(ClientError::Api {
                status,
                body: response.body,
                attempts,
            })),
        }
    }

    fn observe(&mut self, headers: &RateLimitHeaders) {
        if let Some(hash) = &headers.bucket {
            if self.server_bucket.as_ref().is_some_and(|known| known != hash) {
                debug!("Bucket {} moved to server bucket {hash}", self.key);
            }
            self.server_bucket = Some(hash.clone());
        }
        if headers.limit.is_some() {
            self.limit = headers.limit;
        }
    }

    fn pause(&mut self, wait: Duration) {
        let until = Instant::now() + wait;
        if self.paused_until.is_none_or(|current| current < until) {
            self.paused_until = Some(until);
        }
    }
}
