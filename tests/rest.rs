use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fluxer::config::RestConfig;
use fluxer::error::{ClientError, ClientResult};
use fluxer::rest::{HttpBackend, RateLimitedRequestExecutor, Request, Response};
use futures::future::join_all;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::json;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone)]
struct Sent {
    path: String,
    tag: Option<u64>,
    at: Instant,
}

/// Answers from a per-path script, `200 {}` once a script runs dry.
#[derive(Default)]
struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<Response>>>,
    sent: Mutex<Vec<Sent>>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    fn script(&self, path: &str, responses: impl IntoIterator<Item = Response>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .extend(responses);
    }

    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn tags(&self) -> Vec<u64> {
        self.sent().iter().filter_map(|s| s.tag).collect()
    }
}

#[async_trait]
impl HttpBackend for ScriptedBackend {
    async fn execute(&self, request: &Request) -> ClientResult<Response> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.sent.lock().unwrap().push(Sent {
            path: request.path.clone(),
            tag: request.body.as_ref().and_then(|b| b["n"].as_u64()),
            at: Instant::now(),
        });

        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.path)
            .and_then(VecDeque::pop_front);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(scripted.unwrap_or_else(|| response(200, &[], "{}")))
    }
}

fn response(status: u16, headers: &[(&'static str, &str)], body: &str) -> Response {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(HeaderName::from_static(name), HeaderValue::from_str(value).unwrap());
    }
    Response {
        status,
        headers: map,
        body: body.to_string(),
    }
}

fn config() -> RestConfig {
    RestConfig {
        transient_retries: 3,
        transient_retry_delay: Duration::from_millis(500),
        global_limit: 0,
        ..RestConfig::default()
    }
}

fn executor(backend: &Arc<ScriptedBackend>) -> RateLimitedRequestExecutor {
    RateLimitedRequestExecutor::new(backend.clone(), &config())
}

fn message(n: u64) -> Request {
    Request::post("/channels/1/messages").json(json!({ "n": n }))
}

#[tokio::test(start_paused = true)]
async fn same_route_runs_one_at_a_time_in_order() {
    let backend = Arc::new(ScriptedBackend::with_latency(Duration::from_millis(50)));
    let executor = executor(&backend);

    let results = join_all((0..5).map(|n| executor.submit(message(n)))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(backend.tags(), vec![0, 1, 2, 3, 4]);
    assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(executor.bucket_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn different_routes_run_side_by_side() {
    let backend = Arc::new(ScriptedBackend::with_latency(Duration::from_millis(50)));
    let executor = executor(&backend);

    let (a, b) = tokio::join!(
        executor.submit(Request::get("/channels/1/messages")),
        executor.submit(Request::get("/guilds/2")),
    );
    a.unwrap();
    b.unwrap();

    let sent = backend.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].at, sent[1].at);
    assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 2);
    assert_eq!(executor.bucket_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn bucket_429_retries_first_after_the_wait() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.script(
        "/channels/1/messages",
        [response(
            429,
            &[("x-ratelimit-scope", "user")],
            r#"{"retry_after": 1.5, "global": false}"#,
        )],
    );
    let executor = executor(&backend);

    let results = join_all((0..3).map(|n| executor.submit(message(n)))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(backend.tags(), vec![0, 0, 1, 2]);
    let sent = backend.sent();
    assert!(sent[1].at - sent[0].at >= Duration::from_millis(1_500));
    assert!(!executor.is_globally_limited());
}

#[tokio::test(start_paused = true)]
async fn retry_after_header_is_used_without_a_body() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.script("/channels/1/messages", [response(429, &[("retry-after", "2")], "")]);
    let executor = executor(&backend);

    let start = Instant::now();
    executor.submit(message(0)).await.unwrap();

    let sent = backend.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].at - start >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn global_429_holds_every_bucket() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.script(
        "/channels/1/messages",
        [response(
            429,
            &[("x-ratelimit-global", "true")],
            r#"{"retry_after": 1.0, "global": true}"#,
        )],
    );
    let executor = executor(&backend);
    let start = Instant::now();

    let (first, second) = tokio::join!(executor.submit(message(0)), async {
        sleep(Duration::from_millis(100)).await;
        assert!(executor.is_globally_limited());
        executor.submit(Request::get("/guilds/2")).await
    });
    first.unwrap();
    second.unwrap();

    let sent = backend.sent();
    let guild = sent.iter().find(|s| s.path == "/guilds/2").unwrap();
    assert!(guild.at - start >= Duration::from_secs(1));
    assert!(!executor.is_globally_limited());
}

#[tokio::test(start_paused = true)]
async fn exhausted_bucket_pauses_before_the_next_request() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.script(
        "/channels/1/messages",
        [response(
            200,
            &[
                ("x-ratelimit-limit", "5"),
                ("x-ratelimit-remaining", "0"),
                ("x-ratelimit-reset-after", "2.0"),
                ("x-ratelimit-bucket", "abcd"),
            ],
            "{}",
        )],
    );
    let executor = executor(&backend);

    let results = join_all((0..2).map(|n| executor.submit(message(n)))).await;

    assert!(results.iter().all(Result::is_ok));
    let sent = backend.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].at - sent[0].at >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn bad_gateway_is_retried_then_surfaced() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.script("/guilds/2", (0..10).map(|_| response(502, &[], "bad gateway")));
    let executor = executor(&backend);

    let err = executor.submit(Request::get("/guilds/2")).await.unwrap_err();

    assert!(matches!(
        err,
        ClientError::UpstreamTransient {
            status: 502,
            attempts: 4
        }
    ));
    let sent = backend.sent();
    assert_eq!(sent.len(), 4);
    for pair in sent.windows(2) {
        assert!(pair[1].at - pair[0].at >= Duration::from_millis(500));
    }
}

#[tokio::test(start_paused = true)]
async fn transient_error_recovers_within_the_retry_budget() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.script(
        "/guilds/2",
        [response(525, &[], ""), response(200, &[], r#"{"id": "2"}"#)],
    );
    let executor = executor(&backend);

    let ok = executor.submit(Request::get("/guilds/2")).await.unwrap();
    assert_eq!(ok.body, r#"{"id": "2"}"#);
    assert_eq!(backend.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn other_statuses_fail_without_retry() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.script(
        "/guilds/2",
        [response(403, &[], r#"{"message": "Missing Permissions", "code": 50013}"#)],
    );
    let executor = executor(&backend);

    match executor.submit(Request::get("/guilds/2")).await {
        Err(ClientError::Api {
            status,
            body,
            attempts,
        }) => {
            assert_eq!(status, 403);
            assert_eq!(attempts, 1);
            assert!(body.contains("Missing Permissions"));
        }
        other => panic!("expected an API error, got {other:?}"),
    }
    assert_eq!(backend.sent().len(), 1);

    // The bucket keeps serving after a failure.
    executor.submit(Request::get("/guilds/2")).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn idle_buckets_are_retired_and_reopened() {
    let backend = Arc::new(ScriptedBackend::default());
    let executor = executor(&backend);

    let results = join_all(
        (0..500).map(|n| executor.submit(Request::get(format!("/channels/{n}/messages")))),
    )
    .await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(executor.bucket_count(), 500);

    sleep(config().bucket_idle_timeout + Duration::from_secs(1)).await;
    assert_eq!(executor.bucket_count(), 0);

    executor
        .submit(Request::get("/channels/7/messages"))
        .await
        .unwrap();
    assert_eq!(executor.bucket_count(), 1);
    assert_eq!(backend.sent().len(), 501);
}

#[tokio::test(start_paused = true)]
async fn paused_bucket_outlives_its_idle_timeout() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.script(
        "/channels/1/messages",
        [response(
            200,
            &[
                ("x-ratelimit-limit", "1"),
                ("x-ratelimit-remaining", "0"),
                ("x-ratelimit-reset-after", "90"),
            ],
            "{}",
        )],
    );
    let executor = executor(&backend);

    executor.submit(message(0)).await.unwrap();
    sleep(config().bucket_idle_timeout + Duration::from_secs(10)).await;
    assert_eq!(executor.bucket_count(), 1);

    executor.submit(message(1)).await.unwrap();
    let sent = backend.sent();
    assert!(sent[1].at - sent[0].at >= Duration::from_secs(90));
}
