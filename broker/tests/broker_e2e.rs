//! End-to-end scenarios over the in-memory backend with real HTTP sinks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use virta_broker::backend::memory::{MemoryArgs, MemoryBackend};
use virta_broker::backend::Backend;
use virta_broker::broker::{BrokerStatus, ConfigSourceSpec, Instance};
use virta_broker::http_binding::STRUCTURED_CONTENT_TYPE;
use virta_broker::status::StatusManagerConfig;
use virta_core::Event;

// ============================================================================
// Test sink: an HTTP server that records the CloudEvents it receives
// ============================================================================

#[derive(Clone)]
enum SinkMode {
    /// Accept with an empty 204.
    Ack,
    /// Always answer 500.
    Fail,
    /// Accept and answer with a reply CloudEvent.
    Reply(Event),
}

struct SinkState {
    mode: SinkMode,
    received: Mutex<Vec<Event>>,
    hits: AtomicUsize,
}

#[derive(Clone)]
struct Sink {
    url: String,
    state: Arc<SinkState>,
}

impl Sink {
    async fn start(mode: SinkMode) -> Self {
        let state = Arc::new(SinkState {
            mode,
            received: Mutex::new(Vec::new()),
            hits: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/", post(sink_handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await });

        Self { url, state }
    }

    fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    fn received_ids(&self) -> Vec<String> {
        self.state
            .received
            .lock()
            .iter()
            .map(|event| event.id.clone())
            .collect()
    }
}

async fn sink_handler(State(state): State<Arc<SinkState>>, body: Bytes) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if let Ok(event) = Event::from_json(&body) {
        state.received.lock().push(event);
    }

    match &state.mode {
        SinkMode::Ack => StatusCode::NO_CONTENT.into_response(),
        SinkMode::Fail => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        SinkMode::Reply(reply) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, STRUCTURED_CONTENT_TYPE)],
            reply.to_json().unwrap(),
        )
            .into_response(),
    }
}

// ============================================================================
// Broker harness
// ============================================================================

struct TestBroker {
    backend: Arc<MemoryBackend>,
    instance: Arc<Instance>,
    ctx: CancellationToken,
    port: u16,
    handle: tokio::task::JoinHandle<virta_broker::Result<()>>,
}

impl TestBroker {
    async fn start(config: ConfigSourceSpec) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let backend = Arc::new(MemoryBackend::new(MemoryArgs::default()));
        let instance = Arc::new(Instance::new(
            backend.clone(),
            port,
            config,
            StatusManagerConfig::default(),
            Vec::new(),
        ));

        let ctx = CancellationToken::new();
        let handle = {
            let instance = instance.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { instance.start(ctx).await })
        };

        wait_until(|| instance.status() == BrokerStatus::Running).await;
        Self {
            backend,
            instance,
            ctx,
            port,
            handle,
        }
    }

    async fn produce(&self, event: &Event) {
        self.backend.produce(event).await.unwrap();
    }

    async fn shutdown(self) {
        self.ctx.cancel();
        self.handle.await.unwrap().unwrap();
        assert_eq!(self.instance.status(), BrokerStatus::Stopped);
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn trigger_config(entries: &[(&str, String)]) -> ConfigSourceSpec {
    let mut yaml = String::from("triggers:\n");
    for (name, body) in entries {
        yaml.push_str(&format!("  {name}:\n{body}"));
    }
    ConfigSourceSpec::Inline(yaml)
}

fn event(id: &str, ty: &str) -> Event {
    Event::new(id, "/test/source", ty)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn basic_fan_out_delivers_to_the_sink() {
    let sink = Sink::start(SinkMode::Ack).await;
    let broker = TestBroker::start(trigger_config(&[(
        "t1",
        format!("    target:\n      url: {}\n", sink.url),
    )]))
    .await;

    broker.produce(&event("e1", "test.type")).await;

    let probe = sink.clone();
    wait_until(move || probe.hits() == 1).await;
    assert_eq!(sink.received_ids(), vec!["e1"]);

    broker.shutdown().await;
}

#[tokio::test]
async fn ingest_endpoint_accepts_and_routes_events() {
    let sink = Sink::start(SinkMode::Ack).await;
    let broker = TestBroker::start(trigger_config(&[(
        "t1",
        format!("    target:\n      url: {}\n", sink.url),
    )]))
    .await;

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/", broker.port))
        .header("content-type", STRUCTURED_CONTENT_TYPE)
        .body(event("e1", "test.type").to_json().unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    let probe = sink.clone();
    wait_until(move || probe.hits() == 1).await;
    assert_eq!(sink.received_ids(), vec!["e1"]);

    broker.shutdown().await;
}

#[tokio::test]
async fn exact_filter_selects_matching_events() {
    let sink = Sink::start(SinkMode::Ack).await;
    let broker = TestBroker::start(trigger_config(&[(
        "t1",
        format!(
            "    filters:\n      - exact:\n          type: type1\n    target:\n      url: {}\n",
            sink.url
        ),
    )]))
    .await;

    broker.produce(&event("a", "type1")).await;
    broker.produce(&event("b", "type2")).await;
    broker.produce(&event("c", "type1")).await;

    let probe = sink.clone();
    wait_until(move || probe.hits() == 2).await;
    assert_eq!(sink.received_ids(), vec!["a", "c"]);

    // The filtered event never arrives.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.hits(), 2);

    broker.shutdown().await;
}

#[tokio::test]
async fn failing_sink_retries_then_falls_back_to_dead_letter() {
    let sink = Sink::start(SinkMode::Fail).await;
    let dlq = Sink::start(SinkMode::Ack).await;
    let broker = TestBroker::start(trigger_config(&[(
        "t1",
        format!(
            concat!(
                "    target:\n      url: {}\n",
                "    deliveryOptions:\n",
                "      retry: 2\n",
                "      backoffPolicy: constant\n",
                "      backoffDelay: PT0.1S\n",
                "      deadLetterURL: {}\n",
            ),
            sink.url, dlq.url
        ),
    )]))
    .await;

    broker.produce(&event("e1", "test.type")).await;

    let probe = dlq.clone();
    wait_until(move || probe.hits() == 1).await;

    // 1 initial attempt + 2 retries at the sink, then one DLQ delivery.
    assert_eq!(sink.hits(), 3);
    assert_eq!(dlq.received_ids(), vec!["e1"]);

    broker.shutdown().await;
}

#[tokio::test]
async fn dead_letter_gets_a_single_attempt() {
    let sink = Sink::start(SinkMode::Fail).await;
    let dlq = Sink::start(SinkMode::Fail).await;
    let broker = TestBroker::start(trigger_config(&[(
        "t1",
        format!(
            concat!(
                "    target:\n      url: {}\n",
                "    deliveryOptions:\n",
                "      retry: 1\n",
                "      backoffPolicy: constant\n",
                "      backoffDelay: PT0.1S\n",
                "      deadLetterURL: {}\n",
            ),
            sink.url, dlq.url
        ),
    )]))
    .await;

    broker.produce(&event("e1", "test.type")).await;

    let probe = dlq.clone();
    wait_until(move || probe.hits() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The retry budget applies to the target only.
    assert_eq!(sink.hits(), 2);
    assert_eq!(dlq.hits(), 1);

    broker.shutdown().await;
}

#[tokio::test]
async fn zero_retries_means_a_single_attempt() {
    let sink = Sink::start(SinkMode::Fail).await;
    let broker = TestBroker::start(trigger_config(&[(
        "t1",
        format!("    target:\n      url: {}\n", sink.url),
    )]))
    .await;

    broker.produce(&event("e1", "test.type")).await;

    let probe = sink.clone();
    wait_until(move || probe.hits() == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.hits(), 1);

    broker.shutdown().await;
}

#[tokio::test]
async fn missing_target_routes_straight_to_dead_letter() {
    let dlq = Sink::start(SinkMode::Ack).await;
    let broker = TestBroker::start(trigger_config(&[(
        "t1",
        format!(
            "    target: {{}}\n    deliveryOptions:\n      deadLetterURL: {}\n",
            dlq.url
        ),
    )]))
    .await;

    broker.produce(&event("e1", "test.type")).await;

    let probe = dlq.clone();
    wait_until(move || probe.hits() == 1).await;
    assert_eq!(dlq.received_ids(), vec!["e1"]);

    broker.shutdown().await;
}

#[tokio::test]
async fn graceful_drain_delivers_buffered_events() {
    let sink = Sink::start(SinkMode::Ack).await;
    let broker = TestBroker::start(trigger_config(&[(
        "t1",
        format!("    target:\n      url: {}\n", sink.url),
    )]))
    .await;

    for i in 0..100 {
        broker.produce(&event(&format!("e{i}"), "test.type")).await;
    }

    // Shut down immediately: every buffered event must still be delivered
    // before the broker finishes stopping.
    broker.shutdown().await;
    assert_eq!(sink.hits(), 100);
}

#[tokio::test]
async fn config_hot_swap_moves_deliveries_to_the_new_sink() {
    let sink_a = Sink::start(SinkMode::Ack).await;
    let sink_b = Sink::start(SinkMode::Ack).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.yaml");
    let config_for = |url: &str| {
        format!("triggers:\n  t1:\n    target:\n      url: {url}\n")
    };
    std::fs::write(&path, config_for(&sink_a.url)).unwrap();

    let broker = TestBroker::start(ConfigSourceSpec::Poller(
        path.clone(),
        Duration::from_millis(50),
    ))
    .await;

    // File-based config is applied asynchronously; wait for the trigger.
    for _ in 0..500 {
        if !broker.instance.subscriptions().subscription_names().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    broker.produce(&event("before", "test.type")).await;
    let probe = sink_a.clone();
    wait_until(move || probe.hits() == 1).await;

    // Swap the target and wait for the poller to apply it.
    std::fs::write(&path, config_for(&sink_b.url)).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    broker.produce(&event("after", "test.type")).await;
    let probe = sink_b.clone();
    wait_until(move || probe.hits() == 1).await;

    assert_eq!(sink_a.received_ids(), vec!["before"]);
    assert_eq!(sink_b.received_ids(), vec!["after"]);

    broker.shutdown().await;
}

#[tokio::test]
async fn replies_are_ingested_back_into_the_broker() {
    // t1 receives request events and its sink answers with a reply event;
    // t2 filters for the reply type and must see it.
    let reply = event("r1", "reply.type");
    let replying_sink = Sink::start(SinkMode::Reply(reply)).await;
    let reply_sink = Sink::start(SinkMode::Ack).await;

    let broker = TestBroker::start(trigger_config(&[
        (
            "t1",
            format!(
                "    filters:\n      - exact:\n          type: request.type\n    target:\n      url: {}\n",
                replying_sink.url
            ),
        ),
        (
            "t2",
            format!(
                "    filters:\n      - exact:\n          type: reply.type\n    target:\n      url: {}\n",
                reply_sink.url
            ),
        ),
    ]))
    .await;

    broker.produce(&event("q1", "request.type")).await;

    let probe = reply_sink.clone();
    wait_until(move || probe.hits() == 1).await;
    assert_eq!(reply_sink.received_ids(), vec!["r1"]);

    broker.shutdown().await;
}
