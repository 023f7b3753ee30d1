//! Telemetry batching against a mock wire server.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use vmagent_guest_agent::telemetry::{BatcherConfig, Operation, TelemetryBatcher};
use vmagent_guest_agent::{AgentContext, Config, LinuxHost};
use vmagent_wire::RetryPolicy;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn context(server: &MockServer, root: &TempDir) -> AgentContext {
    let mut config = Config::with_dirs(root.path().join("lib"), root.path().join("log"));
    config.endpoint = server.uri();
    let retry = RetryPolicy {
        max_retries: 0,
        retry_delay: Duration::from_millis(10),
        request_timeout: Duration::from_secs(5),
    };
    AgentContext::new(config, retry, Arc::new(LinuxHost::new())).unwrap()
}

fn config() -> BatcherConfig {
    BatcherConfig {
        interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_secs(3600),
        throttle_every: 0,
        throttle_delay: Duration::ZERO,
    }
}

#[tokio::test]
async fn queued_events_are_posted_and_removed() {
    let server = MockServer::start().await;
    let root = TempDir::new().unwrap();
    let ctx = context(&server, &root).await;

    Mock::given(method("POST"))
        .and(path("/machine/"))
        .and(query_param("comp", "telemetrydata"))
        .and(header("x-ms-version", "2012-11-30"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    ctx.events
        .add_extension_event("Foo", Operation::Install, true, 2, "1.0", "install ok");
    ctx.events
        .add_extension_event("Foo", Operation::Enable, false, 1, "1.0", "exit 1");

    let mut batcher = TelemetryBatcher::new(&ctx, config());
    assert_eq!(batcher.run_once().await, 1);
    assert!(ctx.events.pending().unwrap().is_empty());

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8_lossy(&requests[0].body).into_owned();
    assert!(body.starts_with("<?xml"));
    assert!(body.contains("<TelemetryData"));
    assert!(body.contains("install ok"));
    assert!(body.contains("exit 1"));
    assert!(body.contains("WALA"));
}

#[tokio::test]
async fn failed_post_drops_the_batch() {
    let server = MockServer::start().await;
    let root = TempDir::new().unwrap();
    let ctx = context(&server, &root).await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    ctx.events
        .add_extension_event("Foo", Operation::Install, true, 0, "1.0", "");
    let mut batcher = TelemetryBatcher::new(&ctx, config());
    assert_eq!(batcher.run_once().await, 0);
    assert!(ctx.events.pending().unwrap().is_empty());
}

#[tokio::test]
async fn batcher_stops_on_shutdown() {
    let server = MockServer::start().await;
    let root = TempDir::new().unwrap();
    let ctx = context(&server, &root).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(TelemetryBatcher::new(&ctx, config()).run(rx));
    tokio::time::sleep(Duration::from_millis(120)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
