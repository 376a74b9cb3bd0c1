//! Session lifecycle end-to-end tests: suspend/resume, eviction,
//! supersession, health expiry and per-exchange failure mapping.

use std::time::{Duration, Instant};

use culvert::session::{SessionConfig, SessionError};
use culvert_e2e::{MockHttpService, SilentClient, TestClient, TestServer, TestServerOptions};
use culvert_protocol::CloseReason;

fn init_test() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("culvert=debug,culvert_server=debug,culvert_e2e=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn local_service_down_fails_the_exchange_not_the_tunnel() {
    init_test();

    let server = TestServer::start().await;

    // Nothing listens on port 1; connections are refused immediately.
    let client = TestClient::connect(&server, "127.0.0.1:1", Some("deadend"))
        .await
        .expect("Failed to connect client");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let http_client = reqwest::Client::new();
    for _ in 0..2 {
        let resp = http_client
            .get(format!("http://{}/", server.http_addr))
            .header("Host", server.host_for("deadend"))
            .send()
            .await
            .expect("HTTP request failed");

        assert_eq!(resp.status(), 502);
        let body = resp.text().await.unwrap().to_lowercase();
        assert!(body.contains("unreachable"), "body: {}", body);
    }

    // Per-exchange failures leave the session standing.
    assert!(client.is_running());
    assert_eq!(server.registry.len(), 1);
}

#[tokio::test]
async fn slow_local_service_yields_gateway_timeout() {
    init_test();

    let server = TestServer::start_with(TestServerOptions {
        exchange_timeout: Duration::from_secs(1),
        ..Default::default()
    })
    .await;

    let mock = MockHttpService::start().await;
    mock.set_response_delay(Duration::from_secs(5));

    let _client = TestClient::connect(&server, &mock.addr_string(), Some("slow"))
        .await
        .expect("Failed to connect client");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let http_client = reqwest::Client::new();
    let resp = http_client
        .get(format!("http://{}/", server.http_addr))
        .header("Host", server.host_for("slow"))
        .send()
        .await
        .expect("HTTP request failed");

    assert_eq!(resp.status(), 504);
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "timeout must fire from the exchange deadline, not the local service"
    );
}

#[tokio::test]
async fn suspended_session_queues_requests_until_resume() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_body(b"after resume".to_vec());

    let client = TestClient::connect(&server, &mock.addr_string(), Some("parked"))
        .await
        .expect("Failed to connect client");

    tokio::time::sleep(Duration::from_millis(50)).await;

    client.suspend().await.expect("suspend failed");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Fire a public request while parked; it must not reach the local
    // service yet.
    let http_addr = server.http_addr;
    let host = server.host_for("parked");
    let request_task = tokio::spawn(async move {
        reqwest::Client::new()
            .get(format!("http://{}/queued", http_addr))
            .header("Host", host)
            .send()
            .await
    });

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        mock.get_requests().len(),
        0,
        "request must queue while suspended"
    );

    client.resume().await.expect("resume failed");

    let resp = request_task
        .await
        .unwrap()
        .expect("queued request must complete after resume");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "after resume");
    assert_eq!(mock.get_requests().len(), 1);
}

#[tokio::test]
async fn active_key_holder_rejects_newcomers() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;

    let _holder = TestClient::connect(&server, &mock.addr_string(), Some("claimed"))
        .await
        .expect("Failed to connect first client");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = TestClient::connect(&server, &mock.addr_string(), Some("claimed")).await;
    match result {
        Err(SessionError::Rejected(CloseReason::RoutingKeyTaken)) => {}
        other => panic!("expected RoutingKeyTaken rejection, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn suspended_key_holder_is_superseded() {
    init_test();

    let server = TestServer::start().await;

    let mock_old = MockHttpService::start().await;
    mock_old.set_response_body(b"old".to_vec());
    let mock_new = MockHttpService::start().await;
    mock_new.set_response_body(b"new".to_vec());

    let old = TestClient::connect(&server, &mock_old.addr_string(), Some("shared"))
        .await
        .expect("Failed to connect first client");

    tokio::time::sleep(Duration::from_millis(50)).await;
    old.suspend().await.expect("suspend failed");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A suspended holder is presumed stale; the newcomer takes the key.
    let _new = TestClient::connect(&server, &mock_new.addr_string(), Some("shared"))
        .await
        .expect("Second client must supersede the suspended one");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.registry.len(), 1);

    // The old session was closed under it.
    match old.wait().await {
        Err(SessionError::ClosedByServer(CloseReason::Superseded)) => {}
        other => panic!("expected Superseded close, got {:?}", other.err()),
    }

    let resp = reqwest::Client::new()
        .get(format!("http://{}/", server.http_addr))
        .header("Host", server.host_for("shared"))
        .send()
        .await
        .expect("HTTP request failed");
    assert_eq!(resp.text().await.unwrap(), "new");
    assert_eq!(mock_old.get_requests().len(), 0);
}

#[tokio::test]
async fn capacity_pressure_evicts_least_recently_used_tunnel() {
    init_test();

    let server = TestServer::start_with(TestServerOptions {
        registry_capacity: 2,
        ..Default::default()
    })
    .await;

    let mock = MockHttpService::start().await;
    mock.set_response_body(b"still here".to_vec());

    let first = TestClient::connect(&server, &mock.addr_string(), Some("first"))
        .await
        .expect("connect first");
    let _second = TestClient::connect(&server, &mock.addr_string(), Some("second"))
        .await
        .expect("connect second");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.registry.len(), 2);

    let _third = TestClient::connect(&server, &mock.addr_string(), Some("third"))
        .await
        .expect("connect third");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.registry.len(), 2);

    // "first" was the least recently used and got pushed out.
    match first.wait().await {
        Err(SessionError::ClosedByServer(CloseReason::Evicted)) => {}
        other => panic!("expected Evicted close, got {:?}", other.err()),
    }

    let resp = reqwest::Client::new()
        .get(format!("http://{}/", server.http_addr))
        .header("Host", server.host_for("first"))
        .send()
        .await
        .expect("HTTP request failed");
    assert_eq!(resp.status(), 404);

    // Survivors still serve traffic.
    let resp = reqwest::Client::new()
        .get(format!("http://{}/", server.http_addr))
        .header("Host", server.host_for("second"))
        .send()
        .await
        .expect("HTTP request failed");
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn silent_client_is_closed_after_grace_and_pending_exchanges_fail() {
    init_test();

    let server = TestServer::start_with(TestServerOptions {
        health_interval: Duration::from_millis(200),
        probe_timeout: Duration::from_millis(500),
        grace_period: Duration::from_secs(1),
        // Long enough that the 502 below can only come from session closure.
        exchange_timeout: Duration::from_secs(30),
        ..Default::default()
    })
    .await;

    // Completes the handshake, then never acks a probe or serves a request.
    let _ghost = SilentClient::connect(&server, "ghost")
        .await
        .expect("silent client handshake");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.registry.len(), 1);

    // A request dispatched onto the doomed session must resolve as a
    // failure when the session closes, not hang until the exchange timeout.
    let http_addr = server.http_addr;
    let host = server.host_for("ghost");
    let started = Instant::now();
    let resp = reqwest::Client::new()
        .get(format!("http://{}/", http_addr))
        .header("Host", host)
        .send()
        .await
        .expect("HTTP request failed");

    assert_eq!(resp.status(), 502);
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "must fail via session closure, not exchange timeout"
    );

    // And the registry evicted the dead session.
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.registry.len() != 0 {
        assert!(Instant::now() < deadline, "registry never evicted the ghost");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn auth_token_is_enforced() {
    init_test();

    let server = TestServer::start_with(TestServerOptions {
        auth_token: Some("s3cret".to_string()),
        ..Default::default()
    })
    .await;

    let mock = MockHttpService::start().await;

    // Without the token: rejected.
    let result = TestClient::connect(&server, &mock.addr_string(), Some("locked")).await;
    match result {
        Err(SessionError::Rejected(CloseReason::AuthFailed)) => {}
        other => panic!("expected AuthFailed rejection, got {:?}", other.err()),
    }

    // With the token: accepted.
    let mut config = SessionConfig::new(mock.addr_string());
    config.routing_key = Some("locked".to_string());
    config.auth_token = Some("s3cret".to_string());
    let client = TestClient::connect_with(&server, config)
        .await
        .expect("authenticated client must connect");
    assert_eq!(client.routing_key, "locked");
}

#[tokio::test]
async fn clean_shutdown_unregisters_the_tunnel() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;

    let client = TestClient::connect(&server, &mock.addr_string(), Some("brief"))
        .await
        .expect("Failed to connect client");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.registry.len(), 1);

    client.shutdown().await.expect("clean shutdown");

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.registry.len() != 0 {
        assert!(Instant::now() < deadline, "registry entry not cleaned up");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let resp = reqwest::Client::new()
        .get(format!("http://{}/", server.http_addr))
        .header("Host", server.host_for("brief"))
        .send()
        .await
        .expect("HTTP request failed");
    assert_eq!(resp.status(), 404);
}
