//! HTTP tunnel end-to-end tests

use hyper::StatusCode;
use culvert_e2e::{MockHttpService, TestClient, TestServer};

/// Initialize tracing and crypto provider for tests
fn init_test() {
    // Install rustls crypto provider (ignore if already installed)
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("culvert=debug,culvert_server=debug,culvert_e2e=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn basic_get_roundtrip() {
    init_test();

    let server = TestServer::start().await;

    let mock = MockHttpService::start().await;
    mock.set_response_body(b"ok".to_vec());

    let client = TestClient::connect(&server, &mock.addr_string(), Some("api"))
        .await
        .expect("Failed to connect client");
    assert_eq!(client.routing_key, "api");

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    let http_client = reqwest::Client::new();
    let resp = http_client
        .get(format!("http://{}/", server.http_addr))
        .header("Host", server.host_for("api"))
        .send()
        .await
        .expect("HTTP request failed");

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");

    let requests = mock.get_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
}

#[tokio::test]
async fn post_with_body() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_status(StatusCode::CREATED);
    mock.set_response_body(br#"{"id": 123, "status": "created"}"#.to_vec());
    mock.add_response_header("Content-Type", "application/json");

    let client = TestClient::connect(&server, &mock.addr_string(), None)
        .await
        .expect("Failed to connect client");

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    let http_client = reqwest::Client::new();
    let resp = http_client
        .post(format!("http://{}/api/users", server.http_addr))
        .header("Host", server.host_for(&client.routing_key))
        .header("Content-Type", "application/json")
        .body(r#"{"name": "Test User", "email": "test@example.com"}"#)
        .send()
        .await
        .expect("HTTP request failed");

    assert_eq!(resp.status(), 201);
    let body = resp.text().await.expect("Failed to read body");
    assert!(body.contains("created"));

    let requests = mock.get_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].uri, "/api/users");

    let req_body = String::from_utf8_lossy(&requests[0].body);
    assert!(req_body.contains("Test User"));
    assert!(req_body.contains("test@example.com"));
}

#[tokio::test]
async fn auto_assigned_routing_key() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_body(b"auto".to_vec());

    // No requested key: the server picks one and reports it back.
    let client = TestClient::connect(&server, &mock.addr_string(), None)
        .await
        .expect("Failed to connect client");
    assert!(!client.routing_key.is_empty());

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    let http_client = reqwest::Client::new();
    let resp = http_client
        .get(format!("http://{}/", server.http_addr))
        .header("Host", server.host_for(&client.routing_key))
        .send()
        .await
        .expect("HTTP request failed");

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "auto");
}

#[tokio::test]
async fn sequential_requests_reuse_the_tunnel() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_body(b"OK".to_vec());

    let client = TestClient::connect(&server, &mock.addr_string(), Some("seq"))
        .await
        .expect("Failed to connect client");

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    let http_client = reqwest::Client::new();
    for i in 0..5 {
        let resp = http_client
            .get(format!("http://{}/request/{}", server.http_addr, i))
            .header("Host", server.host_for(&client.routing_key))
            .send()
            .await
            .expect("HTTP request failed");
        assert_eq!(resp.status(), 200);
    }

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    let requests = mock.get_requests();
    assert_eq!(requests.len(), 5);
    for (i, req) in requests.iter().enumerate() {
        assert_eq!(req.uri, format!("/request/{}", i));
    }
}

#[tokio::test]
async fn concurrent_requests_correlate_correctly() {
    init_test();

    let server = TestServer::start().await;

    // Echo-style correlation check: each concurrent caller must get the
    // response produced for its own request, never another caller's.
    let mock = MockHttpService::start().await;
    mock.set_response_body(b"shared".to_vec());

    let client = TestClient::connect(&server, &mock.addr_string(), Some("load"))
        .await
        .expect("Failed to connect client");

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    let http_client = reqwest::Client::new();
    let mut tasks = Vec::new();
    for i in 0..10 {
        let http_client = http_client.clone();
        let url = format!("http://{}/concurrent/{}", server.http_addr, i);
        let host = server.host_for(&client.routing_key);
        tasks.push(tokio::spawn(async move {
            let resp = http_client
                .get(url)
                .header("Host", host)
                .send()
                .await
                .expect("HTTP request failed");
            assert_eq!(resp.status(), 200);
            resp.text().await.unwrap()
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap(), "shared");
    }

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    // Every distinct path must have reached the local service exactly once.
    let mut uris: Vec<String> = mock.get_requests().into_iter().map(|r| r.uri).collect();
    uris.sort();
    assert_eq!(uris.len(), 10);
    uris.dedup();
    assert_eq!(uris.len(), 10, "duplicate delivery of a request");
}

#[tokio::test]
async fn headers_are_preserved() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_body(b"Headers received".to_vec());

    let client = TestClient::connect(&server, &mock.addr_string(), None)
        .await
        .expect("Failed to connect client");

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    let http_client = reqwest::Client::new();
    let resp = http_client
        .get(format!("http://{}/headers-test", server.http_addr))
        .header("Host", server.host_for(&client.routing_key))
        .header("X-Custom-Header", "custom-value")
        .header("Authorization", "Bearer test-token")
        .header("Accept", "application/json")
        .send()
        .await
        .expect("HTTP request failed");

    assert_eq!(resp.status(), 200);

    let requests = mock.get_requests();
    assert_eq!(requests.len(), 1);

    let headers: std::collections::HashMap<String, String> = requests[0]
        .headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect();

    assert_eq!(
        headers.get("x-custom-header"),
        Some(&"custom-value".to_string())
    );
    assert_eq!(
        headers.get("authorization"),
        Some(&"Bearer test-token".to_string())
    );
}

#[tokio::test]
async fn error_statuses_pass_through() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_status(StatusCode::NOT_FOUND);
    mock.set_response_body(b"Resource not found".to_vec());

    let client = TestClient::connect(&server, &mock.addr_string(), None)
        .await
        .expect("Failed to connect client");

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    let http_client = reqwest::Client::new();
    let resp = http_client
        .get(format!("http://{}/not-found", server.http_addr))
        .header("Host", server.host_for(&client.routing_key))
        .send()
        .await
        .expect("HTTP request failed");

    assert_eq!(resp.status(), 404);
    assert_eq!(resp.text().await.unwrap(), "Resource not found");
}

#[tokio::test]
async fn tunnels_are_isolated_from_each_other() {
    init_test();

    let server = TestServer::start().await;

    let mock1 = MockHttpService::start().await;
    mock1.set_response_body(b"Response from service 1".to_vec());

    let mock2 = MockHttpService::start().await;
    mock2.set_response_body(b"Response from service 2".to_vec());

    let _client1 = TestClient::connect(&server, &mock1.addr_string(), Some("app1"))
        .await
        .expect("Failed to connect client1");
    let _client2 = TestClient::connect(&server, &mock2.addr_string(), Some("app2"))
        .await
        .expect("Failed to connect client2");

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    let http_client = reqwest::Client::new();

    let resp1 = http_client
        .get(format!("http://{}/", server.http_addr))
        .header("Host", server.host_for("app1"))
        .send()
        .await
        .expect("HTTP request failed");
    assert_eq!(resp1.text().await.unwrap(), "Response from service 1");

    let resp2 = http_client
        .get(format!("http://{}/", server.http_addr))
        .header("Host", server.host_for("app2"))
        .send()
        .await
        .expect("HTTP request failed");
    assert_eq!(resp2.text().await.unwrap(), "Response from service 2");

    assert_eq!(mock1.get_requests().len(), 1);
    assert_eq!(mock2.get_requests().len(), 1);
    assert_eq!(server.registry.len(), 2);
}

#[tokio::test]
async fn unknown_subdomain_gets_404_not_a_hang() {
    init_test();

    let server = TestServer::start().await;

    let http_client = reqwest::Client::new();
    let resp = tokio::time::timeout(
        tokio::time::Duration::from_secs(5),
        http_client
            .get(format!("http://{}/", server.http_addr))
            .header("Host", server.host_for("missing"))
            .send(),
    )
    .await
    .expect("request must not hang")
    .expect("HTTP request failed");

    assert_eq!(resp.status(), 404);
    let body = resp.text().await.unwrap();
    assert!(body.contains("missing"));
}

#[tokio::test]
async fn foreign_host_gets_400() {
    init_test();

    let server = TestServer::start().await;

    let http_client = reqwest::Client::new();
    let resp = http_client
        .get(format!("http://{}/", server.http_addr))
        .header("Host", "unrelated.example.org")
        .send()
        .await
        .expect("HTTP request failed");

    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn large_response_body_streams_through() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    // Larger than any single chunk the local client will hand us.
    let body: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    mock.set_response_body(body.clone());

    let client = TestClient::connect(&server, &mock.addr_string(), Some("big"))
        .await
        .expect("Failed to connect client");

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    let http_client = reqwest::Client::new();
    let resp = http_client
        .get(format!("http://{}/blob", server.http_addr))
        .header("Host", server.host_for(&client.routing_key))
        .send()
        .await
        .expect("HTTP request failed");

    assert_eq!(resp.status(), 200);
    let received = resp.bytes().await.unwrap();
    assert_eq!(received.len(), body.len());
    assert_eq!(&received[..], &body[..]);
}
