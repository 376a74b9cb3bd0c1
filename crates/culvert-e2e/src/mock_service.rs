//! Mock HTTP service for E2E tests
//!
//! Plays the "local service" a tunnel client forwards to: records incoming
//! requests and returns configurable responses, optionally after a delay so
//! tests can exercise the exchange timeout path.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpListener;

/// A recorded HTTP request for test assertions
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Option<Duration>,
}

/// A mock HTTP service listening on an ephemeral local port.
pub struct MockHttpService {
    addr: SocketAddr,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
    response: Arc<RwLock<MockResponse>>,
}

impl MockHttpService {
    /// Start a mock HTTP service on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().unwrap();

        let requests: Arc<RwLock<Vec<RecordedRequest>>> = Arc::new(RwLock::new(Vec::new()));
        let response = Arc::new(RwLock::new(MockResponse {
            status: StatusCode::OK,
            headers: vec![],
            body: b"OK".to_vec(),
            delay: None,
        }));

        let requests_clone = requests.clone();
        let response_clone = response.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };

                let requests = requests_clone.clone();
                let response = response_clone.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let requests = requests.clone();
                        let response = response.clone();
                        async move {
                            let method = req.method().to_string();
                            let uri = req.uri().to_string();
                            let req_headers: Vec<(String, String)> = req
                                .headers()
                                .iter()
                                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                                .collect();

                            let req_body = req
                                .into_body()
                                .collect()
                                .await
                                .map(|b| b.to_bytes().to_vec())
                                .unwrap_or_default();

                            requests.write().push(RecordedRequest {
                                method,
                                uri,
                                headers: req_headers,
                                body: req_body,
                            });

                            let reply = response.read().clone();
                            if let Some(delay) = reply.delay {
                                tokio::time::sleep(delay).await;
                            }

                            let mut builder = Response::builder().status(reply.status);
                            for (name, value) in reply.headers {
                                builder = builder.header(name, value);
                            }

                            Ok::<_, Infallible>(
                                builder.body(Full::new(Bytes::from(reply.body))).unwrap(),
                            )
                        }
                    });

                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            requests,
            response,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the address as a string (e.g., "127.0.0.1:12345")
    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    /// Get all recorded requests
    pub fn get_requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().clone()
    }

    /// Get the last recorded request (if any)
    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.read().last().cloned()
    }

    pub fn set_response_status(&self, status: StatusCode) {
        self.response.write().status = status;
    }

    pub fn set_response_body(&self, body: impl Into<Vec<u8>>) {
        self.response.write().body = body.into();
    }

    pub fn add_response_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.response.write().headers.push((name.into(), value.into()));
    }

    /// Delay every response, to exercise timeout handling.
    pub fn set_response_delay(&self, delay: Duration) {
        self.response.write().delay = Some(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_requests_and_serves_configured_response() {
        let service = MockHttpService::start().await;
        service.set_response_body(b"Hello, World!".to_vec());

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://{}/test", service.addr()))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "Hello, World!");

        let requests = service.get_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].uri, "/test");
    }

    #[tokio::test]
    async fn configurable_status_and_body() {
        let service = MockHttpService::start().await;
        service.set_response_status(StatusCode::CREATED);
        service.set_response_body(r#"{"id": 1}"#);

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{}/users", service.addr()))
            .body(r#"{"name": "test"}"#)
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 201);

        let requests = service.get_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            String::from_utf8_lossy(&requests[0].body),
            r#"{"name": "test"}"#
        );
    }
}
