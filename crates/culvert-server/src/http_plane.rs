use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use culvert_common::ExchangeFailure;
use culvert_protocol::{ExchangeStatus, RequestHead, ResponseHead};

use crate::registry::ConnectionRegistry;
use crate::session::ExchangeEvent;

type PlaneBody = BoxBody<Bytes, std::io::Error>;

/// Public HTTP plane: terminates inbound requests and bridges them onto
/// tunnel sessions by subdomain.
pub struct HttpPlane {
    registry: Arc<ConnectionRegistry>,
    base_domain: String,
    exchange_timeout: Duration,
    /// Optional TLS acceptor for HTTPS mode
    tls_acceptor: Option<TlsAcceptor>,
}

impl HttpPlane {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        base_domain: String,
        exchange_timeout: Duration,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            base_domain,
            exchange_timeout,
            tls_acceptor,
        })
    }

    /// Start listening for public HTTP/HTTPS traffic.
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;

        if self.tls_acceptor.is_some() {
            tracing::info!("HTTPS plane listening on {}", addr);
        } else {
            tracing::info!("HTTP plane listening on {}", addr);
        }

        self.run_with_listener(listener).await
    }

    /// Accept loop over an already-bound listener (used by tests).
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let this = self.clone();

            tokio::spawn(async move {
                if let Some(ref acceptor) = this.tls_acceptor {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            this.serve_connection(tls_stream, peer_addr).await;
                        }
                        Err(e) => {
                            tracing::warn!("TLS handshake failed from {}: {}", peer_addr, e);
                        }
                    }
                } else {
                    this.serve_connection(stream, peer_addr).await;
                }
            });
        }
    }

    /// Serve an HTTP connection on any AsyncRead + AsyncWrite stream.
    async fn serve_connection<S>(self: Arc<Self>, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| {
            let this = self.clone();
            async move { this.handle_request(req).await }
        });

        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            tracing::debug!("HTTP connection error from {}: {}", peer_addr, e);
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<PlaneBody>, Infallible> {
        tracing::debug!(
            "HTTP request: {} {} (Host: {:?})",
            req.method(),
            req.uri(),
            req.headers().get("host")
        );

        let host = req
            .headers()
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let Some(routing_key) = routing_key_from_host(host, &self.base_domain) else {
            return Ok(plain_response(
                StatusCode::BAD_REQUEST,
                "Invalid or missing subdomain",
            ));
        };

        let Some(session) = self.registry.lookup(&routing_key) else {
            tracing::debug!(routing_key = %routing_key, "No tunnel for subdomain");
            return Ok(plain_response(
                StatusCode::NOT_FOUND,
                &format!("No tunnel registered for: {}", routing_key),
            ));
        };

        let (parts, mut body) = req.into_parts();

        let head = RequestHead {
            method: parts.method.to_string(),
            uri: parts.uri.to_string(),
            headers: parts
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect(),
        };
        let head_bytes = match head.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("Failed to encode request head: {}", e);
                return Ok(plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to encode request",
                ));
            }
        };

        let deadline = Instant::now() + self.exchange_timeout;
        let (exchange_id, mut events) = match session.dispatch(head_bytes, deadline).await {
            Ok(dispatched) => dispatched,
            Err(_) => {
                return Ok(plain_response(
                    StatusCode::BAD_GATEWAY,
                    "Tunnel connection lost",
                ));
            }
        };

        // Relay the request body frame by frame; the head already went out,
        // so nothing is buffered whole.
        loop {
            match body.frame().await {
                None => break,
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        if data.is_empty() {
                            continue;
                        }
                        if session.send_chunk(exchange_id, data).await.is_err() {
                            return Ok(plain_response(
                                StatusCode::BAD_GATEWAY,
                                "Tunnel connection lost",
                            ));
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!("Public client aborted request body: {}", e);
                    session.fail_exchange(exchange_id, ExchangeFailure::TransportLost);
                    return Ok(plain_response(
                        StatusCode::BAD_REQUEST,
                        "Request body aborted",
                    ));
                }
            }
        }
        if session.finish(exchange_id).await.is_err() {
            return Ok(plain_response(
                StatusCode::BAD_GATEWAY,
                "Tunnel connection lost",
            ));
        }

        // First event must be the response head; everything after streams to
        // the public caller as it arrives.
        match timeout(self.exchange_timeout, events.recv()).await {
            Err(_) => {
                tracing::debug!(exchange_id, routing_key = %routing_key, "Exchange timed out");
                session.fail_exchange(exchange_id, ExchangeFailure::TimedOut);
                Ok(plain_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    "Tunnel response timeout",
                ))
            }
            Ok(None) => Ok(plain_response(StatusCode::BAD_GATEWAY, "Tunnel closed")),
            Ok(Some(ExchangeEvent::Failed(failure))) => Ok(failure_response(failure)),
            Ok(Some(ExchangeEvent::End { status, detail })) => {
                // Ended before any head: only meaningful as an error report.
                Ok(end_without_head_response(status, &detail))
            }
            Ok(Some(ExchangeEvent::Data(head_bytes))) => {
                let head = match ResponseHead::decode(&head_bytes) {
                    Ok(h) => h,
                    Err(e) => {
                        tracing::error!("Malformed response head from tunnel: {}", e);
                        session.fail_exchange(exchange_id, ExchangeFailure::TransportLost);
                        return Ok(plain_response(
                            StatusCode::BAD_GATEWAY,
                            "Malformed tunnel response",
                        ));
                    }
                };

                let mut builder = Response::builder().status(head.status);
                for (name, value) in head.headers {
                    builder = builder.header(name, value);
                }

                match builder.body(streaming_body(events)) {
                    Ok(response) => Ok(response),
                    Err(e) => {
                        tracing::error!("Invalid response head from tunnel: {}", e);
                        Ok(plain_response(
                            StatusCode::BAD_GATEWAY,
                            "Malformed tunnel response",
                        ))
                    }
                }
            }
        }
    }
}

/// Remaining exchange events as a streaming hyper body.
fn streaming_body(events: mpsc::UnboundedReceiver<ExchangeEvent>) -> PlaneBody {
    let stream = futures_util::stream::unfold(Some(events), |state| async move {
        let mut events = state?;
        match events.recv().await {
            Some(ExchangeEvent::Data(chunk)) => {
                Some((Ok(hyper::body::Frame::data(chunk)), Some(events)))
            }
            Some(ExchangeEvent::End {
                status: ExchangeStatus::Ok,
                ..
            }) => None,
            Some(ExchangeEvent::End { status, .. }) => Some((
                Err(std::io::Error::other(format!(
                    "exchange aborted by peer: {:?}",
                    status
                ))),
                None,
            )),
            Some(ExchangeEvent::Failed(failure)) => {
                Some((Err(std::io::Error::other(failure.to_string())), None))
            }
            None => Some((
                Err(std::io::Error::other("session closed mid-exchange")),
                None,
            )),
        }
    });
    BodyExt::boxed(StreamBody::new(stream))
}

fn plain_response(status: StatusCode, message: &str) -> Response<PlaneBody> {
    Response::builder()
        .status(status)
        .body(
            Full::new(Bytes::from(message.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("static response")
}

fn failure_response(failure: ExchangeFailure) -> Response<PlaneBody> {
    match failure {
        ExchangeFailure::TimedOut => {
            plain_response(StatusCode::GATEWAY_TIMEOUT, "Tunnel response timeout")
        }
        ExchangeFailure::LocalUnreachable => {
            plain_response(StatusCode::BAD_GATEWAY, "Local service unreachable")
        }
        ExchangeFailure::SessionEvicted => {
            plain_response(StatusCode::BAD_GATEWAY, "Tunnel evicted")
        }
        ExchangeFailure::SessionClosed | ExchangeFailure::TransportLost => {
            plain_response(StatusCode::BAD_GATEWAY, "Tunnel disconnected")
        }
    }
}

fn end_without_head_response(status: ExchangeStatus, detail: &str) -> Response<PlaneBody> {
    match status {
        ExchangeStatus::LocalUnreachable => {
            let message = if detail.is_empty() {
                "Local service unreachable".to_string()
            } else {
                format!("Local service unreachable: {}", detail)
            };
            plain_response(StatusCode::BAD_GATEWAY, &message)
        }
        _ => plain_response(StatusCode::BAD_GATEWAY, "Tunnel returned no response"),
    }
}

/// Extract the routing key (first subdomain label) from a Host header value.
fn routing_key_from_host(host: &str, base_domain: &str) -> Option<String> {
    // Remove port if present
    let host = host.split(':').next()?;

    if !host.ends_with(base_domain) {
        return None;
    }

    let prefix = host.strip_suffix(&format!(".{}", base_domain))?;

    // First label only, in case of a multi-level subdomain
    Some(prefix.split('.').next_back()?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_subdomain_label() {
        assert_eq!(
            routing_key_from_host("api.tunnel.example.com", "tunnel.example.com"),
            Some("api".to_string())
        );
        assert_eq!(
            routing_key_from_host("api.tunnel.example.com:8080", "tunnel.example.com"),
            Some("api".to_string())
        );
    }

    #[test]
    fn deep_subdomains_route_on_the_label_closest_to_the_base() {
        assert_eq!(
            routing_key_from_host("extra.api.tunnel.example.com", "tunnel.example.com"),
            Some("api".to_string())
        );
    }

    #[test]
    fn foreign_hosts_are_rejected() {
        assert_eq!(routing_key_from_host("example.org", "tunnel.example.com"), None);
        assert_eq!(
            routing_key_from_host("tunnel.example.com", "tunnel.example.com"),
            None
        );
        assert_eq!(routing_key_from_host("", "tunnel.example.com"), None);
    }
}
