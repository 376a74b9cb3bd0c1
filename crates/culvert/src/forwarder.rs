//! Forwards incoming tunnel exchanges to the local service.
//!
//! Each exchange runs as its own task so a slow local response never blocks
//! the session's frame processing. The request body is assembled before the
//! local call goes out; the response streams back chunk by chunk.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use culvert_protocol::{is_hop_by_hop, ExchangeStatus, Frame, RequestHead, ResponseHead};

use crate::session::Outbound;

/// One unit of an inbound exchange's request payload.
///
/// `End` marks a complete request; a channel that closes without it means the
/// session tore down mid-request and nothing should be forwarded.
#[derive(Debug)]
pub(crate) enum InboundChunk {
    Data(Bytes),
    End,
}

#[derive(Debug, Error)]
enum ForwardError {
    #[error("invalid request head: {0}")]
    InvalidHead(String),

    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// Relays dispatched exchanges to a local HTTP service over a pooled client.
#[derive(Clone)]
pub struct LocalForwarder {
    local_addr: String,
    client: reqwest::Client,
}

impl LocalForwarder {
    pub fn new(local_addr: String) -> Self {
        Self {
            local_addr,
            client: reqwest::Client::builder()
                .pool_max_idle_per_host(10)
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Drive one exchange to completion: decode the head, collect the body,
    /// call the local service, and stream the response back through the
    /// session's write task.
    pub(crate) async fn run_exchange(
        self,
        exchange_id: u64,
        mut chunks: mpsc::UnboundedReceiver<InboundChunk>,
        outbound: mpsc::Sender<Outbound>,
    ) {
        let head = match chunks.recv().await {
            Some(InboundChunk::Data(bytes)) => match RequestHead::decode(&bytes) {
                Ok(head) => head,
                Err(e) => {
                    tracing::error!(exchange_id, "Malformed request head: {}", e);
                    send_end(&outbound, exchange_id, ExchangeStatus::Aborted, "bad head").await;
                    return;
                }
            },
            _ => return, // cancelled before the head arrived
        };

        let mut body = Vec::new();
        let mut complete = false;
        while let Some(chunk) = chunks.recv().await {
            match chunk {
                InboundChunk::Data(bytes) => body.extend_from_slice(&bytes),
                InboundChunk::End => {
                    complete = true;
                    break;
                }
            }
        }
        if !complete {
            tracing::debug!(exchange_id, "Session ended mid-request; dropping exchange");
            return;
        }

        tracing::debug!(
            exchange_id,
            "Forwarding {} {} ({} body bytes)",
            head.method,
            head.uri,
            body.len()
        );

        match self.forward(&head, body).await {
            Ok(mut response) => {
                let response_head = ResponseHead {
                    status: response.status().as_u16(),
                    headers: response
                        .headers()
                        .iter()
                        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
                        .filter_map(|(name, value)| {
                            value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
                        })
                        .collect(),
                };

                let head_bytes = match response_head.encode() {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::error!(exchange_id, "Failed to encode response head: {}", e);
                        send_end(&outbound, exchange_id, ExchangeStatus::Aborted, "encode").await;
                        return;
                    }
                };
                if outbound
                    .send(Outbound::Frame(Frame::data(exchange_id, head_bytes)))
                    .await
                    .is_err()
                {
                    return;
                }

                loop {
                    match response.chunk().await {
                        Ok(Some(chunk)) => {
                            if outbound
                                .send(Outbound::Frame(Frame::data(exchange_id, chunk)))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(exchange_id, "Local response stream failed: {}", e);
                            send_end(
                                &outbound,
                                exchange_id,
                                ExchangeStatus::Aborted,
                                &e.to_string(),
                            )
                            .await;
                            return;
                        }
                    }
                }

                send_end(&outbound, exchange_id, ExchangeStatus::Ok, "").await;
            }
            Err(ForwardError::Request(e)) if e.is_connect() => {
                tracing::warn!(
                    exchange_id,
                    "Local service at {} unreachable: {}",
                    self.local_addr,
                    e
                );
                send_end(
                    &outbound,
                    exchange_id,
                    ExchangeStatus::LocalUnreachable,
                    &e.to_string(),
                )
                .await;
            }
            Err(e) => {
                tracing::warn!(exchange_id, "Failed to forward exchange: {}", e);
                send_end(&outbound, exchange_id, ExchangeStatus::Aborted, &e.to_string()).await;
            }
        }
    }

    /// Issue the local request, filtering hop-by-hop headers.
    async fn forward(&self, head: &RequestHead, body: Vec<u8>) -> Result<reqwest::Response, ForwardError> {
        let local_url = format!("http://{}{}", self.local_addr, head.uri);

        let method = reqwest::Method::from_bytes(head.method.as_bytes())
            .map_err(|e| ForwardError::InvalidHead(e.to_string()))?;

        let mut request = self.client.request(method, &local_url);
        for (name, value) in &head.headers {
            // The local service gets its own Host header from reqwest.
            if name.eq_ignore_ascii_case("host") || is_hop_by_hop(name) {
                continue;
            }
            request = request.header(name, value);
        }

        if !body.is_empty() {
            request = request.body(body);
        }

        Ok(request.send().await?)
    }
}

async fn send_end(
    outbound: &mpsc::Sender<Outbound>,
    exchange_id: u64,
    status: ExchangeStatus,
    detail: &str,
) {
    let _ = outbound
        .send(Outbound::Frame(Frame::end(exchange_id, status, detail)))
        .await;
}
