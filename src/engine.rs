use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use tracing::{debug, warn};

use crate::rewrite::{RewriteStats, rewrite_answers};
use crate::upstream::{Transport, UpstreamClient};
use crate::view::ViewSet;

/// 单个请求的终态 / Terminal state of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Upstream answered; `views` is how many views applied to the client.
    Filtered { views: usize, stats: RewriteStats },
    /// Upstream exchange failed; the client got SERVFAIL.
    Failed,
}

#[derive(Clone)]
pub struct Engine {
    views: Arc<ViewSet>,
    upstream: Arc<UpstreamClient>,
    // Runtime counters / 运行时计数
    pub metrics_inflight: Arc<AtomicUsize>,
    pub metrics_total_requests: Arc<AtomicU64>,
    pub metrics_upstream_failures: Arc<AtomicU64>,
    pub metrics_dropped_records: Arc<AtomicU64>,
}

impl Engine {
    pub fn new(views: Arc<ViewSet>, upstream: UpstreamClient) -> Self {
        Self {
            views,
            upstream: Arc::new(upstream),
            metrics_inflight: Arc::new(AtomicUsize::new(0)),
            metrics_total_requests: Arc::new(AtomicU64::new(0)),
            metrics_upstream_failures: Arc::new(AtomicU64::new(0)),
            metrics_dropped_records: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn metrics_snapshot(&self) -> String {
        format!(
            "inflight={} total={} upstream_failures={} dropped_records={}",
            self.metrics_inflight.load(Ordering::Relaxed),
            self.metrics_total_requests.load(Ordering::Relaxed),
            self.metrics_upstream_failures.load(Ordering::Relaxed),
            self.metrics_dropped_records.load(Ordering::Relaxed),
        )
    }

    pub async fn handle_packet(
        &self,
        packet: &[u8],
        peer: SocketAddr,
        transport: Transport,
    ) -> anyhow::Result<Bytes> {
        self.process(packet, peer, transport).await.map(|(bytes, _)| bytes)
    }

    /// Received -> Forwarded -> {Filtered, Failed}.
    /// `Err` only when the inbound packet itself cannot be decoded.
    pub async fn process(
        &self,
        packet: &[u8],
        peer: SocketAddr,
        transport: Transport,
    ) -> anyhow::Result<(Bytes, Outcome)> {
        struct InflightGuard(Arc<AtomicUsize>);
        impl Drop for InflightGuard {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.metrics_total_requests.fetch_add(1, Ordering::Relaxed);
        self.metrics_inflight.fetch_add(1, Ordering::Relaxed);
        let _inflight_guard = InflightGuard(self.metrics_inflight.clone());

        let req = Message::from_bytes(packet).context("parse request")?;
        let client_ip = peer.ip().to_canonical();
        let start = std::time::Instant::now();

        let (raw, mut resp) = match self.upstream.exchange(packet, transport).await {
            Ok(r) => r,
            Err(err) => {
                self.metrics_upstream_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = "upstream_failed",
                    upstream = %self.upstream.addr(),
                    transport = %transport,
                    client_ip = %client_ip,
                    error = %err,
                    "upstream exchange failed"
                );
                let bytes = build_failure(&req)?;
                return Ok((bytes, Outcome::Failed));
            }
        };

        let views = self.views.views_for(client_ip);
        for v in &views {
            debug!(event = "view_applied", view = %v.name, client_ip = %client_ip, "applying view");
        }
        if views.is_empty() {
            debug!(event = "dns_response", client_ip = %client_ip, views = 0, latency_ms = start.elapsed().as_millis() as u64, "passthrough");
            let stats = RewriteStats {
                kept: resp.answers().len(),
                dropped: 0,
            };
            return Ok((raw, Outcome::Filtered { views: 0, stats }));
        }

        let stats = rewrite_answers(&mut resp, &views, self.views.default_rule());
        debug!(
            event = "dns_response",
            client_ip = %client_ip,
            views = views.len(),
            kept = stats.kept,
            dropped = stats.dropped,
            latency_ms = start.elapsed().as_millis() as u64,
            "filtered"
        );
        let outcome = Outcome::Filtered {
            views: views.len(),
            stats,
        };
        if stats.dropped == 0 {
            return Ok((raw, outcome));
        }
        self.metrics_dropped_records
            .fetch_add(stats.dropped as u64, Ordering::Relaxed);
        Ok((encode(&resp)?, outcome))
    }

    /// Wait until no request is in flight, at most `limit`. Returns whether it drained.
    pub async fn drain(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.metrics_inflight.load(Ordering::Relaxed) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn encode(msg: &Message) -> anyhow::Result<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder).context("encode response")?;
    }
    Ok(Bytes::from(out))
}

/// SERVFAIL echoing the request header and question, no records.
fn build_failure(req: &Message) -> anyhow::Result<Bytes> {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(req.op_code());
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_authoritative(false);
    msg.set_response_code(ResponseCode::ServFail);
    msg.add_queries(req.queries().iter().cloned());
    encode(&msg)
}
