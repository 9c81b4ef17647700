use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

/// 入站查询所使用的传输协议，转发时沿用 / Transport the query arrived on; reused upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        })
    }
}

const MAX_MESSAGE: usize = 64 * 1024;

/// 单次上游交换，不重试 / One exchange per call, no retry, no pooling.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send `query` and return the raw reply together with its decoded form.
    /// The reply must decode and carry the query's id.
    pub async fn exchange(&self, query: &[u8], transport: Transport) -> anyhow::Result<(Bytes, Message)> {
        if query.len() < 2 {
            anyhow::bail!("dns packet too short");
        }
        let fut = async {
            match transport {
                Transport::Udp => self.exchange_udp(query).await,
                Transport::Tcp => self.exchange_tcp(query).await,
            }
        };
        let raw = match timeout(self.timeout, fut).await {
            Ok(res) => res?,
            Err(_) => anyhow::bail!("{} upstream timeout after {:?}", transport, self.timeout),
        };

        let msg = Message::from_bytes(&raw).context("decode upstream reply")?;
        let query_id = u16::from_be_bytes([query[0], query[1]]);
        if msg.id() != query_id {
            anyhow::bail!("upstream reply id {} does not match query id {}", msg.id(), query_id);
        }
        Ok((raw, msg))
    }

    async fn exchange_udp(&self, query: &[u8]) -> anyhow::Result<Bytes> {
        let (domain, bind): (Domain, SocketAddr) = if self.addr.is_ipv4() {
            (Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        } else {
            (Domain::IPV6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)))
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
        if let Err(e) = socket.set_recv_buffer_size(MAX_MESSAGE) {
            warn!("failed to set udp recv buffer size: {}", e);
        }
        socket.bind(&bind.into()).context("bind")?;
        socket.set_nonblocking(true).context("set nonblocking")?;
        let sock = UdpSocket::from_std(socket.into()).context("from_std")?;

        sock.connect(self.addr).await.context("connect upstream")?;
        sock.send(query).await.context("send to upstream")?;

        let mut buf = vec![0u8; MAX_MESSAGE];
        let size = sock.recv(&mut buf).await.context("recv from upstream")?;
        debug!(upstream = %self.addr, bytes = size, "udp reply");
        buf.truncate(size);
        Ok(Bytes::from(buf))
    }

    async fn exchange_tcp(&self, query: &[u8]) -> anyhow::Result<Bytes> {
        if query.len() > u16::MAX as usize {
            anyhow::bail!("query too large for tcp framing");
        }
        let mut stream = TcpStream::connect(self.addr)
            .await
            .context("connect upstream")?;
        let mut out = Vec::with_capacity(2 + query.len());
        out.extend_from_slice(&(query.len() as u16).to_be_bytes());
        out.extend_from_slice(query);
        stream.write_all(&out).await.context("write to upstream")?;

        let mut len_buf = [0u8; 2];
        stream
            .read_exact(&mut len_buf)
            .await
            .context("read reply length")?;
        let resp_len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; resp_len];
        stream
            .read_exact(&mut buf)
            .await
            .context("read reply body")?;
        debug!(upstream = %self.addr, bytes = resp_len, "tcp reply");
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::{Name, RecordType};
    use hickory_proto::serialize::binary::BinEncodable;
    use std::str::FromStr;
    use tokio::net::TcpListener;

    fn query_bytes(id: u16) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        msg.to_bytes().unwrap()
    }

    fn reply_for(query: &[u8], id_override: Option<u16>) -> Vec<u8> {
        let req = Message::from_bytes(query).unwrap();
        let mut resp = Message::new();
        resp.set_id(id_override.unwrap_or(req.id()));
        resp.set_message_type(MessageType::Response);
        resp.add_queries(req.queries().to_vec());
        resp.to_bytes().unwrap()
    }

    #[tokio::test]
    async fn udp_exchange_returns_matching_reply() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let reply = reply_for(&buf[..n], None);
            server.send_to(&reply, peer).await.unwrap();
        });

        let client = UpstreamClient::new(addr, Duration::from_secs(2));
        let (raw, msg) = client.exchange(&query_bytes(0x1234), Transport::Udp).await.unwrap();
        assert_eq!(msg.id(), 0x1234);
        assert_eq!(msg.message_type(), MessageType::Response);
        assert_eq!(&raw[..2], &0x1234u16.to_be_bytes());
    }

    #[tokio::test]
    async fn tcp_exchange_uses_length_prefix() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut buf).await.unwrap();
            let reply = reply_for(&buf, None);
            stream.write_all(&(reply.len() as u16).to_be_bytes()).await.unwrap();
            stream.write_all(&reply).await.unwrap();
        });

        let client = UpstreamClient::new(addr, Duration::from_secs(2));
        let (_, msg) = client.exchange(&query_bytes(7), Transport::Tcp).await.unwrap();
        assert_eq!(msg.id(), 7);
    }

    #[tokio::test]
    async fn id_mismatch_is_an_error() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let reply = reply_for(&buf[..n], Some(999));
            server.send_to(&reply, peer).await.unwrap();
        });

        let client = UpstreamClient::new(addr, Duration::from_secs(2));
        let err = client.exchange(&query_bytes(1), Transport::Udp).await.unwrap_err();
        assert!(err.to_string().contains("does not match"), "{err}");
    }

    #[tokio::test]
    async fn tcp_connection_refused_is_an_error() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let client = UpstreamClient::new(addr, Duration::from_secs(2));
        assert!(client.exchange(&query_bytes(1), Transport::Tcp).await.is_err());
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let client = UpstreamClient::new(addr, Duration::from_millis(100));
        let err = client.exchange(&query_bytes(1), Transport::Udp).await.unwrap_err();
        assert!(err.to_string().contains("timeout"), "{err}");
        drop(server);
    }
}
