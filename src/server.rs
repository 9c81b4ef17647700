use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::upstream::Transport;

const MAX_MESSAGE: usize = 64 * 1024;
/// accept 因 fd/内存耗尽失败时的退避时间
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// 在 Unix 上创建带 SO_REUSEPORT 的 UDP socket，每个 worker 一个
#[cfg(unix)]
pub fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use libc::{SO_REUSEPORT, SOL_SOCKET, c_int, c_void, setsockopt, socklen_t};
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let val: c_int = 1;
    let fd = socket.as_raw_fd();
    let ret = unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        debug!(addr = %addr, "SO_REUSEPORT unavailable, continuing without it");
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Bind the UDP sockets for `workers` receive loops. On unix each worker owns a
/// SO_REUSEPORT socket; elsewhere they share one.
pub fn bind_udp(addr: SocketAddr, workers: usize) -> anyhow::Result<Vec<Arc<UdpSocket>>> {
    let workers = workers.max(1);
    let mut sockets = Vec::with_capacity(workers);

    #[cfg(unix)]
    {
        for worker_id in 0..workers {
            let std_socket = create_reuseport_udp_socket(addr)
                .with_context(|| format!("create udp socket for worker {}", worker_id))?;
            sockets.push(Arc::new(UdpSocket::from_std(std_socket)?));
        }
    }

    #[cfg(not(unix))]
    {
        use socket2::{Domain, Protocol, Socket, Type};
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
        let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
        let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
        socket.set_nonblocking(true).context("set nonblocking")?;
        socket.bind(&addr.into()).context("bind socket")?;
        let shared = Arc::new(UdpSocket::from_std(socket.into()).context("from_std")?);
        for _ in 0..workers {
            sockets.push(Arc::clone(&shared));
        }
    }

    Ok(sockets)
}

/// UDP 接收循环：每个报文一个任务 / One spawned task per datagram; exits on shutdown.
pub async fn run_udp_worker(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    engine: Engine,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(MAX_MESSAGE);

    loop {
        buf.resize(MAX_MESSAGE, 0);
        tokio::select! {
            res = socket.recv_from(&mut buf) => {
                let (len, peer) = match res {
                    Ok(r) => r,
                    Err(err) => {
                        // ICMP errors surface here on some platforms; keep receiving.
                        debug!(worker_id, error = %err, "udp recv error");
                        continue;
                    }
                };
                buf.truncate(len);
                let packet = buf.split().freeze();
                let engine = engine.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    match engine.handle_packet(&packet, peer, Transport::Udp).await {
                        Ok(resp) => {
                            if let Err(err) = socket.send_to(&resp, peer).await {
                                debug!(peer = %peer, error = %err, "udp send failed");
                            }
                        }
                        Err(err) => debug!(peer = %peer, error = %err, "dropping undecodable query"),
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(worker_id, "udp worker shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// TCP accept 循环 / Accept loop; the listener is dropped when shutdown flips.
pub async fn run_tcp(
    listener: TcpListener,
    engine: Engine,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(r) => r,
                    Err(err) => {
                        let backoff = accept_backoff(&err);
                        warn!(error = %err, backoff = ?backoff, "tcp accept failed");
                        if let Some(delay) = backoff {
                            tokio::time::sleep(delay).await;
                        }
                        continue;
                    }
                };
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_tcp_conn(stream, peer, engine).await {
                        debug!(peer = %peer, error = %err, "tcp connection closed with error");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("tcp listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Accept errors never end the loop. Descriptor or memory exhaustion
/// (EMFILE, ENFILE, ENOBUFS, ENOMEM) gets a short pause so the loop does not spin.
fn accept_backoff(err: &io::Error) -> Option<Duration> {
    match err.raw_os_error() {
        Some(code) if is_resource_exhausted(code) => Some(ACCEPT_BACKOFF),
        _ => None,
    }
}

#[cfg(unix)]
fn is_resource_exhausted(code: i32) -> bool {
    matches!(
        code,
        libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM
    )
}

#[cfg(not(unix))]
fn is_resource_exhausted(_code: i32) -> bool {
    false
}

/// 等待停止信号，期间监听器各自独立退出 / Wait for `stop` while listeners run.
/// A listener that exits (cleanly or not) is logged and the rest keep serving;
/// returns early only when every listener is gone. Yields the first failure.
pub async fn supervise<F>(
    listeners: &mut JoinSet<anyhow::Result<()>>,
    stop: F,
) -> Option<anyhow::Error>
where
    F: Future<Output = ()>,
{
    tokio::pin!(stop);
    let mut failure = None;
    loop {
        tokio::select! {
            _ = &mut stop => return failure,
            res = listeners.join_next() => match res {
                Some(res) => {
                    if let Some(err) = listener_error(res) {
                        failure.get_or_insert(err);
                    }
                }
                None => {
                    warn!("all listeners exited");
                    return failure;
                }
            },
        }
    }
}

pub fn listener_error(res: Result<anyhow::Result<()>, JoinError>) -> Option<anyhow::Error> {
    let err = match res {
        Ok(Ok(())) => {
            debug!("listener exited");
            return None;
        }
        Ok(Err(err)) => err,
        Err(join_err) => anyhow::Error::new(join_err).context("listener task panicked"),
    };
    error!(error = %format!("{err:#}"), "listener exited");
    Some(err)
}

async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    engine: Engine,
) -> anyhow::Result<()> {
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        stream.read_exact(&mut buf).await?;

        let resp = engine.handle_packet(&buf, peer, Transport::Tcp).await?;
        if resp.len() > u16::MAX as usize {
            anyhow::bail!("response too large for tcp framing");
        }
        stream.write_all(&(resp.len() as u16).to_be_bytes()).await?;
        stream.write_all(&resp).await?;
    }
}
