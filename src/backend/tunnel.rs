//! Direct CONNECT tunnels
//!
//! Dials the target and relays bytes between client and target until either
//! side closes or the tunnel sits idle too long.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::error::{ProxyError, Result};
use crate::stats::ProxyStats;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Time the still-open direction gets to finish after the other closes
const HALF_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Plain tunnel backend
pub struct LocalStreamBackend {
    connect_timeout: Duration,
    idle_timeout: Duration,
    stats: Arc<ProxyStats>,
}

impl LocalStreamBackend {
    pub fn new(connect_timeout: Duration, idle_timeout: Duration, stats: Arc<ProxyStats>) -> Self {
        Self {
            connect_timeout,
            idle_timeout,
            stats,
        }
    }

    /// Dial the tunnel target
    #[instrument(skip(self))]
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        debug!("Establishing direct tunnel to {}:{}", host, port);
        match timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(ProxyError::Connect(format!("{}:{}: {}", host, port, e))),
            Err(_) => Err(ProxyError::Connect(format!(
                "{}:{}: connect timed out",
                host, port
            ))),
        }
    }

    /// Relay bytes between client and target; both are closed on return
    #[instrument(skip(self, client, remote))]
    pub async fn stream<C, S>(&self, client: C, remote: S) -> Result<(u64, u64)>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (sent, received) = relay(client, remote, self.idle_timeout).await?;
        self.stats.record_bytes_up(sent);
        self.stats.record_bytes_down(received);
        Ok((sent, received))
    }
}

/// Copy data bidirectionally between two streams.
///
/// Returns bytes moved client to server and server to client. Once either
/// side closes or errors, the other direction gets `HALF_CLOSE_GRACE` to
/// drain and both streams are then closed. The relay also ends when nothing
/// moves for `idle_timeout`.
pub async fn relay<C, S>(client: C, server: S, idle_timeout: Duration) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);
    let activity = Activity::new();
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let client_to_server = async {
        let result = pump(&mut client_read, &mut server_write, &activity, &sent).await;
        let _ = server_write.shutdown().await;
        result
    };

    let server_to_client = async {
        let result = pump(&mut server_read, &mut client_write, &activity, &received).await;
        let _ = client_write.shutdown().await;
        result
    };

    tokio::pin!(client_to_server, server_to_client);
    let idle = activity.idle_for(idle_timeout);
    tokio::pin!(idle);

    let first = tokio::select! {
        up = &mut client_to_server => Closed::Client(up),
        down = &mut server_to_client => Closed::Server(down),
        _ = &mut idle => Closed::Idle,
    };

    match first {
        Closed::Client(up) => {
            if let Err(e) = up {
                debug!("Client to server copy ended: {}", e);
            }
            match timeout(HALF_CLOSE_GRACE, &mut server_to_client).await {
                Ok(Err(e)) => debug!("Server to client copy ended: {}", e),
                Ok(Ok(())) => {}
                Err(_) => debug!("Client closed, dropping server side"),
            }
        }
        Closed::Server(down) => {
            if let Err(e) = down {
                debug!("Server to client copy ended: {}", e);
            }
            match timeout(HALF_CLOSE_GRACE, &mut client_to_server).await {
                Ok(Err(e)) => debug!("Client to server copy ended: {}", e),
                Ok(Ok(())) => {}
                Err(_) => debug!("Server closed, dropping client side"),
            }
        }
        Closed::Idle => {
            debug!(idle_secs = idle_timeout.as_secs(), "Tunnel idle, closing");
        }
    }

    let bytes_sent = sent.load(Ordering::Relaxed);
    let bytes_received = received.load(Ordering::Relaxed);
    debug!(
        bytes_sent = bytes_sent,
        bytes_received = bytes_received,
        "Tunnel closed"
    );

    Ok((bytes_sent, bytes_received))
}

/// Which event ended the relay first
enum Closed {
    Client(io::Result<()>),
    Server(io::Result<()>),
    Idle,
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, activity: &Activity, total: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        activity.touch();
        total.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Last time any byte moved through a tunnel
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_ms
            .store(self.origin.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Resolves once nothing has moved for `limit`
    async fn idle_for(&self, limit: Duration) {
        loop {
            let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
            let idle = self.origin.elapsed().saturating_sub(last);
            if idle >= limit {
                return;
            }
            tokio::time::sleep(limit - idle).await;
        }
    }
}
