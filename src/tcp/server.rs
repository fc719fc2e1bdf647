use anyhow::Result;
use futures_util::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A per-connection handler, invoked once per accepted connection with the
/// stream (already configured with read/write deadlines and keepalive) and
/// the peer address.
pub type TcpHandler =
    Arc<dyn Fn(TcpStream, SocketAddr) -> BoxFuture<'static, ()> + Send + Sync>;

/// TCP accept loop: owns the listener, applies configured read/write
/// timeouts and keepalive per connection, spawns one task per connection,
/// and supports graceful shutdown with a drain phase — mirroring
/// `server::run_proxy_server`'s shape (`Semaphore`-counted in-flight,
/// `AtomicI64` active gauge, `select!` against a shutdown `Notify`).
pub struct TcpServer {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub keepalive: Option<Duration>,
}

impl Default for TcpServer {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: None,
            keepalive: Some(Duration::from_secs(3600)),
        }
    }
}

impl TcpServer {
    pub async fn serve(
        &self,
        listen: &str,
        handler: TcpHandler,
        shutdown: Arc<Notify>,
    ) -> Result<()> {
        let addr: SocketAddr = listen.parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!("tcp: listening, addr={}", addr);

        let in_flight = Arc::new(Semaphore::new(0));
        let active_conns = Arc::new(AtomicI64::new(0));

        loop {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = shutdown.notified() => {
                    info!("tcp: stop accepting new connections, draining...");
                    break;
                }
            };

            let (stream, peer_addr) = match accepted {
                Ok(v) => {
                    metrics::counter!("gateway_tcp_connections_total", "status" => "accepted")
                        .increment(1);
                    v
                }
                Err(e) => {
                    error!("tcp: accept failed, error={}", e);
                    metrics::counter!("gateway_tcp_connections_total", "status" => "error")
                        .increment(1);
                    continue;
                }
            };

            if let Some(keepalive) = self.keepalive {
                if let Err(e) = set_keepalive(&stream, keepalive) {
                    error!("tcp: failed to set keepalive, peer={}, error={}", peer_addr, e);
                }
            }

            metrics::gauge!("gateway_tcp_connections_active").increment(1.0);
            active_conns.fetch_add(1, Ordering::Relaxed);
            in_flight.add_permits(1);

            let handler = handler.clone();
            let in_flight = in_flight.clone();
            let active_conns = active_conns.clone();

            tokio::spawn(async move {
                handler(stream, peer_addr).await;
                metrics::gauge!("gateway_tcp_connections_active").decrement(1.0);
                active_conns.fetch_sub(1, Ordering::Relaxed);
                let _ = in_flight.acquire().await;
            });
        }

        let active = active_conns.load(Ordering::Relaxed);
        if active > 0 {
            info!("tcp: waiting for {} active connections to drain", active);
            let drain = async {
                loop {
                    if active_conns.load(Ordering::Relaxed) == 0 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            };
            if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
                info!(
                    "tcp: drain timeout ({}s), {} connections still active",
                    DRAIN_TIMEOUT.as_secs(),
                    active_conns.load(Ordering::Relaxed)
                );
            }
        }

        Ok(())
    }
}

fn set_keepalive(stream: &TcpStream, period: Duration) -> std::io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(period))?;
    Ok(())
}
