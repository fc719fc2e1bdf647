use crate::config::TcpProxyConfig;
use crate::error::GatewayError;
use crate::pipeline::tcp::{Router, TcpConn};
use crate::pipeline::PipelineCtx;
use crate::upstream::cluster::ClusterStore;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

/// Director + data-plane for a single TCP listener: resolves a backend via
/// the cluster's load balancer, dials with a timeout, applies keepalive and
/// an overall deadline, and splices the two halves bidirectionally.
///
/// Mirrors `tcp_proxy.go`'s shape: dial-with-timeout, then relay until
/// either side closes or the deadline elapses. Half-close is observed
/// independently on each direction (see `splice`) rather than torn down
/// as a unit, so a client that shuts its write side can still read a
/// trailing response.
pub struct TcpProxy {
    pub config: Arc<TcpProxyConfig>,
    /// Resolved by name on every connection (not cached) — mirrors how
    /// `proxy::handler` looks clusters up from the shared store, so a
    /// cluster registered later via etcd still lights up the listener.
    pub clusters: ClusterStore,
    pub router: Arc<Router>,
}

impl TcpProxy {
    pub fn new(config: Arc<TcpProxyConfig>, clusters: ClusterStore, router: Arc<Router>) -> Self {
        Self {
            config,
            clusters,
            router,
        }
    }

    pub async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let conn = TcpConn { stream, peer_addr };
        let clusters = self.clusters.clone();
        let config = self.config.clone();

        let core = move |ctx: &mut PipelineCtx<TcpConn>| {
            let clusters = clusters.clone();
            let config = config.clone();
            Box::pin(async move {
                // Outcome stashed under the shared `status_code` context key so
                // a wrapping `circuit_breaker_handler` can inspect it the same
                // way the HTTP response modifier does for its own breaker.
                match relay(ctx, &clusters, &config).await {
                    Ok(()) => ctx.set(crate::pipeline::keys::STATUS_CODE, 200u16),
                    Err(e) => {
                        warn!("tcp: relay failed, peer={}, error={}", ctx.conn.peer_addr, e);
                        ctx.set(crate::pipeline::keys::STATUS_CODE, 502u16);
                    }
                }
            }) as futures_util::future::BoxFuture<'_, ()>
        };

        self.router.serve(conn, Arc::new(core)).await;
    }
}

async fn relay(
    ctx: &mut PipelineCtx<TcpConn>,
    clusters: &ClusterStore,
    config: &TcpProxyConfig,
) -> Result<()> {
    let peer_addr = ctx.conn.peer_addr;

    let cluster = clusters
        .get(&config.cluster)
        .ok_or_else(|| GatewayError::EmptyPool(config.cluster.clone()))?;

    let (target, mut guard) = cluster
        .select_upstream()
        .ok_or_else(|| GatewayError::EmptyPool(cluster.name().to_string()))?;

    let dial_timeout = Duration::from_secs(config.dial_timeout_secs);
    let endpoint = target.instance.endpoint().to_string();

    debug!("tcp: dialing, peer={}, upstream={}", peer_addr, endpoint);

    let upstream = match tokio::time::timeout(dial_timeout, TcpStream::connect(&endpoint)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            guard.mark_failed();
            return Err(GatewayError::StreamRelay(format!(
                "dial {} failed: {}",
                endpoint, e
            ))
            .into());
        }
        Err(_) => {
            guard.mark_failed();
            return Err(GatewayError::StreamRelay(format!(
                "dial {} timed out after {:?}",
                endpoint, dial_timeout
            ))
            .into());
        }
    };

    let keepalive = Duration::from_secs(config.keepalive_secs);
    if let Err(e) = set_keepalive(&upstream, keepalive) {
        warn!("tcp: failed to set upstream keepalive, endpoint={}, error={}", endpoint, e);
    }

    let deadline = Duration::from_secs(config.deadline_secs);
    let result = tokio::time::timeout(deadline, splice(&mut ctx.conn.stream, upstream)).await;

    match result {
        Ok(Ok(())) => {
            drop(guard);
            Ok(())
        }
        Ok(Err(e)) => {
            guard.mark_failed();
            Err(e.context(format!("relay peer={} upstream={}", peer_addr, endpoint)))
        }
        Err(_) => {
            guard.mark_failed();
            Err(GatewayError::StreamRelay(format!(
                "relay deadline ({:?}) exceeded, peer={}, upstream={}",
                deadline, peer_addr, endpoint
            ))
            .into())
        }
    }
}

/// Splice client<->upstream bidirectionally. Each half is driven independently
/// so that one side shutting its write direction (half-close) doesn't force
/// the other direction closed — `copy_bidirectional` completes only once both
/// halves have reached EOF or errored.
async fn splice(client: &mut TcpStream, mut upstream: TcpStream) -> Result<()> {
    match tokio::io::copy_bidirectional(client, &mut upstream).await {
        Ok((from_client, from_upstream)) => {
            debug!(
                "tcp: splice done, client_to_upstream={}b, upstream_to_client={}b",
                from_client, from_upstream
            );
            Ok(())
        }
        Err(e) => {
            let _ = upstream.shutdown().await;
            Err(e).context("bidirectional splice failed")
        }
    }
}

fn set_keepalive(stream: &TcpStream, period: Duration) -> std::io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(period))?;
    Ok(())
}
