use super::GrpcProxy;
use crate::upstream::cluster::ClusterStore;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower::Service;
use tracing::{error, info};

/// Runs the gRPC unknown-service reverse proxy: an HTTP/2-only listener that
/// hands every request, regardless of `:path`, to `GrpcProxy` for relay to
/// the backing cluster. There is no per-service route table — the gateway
/// is deliberately oblivious to the schemas it fronts (see `grpc::proxy`).
pub async fn run_grpc_server(
    listen: &str,
    clusters: ClusterStore,
    cluster_name: String,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("grpc: listening, addr={}", addr);

    let proxy = GrpcProxy::new(clusters, cluster_name);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("grpc: stop accepting new connections");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("grpc: accept failed, error={}", e);
                continue;
            }
        };

        let proxy = proxy.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let mut proxy = proxy.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(
                        Service::call(&mut proxy, req).await.unwrap(),
                    )
                }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("grpc: connection error, peer={}, error={}", peer_addr, e);
                }
            }
        });
    }

    Ok(())
}
