use super::codec::RawCodec;
use crate::proxy::context::{empty_body, BoxBody};
use crate::upstream::cluster::ClusterStore;
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::BodyExt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tonic::client::Grpc;
use tonic::codec::Streaming;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request as TonicRequest, Status};
use tower::Service;
use tracing::{error, warn};

/// Method prefixes that are never proxied downstream — mirrors the source's
/// `strings.HasPrefix(methodName, "/com.example.internal")` guard against
/// leaking internal-only RPCs through the gateway.
const BLOCKED_PREFIXES: &[&str] = &["/com.example.internal"];

/// Unknown-service gRPC reverse proxy. The gateway never knows the schema of
/// the services it fronts — every request, regardless of `:path`, is relayed
/// to a backend selected from `cluster` using the raw passthrough codec, the
/// same role `grpc.UnknownServiceHandler` plays upstream: there is no
/// per-service registration, every method is "unknown" by design.
#[derive(Clone)]
pub struct GrpcProxy {
    clusters: ClusterStore,
    cluster_name: Arc<str>,
    channels: Arc<DashMap<String, Channel>>,
}

impl GrpcProxy {
    pub fn new(clusters: ClusterStore, cluster_name: impl Into<Arc<str>>) -> Self {
        Self {
            clusters,
            cluster_name: cluster_name.into(),
            channels: Arc::new(DashMap::new()),
        }
    }

    fn channel_for(&self, endpoint: &str) -> Channel {
        if let Some(existing) = self.channels.get(endpoint) {
            return existing.clone();
        }
        let channel: Channel = Endpoint::from_shared(format!("http://{}", endpoint))
            .expect("endpoint is a valid authority")
            .connect_lazy();
        self.channels.insert(endpoint.to_string(), channel.clone());
        channel
    }

    async fn proxy(&self, req: http::Request<hyper::body::Incoming>) -> http::Response<BoxBody> {
        let path = req.uri().path().to_string();

        if BLOCKED_PREFIXES.iter().any(|p| path.starts_with(p)) {
            return status_response(Status::unimplemented("method not exposed via proxy"));
        }

        let Some(cluster) = self.clusters.get(&self.cluster_name) else {
            return status_response(Status::unavailable(format!(
                "unknown cluster: {}",
                self.cluster_name
            )));
        };
        let (target, mut guard) = match cluster.select_upstream_for_key(&path) {
            Some(v) => v,
            None => return status_response(Status::unavailable("no backend available")),
        };
        let endpoint = target.instance.endpoint().to_string();
        let channel = self.channel_for(&endpoint);

        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| path.clone().try_into().expect("path is a valid PathAndQuery"));

        let mut client = Grpc::new(channel);
        if let Err(e) = client.ready().await {
            guard.mark_failed();
            error!("grpc: upstream not ready, endpoint={}, error={}", endpoint, e);
            return status_response(Status::unavailable(format!("upstream not ready: {}", e)));
        }

        let mut tonic_req = TonicRequest::new(decode_frames(body));
        *tonic_req.metadata_mut() =
            tonic::metadata::MetadataMap::from_headers(parts.headers.clone());

        match client
            .streaming::<_, Bytes, Bytes, _>(tonic_req, path_and_query, RawCodec)
            .await
        {
            Ok(response) => {
                let (metadata, stream, _extensions) = response.into_parts();
                encode_response(metadata.into_headers(), stream)
            }
            Err(status) => {
                guard.mark_failed();
                warn!("grpc: relay failed, endpoint={}, status={}", endpoint, status);
                status_response(status)
            }
        }
    }
}

impl Service<http::Request<hyper::body::Incoming>> for GrpcProxy {
    type Response = http::Response<BoxBody>;
    type Error = std::convert::Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<hyper::body::Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.proxy(req).await) })
    }
}

/// Adapts an incoming hyper body into a `Stream<Item = Bytes>` of raw gRPC
/// message frames, handed to `tonic::client::Grpc::streaming` paired with
/// `RawCodec` so no protobuf decoding happens on the gateway's hot path.
fn decode_frames(
    body: hyper::body::Incoming,
) -> impl futures_util::Stream<Item = Bytes> + Send + 'static {
    futures_util::stream::unfold(body, |mut body| async move {
        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        return Some((data, body));
                    }
                    // trailers frame from the client side — nothing to relay.
                }
                Some(Err(_)) | None => return None,
            }
        }
    })
}

/// Relays the downstream `Streaming<Bytes>` back as the upstream response
/// body, one DATA frame per relayed message, ending in an empty trailers
/// frame (status OK — errors are surfaced via `status_response` instead,
/// since mid-stream failures abort the whole relay rather than trickle a
/// grpc-status trailer through a half-consumed body).
fn encode_response(headers: http::HeaderMap, stream: Streaming<Bytes>) -> http::Response<BoxBody> {
    let frames = futures_util::stream::unfold(stream, |mut stream| async move {
        match stream.message().await {
            Ok(Some(bytes)) => Some((Ok(http_body::Frame::data(bytes)), stream)),
            Ok(None) => None,
            Err(status) => {
                warn!("grpc: downstream stream error, status={}", status);
                None
            }
        }
    });

    let body = http_body_util::StreamBody::new(frames)
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed();

    let mut resp = http::Response::new(body);
    *resp.headers_mut() = headers;
    resp
}

fn status_response(status: Status) -> http::Response<BoxBody> {
    let mut resp = http::Response::new(empty_body());
    *resp.status_mut() = http::StatusCode::OK;
    let headers = resp.headers_mut();
    headers.insert(
        "content-type",
        http::HeaderValue::from_static("application/grpc"),
    );
    headers.insert(
        "grpc-status",
        http::HeaderValue::from_str(&(status.code() as i32).to_string()).unwrap(),
    );
    if !status.message().is_empty() {
        if let Ok(v) = http::HeaderValue::from_str(status.message()) {
            headers.insert("grpc-message", v);
        }
    }
    resp
}
