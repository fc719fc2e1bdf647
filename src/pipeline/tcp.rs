use super::{Handler, PipelineCtx};
use std::sync::Arc;

/// The TCP flavor's per-connection state: the raw stream plus the peer
/// address, used by the whitelist middleware.
pub struct TcpConn {
    pub stream: tokio::net::TcpStream,
    pub peer_addr: std::net::SocketAddr,
}

#[derive(Clone)]
pub struct Route {
    handlers: Arc<Vec<Handler<TcpConn>>>,
}

/// TCP router. Unlike the HTTP flavor, which does longest-prefix matching,
/// the TCP pipeline selects `groups[0]` unconditionally — TCP has no path to
/// match against. This is an intentional asymmetry from the source (see
/// DESIGN.md open questions), not an oversight.
pub struct Router {
    groups: Vec<Route>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self { groups: Vec::new() }
    }

    pub fn group(&mut self) -> &mut Route {
        if self.groups.is_empty() {
            self.groups.push(Route {
                handlers: Arc::new(Vec::new()),
            });
        }
        &mut self.groups[0]
    }

    /// `ServeTCP`: always uses `groups[0]`'s handler list, shallow-copied
    /// into a fresh context with the terminal core handler appended.
    pub async fn serve(&self, conn: TcpConn, core_handler: Handler<TcpConn>) {
        let handlers: Arc<Vec<Handler<TcpConn>>> = match self.groups.first() {
            Some(route) => {
                let mut chain = (*route.handlers).clone();
                chain.push(core_handler);
                Arc::new(chain)
            }
            None => Arc::new(vec![core_handler]),
        };

        let mut ctx = PipelineCtx::new(conn, handlers);
        ctx.next().await;
    }
}

impl Route {
    pub fn use_handler(&mut self, handler: Handler<TcpConn>) -> &mut Self {
        Arc::make_mut(&mut self.handlers).push(handler);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};

    async fn accept_pair() -> TcpConn {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();
        TcpConn { stream, peer_addr }
    }

    #[tokio::test]
    async fn always_uses_first_registered_group() {
        let hit = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new();
        {
            let hit = hit.clone();
            router.group().use_handler(Arc::new(move |ctx: &mut PipelineCtx<TcpConn>| {
                let hit = hit.clone();
                Box::pin(async move {
                    hit.store(1, Ordering::Relaxed);
                    ctx.next().await;
                })
            }));
        }

        let core: Handler<TcpConn> = Arc::new(|_ctx| Box::pin(async move {}));
        router.serve(accept_pair().await, core).await;

        assert_eq!(hit.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn group_returns_the_same_route_on_repeated_calls() {
        let mut router = Router::new();
        router.group().use_handler(Arc::new(|_ctx| Box::pin(async move {})));
        router.group().use_handler(Arc::new(|_ctx| Box::pin(async move {})));

        assert_eq!(router.groups.len(), 1);
        assert_eq!(router.groups[0].handlers.len(), 2);
    }
}
