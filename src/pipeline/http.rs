use super::{Handler, PipelineCtx};
use std::sync::Arc;

/// One registered route: a path prefix plus its ordered handler list.
/// `route.use_handler(...)` appends; a route is registered with the router
/// exactly once, at `Group(prefix)` time.
#[derive(Clone)]
pub struct Route {
    pub prefix: String,
    handlers: Arc<Vec<Handler<HttpConn>>>,
}

/// The HTTP flavor's per-request connection: request/response pair. Kept
/// generic-friendly (not hyper-specific) so the cursor engine in
/// `pipeline::mod` stays protocol-agnostic; callers adapt their own
/// request/response types at the boundary.
pub struct HttpConn {
    pub method: String,
    pub path: String,
    pub status: Option<u16>,
}

/// Router holding every registered route. Routes are registered before the
/// server starts; registering after first request is undefined behavior
/// (matches the source's documented contract — not enforced at runtime).
pub struct Router {
    routes: Vec<Route>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// `Group(prefix)` — registers and returns a new route, or returns the
    /// already-registered route for that exact prefix.
    pub fn group(&mut self, prefix: impl Into<String>) -> &mut Route {
        let prefix = prefix.into();
        if let Some(idx) = self.routes.iter().position(|r| r.prefix == prefix) {
            return &mut self.routes[idx];
        }
        self.routes.push(Route {
            prefix,
            handlers: Arc::new(Vec::new()),
        });
        self.routes.last_mut().unwrap()
    }

    /// Longest-prefix match; ties resolved by first-registered (earlier
    /// wins, since we keep the first strictly-longer match found).
    fn match_route(&self, path: &str) -> Option<&Route> {
        let mut best: Option<&Route> = None;
        for route in &self.routes {
            if path.starts_with(route.prefix.as_str())
                && best.map(|b| route.prefix.len() > b.prefix.len()).unwrap_or(true)
            {
                best = Some(route);
            }
        }
        best
    }

    /// `ServeHTTP`: match the route, shallow-copy its handler list into a
    /// fresh context, append the terminal core handler, reset the cursor,
    /// and drive the chain with `next()`.
    pub async fn serve(&self, conn: HttpConn, core_handler: Handler<HttpConn>) {
        let handlers: Arc<Vec<Handler<HttpConn>>> = match self.match_route(&conn.path) {
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
    pub fn use_handler(&mut self, handler: Handler<HttpConn>) -> &mut Self {
        Arc::make_mut(&mut self.handlers).push(handler);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn conn(path: &str) -> HttpConn {
        HttpConn {
            method: "GET".to_string(),
            path: path.to_string(),
            status: None,
        }
    }

    fn marking_handler(hit: Arc<AtomicUsize>, id: usize) -> Handler<HttpConn> {
        Arc::new(move |ctx: &mut PipelineCtx<HttpConn>| {
            let hit = hit.clone();
            Box::pin(async move {
                hit.store(id, Ordering::Relaxed);
                ctx.next().await;
            })
        })
    }

    #[tokio::test]
    async fn longest_prefix_wins_over_shorter_match() {
        let hit = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new();
        router.group("/api").use_handler(marking_handler(hit.clone(), 1));
        router.group("/api/v2").use_handler(marking_handler(hit.clone(), 2));

        let core: Handler<HttpConn> = Arc::new(|_ctx| Box::pin(async move {}));
        router.serve(conn("/api/v2/users"), core).await;

        assert_eq!(hit.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn unmatched_path_falls_straight_through_to_core() {
        let router = Router::new();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        let core: Handler<HttpConn> = Arc::new(move |_ctx| {
            let ran = ran2.clone();
            Box::pin(async move {
                ran.store(true, Ordering::Relaxed);
            })
        });

        router.serve(conn("/nowhere"), core).await;

        assert!(ran.load(Ordering::Relaxed));
    }

    #[test]
    fn group_is_idempotent_for_the_same_prefix() {
        let mut router = Router::new();
        router.group("/api").use_handler(Arc::new(|_ctx| Box::pin(async move {})));
        router.group("/api").use_handler(Arc::new(|_ctx| Box::pin(async move {})));

        assert_eq!(router.routes.len(), 1);
        assert_eq!(router.routes[0].handlers.len(), 2);
    }
}
