pub mod circuit_breaker;
pub mod flowcount;
pub mod http;
pub mod rate_limit;
pub mod tcp;
pub mod whitelist;

use futures_util::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Cursor ceiling. No route may carry more than 63 handlers; values `>= 63`
/// mean "aborted". Doubles as a soft cap on pipeline depth.
pub const ABORT_INDEX: i8 = 63;

/// A pipeline handler. Handlers are `Arc`-shared across every request on a
/// route (built once at route-compile time); only the `PipelineCtx` is
/// per-request. Each invocation may run work and fall through (pre-only),
/// call `ctx.next()` itself and run more work after (wrap), or call
/// `ctx.abort()` to short-circuit the rest of the chain.
pub type Handler<C> = Arc<dyn for<'a> Fn(&'a mut PipelineCtx<C>) -> BoxFuture<'a, ()> + Send + Sync>;

/// Per-request/connection pipeline context. `conn` is the HTTP request/
/// response pair or the raw TCP connection, generic over `C` so the two
/// flavors (`pipeline::http`, `pipeline::tcp`) share this one cursor engine.
pub struct PipelineCtx<C> {
    pub conn: C,
    handlers: Arc<Vec<Handler<C>>>,
    cursor: i8,
    values: HashMap<&'static str, Box<dyn Any + Send>>,
}

impl<C> PipelineCtx<C> {
    pub fn new(conn: C, handlers: Arc<Vec<Handler<C>>>) -> Self {
        Self {
            conn,
            handlers,
            cursor: -1,
            values: HashMap::new(),
        }
    }

    /// Increment the cursor; while it indexes a real handler, invoke it and
    /// advance. Mirrors the Go `Next()` loop exactly — this is what lets a
    /// handler that never calls `next()` still have the outer loop continue.
    pub fn next<'a>(&'a mut self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            loop {
                self.cursor += 1;
                if self.cursor < 0 || (self.cursor as usize) >= self.handlers.len() {
                    break;
                }
                let handler = self.handlers[self.cursor as usize].clone();
                (handler)(self).await;
            }
        })
    }

    pub fn abort(&mut self) {
        self.cursor = ABORT_INDEX;
    }

    pub fn is_aborted(&self) -> bool {
        self.cursor >= ABORT_INDEX
    }

    pub fn reset(&mut self) {
        self.cursor = -1;
    }

    pub fn set(&mut self, key: &'static str, value: impl Any + Send) {
        self.values.insert(key, Box::new(value));
    }

    pub fn get<T: 'static>(&self, key: &'static str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }
}

/// Well-known context keys shared between the HTTP response modifier and the
/// circuit breaker handler (see DESIGN NOTES: "ambient context keys").
pub mod keys {
    pub const STATUS_CODE: &str = "status_code";
    pub const RESPONSE_PAYLOAD: &str = "response_payload";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler<()> {
        Arc::new(move |ctx: &mut PipelineCtx<()>| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::Relaxed);
                ctx.next().await;
            })
        })
    }

    #[tokio::test]
    async fn invokes_handlers_in_order_when_none_abort() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handlers: Vec<Handler<()>> = (0..3)
            .map(|i| {
                let order = order.clone();
                Arc::new(move |ctx: &mut PipelineCtx<()>| {
                    let order = order.clone();
                    Box::pin(async move {
                        order.lock().unwrap().push(i);
                        ctx.next().await;
                    }) as BoxFuture<'_, ()>
                }) as Handler<()>
            })
            .collect();

        let mut ctx = PipelineCtx::new((), Arc::new(handlers));
        ctx.next().await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn abort_short_circuits_remaining_handlers() {
        let count = Arc::new(AtomicUsize::new(0));
        let aborting: Handler<()> = Arc::new(|ctx: &mut PipelineCtx<()>| {
            Box::pin(async move {
                ctx.abort();
            })
        });

        let handlers = vec![aborting, counting_handler(count.clone())];
        let mut ctx = PipelineCtx::new((), Arc::new(handlers));
        ctx.next().await;

        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert!(ctx.is_aborted());
    }

    #[tokio::test]
    async fn handler_that_never_calls_next_still_lets_outer_loop_continue() {
        let count = Arc::new(AtomicUsize::new(0));
        // The first handler does its work but never awaits `next()` itself —
        // the outer `next()` loop must still advance past it, not stall.
        let silent: Handler<()> = Arc::new(|_ctx: &mut PipelineCtx<()>| Box::pin(async move {}));

        let handlers = vec![silent, counting_handler(count.clone())];
        let mut ctx = PipelineCtx::new((), Arc::new(handlers));
        ctx.next().await;

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn context_values_round_trip() {
        let mut ctx: PipelineCtx<()> = PipelineCtx::new((), Arc::new(Vec::new()));
        ctx.set(keys::STATUS_CODE, 200u16);
        assert_eq!(ctx.get::<u16>(keys::STATUS_CODE), Some(&200));
        assert_eq!(ctx.get::<String>(keys::RESPONSE_PAYLOAD), None);
    }
}
