use super::{keys, Handler, PipelineCtx};
use crate::config::CircuitBreakerConfig;
use crate::upstream::{BreakerCheck, CircuitBreakerRegistry};
use std::sync::Arc;

/// Wraps the teacher's per-node `CircuitBreakerRegistry` as a pipeline
/// handler: runs `Next`, then inspects the well-known `status_code` context
/// key the response modifier stashed; anything other than 200 counts as a
/// failure. On open/rejected, writes a short `"circuit error: <kind>"` and
/// aborts instead of calling `Next`.
pub fn circuit_breaker_handler<C: Send + 'static>(
    registry: Arc<CircuitBreakerRegistry>,
    config: Arc<CircuitBreakerConfig>,
    node_key: impl Fn(&PipelineCtx<C>) -> String + Send + Sync + 'static,
    write_denial: impl Fn(&mut PipelineCtx<C>, &str) + Send + Sync + 'static,
) -> Handler<C> {
    let node_key = Arc::new(node_key);
    let write_denial = Arc::new(write_denial);
    Arc::new(move |ctx: &mut PipelineCtx<C>| {
        let registry = registry.clone();
        let config = config.clone();
        let node_key = node_key.clone();
        let write_denial = write_denial.clone();
        Box::pin(async move {
            let key = node_key(ctx);
            match registry.check(&key, &config) {
                BreakerCheck::Rejected => {
                    write_denial(ctx, "open");
                    ctx.abort();
                    return;
                }
                BreakerCheck::Allowed | BreakerCheck::Probe => {}
            }

            ctx.next().await;

            let status = ctx.get::<u16>(keys::STATUS_CODE).copied();
            match status {
                Some(200) => registry.record_success(&key, &config),
                _ => registry.record_failure(&key, &config),
            }
        })
    })
}
