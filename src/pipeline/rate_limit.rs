use super::{Handler, PipelineCtx};
use crate::config::RateLimitConfig;
use crate::proxy::filter::RateLimiter;
use std::sync::Arc;

/// Wraps the teacher's existing token-bucket/sliding-window `RateLimiter` as
/// a pipeline handler. `Allow` stays non-blocking — no `Wait` path — to
/// avoid head-of-line blocking under load, per the source's design note.
pub fn rate_limit_handler<C: Send + 'static>(
    limiter: Arc<RateLimiter>,
    config: Arc<RateLimitConfig>,
    key_of: impl Fn(&PipelineCtx<C>) -> String + Send + Sync + 'static,
    write_denial: impl Fn(&mut PipelineCtx<C>, &str) + Send + Sync + 'static,
) -> Handler<C> {
    let key_of = Arc::new(key_of);
    let write_denial = Arc::new(write_denial);
    Arc::new(move |ctx: &mut PipelineCtx<C>| {
        let limiter = limiter.clone();
        let config = config.clone();
        let key_of = key_of.clone();
        let write_denial = write_denial.clone();
        Box::pin(async move {
            let key = key_of(ctx);
            if !limiter.check(&config, &key).await {
                write_denial(ctx, "rate limit exceeded");
                ctx.abort();
                return;
            }
            ctx.next().await;
        })
    })
}
