use super::{Handler, PipelineCtx};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// QPS flow counter. `Increase()` is a cheap atomic add done inline on every
/// request; a background ticker task (spawned by the caller, typically every
/// 1s) swaps the per-tick count to zero and recomputes `qps`.
pub struct FlowCounter {
    total_count: AtomicU64,
    ticker_count: AtomicU64,
    qps: AtomicU64,
    name: String,
}

impl FlowCounter {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            total_count: AtomicU64::new(0),
            ticker_count: AtomicU64::new(0),
            qps: AtomicU64::new(0),
            name: name.into(),
        })
    }

    pub fn increase(&self) {
        self.ticker_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn qps(&self) -> u64 {
        self.qps.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total_count.load(Ordering::Relaxed)
    }

    /// Runs forever, ticking at `interval`. Spawn as its own task per route.
    pub async fn run_ticker(self: Arc<Self>, interval: Duration) {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            let count = self.ticker_count.swap(0, Ordering::Relaxed);
            let elapsed = interval.as_secs_f64().max(0.001);
            self.qps.store((count as f64 / elapsed) as u64, Ordering::Relaxed);
            self.total_count.fetch_add(count, Ordering::Relaxed);
            metrics::gauge!("gateway_flow_qps", "route" => self.name.clone()).set(self.qps() as f64);
            metrics::counter!("gateway_flow_total", "route" => self.name.clone()).increment(count);
        }
    }
}

/// Wraps a `FlowCounter` as a pipeline handler: increments then falls
/// through unconditionally.
pub fn flowcount_handler<C: Send + 'static>(counter: Arc<FlowCounter>) -> Handler<C> {
    Arc::new(move |ctx: &mut PipelineCtx<C>| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.increase();
            ctx.next().await;
        })
    })
}
