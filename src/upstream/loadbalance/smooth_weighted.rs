use super::UpstreamInstance;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const DEFAULT_MAX_FAILS: i64 = 3;
const FAIL_TIMEOUT: Duration = Duration::from_secs(3);

/// Smooth weighted round-robin with passive health tracking.
///
/// Distinct from `RoundRobinBalancer`'s prefix-sum weighted selection: this
/// variant tracks per-node `effectiveWeight`/`currentWeight` and skips nodes
/// that have failed too many times within a rolling window.
pub struct SmoothWeightedBalancer {
    nodes: Mutex<Vec<Arc<Node>>>,
}

struct Node {
    instance: UpstreamInstance,
    weight: i64,
    effective_weight: AtomicI64,
    current_weight: AtomicI64,
    max_fails: AtomicI64,
    fail_times: Mutex<Vec<Instant>>,
}

impl SmoothWeightedBalancer {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
        }
    }

    pub fn update_instances(&self, instances: Vec<UpstreamInstance>) {
        let mut nodes = self.nodes.lock().unwrap();
        let mut reused: std::collections::HashMap<String, Arc<Node>> = nodes
            .drain(..)
            .map(|n| (n.instance.endpoint().to_string(), n))
            .collect();

        *nodes = instances
            .into_iter()
            .map(|inst| {
                let weight = inst.weight.max(1) as i64;
                if let Some(existing) = reused.remove(inst.endpoint()) {
                    // Preserve passive-health state across pool rebuilds;
                    // only the instance handle (counters) is refreshed.
                    Arc::new(Node {
                        instance: inst,
                        weight,
                        effective_weight: AtomicI64::new(existing.effective_weight.load(Ordering::Relaxed)),
                        current_weight: AtomicI64::new(existing.current_weight.load(Ordering::Relaxed)),
                        max_fails: AtomicI64::new(existing.max_fails.load(Ordering::Relaxed)),
                        fail_times: Mutex::new(existing.fail_times.lock().unwrap().clone()),
                    })
                } else {
                    Arc::new(Node {
                        instance: inst,
                        weight,
                        effective_weight: AtomicI64::new(weight),
                        current_weight: AtomicI64::new(0),
                        max_fails: AtomicI64::new(DEFAULT_MAX_FAILS),
                        fail_times: Mutex::new(Vec::new()),
                    })
                }
            })
            .collect();
    }

    pub fn do_select(&self) -> Option<UpstreamInstance> {
        let nodes = self.nodes.lock().unwrap();
        if nodes.is_empty() {
            return None;
        }

        let mut total: i64 = 0;
        let mut best: Option<&Arc<Node>> = None;
        let mut best_weight = i64::MIN;

        for node in nodes.iter() {
            if node.max_fails.load(Ordering::Relaxed) <= 0 {
                refresh_failures(node);
                if node.max_fails.load(Ordering::Relaxed) <= 0 {
                    continue;
                }
            }

            let ew = node.effective_weight.load(Ordering::Relaxed);
            let cw = node.current_weight.fetch_add(ew, Ordering::Relaxed) + ew;
            total += ew;

            if cw > best_weight {
                best_weight = cw;
                best = Some(node);
            }
        }

        let winner = best?;
        winner.current_weight.fetch_sub(total, Ordering::Relaxed);
        Some(winner.instance.clone())
    }

    /// Passive-health feedback: call after each request completes.
    pub fn callback(&self, endpoint: &str, success: bool) {
        let nodes = self.nodes.lock().unwrap();
        let node = match nodes.iter().find(|n| n.instance.endpoint() == endpoint) {
            Some(n) => n,
            None => return,
        };

        if success {
            let _ = node.effective_weight.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |ew| if ew < node.weight { Some(ew + 1) } else { None },
            );
        } else {
            node.effective_weight.fetch_sub(1, Ordering::Relaxed);
            let mut fail_times = node.fail_times.lock().unwrap();
            fail_times.push(Instant::now());
            node.max_fails.store(
                DEFAULT_MAX_FAILS - fail_times.len() as i64,
                Ordering::Relaxed,
            );
        }
    }

    pub fn get_instances(&self) -> Vec<UpstreamInstance> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.instance.clone())
            .collect()
    }
}

/// Drop fail timestamps outside the 3s rolling window and recompute
/// `max_fails = 3 - len(fail_times)`.
fn refresh_failures(node: &Node) {
    let mut fail_times = node.fail_times.lock().unwrap();
    let now = Instant::now();
    fail_times.retain(|t| now.duration_since(*t) < FAIL_TIMEOUT);
    node.max_fails
        .store(DEFAULT_MAX_FAILS - fail_times.len() as i64, Ordering::Relaxed);
}
