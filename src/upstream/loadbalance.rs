pub mod consistent_hash;
pub mod random;
pub mod round_robin;
pub mod smooth_weighted;

use crate::config::UpstreamNode;
use consistent_hash::ConsistentHashBalancer;
use random::RandomBalancer;
use round_robin::RoundRobinBalancer;
use smooth_weighted::SmoothWeightedBalancer;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A resolved upstream node carrying per-request state (active count, etc.).
/// Cheap to clone — the counters are shared via `Arc`.
#[derive(Debug, Clone)]
pub struct UpstreamInstance {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub metadata: std::collections::HashMap<String, String>,
    pub active_requests: Arc<AtomicUsize>,
    /// Pre-computed "host:port" string — avoids a `format!()` allocation on
    /// every request in `endpoint()`, `select_healthy_node`, circuit breaker
    /// lookups, health recording, etc.
    endpoint: Arc<str>,
}

impl UpstreamInstance {
    /// Returns the cached "host:port" string. Zero allocation.
    #[inline]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn inc_active(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

impl From<&UpstreamNode> for UpstreamInstance {
    fn from(node: &UpstreamNode) -> Self {
        let endpoint: Arc<str> = format!("{}:{}", node.host, node.port).into();
        Self {
            host: node.host.clone(),
            port: node.port,
            weight: node.weight,
            metadata: node.metadata.clone(),
            active_requests: Arc::new(AtomicUsize::new(0)),
            endpoint,
        }
    }
}

/// Enum-based load balancer — no trait objects, no dynamic dispatch.
pub enum LoadBalancer {
    RoundRobin(RoundRobinBalancer),
    Random(RandomBalancer),
    ConsistentHash(ConsistentHashBalancer),
    SmoothWeighted(SmoothWeightedBalancer),
}

impl LoadBalancer {
    pub fn new(lb_type: &str) -> Arc<Self> {
        match lb_type {
            "random" | "weighted_random" => Arc::new(Self::Random(RandomBalancer::new())),
            "consistent_hash" | "chash" => {
                Arc::new(Self::ConsistentHash(ConsistentHashBalancer::new()))
            }
            "smooth_weighted" | "weighted" => {
                Arc::new(Self::SmoothWeighted(SmoothWeightedBalancer::new()))
            }
            _ => Arc::new(Self::RoundRobin(RoundRobinBalancer::new())),
        }
    }

    /// Atomically replace the instance list, reusing existing counters for
    /// instances that were already present.
    pub fn update_instances(&self, nodes: &[UpstreamNode]) {
        let instances: Vec<UpstreamInstance> = nodes.iter().map(UpstreamInstance::from).collect();
        match self {
            Self::RoundRobin(lb) => lb.update_instances(instances),
            Self::Random(lb) => lb.update_instances(instances),
            Self::ConsistentHash(lb) => lb.update_instances(instances),
            Self::SmoothWeighted(lb) => lb.update_instances(instances),
        }
    }

    /// Unified select — returns a `RequestGuard` that auto-decrements
    /// counters on drop.
    pub fn select(self: &Arc<Self>) -> Option<RequestGuard> {
        match self.as_ref() {
            Self::RoundRobin(lb) => {
                let instance = lb.do_select()?;
                Some(RequestGuard {
                    instance,
                    _balancer: None,
                    failed: AtomicBool::new(false),
                })
            }
            Self::Random(lb) => {
                let instance = lb.do_select()?;
                Some(RequestGuard {
                    instance,
                    _balancer: None,
                    failed: AtomicBool::new(false),
                })
            }
            Self::ConsistentHash(lb) => {
                let instance = lb.do_select()?;
                Some(RequestGuard {
                    instance,
                    _balancer: None,
                    failed: AtomicBool::new(false),
                })
            }
            Self::SmoothWeighted(lb) => {
                let instance = lb.do_select()?;
                Some(RequestGuard {
                    instance,
                    _balancer: Some(self.clone()),
                    failed: AtomicBool::new(false),
                })
            }
        }
    }

    /// Select by routing key — only the consistent-hash ring uses `key` to
    /// pick a deterministic backend; other policies ignore it and fall back
    /// to their unkeyed selection.
    pub fn select_for_key(self: &Arc<Self>, key: &str) -> Option<RequestGuard> {
        if let Self::ConsistentHash(lb) = self.as_ref() {
            let instance = lb.do_select_for_key(key)?;
            return Some(RequestGuard {
                instance,
                _balancer: None,
                failed: AtomicBool::new(false),
            });
        }
        self.select()
    }

    pub fn get_instances(&self) -> Vec<UpstreamInstance> {
        match self {
            Self::RoundRobin(lb) => lb.get_instances(),
            Self::Random(lb) => lb.get_instances(),
            Self::ConsistentHash(lb) => lb.get_instances(),
            Self::SmoothWeighted(lb) => lb.get_instances(),
        }
    }
}

impl crate::registry::Observer for LoadBalancer {
    /// Parses the subject's `"host:port,weight"` snapshot entries and
    /// rebuilds the pool — the balancer side of the observer/subject binding
    /// (C4): `Subject::notify_all` calls this on every registry change.
    fn update(&self, hosts: &[String]) {
        let nodes: Vec<UpstreamNode> = hosts
            .iter()
            .filter_map(|entry| {
                let (addr, weight) = entry.split_once(',').unwrap_or((entry.as_str(), "50"));
                let (host, port) = addr.rsplit_once(':')?;
                Some(UpstreamNode {
                    host: host.to_string(),
                    port: port.parse().ok()?,
                    weight: weight.parse().unwrap_or(50),
                    metadata: Default::default(),
                })
            })
            .collect();
        self.update_instances(&nodes);
    }
}

/// RAII guard returned from `LoadBalancer::select()`.
/// Automatically decrements active counters on drop and, for balancers with
/// passive health (smooth weighted round-robin), reports the outcome.
pub struct RequestGuard {
    pub instance: UpstreamInstance,
    pub(crate) _balancer: Option<Arc<LoadBalancer>>,
    pub(crate) failed: AtomicBool,
}

impl RequestGuard {
    pub fn endpoint(&self) -> &str {
        self.instance.endpoint()
    }

    /// Mark request as failed — counts toward the smooth-weighted balancer's
    /// failure window.
    pub fn mark_failed(&mut self) {
        self.failed.store(true, Ordering::Relaxed);
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let Some(ref balancer) = self._balancer else {
            return;
        };
        if let LoadBalancer::SmoothWeighted(lb) = balancer.as_ref() {
            lb.callback(self.instance.endpoint(), !self.failed.load(Ordering::Relaxed));
            return;
        }
        self.instance.dec_active();
    }
}

/// Resolved upstream target metadata for building the proxy request.
///
/// Uses `Arc<str>` for `scheme` / `pass_host` / `upstream_host` because these
/// values come from the cluster config (rarely changes) and are cloned on every
/// request in `select_upstream()`. `Arc<str>` clone is just an atomic increment
/// vs `String::clone` which heap-allocates.
pub struct UpstreamTarget {
    pub instance: UpstreamInstance,
    pub scheme: Arc<str>,
    pub pass_host: Arc<str>,
    pub upstream_host: Option<Arc<str>>,
}
