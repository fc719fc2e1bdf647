use super::UpstreamInstance;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Number of virtual nodes each real backend contributes to the ring.
const DEFAULT_REPLICAS: usize = 10;

/// Consistent hashing with virtual nodes (CRC32 ring).
///
/// Two structures kept in lockstep: a sorted vector of 32-bit hash keys and a
/// parallel vector of the backend each key maps to. `Get` hashes the routing
/// key and binary-searches for the first ring entry `>= hash`, wrapping to
/// index 0 past the end.
pub struct ConsistentHashBalancer {
    state: ArcSwap<Ring>,
    replicas: usize,
}

struct Ring {
    /// Sorted ascending. Parallel to `addrs`.
    keys: Vec<u32>,
    /// `addrs[i]` is the backend owning `keys[i]`.
    addrs: Vec<UpstreamInstance>,
}

impl ConsistentHashBalancer {
    pub fn new() -> Self {
        Self::with_replicas(DEFAULT_REPLICAS)
    }

    pub fn with_replicas(replicas: usize) -> Self {
        Self {
            state: ArcSwap::from_pointee(Ring {
                keys: Vec::new(),
                addrs: Vec::new(),
            }),
            replicas: replicas.max(1),
        }
    }

    pub fn update_instances(&self, instances: Vec<UpstreamInstance>) {
        let mut entries: Vec<(u32, UpstreamInstance)> =
            Vec::with_capacity(instances.len() * self.replicas);
        for inst in &instances {
            for i in 0..self.replicas {
                let vnode_key = format!("{}{}", i, inst.endpoint());
                entries.push((hash_key(vnode_key.as_bytes()), inst.clone()));
            }
        }
        entries.sort_by_key(|(h, _)| *h);
        let mut keys = Vec::with_capacity(entries.len());
        let mut addrs = Vec::with_capacity(entries.len());
        for (h, inst) in entries {
            keys.push(h);
            addrs.push(inst);
        }
        self.state.store(Arc::new(Ring { keys, addrs }));
    }

    /// Route by an arbitrary key (e.g. request URI, client address).
    pub fn do_select_for_key(&self, key: &str) -> Option<UpstreamInstance> {
        let ring = self.state.load();
        if ring.keys.is_empty() {
            return None;
        }
        let h = hash_key(key.as_bytes());
        let idx = ring.keys.partition_point(|&k| k < h);
        let idx = if idx == ring.keys.len() { 0 } else { idx };
        Some(ring.addrs[idx].clone())
    }

    /// Unkeyed selection falls back to a random ring entry — callers that
    /// care about stable routing should use `do_select_for_key`.
    pub fn do_select(&self) -> Option<UpstreamInstance> {
        let ring = self.state.load();
        if ring.addrs.is_empty() {
            return None;
        }
        use rand::Rng;
        let idx = rand::thread_rng().gen_range(0..ring.addrs.len());
        Some(ring.addrs[idx].clone())
    }

    pub fn get_instances(&self) -> Vec<UpstreamInstance> {
        let ring = self.state.load();
        let mut seen = std::collections::HashSet::new();
        ring.addrs
            .iter()
            .filter(|inst| seen.insert(inst.endpoint().to_string()))
            .cloned()
            .collect()
    }
}

fn hash_key(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}
