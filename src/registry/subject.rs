use super::client::RegistryClient;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Fan-out target for registry snapshot changes. Balancers and proxies
/// implement this to rebuild their pool whenever `Subject::update_conf` runs.
pub trait Observer: Send + Sync {
    fn update(&self, hosts: &[String]);
}

/// The subject side of the subject/observer pair: fans out snapshot changes
/// to every attached observer.
///
/// Two feeds can drive a `Subject`:
/// - A registry-backed watch (`watch_conf`), for paths with a live
///   hierarchical child-watch — genuinely `NewSubject`'s connect/children/
///   watch procedure against a registry.
/// - A directly-pushed feed (`update_conf`), for callers that already have a
///   fresh node list from elsewhere (service discovery, a config hot-reload)
///   and just need the fan-out/notify half of the subject, not the watch
///   loop. This is how the balancer pool and cluster config watch stay
///   observers of one shared mechanism instead of each reinventing it.
///
/// Observer attachment is append-only and must complete before the first
/// `notify_all` — the list is iterated without synchronization beyond the
/// mutex guarding appends, matching the "observers never own subjects"
/// design note.
pub struct Subject {
    registry: Option<Arc<RegistryClient>>,
    path: Option<String>,
    /// `"<format>"` applied to each host before formatting into `"host,weight"`.
    format: String,
    observers: Mutex<Vec<Arc<dyn Observer>>>,
    snapshot: Mutex<Vec<String>>,
    ip_weight_overrides: Mutex<HashMap<String, String>>,
}

impl Subject {
    /// `NewSubject(format, path, hosts, ipWeightOverrides)` — connects, reads
    /// the initial child snapshot, and returns a subject ready to `attach`
    /// observers and start `watch_conf`.
    pub async fn new(
        registry: Arc<RegistryClient>,
        path: impl Into<String>,
        format: impl Into<String>,
        ip_weight_overrides: HashMap<String, String>,
    ) -> anyhow::Result<Arc<Self>> {
        let path = path.into();
        let initial = registry.children(&path).await.unwrap_or_default();
        Ok(Arc::new(Self {
            registry: Some(registry),
            path: Some(path),
            format: format.into(),
            observers: Mutex::new(Vec::new()),
            snapshot: Mutex::new(initial),
            ip_weight_overrides: Mutex::new(ip_weight_overrides),
        }))
    }

    /// A subject with no registry-backed watch, fed entirely through
    /// `update_conf` by the caller (e.g. a `Cluster`'s Consul discovery
    /// results or static etcd cluster-config nodes). `watch_conf` is a no-op
    /// on a subject built this way.
    pub fn new_detached(format: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            registry: None,
            path: None,
            format: format.into(),
            observers: Mutex::new(Vec::new()),
            snapshot: Mutex::new(Vec::new()),
            ip_weight_overrides: Mutex::new(HashMap::new()),
        })
    }

    pub fn attach(&self, observer: Arc<dyn Observer>) {
        self.observers.lock().unwrap().push(observer);
    }

    /// `GetConf()` — the observer-visible list, `"<formatted-host>,<weight>"`.
    pub fn get_conf(&self) -> Vec<String> {
        let snapshot = self.snapshot.lock().unwrap();
        let overrides = self.ip_weight_overrides.lock().unwrap();
        snapshot
            .iter()
            .map(|host| {
                let formatted = if self.format.contains("{}") {
                    self.format.replacen("{}", host, 1)
                } else {
                    host.clone()
                };
                let weight = overrides.get(host).cloned().unwrap_or_else(|| "50".to_string());
                format!("{},{}", formatted, weight)
            })
            .collect()
    }

    /// `UpdateConf(list)` — replace the snapshot, notify every observer in
    /// attach order exactly once.
    pub fn update_conf(&self, hosts: Vec<String>) {
        {
            let mut snapshot = self.snapshot.lock().unwrap();
            *snapshot = hosts;
        }
        self.notify_all();
    }

    pub fn notify_all(&self) {
        let conf = self.get_conf();
        let observers = self.observers.lock().unwrap();
        for observer in observers.iter() {
            observer.update(&conf);
        }
    }

    /// `WatchConf()` — loops reading children with a one-shot watch, pushing
    /// the snapshot and calling `update_conf` on change. Terminates on
    /// registry disconnect or if this subject has no registry attached; the
    /// caller should re-spawn with backoff.
    pub async fn watch_conf(self: Arc<Self>) {
        let (Some(registry), Some(path)) = (self.registry.clone(), self.path.clone()) else {
            warn!("registry: subject: watch_conf called on a detached subject, ignoring");
            return;
        };

        loop {
            let mut stream = match registry.children_w(&path).await {
                Ok(s) => s,
                Err(e) => {
                    error!("registry: subject: watch connect failed, path={}, error={}", path, e);
                    return;
                }
            };

            loop {
                match stream.next_response().await {
                    Some(resp) => {
                        if let Some(result) = resp.result {
                            if result.events.is_empty() {
                                continue;
                            }
                        } else {
                            continue;
                        }
                    }
                    None => {
                        warn!("registry: subject: watch stream ended, path={}", path);
                        return;
                    }
                }

                match registry.children(&path).await {
                    Ok(hosts) => {
                        info!(
                            "registry: subject: snapshot changed, path={}, count={}",
                            path,
                            hosts.len()
                        );
                        self.update_conf(hosts);
                    }
                    Err(e) => {
                        warn!(
                            "registry: subject: failed to read children after watch event, path={}, error={}",
                            path, e
                        );
                    }
                }
            }
        }
    }
}
