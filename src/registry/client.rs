use crate::etcd::client::{
    b64_decode, b64_encode, prefix_range_end, DeleteRangeRequest, PutRequest, RangeRequest,
    WatchCreate, WatchCreateRequest, WatchStream,
};
use crate::etcd::EtcdClient;
use std::time::Duration;

/// ZooKeeper-style node flags. Persistent nodes survive session loss;
/// ephemeral nodes are tied to a lease and disappear when it lapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFlag {
    Persistent = 0,
    Ephemeral = 1,
}

/// Connection/session timeout used for ephemeral-node leases, matching the
/// hierarchical registry's 5s session timeout contract.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default path under which backend servers register themselves.
pub const DEFAULT_PATH_PREFIX: &str = "/gateway_servers_";

/// Hierarchical key/value registry client, named after the ZooKeeper-style
/// operation surface the gateway's registry subject requires
/// (`Exists`/`Create`/`Children`/`ChildrenW`/`Get`/`Set`/`Delete`), backed by
/// etcd v3's HTTP/JSON gateway — the only registry client already present in
/// the dependency stack. Ephemeral nodes are leased etcd keys kept alive for
/// the life of the caller's session; persistent nodes are unleased puts.
pub struct RegistryClient {
    etcd: EtcdClient,
    /// Lease backing this session's ephemeral nodes, granted lazily on the
    /// first ephemeral `create`.
    session_lease: tokio::sync::Mutex<Option<i64>>,
}

impl RegistryClient {
    pub fn new(etcd: EtcdClient) -> Self {
        Self {
            etcd,
            session_lease: tokio::sync::Mutex::new(None),
        }
    }

    /// `Exists(path)` — true if the key is present.
    pub async fn exists(&self, path: &str) -> anyhow::Result<bool> {
        let resp = self
            .etcd
            .range(&RangeRequest {
                key: b64_encode(path),
                range_end: String::new(),
                keys_only: Some(true),
            })
            .await?;
        Ok(!resp.kvs.is_empty())
    }

    /// `Create(path, data, flag)` — persistent nodes are plain puts;
    /// ephemeral nodes are tied to this client's session lease.
    pub async fn create(&self, path: &str, data: &str, flag: NodeFlag) -> anyhow::Result<()> {
        let lease = match flag {
            NodeFlag::Persistent => None,
            NodeFlag::Ephemeral => Some(self.ensure_session_lease().await?),
        };
        self.etcd
            .put(&PutRequest {
                key: b64_encode(path),
                value: b64_encode(data),
                lease,
            })
            .await
    }

    /// `Get(path)` — returns the value, or `None` if the key doesn't exist.
    pub async fn get(&self, path: &str) -> anyhow::Result<Option<String>> {
        let resp = self
            .etcd
            .range(&RangeRequest {
                key: b64_encode(path),
                range_end: String::new(),
                keys_only: None,
            })
            .await?;
        match resp.kvs.into_iter().next() {
            Some(kv) => Ok(Some(b64_decode(&kv.value)?)),
            None => Ok(None),
        }
    }

    /// `Set(path, data, version)` — `version` (ZK's CAS token) is accepted
    /// but not enforced: the teacher's etcd client exposes plain put/range,
    /// not transactions, so this is advisory, last-write-wins (see
    /// DESIGN.md).
    pub async fn set(&self, path: &str, data: &str, _version: Option<i64>) -> anyhow::Result<()> {
        self.etcd
            .put(&PutRequest {
                key: b64_encode(path),
                value: b64_encode(data),
                lease: None,
            })
            .await
    }

    /// `Delete(path, version)` — `version` ignored, same caveat as `set`.
    pub async fn delete(&self, path: &str, _version: Option<i64>) -> anyhow::Result<()> {
        self.etcd
            .delete_range(&DeleteRangeRequest {
                key: b64_encode(path),
                range_end: String::new(),
            })
            .await
    }

    /// `Children(path)` — immediate child key names under `path/`.
    pub async fn children(&self, path: &str) -> anyhow::Result<Vec<String>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let resp = self
            .etcd
            .range(&RangeRequest {
                key: b64_encode(&prefix),
                range_end: prefix_range_end(&prefix),
                keys_only: Some(true),
            })
            .await?;
        let mut names = Vec::with_capacity(resp.kvs.len());
        for kv in resp.kvs {
            let full_key = b64_decode(&kv.key)?;
            if let Some(child) = full_key.strip_prefix(&prefix) {
                names.push(child.to_string());
            }
        }
        Ok(names)
    }

    /// `ChildrenW(path)` — opens a watch on `path/*` and returns a stream
    /// that yields one `WatchStream` response per underlying change batch.
    /// The caller re-issues `children()` after each event to get a fresh
    /// snapshot (one-shot watch semantics, as in the ZK original).
    pub async fn children_w(&self, path: &str) -> anyhow::Result<WatchStream> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.etcd
            .watch_stream(&WatchCreateRequest {
                create_request: WatchCreate {
                    key: b64_encode(&prefix),
                    range_end: prefix_range_end(&prefix),
                    start_revision: None,
                },
            })
            .await
    }

    /// Ensure this client has a live lease backing its ephemeral nodes,
    /// granting one (TTL = session timeout) on first use. The caller is
    /// responsible for periodically renewing it (`EtcdClient::lease_keepalive`)
    /// for the life of the session — letting it lapse is what makes
    /// ephemeral nodes disappear on disconnect.
    async fn ensure_session_lease(&self) -> anyhow::Result<i64> {
        let mut guard = self.session_lease.lock().await;
        if let Some(id) = *guard {
            return Ok(id);
        }
        let id = self.etcd.lease_grant(SESSION_TIMEOUT.as_secs()).await?;
        *guard = Some(id);
        Ok(id)
    }

    pub async fn renew_session(&self) -> anyhow::Result<()> {
        let lease = *self.session_lease.lock().await;
        if let Some(id) = lease {
            self.etcd.lease_keepalive(id).await?;
        }
        Ok(())
    }

    /// `RegisterServerPath(path, host)` — ensure `path` exists as a
    /// persistent node, then register `path/host` as ephemeral.
    pub async fn register_server_path(&self, path: &str, host: &str) -> anyhow::Result<()> {
        if !self.exists(path).await? {
            self.create(path, "", NodeFlag::Persistent).await?;
        }
        let child = format!("{}/{}", path.trim_end_matches('/'), host);
        self.create(&child, "", NodeFlag::Ephemeral).await
    }
}
