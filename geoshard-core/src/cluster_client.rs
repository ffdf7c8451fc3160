//! Outbound calls to shards and to other routing nodes.

use crate::{GeoRange, GeoShardError, PeerRecord, Result, TopologyUpdate};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const SHARD_HEARTBEAT_PATH: &str = "/api/heartbeat";
pub const SHARD_POST_RANGE_PATH: &str = "/api/postrange";
pub const SHARD_REDISTRIBUTE_PATH: &str = "/api/redistribute";
pub const SHARD_BACKUP_ADDR_PATH: &str = "/api/backupaddr";
pub const SHARD_BACKUPS_PATH: &str = "/api/backups";

pub const PEER_HEARTBEAT_PATH: &str = "/heartbeat";
pub const SHARD_TABLE_PATH: &str = "/director/allserverinfo?excludeid=true";
pub const PEER_TABLE_PATH: &str = "/webserver/allserverinfo?excludeid=true";
pub const PEER_ANNOUNCE_PATH: &str = "/webserver/newserver";
pub const PEER_SUSPECT_PATH: &str = "/webserver/servermaybedown";
pub const TOPOLOGY_UPDATE_PATH: &str = "/director/applyupdates";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTarget {
    Shard,
    Peer,
}

impl ProbeTarget {
    fn path(self) -> &'static str {
        match self {
            ProbeTarget::Shard => SHARD_HEARTBEAT_PATH,
            ProbeTarget::Peer => PEER_HEARTBEAT_PATH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedistributionTarget {
    pub range: GeoRange,
    pub address: String,
}

/// Tells a shard where each of the posts it holds for a departed shard
/// belongs now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedistributionPlan {
    pub target_servers: Vec<RedistributionTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupAddrNotice {
    pub new_backup_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspectNotice {
    pub base_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspectReply {
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    #[serde(flatten)]
    pub peer: PeerRecord,
    /// Set by the node that first receives the announcement so receivers
    /// of the fan-out do not forward it again.
    #[serde(default)]
    pub forwarded: bool,
}

/// A client request replayed verbatim to one or more shards.
#[derive(Debug, Clone)]
pub struct RoutedRequest {
    pub method: Method,
    /// Path plus query string, starting with `/`.
    pub path_and_query: String,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl RoutedRequest {
    pub fn is_write(&self) -> bool {
        self.method == Method::POST
    }
}

#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Any 2xx answer counts as alive.
    async fn probe(&self, addr: &str, target: ProbeTarget, timeout: Option<Duration>)
    -> Result<()>;

    /// Bounding range of the posts a shard holds, `None` if it holds none.
    async fn fetch_post_range(&self, addr: &str) -> Result<Option<GeoRange>>;

    async fn send_redistribution(&self, addr: &str, plan: &RedistributionPlan) -> Result<()>;

    async fn notify_backup_change(&self, addr: &str, new_backup_addr: &str) -> Result<()>;

    async fn clear_backups(&self, addr: &str) -> Result<()>;

    /// Pulls a peer's table through one of the read-only retrieval paths.
    async fn fetch_table(&self, addr: &str, path: &str) -> Result<Vec<Value>>;

    async fn forward(&self, addr: &str, request: &RoutedRequest) -> Result<Value>;

    /// Asks `via` to check `suspect`; returns whether `via` confirmed it down.
    async fn report_suspected_failure(&self, via: &str, suspect: &str) -> Result<bool>;

    async fn push_topology_update(&self, addr: &str, update: &TopologyUpdate) -> Result<()>;

    async fn announce_peer(&self, addr: &str, announcement: &PeerAnnouncement) -> Result<()>;
}

/// Upper bound on any single outbound call unless the call sets its own.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HttpClusterClient {
    client: reqwest::Client,
}

impl HttpClusterClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GeoShardError::Internal(format!("failed to build http client: {}", e)))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(
        &self,
        addr: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|error| GeoShardError::peer_unreachable(addr, error))?;

        if !response.status().is_success() {
            return Err(GeoShardError::peer_unreachable(
                addr,
                format!("unexpected status {}", response.status()),
            ));
        }

        Ok(response)
    }
}

#[async_trait]
impl ClusterTransport for HttpClusterClient {
    async fn probe(
        &self,
        addr: &str,
        target: ProbeTarget,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut request = self.client.get(peer_url(addr, target.path()));
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        self.send(addr, request).await?;
        Ok(())
    }

    async fn fetch_post_range(&self, addr: &str) -> Result<Option<GeoRange>> {
        let request = self.client.get(peer_url(addr, SHARD_POST_RANGE_PATH));
        let response = self.send(addr, request).await?;
        response
            .json::<Option<GeoRange>>()
            .await
            .map_err(|error| GeoShardError::peer_unreachable(addr, error))
    }

    async fn send_redistribution(&self, addr: &str, plan: &RedistributionPlan) -> Result<()> {
        let request = self
            .client
            .post(peer_url(addr, SHARD_REDISTRIBUTE_PATH))
            .json(plan);
        self.send(addr, request).await?;
        Ok(())
    }

    async fn notify_backup_change(&self, addr: &str, new_backup_addr: &str) -> Result<()> {
        let request = self
            .client
            .put(peer_url(addr, SHARD_BACKUP_ADDR_PATH))
            .json(&BackupAddrNotice {
                new_backup_addr: new_backup_addr.to_string(),
            });
        self.send(addr, request).await?;
        Ok(())
    }

    async fn clear_backups(&self, addr: &str) -> Result<()> {
        let request = self.client.delete(peer_url(addr, SHARD_BACKUPS_PATH));
        self.send(addr, request).await?;
        Ok(())
    }

    async fn fetch_table(&self, addr: &str, path: &str) -> Result<Vec<Value>> {
        let request = self.client.get(peer_url(addr, path));
        let response = self.send(addr, request).await?;
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|error| GeoShardError::peer_unreachable(addr, error))
    }

    async fn forward(&self, addr: &str, request: &RoutedRequest) -> Result<Value> {
        let mut builder = self
            .client
            .request(request.method.clone(), peer_url(addr, &request.path_and_query))
            .body(request.body.clone());
        if let Some(content_type) = &request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }

        let response = self.send(addr, builder).await?;
        let body = response
            .bytes()
            .await
            .map_err(|error| GeoShardError::peer_unreachable(addr, error))?;
        Ok(decode_body(&body))
    }

    async fn report_suspected_failure(&self, via: &str, suspect: &str) -> Result<bool> {
        let request = self
            .client
            .post(peer_url(via, PEER_SUSPECT_PATH))
            .json(&SuspectNotice {
                base_addr: suspect.to_string(),
            });
        let response = self.send(via, request).await?;
        let reply = response
            .json::<SuspectReply>()
            .await
            .map_err(|error| GeoShardError::peer_unreachable(via, error))?;
        Ok(reply.confirmed)
    }

    async fn push_topology_update(&self, addr: &str, update: &TopologyUpdate) -> Result<()> {
        let request = self
            .client
            .post(peer_url(addr, TOPOLOGY_UPDATE_PATH))
            .json(update);
        self.send(addr, request).await?;
        Ok(())
    }

    async fn announce_peer(&self, addr: &str, announcement: &PeerAnnouncement) -> Result<()> {
        let request = self
            .client
            .post(peer_url(addr, PEER_ANNOUNCE_PATH))
            .json(announcement);
        self.send(addr, request).await?;
        Ok(())
    }
}

/// Joins a node address and a path. Addresses without a scheme are
/// reached over plain http.
pub fn peer_url(addr: &str, path: &str) -> String {
    let addr = addr.trim().trim_end_matches('/');
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    if addr.starts_with("http://") || addr.starts_with("https://") {
        format!("{}{}", addr, path)
    } else {
        format!("http://{}{}", addr, path)
    }
}

/// Shard responses are JSON in practice; anything else is kept as a string.
pub fn decode_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }

    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}
