use super::merge::merge_responses;
use crate::{
    ClusterTransport, GeoPoint, GeoShardError, RangeKind, Result, RoutedRequest, ShardDirectory,
    ShardQuery,
};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct RouteRequestOperation {
    directory: Arc<dyn ShardDirectory>,
    transport: Arc<dyn ClusterTransport>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteTarget {
    /// Skip the directory and talk to one shard directly.
    Address(String),
    /// Every shard whose range meets the circle. A radius of zero or less
    /// reaches all shards.
    Area { center: GeoPoint, radius_meters: f64 },
}

#[derive(Debug, Clone)]
pub struct RouteRequestOperationRequest {
    pub request: RoutedRequest,
    pub target: RouteTarget,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequestOperationResult {
    pub status_code: u16,
    pub body: Value,
    #[serde(skip)]
    pub shards: Vec<String>,
}

impl RouteRequestOperation {
    pub fn new(directory: Arc<dyn ShardDirectory>, transport: Arc<dyn ClusterTransport>) -> Self {
        Self {
            directory,
            transport,
        }
    }

    pub async fn run(
        &self,
        request: RouteRequestOperationRequest,
    ) -> Result<RouteRequestOperationResult> {
        let RouteRequestOperationRequest { request, target } = request;

        let (center, radius_meters) = match target {
            RouteTarget::Address(addr) => {
                let body = self.transport.forward(&addr, &request).await?;
                return Ok(RouteRequestOperationResult {
                    status_code: 200,
                    body,
                    shards: vec![addr],
                });
            }
            RouteTarget::Area {
                center,
                radius_meters,
            } => (center, radius_meters),
        };

        let range_kind = if request.is_write() {
            RangeKind::Write
        } else {
            RangeKind::Read
        };
        let query = ShardQuery::covering(center, radius_meters, range_kind);
        let shards = self.directory.find_where(&query).await?;

        if shards.is_empty() {
            if request.is_write() {
                return Err(GeoShardError::NoShardAvailable(format!(
                    "no shard accepts writes around ({}, {})",
                    center.lat, center.lng
                )));
            }
            return Ok(RouteRequestOperationResult {
                status_code: 200,
                body: Value::Array(Vec::new()),
                shards: Vec::new(),
            });
        }

        tracing::debug!(
            "Routing {} {} to {} shard(s)",
            request.method,
            request.path_and_query,
            shards.len()
        );

        let request = &request;
        let mut pending: FuturesUnordered<_> = shards
            .into_iter()
            .map(|shard| async move {
                let outcome = self.transport.forward(&shard.base_addr, request).await;
                (shard.base_addr, outcome)
            })
            .collect();

        let mut merged = Value::Null;
        let mut answered = Vec::new();
        while let Some((addr, outcome)) = pending.next().await {
            let body = outcome.map_err(|error| {
                tracing::warn!("Shard {} failed routed request: {}", addr, error);
                error
            })?;
            merged = merge_responses(merged, body);
            answered.push(addr);
        }

        Ok(RouteRequestOperationResult {
            status_code: 200,
            body: merged,
            shards: answered,
        })
    }
}
