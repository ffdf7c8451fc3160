use crate::bootstrap::join_network;
use crate::config::Config;
use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use geoshard_core::{
    ClusterTransport, FailureHandler, GeoPoint, GeoShardError, HttpClusterClient,
    MajorityReconciler, PeerAnnouncement, PeerDirectory, PeerTable, PlaceShardOperation,
    PlaceShardOperationRequest, RecalculateRangesOperation, ReconcileOutcome, Reconciler,
    RemoveShardOperation, RemoveShardOperationRequest, Result, RingHeartbeatMonitor,
    RouteRequestOperation, RouteRequestOperationRequest, RouteTarget, RoutedRequest,
    ShardDirectory, ShardHeartbeatMonitor, ShardRecord, ShardTable, SuspectNotice, SuspectReply,
    SyncedTable, TopologyLock, TopologyUpdate,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub config: Config,
    pub directory: Arc<dyn ShardDirectory>,
    pub peers: Arc<PeerDirectory>,
    pub transport: Arc<dyn ClusterTransport>,
    /// Taken by every local writer of the shard table.
    pub lock: TopologyLock,
    pub place_shard: PlaceShardOperation,
    pub remove_shard: RemoveShardOperation,
    pub route_request: RouteRequestOperation,
    pub recalculate_ranges: RecalculateRangesOperation,
    pub shard_monitor: ShardHeartbeatMonitor,
    pub ring_monitor: RingHeartbeatMonitor,
    pub reconciler: MajorityReconciler,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddShardBody {
    base_addr: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveShardBody {
    base_addr: String,
    #[serde(default)]
    use_backup_for_recovery: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlacementResponse {
    shard: ShardRecord,
    split_from: Option<String>,
    updated: Vec<String>,
    propagated_to: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RemovalResponse {
    removed: String,
    relinked: Vec<String>,
    absorbed_by: Option<String>,
    redistributed_via: Option<String>,
    refreshed: Vec<String>,
    completed_at: String,
    propagated_to: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteQuery {
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    radius: Option<f64>,
    #[serde(default)]
    database_address: Option<String>,
}

impl RouteQuery {
    /// A missing location or radius defaults to zero, which reaches every
    /// shard.
    fn target(&self) -> RouteTarget {
        if let Some(addr) = self
            .database_address
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
        {
            return RouteTarget::Address(addr.to_string());
        }

        RouteTarget::Area {
            center: GeoPoint::new(self.latitude.unwrap_or(0.0), self.longitude.unwrap_or(0.0)),
            radius_meters: self.radius.unwrap_or(0.0),
        }
    }
}

/// Escalates a shard that missed too many heartbeats: recover its posts
/// from its backup, then tell the other routing nodes.
struct RemoveOnFailure {
    remove_shard: RemoveShardOperation,
    peers: Arc<PeerDirectory>,
    transport: Arc<dyn ClusterTransport>,
}

#[async_trait]
impl FailureHandler for RemoveOnFailure {
    async fn on_failure(&self, addr: &str) -> Result<()> {
        let summary = self
            .remove_shard
            .run(RemoveShardOperationRequest {
                base_addr: addr.to_string(),
                use_backup_for_recovery: true,
            })
            .await?;

        let others = self.peers.others().await;
        summary
            .topology_update()
            .broadcast(self.transport.as_ref(), &others)
            .await;
        Ok(())
    }
}

impl ServerState {
    pub fn new(
        config: Config,
        directory: Arc<dyn ShardDirectory>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Self {
        let peers = Arc::new(PeerDirectory::new(config.base_addr.clone()));
        let lock = TopologyLock::new();

        let place_shard =
            PlaceShardOperation::new(directory.clone(), transport.clone(), lock.clone());
        let remove_shard =
            RemoveShardOperation::new(directory.clone(), transport.clone(), lock.clone());
        let route_request = RouteRequestOperation::new(directory.clone(), transport.clone());
        let recalculate_ranges =
            RecalculateRangesOperation::new(directory.clone(), transport.clone(), lock.clone());

        let failure_handler = Arc::new(RemoveOnFailure {
            remove_shard: remove_shard.clone(),
            peers: peers.clone(),
            transport: transport.clone(),
        });
        let shard_monitor = ShardHeartbeatMonitor::new(
            directory.clone(),
            peers.clone(),
            transport.clone(),
            failure_handler,
            config.heartbeat.shard_settings(),
        );
        let ring_monitor = RingHeartbeatMonitor::new(
            peers.clone(),
            transport.clone(),
            config.heartbeat.peer_settings(),
        );
        let reconciler = MajorityReconciler::with_sample_size(
            transport.clone(),
            config.maintenance.reconcile_sample_size,
        );

        Self {
            config,
            directory,
            peers,
            transport,
            lock,
            place_shard,
            remove_shard,
            route_request,
            recalculate_ranges,
            shard_monitor,
            ring_monitor,
            reconciler,
        }
    }
}

pub async fn run_server(config: Config) -> Result<()> {
    let directory = config.directory.builder().build().await?;
    let transport: Arc<dyn ClusterTransport> = Arc::new(HttpClusterClient::with_timeout(
        config.transport.request_timeout(),
    )?);
    let state = Arc::new(ServerState::new(config, directory, transport));

    if let Some(seed) = state.config.seed_peer() {
        if let Err(e) = join_network(
            seed,
            state.directory.clone(),
            state.lock.clone(),
            state.peers.clone(),
            state.transport.as_ref(),
        )
        .await
        {
            tracing::error!("Failed to join network through {}: {}", seed, e);
        }
    }

    spawn_background_loops(&state);

    let app = Router::new()
        .route("/heartbeat", get(heartbeat_handler))
        .route("/director/allserverinfo", get(list_shards))
        .route("/director/addserverinfo", post(add_shard))
        .route("/director/removeserver", post(remove_shard_handler))
        .route("/director/applyupdates", post(apply_updates))
        .route("/webserver/allserverinfo", get(list_peers))
        .route("/webserver/newserver", post(register_peer))
        .route("/webserver/servermaybedown", post(suspect_peer))
        .route("/api/*path", any(route_api_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let bind_addr = state.config.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on {} as {}", bind_addr, state.config.base_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn spawn_background_loops(state: &Arc<ServerState>) {
    let shard_state = state.clone();
    tokio::spawn(async move {
        shard_heartbeat_loop(shard_state).await;
    });

    let ring_state = state.clone();
    tokio::spawn(async move {
        ring_heartbeat_loop(ring_state).await;
    });

    let recalculate_state = state.clone();
    tokio::spawn(async move {
        recalculate_loop(recalculate_state).await;
    });

    let shard_table_state = state.clone();
    tokio::spawn(async move {
        let table = ShardTable::new(
            shard_table_state.directory.clone(),
            shard_table_state.lock.clone(),
        );
        reconcile_loop(shard_table_state, table).await;
    });

    let peer_table_state = state.clone();
    tokio::spawn(async move {
        let table = PeerTable::new(peer_table_state.peers.clone());
        reconcile_loop(peer_table_state, table).await;
    });
}

async fn shard_heartbeat_loop(state: Arc<ServerState>) {
    let mut interval = tokio::time::interval(state.shard_monitor.settings().interval);

    loop {
        interval.tick().await;

        match state.shard_monitor.tick().await {
            Ok(failed) if !failed.is_empty() => {
                tracing::warn!("Shards reported failed this round: {:?}", failed);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Shard heartbeat round failed: {}", e),
        }
    }
}

async fn ring_heartbeat_loop(state: Arc<ServerState>) {
    let mut interval = tokio::time::interval(state.ring_monitor.settings().interval);

    loop {
        interval.tick().await;

        if let Some(outcome) = state.ring_monitor.tick().await {
            tracing::info!("Ring heartbeat outcome: {:?}", outcome);
        }
    }
}

async fn recalculate_loop(state: Arc<ServerState>) {
    let period = Duration::from_secs(state.config.maintenance.recalculate_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;

        if let Err(e) = state.recalculate_ranges.run().await {
            tracing::warn!("Read range recalculation failed: {}", e);
        }
    }
}

async fn reconcile_loop<T: SyncedTable>(state: Arc<ServerState>, table: T) {
    let period = Duration::from_secs(state.config.maintenance.reconcile_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;

        let others = state.peers.others().await;
        match state.reconciler.reconcile(&table, &others).await {
            Ok(ReconcileOutcome::Repaired(rows)) => {
                tracing::info!("Repaired {} table, now {} row(s)", table.name(), rows.len());
            }
            Ok(ReconcileOutcome::Unchanged) => {}
            Err(e) => tracing::warn!("Reconciling {} table failed: {}", table.name(), e),
        }
    }
}

fn status_for(error: &GeoShardError) -> StatusCode {
    match error {
        GeoShardError::NotFound(_) => StatusCode::NOT_FOUND,
        GeoShardError::Conflict(_) => StatusCode::CONFLICT,
        GeoShardError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        GeoShardError::NoShardAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        GeoShardError::ReconciliationInconclusive { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GeoShardError::PeerUnreachable { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: GeoShardError) -> Response {
    let resp = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(error.to_string()),
    };
    (status_for(&error), Json(resp)).into_response()
}

fn ok_response<T: Serialize>(data: T) -> Response {
    let resp = ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    };
    (StatusCode::OK, Json(resp)).into_response()
}

async fn heartbeat_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// Served bare so peers can diff it row by row.
async fn list_shards(State(state): State<Arc<ServerState>>) -> Response {
    match state.directory.find_all().await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn add_shard(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<AddShardBody>,
) -> Response {
    let result = match state
        .place_shard
        .run(PlaceShardOperationRequest {
            base_addr: body.base_addr,
        })
        .await
    {
        Ok(result) => result,
        Err(e) => return error_response(e),
    };

    let others = state.peers.others().await;
    let propagated_to = result
        .topology_update()
        .broadcast(state.transport.as_ref(), &others)
        .await;

    ok_response(PlacementResponse {
        updated: result
            .updated
            .iter()
            .map(|record| record.base_addr.clone())
            .collect(),
        shard: result.shard,
        split_from: result.split_from,
        propagated_to,
    })
}

async fn remove_shard_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RemoveShardBody>,
) -> Response {
    let summary = match state
        .remove_shard
        .run(RemoveShardOperationRequest {
            base_addr: body.base_addr,
            use_backup_for_recovery: body.use_backup_for_recovery,
        })
        .await
    {
        Ok(summary) => summary,
        Err(e) => return error_response(e),
    };

    let others = state.peers.others().await;
    let propagated_to = summary
        .topology_update()
        .broadcast(state.transport.as_ref(), &others)
        .await;

    ok_response(RemovalResponse {
        removed: summary.removed.base_addr.clone(),
        relinked: summary.relinked,
        absorbed_by: summary.absorbed_by,
        redistributed_via: summary.redistributed_via,
        refreshed: summary.refreshed,
        completed_at: summary.completed_at.to_rfc3339(),
        propagated_to,
    })
}

/// Applies a change made on another node. Never re-broadcast.
async fn apply_updates(
    State(state): State<Arc<ServerState>>,
    Json(update): Json<TopologyUpdate>,
) -> Response {
    let _guard = state.lock.acquire().await;
    match update.apply(state.directory.as_ref()).await {
        Ok(()) => ok_response(serde_json::json!({
            "removed": update.removed.len(),
            "upserted": update.upserted.len(),
        })),
        Err(e) => error_response(e),
    }
}

async fn list_peers(State(state): State<Arc<ServerState>>) -> Response {
    (StatusCode::OK, Json(state.peers.records().await)).into_response()
}

async fn register_peer(
    State(state): State<Arc<ServerState>>,
    Json(announcement): Json<PeerAnnouncement>,
) -> Response {
    let addr = announcement.peer.base_addr.trim().to_string();
    let added = match state.peers.add(&addr).await {
        Ok(added) => added,
        Err(e) => return error_response(e),
    };
    if added {
        tracing::info!("Registered peer {}", addr);
    }

    if !announcement.forwarded {
        let forwarded = PeerAnnouncement {
            peer: announcement.peer.clone(),
            forwarded: true,
        };
        let targets: Vec<String> = state
            .peers
            .others()
            .await
            .into_iter()
            .filter(|peer| *peer != addr)
            .collect();

        for target in targets {
            if let Err(e) = state.transport.announce_peer(&target, &forwarded).await {
                tracing::warn!("Failed to forward peer {} to {}: {}", addr, target, e);
            }
        }
    }

    ok_response(serde_json::json!({ "added": added }))
}

async fn suspect_peer(
    State(state): State<Arc<ServerState>>,
    Json(notice): Json<SuspectNotice>,
) -> Response {
    let confirmed = state.ring_monitor.corroborate(notice.base_addr.trim()).await;
    (StatusCode::OK, Json(SuspectReply { confirmed })).into_response()
}

async fn route_api_request(
    State(state): State<Arc<ServerState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<RouteQuery>,
    body: Bytes,
) -> Response {
    let request = RoutedRequest {
        method,
        path_and_query: uri
            .path_and_query()
            .map(|value| value.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        body,
    };

    match state
        .route_request
        .run(RouteRequestOperationRequest {
            request,
            target: query.target(),
        })
        .await
    {
        Ok(result) => {
            let status =
                StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::OK);
            (status, Json(result)).into_response()
        }
        Err(e) => error_response(e),
    }
}
