//! Geoshard Core - shard directory and topology management for a
//! geographically partitioned post store
//!
//! A coordinator-free routing tier that:
//! - partitions the globe into rectangular write ranges, one per shard
//! - places joining shards into free space or splits the largest shard
//! - repairs the partition when a shard leaves or fails
//! - fans client requests out to every shard covering an area
//! - keeps its tables in step with other routing nodes by majority vote

pub mod backup;
pub mod cluster_client;
pub mod directory;
pub mod error;
pub mod geo;
pub mod heartbeat;
pub mod operations;
pub mod peers;
pub mod reconcile;
pub mod shard;
pub mod topology;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use backup::{BackupAssignment, choose_backup, farthest_shard};
pub use cluster_client::{
    ClusterTransport, HttpClusterClient, PeerAnnouncement, ProbeTarget, RedistributionPlan,
    RedistributionTarget, RoutedRequest, SuspectNotice, SuspectReply,
};
pub use directory::{
    DirectoryBuilder, MemoryDirectory, RangeKind, RedisDirectory, ShardDirectory, ShardQuery,
    SqliteDirectory,
};
pub use error::{GeoShardError, Result};
pub use geo::{GeoPoint, GeoRange, OccupancyGrid};
pub use heartbeat::{
    FailureHandler, HeartbeatSettings, MissCounter, RingHeartbeatMonitor, ShardHeartbeatMonitor,
    SuspicionOutcome,
};
pub use operations::{
    EdgeAlignedGapFiller, GapFiller, PlaceShardOperation, PlaceShardOperationRequest,
    PlaceShardOperationResult, RecalculateRangesOperation, RecalculateRangesOperationResult,
    RemoveShardOperation, RemoveShardOperationRequest, RepairSummary, RouteRequestOperation,
    RouteRequestOperationRequest, RouteRequestOperationResult, RouteTarget,
};
pub use peers::{PeerDirectory, PeerRecord};
pub use reconcile::{
    MajorityReconciler, PeerTable, ReconcileOutcome, Reconciler, ShardTable, SyncedTable,
};
pub use shard::ShardRecord;
pub use topology::{TopologyLock, TopologyUpdate};
