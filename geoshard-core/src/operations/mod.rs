pub mod merge;
pub mod place_shard;
pub mod recalculate_ranges;
pub mod remove_shard;
pub mod route_request;

pub use merge::{loosely_equal, merge_responses};
pub use place_shard::{PlaceShardOperation, PlaceShardOperationRequest, PlaceShardOperationResult};
pub use recalculate_ranges::{
    RecalculateRangesOperation, RecalculateRangesOperationResult, refresh_read_range,
};
pub use remove_shard::{
    EdgeAlignedGapFiller, GapFiller, RemoveShardOperation, RemoveShardOperationRequest,
    RepairSummary,
};
pub use route_request::{
    RouteRequestOperation, RouteRequestOperationRequest, RouteRequestOperationResult, RouteTarget,
};
