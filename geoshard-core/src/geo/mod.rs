//! Planar geometry over latitude/longitude degrees.

pub mod circle;
pub mod occupancy;
pub mod range;

pub use circle::{GeoPoint, circular_distance};
pub use occupancy::OccupancyGrid;
pub use range::GeoRange;
