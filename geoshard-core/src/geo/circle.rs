use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Euclidean distance in degrees, taking the shorter way around on each
    /// axis.
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        let lng = shortest_arc(self.lng, other.lng, 360.0);
        let lat = shortest_arc(self.lat, other.lat, 180.0);
        (lng * lng + lat * lat).sqrt()
    }
}

fn shortest_arc(a: f64, b: f64, circle_len: f64) -> f64 {
    if a == b {
        return 0.0;
    }
    circular_distance(a, b, circle_len).min(circular_distance(b, a, circle_len))
}

/// Arc length travelled from `start` to `end` moving only forward around a
/// circle of length `circle_len`. Equal positions count as a full turn.
pub fn circular_distance(start: f64, end: f64, circle_len: f64) -> f64 {
    if start < end {
        end - start
    } else {
        end + circle_len - start
    }
}
