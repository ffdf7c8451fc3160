use super::circle::{GeoPoint, circular_distance};
use crate::{GeoShardError, Result};
use serde::{Deserialize, Serialize};

pub const MIN_LAT: f64 = -90.0;
pub const MAX_LAT: f64 = 90.0;
pub const MIN_LNG: f64 = -180.0;
pub const MAX_LNG: f64 = 180.0;

/// Axis-aligned latitude/longitude rectangle in degrees.
///
/// Stored ranges never cross the ±180 longitude seam; wraparound is only
/// considered when querying and when measuring distances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoRange {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl GeoRange {
    pub const WORLD: GeoRange = GeoRange {
        min_lat: MIN_LAT,
        max_lat: MAX_LAT,
        min_lng: MIN_LNG,
        max_lng: MAX_LNG,
    };

    pub fn new(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bounds = [self.min_lat, self.max_lat, self.min_lng, self.max_lng];
        if bounds.iter().any(|value| !value.is_finite()) {
            return Err(GeoShardError::InvalidRequest(format!(
                "range has non-finite bounds: {:?}",
                self
            )));
        }

        if self.min_lat > self.max_lat || self.min_lng > self.max_lng {
            return Err(GeoShardError::InvalidRequest(format!(
                "range minimum exceeds maximum: {:?}",
                self
            )));
        }

        if self.min_lat < MIN_LAT
            || self.max_lat > MAX_LAT
            || self.min_lng < MIN_LNG
            || self.max_lng > MAX_LNG
        {
            return Err(GeoShardError::InvalidRequest(format!(
                "range lies outside the world: {:?}",
                self
            )));
        }

        Ok(())
    }

    pub fn lat_span(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn lng_span(&self) -> f64 {
        self.max_lng - self.min_lng
    }

    /// Area in square degrees.
    pub fn area(&self) -> f64 {
        self.lat_span() * self.lng_span()
    }

    /// Grows this range to the smallest rectangle holding both ranges.
    /// Returns whether any bound moved.
    pub fn expand_to_contain(&mut self, other: &GeoRange) -> bool {
        let before = *self;
        self.min_lat = self.min_lat.min(other.min_lat);
        self.max_lat = self.max_lat.max(other.max_lat);
        self.min_lng = self.min_lng.min(other.min_lng);
        self.max_lng = self.max_lng.max(other.max_lng);
        before != *self
    }

    pub fn expanded_to_contain(mut self, other: &GeoRange) -> GeoRange {
        self.expand_to_contain(other);
        self
    }

    pub fn contains(&self, other: &GeoRange) -> bool {
        self.min_lat <= other.min_lat
            && self.max_lat >= other.max_lat
            && self.min_lng <= other.min_lng
            && self.max_lng >= other.max_lng
    }

    pub fn contains_point(&self, point: &GeoPoint) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.lat)
            && (self.min_lng..=self.max_lng).contains(&point.lng)
    }

    /// True when the two ranges share interior area. Ranges that only touch
    /// along an edge or at a corner do not overlap.
    pub fn overlaps(&self, other: &GeoRange) -> bool {
        self.min_lat < other.max_lat
            && other.min_lat < self.max_lat
            && self.min_lng < other.max_lng
            && other.min_lng < self.max_lng
    }

    /// True when both ranges have the same extent along one axis and touch
    /// along the other, so that their union is again a rectangle.
    pub fn shares_full_edge_with(&self, other: &GeoRange) -> bool {
        let same_lng = self.min_lng == other.min_lng && self.max_lng == other.max_lng;
        let same_lat = self.min_lat == other.min_lat && self.max_lat == other.max_lat;
        let touch_lat = self.max_lat == other.min_lat || self.min_lat == other.max_lat;
        let touch_lng = self.max_lng == other.min_lng || self.min_lng == other.max_lng;

        (same_lng && touch_lat) || (same_lat && touch_lng)
    }

    /// Midpoint along each axis, measured forward from the minimum bound
    /// around the circle and wrapped back into the valid range.
    pub fn center(&self) -> GeoPoint {
        let lng_extent = circular_distance(self.min_lng, self.max_lng, 360.0);
        let lat_extent = circular_distance(self.min_lat, self.max_lat, 180.0);

        let mut lng = self.min_lng + lng_extent / 2.0;
        let mut lat = self.min_lat + lat_extent / 2.0;

        if lng > MAX_LNG {
            lng -= 360.0;
        } else if lng < MIN_LNG {
            lng += 360.0;
        }

        if lat > MAX_LAT {
            lat -= 180.0;
        } else if lat < MIN_LAT {
            lat += 180.0;
        }

        GeoPoint { lat, lng }
    }

    /// Bisects the longer axis; ties go to longitude. Returns the lower half
    /// first. Both halves share the bisecting boundary.
    pub fn split_longer_axis(&self) -> (GeoRange, GeoRange) {
        if self.lat_span() > self.lng_span() {
            let middle = (self.min_lat + self.max_lat) / 2.0;
            (
                GeoRange {
                    max_lat: middle,
                    ..*self
                },
                GeoRange {
                    min_lat: middle,
                    ..*self
                },
            )
        } else {
            let middle = (self.min_lng + self.max_lng) / 2.0;
            (
                GeoRange {
                    max_lng: middle,
                    ..*self
                },
                GeoRange {
                    min_lng: middle,
                    ..*self
                },
            )
        }
    }
}

impl Default for GeoRange {
    fn default() -> Self {
        Self::WORLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_contains_both_inputs() {
        let mut a = GeoRange::new(0.0, 10.0, 0.0, 10.0);
        let b = GeoRange::new(-5.0, 3.0, 8.0, 20.0);

        assert!(a.expand_to_contain(&b));
        assert!(a.contains(&GeoRange::new(0.0, 10.0, 0.0, 10.0)));
        assert!(a.contains(&b));
        assert_eq!(a, GeoRange::new(-5.0, 10.0, 0.0, 20.0));
    }

    #[test]
    fn test_expand_is_noop_when_already_contained() {
        let mut outer = GeoRange::new(-10.0, 10.0, -10.0, 10.0);
        let inner = GeoRange::new(-1.0, 1.0, -2.0, 2.0);

        assert!(!outer.expand_to_contain(&inner));
        assert_eq!(outer, GeoRange::new(-10.0, 10.0, -10.0, 10.0));
    }

    #[test]
    fn test_split_world_bisects_longitude() {
        let (lower, upper) = GeoRange::WORLD.split_longer_axis();

        assert_eq!(lower, GeoRange::new(-90.0, 90.0, -180.0, 0.0));
        assert_eq!(upper, GeoRange::new(-90.0, 90.0, 0.0, 180.0));
        assert_eq!(lower.area() + upper.area(), GeoRange::WORLD.area());
        assert!(!lower.overlaps(&upper));
        assert_eq!(lower.expanded_to_contain(&upper), GeoRange::WORLD);
    }

    #[test]
    fn test_split_tall_range_bisects_latitude() {
        let range = GeoRange::new(-90.0, 90.0, 0.0, 45.0);
        let (lower, upper) = range.split_longer_axis();

        assert_eq!(lower, GeoRange::new(-90.0, 0.0, 0.0, 45.0));
        assert_eq!(upper, GeoRange::new(0.0, 90.0, 0.0, 45.0));
        assert_eq!(lower.area() + upper.area(), range.area());
        assert!(lower.shares_full_edge_with(&upper));
    }

    #[test]
    fn test_center_of_world_is_origin() {
        let center = GeoRange::WORLD.center();
        assert_eq!(center.lat, 0.0);
        assert_eq!(center.lng, 0.0);
    }

    #[test]
    fn test_center_of_plain_range_is_midpoint() {
        let center = GeoRange::new(10.0, 20.0, 100.0, 140.0).center();
        assert_eq!(center.lat, 15.0);
        assert_eq!(center.lng, 120.0);
    }

    #[test]
    fn test_overlap_excludes_touching_edges() {
        let a = GeoRange::new(0.0, 10.0, 0.0, 10.0);
        let b = GeoRange::new(0.0, 10.0, 10.0, 20.0);
        let c = GeoRange::new(5.0, 15.0, 5.0, 15.0);

        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
    }

    #[test]
    fn test_full_edge_requires_matching_extent() {
        let a = GeoRange::new(0.0, 10.0, 0.0, 10.0);
        let aligned = GeoRange::new(10.0, 20.0, 0.0, 10.0);
        let offset = GeoRange::new(10.0, 20.0, 0.0, 5.0);
        let corner = GeoRange::new(10.0, 20.0, 10.0, 20.0);

        assert!(a.shares_full_edge_with(&aligned));
        assert!(!a.shares_full_edge_with(&offset));
        assert!(!a.shares_full_edge_with(&corner));
    }

    #[test]
    fn test_validate_rejects_inverted_and_out_of_world() {
        assert!(GeoRange::new(10.0, 0.0, 0.0, 1.0).validate().is_err());
        assert!(GeoRange::new(0.0, 91.0, 0.0, 1.0).validate().is_err());
        assert!(GeoRange::new(0.0, 1.0, f64::NAN, 1.0).validate().is_err());
        assert!(GeoRange::WORLD.validate().is_ok());
    }

    #[test]
    fn test_serializes_with_camel_case_bounds() {
        let json = serde_json::to_value(GeoRange::new(1.0, 2.0, 3.0, 4.0)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"minLat": 1.0, "maxLat": 2.0, "minLng": 3.0, "maxLng": 4.0})
        );
    }
}
