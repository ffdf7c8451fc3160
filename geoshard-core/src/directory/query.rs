use crate::geo::range::{MAX_LNG, MIN_LNG};
use crate::{GeoPoint, GeoRange, ShardRecord};

pub const METERS_PER_DEGREE: f64 = 111_000.0;

/// Which of a shard's two ranges a bound applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    Write,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    MinLat,
    MaxLat,
    MinLng,
    MaxLng,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Gt,
    Lte,
}

/// Predicate over shard records that every directory backend can evaluate,
/// either in memory or translated to its own query language.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardQuery {
    All,
    Addr(String),
    BackupAddr(String),
    Bound {
        range: RangeKind,
        bound: Bound,
        cmp: Comparison,
        value: f64,
    },
    And(Vec<ShardQuery>),
    Or(Vec<ShardQuery>),
}

impl ShardQuery {
    pub fn bound(range: RangeKind, bound: Bound, cmp: Comparison, value: f64) -> Self {
        ShardQuery::Bound {
            range,
            bound,
            cmp,
            value,
        }
    }

    pub fn matches(&self, record: &ShardRecord) -> bool {
        match self {
            ShardQuery::All => true,
            ShardQuery::Addr(addr) => record.base_addr == *addr,
            ShardQuery::BackupAddr(addr) => record.backup_addr == *addr,
            ShardQuery::Bound {
                range,
                bound,
                cmp,
                value,
            } => {
                let actual = bound_value(record, *range, *bound);
                match cmp {
                    Comparison::Eq => actual == *value,
                    Comparison::Gt => actual > *value,
                    Comparison::Lte => actual <= *value,
                }
            }
            ShardQuery::And(queries) => queries.iter().all(|query| query.matches(record)),
            ShardQuery::Or(queries) => queries.iter().any(|query| query.matches(record)),
        }
    }

    /// Shards whose `range` may hold points within `radius_meters` of
    /// `center`. The circle is approximated by its bounding box; a box that
    /// crosses the ±180 seam becomes two longitude bands. A non-positive
    /// radius matches every shard.
    pub fn covering(center: GeoPoint, radius_meters: f64, range: RangeKind) -> Self {
        if radius_meters.is_nan() || radius_meters <= 0.0 {
            return ShardQuery::All;
        }

        let lat_delta = radius_meters / METERS_PER_DEGREE;
        let mut clauses = vec![
            ShardQuery::bound(range, Bound::MaxLat, Comparison::Gt, center.lat - lat_delta),
            ShardQuery::bound(range, Bound::MinLat, Comparison::Lte, center.lat + lat_delta),
        ];

        let lng_meters_per_degree = center.lat.to_radians().cos() * METERS_PER_DEGREE;
        if lng_meters_per_degree > 0.0 {
            let lng_delta = radius_meters / lng_meters_per_degree;
            let clause = longitude_clause(center.lng - lng_delta, center.lng + lng_delta, range);
            clauses.extend(clause);
        }

        ShardQuery::And(clauses)
    }

    /// Shards whose write range has a bound lying on one of `range`'s edges.
    /// Callers still have to check full-edge alignment.
    pub fn touching_edges(range: &GeoRange) -> Self {
        let write = RangeKind::Write;
        ShardQuery::Or(vec![
            ShardQuery::bound(write, Bound::MinLat, Comparison::Eq, range.max_lat),
            ShardQuery::bound(write, Bound::MaxLat, Comparison::Eq, range.min_lat),
            ShardQuery::bound(write, Bound::MinLng, Comparison::Eq, range.max_lng),
            ShardQuery::bound(write, Bound::MaxLng, Comparison::Eq, range.min_lng),
        ])
    }
}

fn longitude_clause(min: f64, max: f64, range: RangeKind) -> Option<ShardQuery> {
    let span = MAX_LNG - MIN_LNG;
    if max - min >= span {
        return None;
    }

    if min < MIN_LNG {
        return Some(ShardQuery::Or(vec![
            longitude_band(MIN_LNG, max, range),
            longitude_band(min + span, MAX_LNG, range),
        ]));
    }

    if max > MAX_LNG {
        return Some(ShardQuery::Or(vec![
            longitude_band(min, MAX_LNG, range),
            longitude_band(MIN_LNG, max - span, range),
        ]));
    }

    Some(longitude_band(min, max, range))
}

fn longitude_band(min: f64, max: f64, range: RangeKind) -> ShardQuery {
    ShardQuery::And(vec![
        ShardQuery::bound(range, Bound::MaxLng, Comparison::Gt, min),
        ShardQuery::bound(range, Bound::MinLng, Comparison::Lte, max),
    ])
}

pub fn bound_value(record: &ShardRecord, range: RangeKind, bound: Bound) -> f64 {
    let range = match range {
        RangeKind::Write => &record.write_range,
        RangeKind::Read => &record.read_range,
    };

    match bound {
        Bound::MinLat => range.min_lat,
        Bound::MaxLat => range.max_lat,
        Bound::MinLng => range.min_lng,
        Bound::MaxLng => range.max_lng,
    }
}
