use crate::{GeoRange, ShardRecord};

#[derive(Debug, Clone, PartialEq)]
pub struct BackupAssignment {
    /// Backup target for the joining shard.
    pub backup_addr: String,
    /// The farthest existing shard, now backing up to the joining shard.
    /// Must be persisted and told about its new target.
    pub relinked: Option<ShardRecord>,
    /// Where the relinked shard used to send its replicas; that node may
    /// drop them.
    pub previous_target: Option<String>,
}

/// Picks a backup for a shard joining with `new_range`.
///
/// The existing shard whose write range is centered farthest away hands its
/// backup target over to the newcomer and starts backing up to the newcomer
/// instead. A shard joining an empty directory backs up to itself.
pub fn choose_backup(
    new_addr: &str,
    new_range: &GeoRange,
    existing: &[ShardRecord],
) -> BackupAssignment {
    let candidates = existing.iter().filter(|shard| shard.base_addr != new_addr);
    let Some(farthest) = farthest_shard(new_range, candidates) else {
        return BackupAssignment {
            backup_addr: new_addr.to_string(),
            relinked: None,
            previous_target: None,
        };
    };

    let mut relinked = farthest.clone();
    relinked.backup_addr = new_addr.to_string();

    BackupAssignment {
        backup_addr: farthest.backup_addr.clone(),
        relinked: Some(relinked),
        previous_target: Some(farthest.backup_addr.clone()),
    }
}

/// First shard with the greatest center-to-center distance from `range`.
pub fn farthest_shard<'a>(
    range: &GeoRange,
    candidates: impl IntoIterator<Item = &'a ShardRecord>,
) -> Option<&'a ShardRecord> {
    let target = range.center();
    let mut farthest: Option<(f64, &ShardRecord)> = None;

    for shard in candidates {
        let distance = target.distance_to(&shard.write_range.center());
        if farthest.map_or(true, |(max, _)| distance > max) {
            farthest = Some((distance, shard));
        }
    }

    farthest.map(|(_, shard)| shard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_shard_backs_up_to_itself() {
        let assignment = choose_backup("a", &GeoRange::WORLD, &[]);
        assert_eq!(assignment.backup_addr, "a");
        assert!(assignment.relinked.is_none());
    }

    #[test]
    fn test_second_shard_swaps_with_first() {
        let existing = vec![ShardRecord::new(
            "a",
            "a",
            GeoRange::new(-90.0, 90.0, 0.0, 180.0),
        )];
        let assignment = choose_backup("b", &GeoRange::new(-90.0, 90.0, -180.0, 0.0), &existing);

        assert_eq!(assignment.backup_addr, "a");
        let relinked = assignment.relinked.unwrap();
        assert_eq!(relinked.base_addr, "a");
        assert_eq!(relinked.backup_addr, "b");
        assert_eq!(assignment.previous_target.as_deref(), Some("a"));
    }

    #[test]
    fn test_farthest_shard_hands_over_its_backup() {
        let existing = vec![
            ShardRecord::new("near", "far", GeoRange::new(0.0, 10.0, 0.0, 10.0)),
            ShardRecord::new("far", "near", GeoRange::new(0.0, 10.0, 170.0, 180.0)),
        ];
        let new_range = GeoRange::new(0.0, 10.0, 10.0, 20.0);
        let assignment = choose_backup("new", &new_range, &existing);

        assert_eq!(assignment.backup_addr, "near");
        assert_eq!(assignment.relinked.unwrap().base_addr, "far");
    }

    #[test]
    fn test_distance_wraps_around_seam() {
        // "east" sits just across the seam and is therefore close
        let existing = vec![
            ShardRecord::new("east", "mid", GeoRange::new(0.0, 10.0, 170.0, 180.0)),
            ShardRecord::new("mid", "east", GeoRange::new(0.0, 10.0, 0.0, 10.0)),
        ];
        let new_range = GeoRange::new(0.0, 10.0, -180.0, -170.0);
        let assignment = choose_backup("west", &new_range, &existing);

        assert_eq!(assignment.relinked.unwrap().base_addr, "mid");
    }

    #[test]
    fn test_never_self_backed_when_others_exist() {
        let existing = vec![
            ShardRecord::new("a", "c", GeoRange::new(-90.0, 90.0, -180.0, 0.0)),
            ShardRecord::new("b", "a", GeoRange::new(-90.0, 0.0, 0.0, 180.0)),
            ShardRecord::new("c", "b", GeoRange::new(0.0, 90.0, 0.0, 180.0)),
        ];

        for (addr, range) in [
            ("d", GeoRange::new(-90.0, 90.0, -180.0, -90.0)),
            ("e", GeoRange::new(0.0, 90.0, 90.0, 180.0)),
        ] {
            let assignment = choose_backup(addr, &range, &existing);
            assert_ne!(assignment.backup_addr, addr);
        }
    }
}
