use super::range::GeoRange;

/// Coordinate-compressed view of the world. Each cell lies between two
/// consecutive breakpoints on each axis, so every cell is either wholly
/// inside some range or wholly outside all of them.
#[derive(Debug, Clone)]
pub struct OccupancyGrid {
    lats: Vec<f64>,
    lngs: Vec<f64>,
    // filled[row][col]; rows follow latitude, columns follow longitude
    filled: Vec<Vec<bool>>,
}

impl OccupancyGrid {
    pub fn build<'a>(ranges: impl IntoIterator<Item = &'a GeoRange>) -> Self {
        let ranges: Vec<&GeoRange> = ranges.into_iter().collect();

        let mut lats = vec![GeoRange::WORLD.min_lat, GeoRange::WORLD.max_lat];
        let mut lngs = vec![GeoRange::WORLD.min_lng, GeoRange::WORLD.max_lng];
        for range in &ranges {
            insert_sorted_unique(&mut lats, range.min_lat);
            insert_sorted_unique(&mut lats, range.max_lat);
            insert_sorted_unique(&mut lngs, range.min_lng);
            insert_sorted_unique(&mut lngs, range.max_lng);
        }

        let rows = lats.len() - 1;
        let cols = lngs.len() - 1;
        let mut filled = vec![vec![false; cols]; rows];
        for (row, cells) in filled.iter_mut().enumerate() {
            for (col, cell) in cells.iter_mut().enumerate() {
                let bounds = GeoRange::new(lats[row], lats[row + 1], lngs[col], lngs[col + 1]);
                *cell = ranges.iter().any(|range| range.contains(&bounds));
            }
        }

        Self { lats, lngs, filled }
    }

    pub fn rows(&self) -> usize {
        self.filled.len()
    }

    pub fn cols(&self) -> usize {
        self.filled.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_filled(&self, row: usize, col: usize) -> bool {
        self.filled[row][col]
    }

    /// Largest empty rectangle by area in square degrees, or `None` when no
    /// empty region of positive area is left. Ties keep the first rectangle
    /// found scanning rows then columns.
    pub fn largest_free_rectangle(&self) -> Option<GeoRange> {
        let mut best: Option<(f64, GeoRange)> = None;

        for row in 0..self.rows() {
            for col in 0..self.cols() {
                if self.filled[row][col] {
                    continue;
                }

                if let Some((area, range)) = self.largest_from(row, col) {
                    if best.map_or(true, |(best_area, _)| area > best_area) {
                        best = Some((area, range));
                    }
                }
            }
        }

        best.map(|(_, range)| range)
    }

    // Grows height first, then width. A rectangle is accepted only while its
    // bottom row and right column are clear; earlier steps already cleared
    // everything above and to the left.
    fn largest_from(&self, row: usize, col: usize) -> Option<(f64, GeoRange)> {
        let mut best: Option<(f64, GeoRange)> = None;

        for bottom in row..self.rows() {
            if self.filled[bottom][col] {
                break;
            }

            for right in col..self.cols() {
                if self.edge_blocked(row, col, bottom, right) {
                    break;
                }

                let range = GeoRange::new(
                    self.lats[row],
                    self.lats[bottom + 1],
                    self.lngs[col],
                    self.lngs[right + 1],
                );
                let area = range.area();
                if area > best.map_or(0.0, |(best_area, _)| best_area) {
                    best = Some((area, range));
                }
            }
        }

        best
    }

    fn edge_blocked(&self, top: usize, left: usize, bottom: usize, right: usize) -> bool {
        (left..=right).any(|col| self.filled[bottom][col])
            || (top..=bottom).any(|row| self.filled[row][right])
    }
}

fn insert_sorted_unique(values: &mut Vec<f64>, value: f64) {
    let index = values.partition_point(|existing| *existing < value);
    if values.get(index) != Some(&value) {
        values.insert(index, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_world_is_one_free_cell() {
        let grid = OccupancyGrid::build(std::iter::empty());
        assert_eq!(grid.rows(), 1);
        assert_eq!(grid.cols(), 1);
        assert_eq!(grid.largest_free_rectangle(), Some(GeoRange::WORLD));
    }

    #[test]
    fn test_fully_covered_world_has_no_free_rectangle() {
        let west = GeoRange::new(-90.0, 90.0, -180.0, 0.0);
        let east = GeoRange::new(-90.0, 90.0, 0.0, 180.0);
        let grid = OccupancyGrid::build([&west, &east]);

        assert_eq!(grid.largest_free_rectangle(), None);
    }

    #[test]
    fn test_breakpoints_are_deduplicated() {
        let a = GeoRange::new(-90.0, 0.0, -180.0, 0.0);
        let b = GeoRange::new(0.0, 90.0, -180.0, 0.0);
        let grid = OccupancyGrid::build([&a, &b]);

        assert_eq!(grid.rows(), 2);
        assert_eq!(grid.cols(), 2);
        assert!(grid.is_filled(0, 0));
        assert!(grid.is_filled(1, 0));
        assert!(!grid.is_filled(0, 1));
    }

    #[test]
    fn test_largest_free_rectangle_avoids_occupied_cells() {
        let occupied = [
            GeoRange::new(-90.0, 0.0, -180.0, 0.0),
            GeoRange::new(30.0, 90.0, 90.0, 180.0),
        ];
        let grid = OccupancyGrid::build(occupied.iter());
        let free = grid.largest_free_rectangle().unwrap();

        for range in &occupied {
            assert!(!free.overlaps(range), "{:?} overlaps {:?}", free, range);
        }
        assert_eq!(free, GeoRange::new(0.0, 90.0, -180.0, 90.0));
    }

    #[test]
    fn test_free_rectangle_in_middle_of_world() {
        let occupied = [
            GeoRange::new(-90.0, 90.0, -180.0, -60.0),
            GeoRange::new(-90.0, 90.0, 60.0, 180.0),
            GeoRange::new(-90.0, -30.0, -60.0, 60.0),
            GeoRange::new(30.0, 90.0, -60.0, 60.0),
        ];
        let grid = OccupancyGrid::build(occupied.iter());

        assert_eq!(
            grid.largest_free_rectangle(),
            Some(GeoRange::new(-30.0, 30.0, -60.0, 60.0))
        );
    }
}
