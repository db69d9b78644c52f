//! Tile origin enumeration and job partitioning.
//!
//! A [`TileGrid`] covers an area with fixed-size tiles, starting at the
//! top-left corner and walking left to right, then top to bottom. The last
//! column and row may overflow the area's right and bottom edges: tiles are
//! never clipped, so every point of the area is covered by a full-size tile.

use crate::extent::{GeoExtent, TileFootprint};
use serde::{Deserialize, Serialize};

/// Geographic top-left corner of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TileOrigin {
    pub latitude: f64,
    pub longitude: f64,
}

impl TileOrigin {
    #[inline]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Identifier shared by a tile's image row and its label rows.
    pub fn tile_id(&self) -> String {
        format!("image_{}_{}.jpg", self.latitude, self.longitude)
    }

    #[inline]
    pub fn extent(&self, footprint: TileFootprint) -> GeoExtent {
        GeoExtent::from_top_left(self.latitude, self.longitude, footprint)
    }
}

/// Regular grid of tiles over an area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    area: GeoExtent,
    footprint: TileFootprint,
}

impl TileGrid {
    pub fn new(area: GeoExtent, footprint: TileFootprint) -> Self {
        Self { area, footprint }
    }

    pub fn area(&self) -> GeoExtent {
        self.area
    }

    pub fn footprint(&self) -> TileFootprint {
        self.footprint
    }

    /// A fresh iterator over the grid; each call restarts from the top-left.
    pub fn iter(&self) -> TileGridIter {
        TileGridIter { grid: *self, row: 0, col: 0 }
    }

    /// Number of tiles the grid yields.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl IntoIterator for &TileGrid {
    type Item = TileOrigin;
    type IntoIter = TileGridIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Row-major iterator over a [`TileGrid`].
///
/// Positions are derived from the row/column index rather than by repeated
/// addition, so long rows do not drift.
#[derive(Debug, Clone)]
pub struct TileGridIter {
    grid: TileGrid,
    row: u64,
    col: u64,
}

impl Iterator for TileGridIter {
    type Item = TileOrigin;

    fn next(&mut self) -> Option<TileOrigin> {
        let area = self.grid.area;
        let footprint = self.grid.footprint;

        loop {
            let latitude = area.y_max - self.row as f64 * footprint.height;
            if latitude <= area.y_min {
                return None;
            }

            let longitude = area.x_min + self.col as f64 * footprint.width;
            if longitude < area.x_max {
                self.col += 1;
                return Some(TileOrigin::new(latitude, longitude));
            }

            self.row += 1;
            self.col = 0;
        }
    }
}

/// Where tile origins come from: a computed grid or an externally supplied
/// list (for irregular coverage areas). Both are consumed identically.
#[derive(Debug, Clone)]
pub enum TilePlan {
    Computed(TileGrid),
    Listed(Vec<TileOrigin>),
}

impl TilePlan {
    pub fn origins(&self) -> Box<dyn Iterator<Item = TileOrigin> + '_> {
        match self {
            TilePlan::Computed(grid) => Box::new(grid.iter()),
            TilePlan::Listed(origins) => Box::new(origins.iter().copied()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TilePlan::Computed(grid) => grid.len(),
            TilePlan::Listed(origins) => origins.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits `items` into at most `groups` contiguous groups of
/// `ceil(len / groups)` items each. Later groups may be shorter, and fewer
/// groups than requested are returned when there are not enough items.
pub fn split_even<T>(items: &[T], groups: usize) -> std::slice::Chunks<'_, T> {
    let groups = groups.max(1);
    let per_group = items.len().div_ceil(groups).max(1);
    items.chunks(per_group)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(x_min: f64, y_min: f64, x_max: f64, y_max: f64, size: f64) -> TileGrid {
        TileGrid::new(
            GeoExtent::new(x_min, y_min, x_max, y_max).unwrap(),
            TileFootprint::square(size).unwrap(),
        )
    }

    #[test]
    fn enumerates_row_major_from_top_left() {
        let origins: Vec<_> = grid(0.0, 0.0, 2.0, 2.0, 1.0).iter().collect();
        assert_eq!(
            origins,
            vec![
                TileOrigin::new(2.0, 0.0),
                TileOrigin::new(2.0, 1.0),
                TileOrigin::new(1.0, 0.0),
                TileOrigin::new(1.0, 1.0),
            ]
        );
    }

    #[test]
    fn iteration_is_restartable() {
        let g = grid(0.0, 0.0, 3.0, 2.0, 1.0);
        let first: Vec<_> = g.iter().collect();
        let second: Vec<_> = (&g).into_iter().collect();
        assert_eq!(first, second);
        assert_eq!(g.len(), 6);
    }

    #[test]
    fn last_column_and_row_overflow_the_area() {
        let g = grid(0.0, 0.0, 2.5, 1.5, 1.0);
        let origins: Vec<_> = g.iter().collect();
        assert_eq!(origins.len(), 6);

        let last = origins.last().unwrap();
        let extent = last.extent(g.footprint());
        assert_eq!(extent.x_max, 3.0);
        assert_eq!(extent.y_min, -0.5);
    }

    #[test]
    fn degenerate_area_yields_nothing() {
        assert!(grid(0.0, 0.0, 0.0, 1.0, 1.0).is_empty());
        assert!(grid(0.0, 1.0, 1.0, 1.0, 1.0).is_empty());
    }

    #[test]
    fn origins_do_not_accumulate_drift() {
        let size = 0.0014272;
        let g = grid(151.1331, -33.8912, 151.1703, -33.8672, size);
        let cols = g.iter().take_while(|o| o.latitude == -33.8672).count();
        let last = g.iter().nth(cols - 1).unwrap();
        assert_eq!(last.longitude, 151.1331 + (cols - 1) as f64 * size);
    }

    #[test]
    fn listed_plan_preserves_order() {
        let listed = vec![TileOrigin::new(5.0, 1.0), TileOrigin::new(-3.0, 2.0)];
        let plan = TilePlan::Listed(listed.clone());
        assert_eq!(plan.origins().collect::<Vec<_>>(), listed);
        assert_eq!(plan.len(), 2);

        let computed = TilePlan::Computed(grid(0.0, 0.0, 2.0, 2.0, 1.0));
        assert_eq!(computed.origins().count(), 4);
    }

    #[test]
    fn tile_id_uses_origin() {
        assert_eq!(TileOrigin::new(-33.8672, 151.1331).tile_id(), "image_-33.8672_151.1331.jpg");
    }

    #[test]
    fn split_even_uses_ceiling_group_size() {
        let items: Vec<u32> = (0..10).collect();
        let groups: Vec<_> = split_even(&items, 4).collect();
        assert_eq!(groups.len(), 4);
        assert_eq!(groups[0], &[0, 1, 2]);
        assert_eq!(groups[3], &[9]);

        let few: Vec<_> = split_even(&items[..3], 8).collect();
        assert_eq!(few.len(), 3);

        assert_eq!(split_even::<u32>(&[], 2).count(), 0);
        assert_eq!(split_even(&items, 0).count(), 1);
    }
}
