//! Uniform spatial grid over image points for radius queries.

use nalgebra::Point2;

/// Buckets point indices by image cell.
///
/// A radius query only visits the cells overlapping the search square, so
/// proximity tests against thousands of tracked pixels stay cheap.
#[derive(Debug, Clone)]
pub struct FeatureGrid {
    /// Row-major: `cells[row * cols + col]`.
    cells: Vec<Vec<usize>>,
    points: Vec<Point2<f64>>,
    cell_width_inv: f64,
    cell_height_inv: f64,
    cols: usize,
    rows: usize,
}

impl FeatureGrid {
    pub const GRID_COLS: usize = 64;
    pub const GRID_ROWS: usize = 48;

    pub fn new(points: impl IntoIterator<Item = Point2<f64>>, width: u32, height: u32) -> Self {
        let cols = Self::GRID_COLS;
        let rows = Self::GRID_ROWS;
        let cell_width_inv = cols as f64 / f64::from(width.max(1));
        let cell_height_inv = rows as f64 / f64::from(height.max(1));

        let mut grid = Self {
            cells: vec![Vec::new(); cols * rows],
            points: Vec::new(),
            cell_width_inv,
            cell_height_inv,
            cols,
            rows,
        };
        for p in points {
            grid.insert(p);
        }
        grid
    }

    /// Add a point; returns its index.
    pub fn insert(&mut self, p: Point2<f64>) -> usize {
        let idx = self.points.len();
        let (col, row) = self.cell_of(&p);
        self.cells[row * self.cols + col].push(idx);
        self.points.push(p);
        idx
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn cell_of(&self, p: &Point2<f64>) -> (usize, usize) {
        let col = (p.x * self.cell_width_inv).floor().max(0.0) as usize;
        let row = (p.y * self.cell_height_inv).floor().max(0.0) as usize;
        (col.min(self.cols - 1), row.min(self.rows - 1))
    }

    /// Indices of the points within `r` pixels of `(x, y)`.
    pub fn get_features_in_area(&self, x: f64, y: f64, r: f64) -> Vec<usize> {
        let min_col = ((x - r) * self.cell_width_inv).floor().max(0.0) as usize;
        let max_col = (((x + r) * self.cell_width_inv).floor().max(0.0) as usize).min(self.cols - 1);
        let min_row = ((y - r) * self.cell_height_inv).floor().max(0.0) as usize;
        let max_row = (((y + r) * self.cell_height_inv).floor().max(0.0) as usize).min(self.rows - 1);

        let query = Point2::new(x, y);
        let r_sq = r * r;
        let mut found = Vec::new();
        for row in min_row..=max_row {
            for col in min_col..=max_col {
                found.extend(
                    self.cells[row * self.cols + col]
                        .iter()
                        .copied()
                        .filter(|&i| (self.points[i] - query).norm_squared() <= r_sq),
                );
            }
        }
        found
    }

    /// Whether any indexed point lies strictly closer than `r` to `p`.
    pub fn has_neighbor_within(&self, p: &Point2<f64>, r: f64) -> bool {
        self.get_features_in_area(p.x, p.y, r)
            .into_iter()
            .any(|i| (self.points[i] - p).norm() < r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radius_query_matches_brute_force() {
        let points: Vec<_> = (0..200)
            .map(|i| Point2::new((i * 37 % 640) as f64 + 0.5, (i * 53 % 480) as f64 + 0.25))
            .collect();
        let grid = FeatureGrid::new(points.iter().copied(), 640, 480);
        let query = Point2::new(300.0, 200.0);

        let mut found = grid.get_features_in_area(query.x, query.y, 60.0);
        found.sort_unstable();
        let expected: Vec<usize> = points
            .iter()
            .enumerate()
            .filter(|(_, p)| (*p - query).norm() <= 60.0)
            .map(|(i, _)| i)
            .collect();

        assert_eq!(found, expected);
    }

    #[test]
    fn test_out_of_bounds_points_are_clamped() {
        let mut grid = FeatureGrid::new(std::iter::empty(), 640, 480);
        grid.insert(Point2::new(-3.0, 500.0));

        assert_eq!(grid.len(), 1);
        assert!(grid.has_neighbor_within(&Point2::new(0.0, 479.0), 25.0));
        assert!(!grid.has_neighbor_within(&Point2::new(100.0, 100.0), 25.0));
    }
}
