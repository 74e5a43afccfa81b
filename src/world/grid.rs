//! Streaming grid
//!
//! Bake-time spatial index over islands. Level `i` has cells of size
//! `base * 2^i`; an island lives in the smallest level whose cell size
//! covers its largest streaming extent and, within that level, in the cell
//! containing its center. Empty cells never materialize; the non-empty
//! ones become sectors when a scene is compiled.

use glam::Vec3;
use rustc_hash::FxHashMap;

use crate::world::StreamingBox;

/// Floor of the configurable smallest cell size.
pub const MIN_BASE_CELL_SIZE: f32 = 16.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GridCellCoord {
    pub level: u32,
    pub x: i32,
    pub y: i32,
}

struct GridLevel {
    cells: FxHashMap<(i32, i32), Vec<u32>>,
}

/// Multi-level 2D grid bucketing islands by streaming radius.
pub struct StreamingGrid {
    base_cell_size: f32,
    levels: Vec<GridLevel>,
}

impl StreamingGrid {
    #[must_use]
    pub fn new(base_cell_size: f32) -> Self {
        Self {
            base_cell_size: base_cell_size.max(MIN_BASE_CELL_SIZE),
            levels: Vec::new(),
        }
    }

    #[must_use]
    pub fn base_cell_size(&self) -> f32 {
        self.base_cell_size
    }

    #[must_use]
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Cell size of level `level`.
    #[must_use]
    pub fn cell_size(&self, level: u32) -> f32 {
        self.base_cell_size * (1u32 << level) as f32
    }

    /// Level an extent belongs to: the smallest level whose cell size
    /// equals or exceeds it.
    #[must_use]
    pub fn level_for_extent(&self, extent: f32) -> u32 {
        let mut level = 0u32;
        while self.cell_size(level) < extent {
            level += 1;
        }
        level
    }

    /// Cell coordinate of a point at `level`.
    #[must_use]
    pub fn cell_for_point(&self, level: u32, point: Vec3) -> (i32, i32) {
        let size = self.cell_size(level);
        (
            (point.x / size).floor() as i32,
            (point.y / size).floor() as i32,
        )
    }

    /// Insert an island (by caller index) with its streaming box.
    pub fn insert(&mut self, index: u32, streaming_box: &StreamingBox) -> GridCellCoord {
        let level = self.level_for_extent(streaming_box.max_extent());
        let (x, y) = self.cell_for_point(level, streaming_box.center());

        while self.levels.len() <= level as usize {
            self.levels.push(GridLevel {
                cells: FxHashMap::default(),
            });
        }
        self.levels[level as usize]
            .cells
            .entry((x, y))
            .or_default()
            .push(index);

        GridCellCoord { level, x, y }
    }

    /// Islands bucketed into one cell.
    #[must_use]
    pub fn cell_islands(&self, coord: GridCellCoord) -> &[u32] {
        self.levels
            .get(coord.level as usize)
            .and_then(|level| level.cells.get(&(coord.x, coord.y)))
            .map_or(&[], Vec::as_slice)
    }

    /// Iterate every non-empty cell with its islands.
    pub fn non_empty_cells(&self) -> impl Iterator<Item = (GridCellCoord, &[u32])> {
        self.levels.iter().enumerate().flat_map(|(level, grid)| {
            grid.cells.iter().map(move |(&(x, y), islands)| {
                (
                    GridCellCoord {
                        level: level as u32,
                        x,
                        y,
                    },
                    islands.as_slice(),
                )
            })
        })
    }

    /// World-space bounds of a cell.
    #[must_use]
    pub fn cell_bounds(&self, coord: GridCellCoord) -> StreamingBox {
        let size = self.cell_size(coord.level);
        let min = Vec3::new(coord.x as f32 * size, coord.y as f32 * size, f32::MIN);
        let max = Vec3::new(
            (coord.x + 1) as f32 * size,
            (coord.y + 1) as f32 * size,
            f32::MAX,
        );
        StreamingBox::new(min, max)
    }

    #[must_use]
    pub fn total_island_count(&self) -> usize {
        self.levels
            .iter()
            .map(|level| level.cells.values().map(Vec::len).sum::<usize>())
            .sum()
    }
}
