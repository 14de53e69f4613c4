//! Integer grid addressing: tile and chunk coordinates, cardinal
//! directions, and multi-tile footprints.
//!
//! [`Direction`] order (N, E, S, W) is load-bearing: every neighbor probe,
//! routing expansion, and admission tie-break iterates directions in this
//! order, which is what makes those decisions deterministic.

use crate::fixed::Fixed64;
use serde::{Deserialize, Serialize};

/// Number of tiles along one side of a chunk.
pub const CHUNK_SIZE_TILES: i32 = 8;

// ---------------------------------------------------------------------------
// Tile and chunk coordinates
// ---------------------------------------------------------------------------

/// A tile coordinate on the world grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TilePos {
    pub x: i32,
    pub y: i32,
}

impl TilePos {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The chunk containing this tile.
    pub fn chunk(&self) -> ChunkPos {
        ChunkPos {
            x: self.x.div_euclid(CHUNK_SIZE_TILES),
            y: self.y.div_euclid(CHUNK_SIZE_TILES),
        }
    }

    /// Index of this tile within its chunk's flat storage.
    pub fn chunk_index(&self) -> usize {
        let lx = self.x.rem_euclid(CHUNK_SIZE_TILES);
        let ly = self.y.rem_euclid(CHUNK_SIZE_TILES);
        (lx + ly * CHUNK_SIZE_TILES) as usize
    }

    /// The adjacent tile in the given direction.
    pub fn step(&self, dir: Direction) -> TilePos {
        let (dx, dy) = dir.offset();
        TilePos::new(self.x + dx, self.y + dy)
    }

    /// Manhattan distance to another tile.
    pub fn manhattan_distance(&self, other: TilePos) -> u32 {
        (self.x - other.x).unsigned_abs() + (self.y - other.y).unsigned_abs()
    }
}

/// A chunk coordinate (world tile coordinate divided by chunk size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub y: i32,
}

impl ChunkPos {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The world position of this chunk's minimum-corner tile.
    pub fn origin_tile(&self) -> TilePos {
        TilePos::new(self.x * CHUNK_SIZE_TILES, self.y * CHUNK_SIZE_TILES)
    }
}

// ---------------------------------------------------------------------------
// Directions
// ---------------------------------------------------------------------------

/// Cardinal directions, in deterministic probe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    North,
    East,
    South,
    West,
}

impl Direction {
    /// All four directions in probe order.
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::East,
        Direction::South,
        Direction::West,
    ];

    /// Stable index of this direction (N=0, E=1, S=2, W=3).
    pub fn index(self) -> usize {
        self as usize
    }

    /// Direction from its stable index. Panics on indices above 3.
    pub fn from_index(i: usize) -> Direction {
        Self::ALL[i]
    }

    /// The opposite direction.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::North => Direction::South,
            Direction::East => Direction::West,
            Direction::South => Direction::North,
            Direction::West => Direction::East,
        }
    }

    /// Tile offset for this direction. North is negative y.
    pub fn offset(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::East => (1, 0),
            Direction::South => (0, 1),
            Direction::West => (-1, 0),
        }
    }
}

// ---------------------------------------------------------------------------
// Footprints and rectangles
// ---------------------------------------------------------------------------

/// The tile extent of a placed block. Origin is the minimum corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Footprint {
    pub width: u32,
    pub height: u32,
}

impl Footprint {
    /// A 1x1 footprint.
    pub fn single() -> Self {
        Self {
            width: 1,
            height: 1,
        }
    }

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Iterate over all tiles covered by this footprint at the given origin.
    pub fn tiles(&self, origin: TilePos) -> impl Iterator<Item = TilePos> {
        let w = self.width as i32;
        let h = self.height as i32;
        let (ox, oy) = (origin.x, origin.y);
        (0..h).flat_map(move |dy| (0..w).map(move |dx| TilePos::new(ox + dx, oy + dy)))
    }
}

/// An inclusive axis-aligned rectangle of tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRect {
    pub min: TilePos,
    pub max: TilePos,
}

impl TileRect {
    pub fn new(min: TilePos, max: TilePos) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, pos: TilePos) -> bool {
        pos.x >= self.min.x && pos.x <= self.max.x && pos.y >= self.min.y && pos.y <= self.max.y
    }

    /// Whether two rectangles share at least one tile.
    pub fn intersects(&self, other: &TileRect) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }
}

// ---------------------------------------------------------------------------
// Sub-tile geometry (entities)
// ---------------------------------------------------------------------------

/// A continuous position or velocity in tile units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vec2Fix {
    pub x: Fixed64,
    pub y: Fixed64,
}

impl Vec2Fix {
    pub fn new(x: Fixed64, y: Fixed64) -> Self {
        Self { x, y }
    }

    pub const ZERO: Vec2Fix = Vec2Fix {
        x: Fixed64::ZERO,
        y: Fixed64::ZERO,
    };
}
