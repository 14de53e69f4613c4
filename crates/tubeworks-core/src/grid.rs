//! Chunked tile storage and block placement.
//!
//! The grid owns every placed block in a slotmap arena; chunks store per-tile
//! occupancy as `Option<BlockId>`, so the tile→block and block→tile views can
//! be checked against each other (they must always agree). Chunks are created
//! lazily on first access and unloaded only when nothing holds them live.

use crate::block::BlockData;
use crate::geom::{ChunkPos, Footprint, TilePos, TileRect, CHUNK_SIZE_TILES};
use crate::id::{BlockId, ResourceTypeId};
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use std::collections::BTreeMap;

/// Tiles per chunk.
pub const CHUNK_AREA: usize = (CHUNK_SIZE_TILES * CHUNK_SIZE_TILES) as usize;

// ---------------------------------------------------------------------------
// Ground layer
// ---------------------------------------------------------------------------

/// The ground layer of a tile. At most one per tile, always present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ground {
    #[default]
    Soil,
    Rock,
    /// An ore body. Producers with `require_ore` run only on matching ore.
    Ore {
        resource: ResourceTypeId,
        richness: u32,
    },
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

/// A fixed-size square batch of tiles. Pure data; all interaction goes
/// through [`TileGrid`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub pos: ChunkPos,
    /// Ground layer, flat row-major storage.
    ground: Vec<Ground>,
    /// Block occupying each tile, if any. Multi-tile blocks appear once per
    /// covered tile.
    occupants: Vec<Option<BlockId>>,
}

impl Chunk {
    fn new(pos: ChunkPos) -> Self {
        Self {
            pos,
            ground: vec![Ground::default(); CHUNK_AREA],
            occupants: vec![None; CHUNK_AREA],
        }
    }

    pub fn ground_at(&self, pos: TilePos) -> Ground {
        self.ground[pos.chunk_index()]
    }

    pub fn occupant_at(&self, pos: TilePos) -> Option<BlockId> {
        self.occupants[pos.chunk_index()]
    }

    /// Whether any tile in this chunk is occupied by a block.
    pub fn has_blocks(&self) -> bool {
        self.occupants.iter().any(|o| o.is_some())
    }

    /// All occupants in this chunk, deduplicated, in tile order.
    pub fn occupants(&self) -> &[Option<BlockId>] {
        &self.occupants
    }

    pub fn ground(&self) -> &[Ground] {
        &self.ground
    }
}

/// A tile's contents: its ground layer and the block occupying it, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileView {
    pub pos: TilePos,
    pub ground: Ground,
    pub block: Option<BlockId>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structural conflicts rejected at placement time. The grid is untouched
/// when any of these is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("tile {0:?} is already occupied")]
    Occupied(TilePos),
    #[error("tile {0:?} is outside the permitted placement bounds")]
    OutOfBounds(TilePos),
}

// ---------------------------------------------------------------------------
// TileGrid
// ---------------------------------------------------------------------------

/// Chunked tile storage plus the block arena.
///
/// Chunks live in a `BTreeMap` so iteration order is deterministic. Blocks
/// are owned here exclusively; everything else refers to them by id.
#[derive(Debug, Serialize, Deserialize)]
pub struct TileGrid {
    pub(crate) chunks: BTreeMap<ChunkPos, Chunk>,
    pub(crate) blocks: SlotMap<BlockId, BlockData>,
    /// Optional permitted placement bounds. `None` means unbounded.
    bounds: Option<TileRect>,
}

impl Default for TileGrid {
    fn default() -> Self {
        Self::new()
    }
}

impl TileGrid {
    pub fn new() -> Self {
        Self {
            chunks: BTreeMap::new(),
            blocks: SlotMap::with_key(),
            bounds: None,
        }
    }

    /// Restrict placement to an inclusive rectangle.
    pub fn with_bounds(bounds: TileRect) -> Self {
        Self {
            chunks: BTreeMap::new(),
            blocks: SlotMap::with_key(),
            bounds: Some(bounds),
        }
    }

    pub fn bounds(&self) -> Option<TileRect> {
        self.bounds
    }

    // -----------------------------------------------------------------------
    // Chunk access
    // -----------------------------------------------------------------------

    /// The chunk containing `pos`, created on first access.
    pub fn chunk_mut(&mut self, pos: TilePos) -> &mut Chunk {
        let cpos = pos.chunk();
        self.chunks.entry(cpos).or_insert_with(|| Chunk::new(cpos))
    }

    /// The chunk containing `pos`, if it has been created.
    pub fn chunk(&self, pos: TilePos) -> Option<&Chunk> {
        self.chunks.get(&pos.chunk())
    }

    pub fn loaded_chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// Unload chunks that hold no blocks and are not overlapped by any of
    /// the given live footprints (entity hitboxes, in practice). Returns the
    /// positions of unloaded chunks. Chunks containing blocks are always
    /// kept: segments, packets riding them, and network spans all live in
    /// block-occupied chunks.
    pub fn unload_idle_chunks(&mut self, live: &[TileRect]) -> Vec<ChunkPos> {
        let mut unloaded = Vec::new();
        self.chunks.retain(|&cpos, chunk| {
            if chunk.has_blocks() {
                return true;
            }
            let origin = cpos.origin_tile();
            let rect = TileRect::new(
                origin,
                TilePos::new(origin.x + CHUNK_SIZE_TILES - 1, origin.y + CHUNK_SIZE_TILES - 1),
            );
            if live.iter().any(|r| r.intersects(&rect)) {
                return true;
            }
            unloaded.push(cpos);
            false
        });
        unloaded
    }

    // -----------------------------------------------------------------------
    // Tiles
    // -----------------------------------------------------------------------

    /// The tile at `pos`, creating its chunk on first access.
    pub fn tile_at(&mut self, pos: TilePos) -> TileView {
        let chunk = self.chunk_mut(pos);
        TileView {
            pos,
            ground: chunk.ground_at(pos),
            block: chunk.occupant_at(pos),
        }
    }

    // -----------------------------------------------------------------------
    // Ground layer
    // -----------------------------------------------------------------------

    pub fn ground_at(&mut self, pos: TilePos) -> Ground {
        self.chunk_mut(pos).ground[pos.chunk_index()]
    }

    /// Ground without creating the chunk. Unloaded chunks read as default.
    pub fn ground_at_loaded(&self, pos: TilePos) -> Ground {
        self.chunk(pos)
            .map(|c| c.ground_at(pos))
            .unwrap_or_default()
    }

    pub fn set_ground(&mut self, pos: TilePos, ground: Ground) {
        let idx = pos.chunk_index();
        self.chunk_mut(pos).ground[idx] = ground;
    }

    // -----------------------------------------------------------------------
    // Block placement
    // -----------------------------------------------------------------------

    /// The block occupying `pos`, if any. Does not create the chunk.
    pub fn block_at(&self, pos: TilePos) -> Option<BlockId> {
        self.chunk(pos).and_then(|c| c.occupant_at(pos))
    }

    pub fn block(&self, id: BlockId) -> Option<&BlockData> {
        self.blocks.get(id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BlockData> {
        self.blocks.get_mut(id)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.keys()
    }

    /// Whether a footprint fits at `origin` with no conflicts.
    pub fn can_place(&self, origin: TilePos, footprint: Footprint) -> bool {
        footprint.tiles(origin).all(|t| {
            self.bounds.is_none_or(|b| b.contains(t)) && self.block_at(t).is_none()
        })
    }

    /// Place a block. All target tiles must be free and inside the permitted
    /// bounds; on conflict nothing changes and the offending tile is
    /// reported.
    pub fn place_block(&mut self, data: BlockData) -> Result<BlockId, PlacementError> {
        for tile in data.tiles() {
            if let Some(b) = self.bounds {
                if !b.contains(tile) {
                    return Err(PlacementError::OutOfBounds(tile));
                }
            }
            if self.block_at(tile).is_some() {
                return Err(PlacementError::Occupied(tile));
            }
        }
        let tiles: Vec<TilePos> = data.tiles().collect();
        let id = self.blocks.insert(data);
        for tile in tiles {
            let idx = tile.chunk_index();
            self.chunk_mut(tile).occupants[idx] = Some(id);
        }
        Ok(id)
    }

    /// Remove the block covering `pos`. Returns the owned block data, or
    /// `None` if the tile is empty (removing a never-placed block is a
    /// rejection, not a crash).
    pub fn remove_block_at(&mut self, pos: TilePos) -> Option<(BlockId, BlockData)> {
        let id = self.block_at(pos)?;
        self.remove_block(id)
    }

    /// Remove a block by id, clearing every tile it occupied.
    pub fn remove_block(&mut self, id: BlockId) -> Option<(BlockId, BlockData)> {
        let data = self.blocks.remove(id)?;
        for tile in data.tiles() {
            let idx = tile.chunk_index();
            if let Some(chunk) = self.chunks.get_mut(&tile.chunk()) {
                debug_assert_eq!(chunk.occupants[idx], Some(id), "occupancy out of sync");
                chunk.occupants[idx] = None;
            }
        }
        Some((id, data))
    }

    /// The occupants of the four tiles adjacent to `pos`, in direction
    /// order. Used to build block update contexts.
    pub fn neighbors_of(&self, pos: TilePos) -> [Option<BlockId>; 4] {
        let mut out = [None; 4];
        for dir in crate::geom::Direction::ALL {
            out[dir.index()] = self.block_at(pos.step(dir));
        }
        out
    }
}
