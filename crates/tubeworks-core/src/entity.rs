//! Moving and living entities: sub-tile positions, discrete-time motion,
//! and collision against tile occupancy.
//!
//! Entities are owned by the level's entity arena, independent of the tile
//! grid. A blocked move is clamped to the nearest legal position along the
//! attempted axis, never teleported. Living entities carry health and are
//! checked against active weapon-effect volumes; this layer only emits hit
//! events, it never applies damage on its own.

use crate::fixed::Fixed64;
use crate::geom::{TilePos, TileRect, Vec2Fix};
use crate::grid::TileGrid;
use crate::id::EntityTypeId;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Entity data
// ---------------------------------------------------------------------------

/// Axis-aligned bounding footprint, in tile units, centered on the
/// entity position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hitbox {
    pub half_w: Fixed64,
    pub half_h: Fixed64,
}

impl Hitbox {
    pub fn new(half_w: Fixed64, half_h: Fixed64) -> Self {
        Self { half_w, half_h }
    }

    /// The tile rectangle covered by this hitbox at `pos`.
    pub fn covered_tiles(&self, pos: Vec2Fix) -> TileRect {
        let min_x: i32 = (pos.x - self.half_w).floor().to_num();
        let min_y: i32 = (pos.y - self.half_h).floor().to_num();
        // An entity flush against a tile edge does not overlap the next tile.
        let max_x: i32 = ceil_exclusive(pos.x + self.half_w);
        let max_y: i32 = ceil_exclusive(pos.y + self.half_h);
        TileRect::new(TilePos::new(min_x, min_y), TilePos::new(max_x, max_y))
    }
}

/// Largest integer n with n < v, i.e. the last tile index a right/bottom
/// edge at `v` still overlaps.
fn ceil_exclusive(v: Fixed64) -> i32 {
    let f: i32 = v.floor().to_num();
    if v == Fixed64::from_num(f) { f - 1 } else { f }
}

/// Health carried by living entities. Mutated only through damage commands
/// submitted by the weapon collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub current: u32,
    pub max: u32,
}

impl Health {
    pub fn full(max: u32) -> Self {
        Self { current: max, max }
    }

    pub fn is_dead(&self) -> bool {
        self.current == 0
    }
}

/// A moving entity. Living entities are the subset with `health` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityData {
    pub entity_type: EntityTypeId,
    pub pos: Vec2Fix,
    pub vel: Vec2Fix,
    pub hitbox: Hitbox,
    /// Present on living entities only.
    pub health: Option<Health>,
}

impl EntityData {
    pub fn is_living(&self) -> bool {
        self.health.is_some()
    }

    /// The tile rectangle currently covered by this entity.
    pub fn footprint(&self) -> TileRect {
        self.hitbox.covered_tiles(self.pos)
    }
}

/// Parameters for spawning an entity through the command queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpawn {
    pub entity_type: EntityTypeId,
    pub pos: Vec2Fix,
    pub vel: Vec2Fix,
    pub hitbox: Hitbox,
    /// Maximum health for a living entity, `None` for a plain mover.
    pub max_health: Option<u32>,
}

// ---------------------------------------------------------------------------
// Weapon-effect volumes
// ---------------------------------------------------------------------------

/// An active weapon-effect area registered by the weapon collaborator for
/// the current tick. Overlapping living entities produce hit events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectVolume {
    /// Collaborator-chosen identifier echoed back in hit events.
    pub id: u64,
    pub min: Vec2Fix,
    pub max: Vec2Fix,
}

impl EffectVolume {
    /// Whether an entity hitbox at `pos` overlaps this volume.
    pub fn overlaps(&self, pos: Vec2Fix, hitbox: Hitbox) -> bool {
        pos.x - hitbox.half_w < self.max.x
            && pos.x + hitbox.half_w > self.min.x
            && pos.y - hitbox.half_h < self.max.y
            && pos.y + hitbox.half_h > self.min.y
    }
}

// ---------------------------------------------------------------------------
// Motion
// ---------------------------------------------------------------------------

/// Whether the hitbox at `pos` overlaps any block-occupied tile.
pub fn position_blocked(grid: &TileGrid, pos: Vec2Fix, hitbox: Hitbox) -> bool {
    let rect = hitbox.covered_tiles(pos);
    for y in rect.min.y..=rect.max.y {
        for x in rect.min.x..=rect.max.x {
            if grid.block_at(TilePos::new(x, y)).is_some() {
                return true;
            }
        }
    }
    false
}

/// Advance one entity by one tick and resolve collisions per axis.
///
/// Each axis moves independently: the full displacement is attempted, and if
/// the destination overlaps a blocked tile the position is pulled back to
/// the blocking tile's edge (the nearest legal position along the attempted
/// vector). Returns true if either axis was blocked.
pub fn integrate(grid: &TileGrid, entity: &mut EntityData) -> bool {
    let mut blocked = false;

    // X axis.
    if entity.vel.x != Fixed64::ZERO {
        let target = Vec2Fix::new(entity.pos.x + entity.vel.x, entity.pos.y);
        if position_blocked(grid, target, entity.hitbox) {
            entity.pos.x = clamp_axis(grid, entity.pos, entity.hitbox, entity.vel.x, Axis::X);
            blocked = true;
        } else {
            entity.pos.x = target.x;
        }
    }

    // Y axis.
    if entity.vel.y != Fixed64::ZERO {
        let target = Vec2Fix::new(entity.pos.x, entity.pos.y + entity.vel.y);
        if position_blocked(grid, target, entity.hitbox) {
            entity.pos.y = clamp_axis(grid, entity.pos, entity.hitbox, entity.vel.y, Axis::Y);
            blocked = true;
        } else {
            entity.pos.y = target.y;
        }
    }

    blocked
}

#[derive(Clone, Copy)]
enum Axis {
    X,
    Y,
}

/// Find the furthest legal coordinate along one axis, stepping tile edge by
/// tile edge from the current position toward the attempted displacement.
fn clamp_axis(grid: &TileGrid, pos: Vec2Fix, hitbox: Hitbox, delta: Fixed64, axis: Axis) -> Fixed64 {
    let one = Fixed64::from_num(1);
    let current = match axis {
        Axis::X => pos.x,
        Axis::Y => pos.y,
    };
    let half = match axis {
        Axis::X => hitbox.half_w,
        Axis::Y => hitbox.half_h,
    };

    let mut best = current;
    let positive = delta > Fixed64::ZERO;

    // Candidate stopping positions: flush against each tile edge between
    // here and the target, nearest first.
    let mut candidate = if positive {
        // Leading edge snaps to the next integer boundary.
        (current + half).ceil() - half
    } else {
        (current - half).floor() + half
    };

    let target = current + delta;
    loop {
        let past_target = if positive {
            candidate > target
        } else {
            candidate < target
        };
        if past_target {
            break;
        }
        let probe = match axis {
            Axis::X => Vec2Fix::new(candidate, pos.y),
            Axis::Y => Vec2Fix::new(pos.x, candidate),
        };
        if position_blocked(grid, probe, hitbox) {
            break;
        }
        best = candidate;
        candidate = if positive { candidate + one } else { candidate - one };
    }

    best
}

/// Collect hit events for living entities overlapping effect volumes.
/// Returns (entity footprint overlaps volume id) pairs in entity order.
pub fn collect_hits<'a>(
    entities: impl Iterator<Item = (&'a EntityData, crate::id::EntityId)>,
    volumes: &[EffectVolume],
) -> Vec<(crate::id::EntityId, u64)> {
    let mut hits = Vec::new();
    for (entity, id) in entities {
        if !entity.is_living() {
            continue;
        }
        for volume in volumes {
            if volume.overlaps(entity.pos, entity.hitbox) {
                hits.push((id, volume.id));
            }
        }
    }
    hits
}
