//! Read-only snapshots for rendering, UI, and debugging collaborators.
//!
//! Snapshots are plain data copied out of the simulation; holding one never
//! grants mutation access, and taking one never changes state.

use crate::block::Behavior;
use crate::entity::Health;
use crate::fixed::Fixed64;
use crate::geom::{ChunkPos, Footprint, TilePos, Vec2Fix};
use crate::grid::Ground;
use crate::id::{BlockId, BlockTypeId, EntityId, EntityTypeId, NetworkId, ResourceTypeId};
use crate::level::Level;
use crate::network::NetworkState;

/// Coarse behavior tag for renderers that only need the block family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKindTag {
    Producer,
    Consumer,
    Storage,
    Converter,
    Tube,
    Custom,
}

/// One chunk's tile data.
#[derive(Debug, Clone)]
pub struct ChunkSnapshot {
    pub pos: ChunkPos,
    pub ground: Vec<Ground>,
    pub occupants: Vec<Option<BlockId>>,
}

/// One placed block.
#[derive(Debug, Clone)]
pub struct BlockSnapshot {
    pub id: BlockId,
    pub block_type: BlockTypeId,
    pub origin: TilePos,
    pub footprint: Footprint,
    pub kind: BlockKindTag,
}

/// One entity.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub entity_type: EntityTypeId,
    pub pos: Vec2Fix,
    pub vel: Vec2Fix,
    pub health: Option<Health>,
}

/// One network, summarized.
#[derive(Debug, Clone)]
pub struct NetworkSnapshot {
    pub id: NetworkId,
    pub state: NetworkState,
    pub segment_count: usize,
    pub endpoint_count: usize,
    pub packet_count: usize,
}

/// One in-flight packet.
#[derive(Debug, Clone)]
pub struct PacketSnapshot {
    pub resource: ResourceTypeId,
    pub quantity: u32,
    pub segment: BlockId,
    pub progress: Fixed64,
}

impl Level {
    /// Snapshot every loaded chunk, in deterministic position order.
    pub fn snapshot_chunks(&self) -> Vec<ChunkSnapshot> {
        self.grid
            .chunks()
            .map(|c| ChunkSnapshot {
                pos: c.pos,
                ground: c.ground().to_vec(),
                occupants: c.occupants().to_vec(),
            })
            .collect()
    }

    /// Snapshot every placed block.
    pub fn snapshot_blocks(&self) -> Vec<BlockSnapshot> {
        self.grid
            .block_ids()
            .filter_map(|id| {
                let block = self.grid.block(id)?;
                let kind = match &block.behavior {
                    Behavior::Producer(_) => BlockKindTag::Producer,
                    Behavior::Consumer(_) => BlockKindTag::Consumer,
                    Behavior::Storage(_) => BlockKindTag::Storage,
                    Behavior::Converter(_) => BlockKindTag::Converter,
                    Behavior::Tube(_) => BlockKindTag::Tube,
                    Behavior::Custom(_) => BlockKindTag::Custom,
                };
                Some(BlockSnapshot {
                    id,
                    block_type: block.block_type,
                    origin: block.origin,
                    footprint: block.footprint,
                    kind,
                })
            })
            .collect()
    }

    /// Snapshot every entity.
    pub fn snapshot_entities(&self) -> Vec<EntitySnapshot> {
        self.entities
            .iter()
            .map(|(id, e)| EntitySnapshot {
                id,
                entity_type: e.entity_type,
                pos: e.pos,
                vel: e.vel,
                health: e.health,
            })
            .collect()
    }

    /// Summarize every network.
    pub fn snapshot_networks(&self) -> Vec<NetworkSnapshot> {
        self.nets
            .networks
            .iter()
            .map(|(id, net)| NetworkSnapshot {
                id,
                state: net.state,
                segment_count: net.segments.len(),
                endpoint_count: net.endpoints.len(),
                packet_count: net.packets.len(),
            })
            .collect()
    }

    /// Snapshot every in-flight packet.
    pub fn snapshot_packets(&self) -> Vec<PacketSnapshot> {
        self.nets
            .packets
            .iter()
            .map(|(_, p)| PacketSnapshot {
                resource: p.resource,
                quantity: p.quantity,
                segment: p.segment,
                progress: p.progress,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn snapshots_reflect_placed_blocks() {
        let mut level = basic_level();
        let lookup = Blocks::build_line(&mut level);

        let blocks = level.snapshot_blocks();
        assert_eq!(blocks.len(), 5);
        assert!(blocks
            .iter()
            .any(|b| b.id == lookup.producer && b.kind == BlockKindTag::Producer));
        assert_eq!(
            blocks.iter().filter(|b| b.kind == BlockKindTag::Tube).count(),
            3
        );

        let nets = level.snapshot_networks();
        assert_eq!(nets.len(), 1);
        assert_eq!(nets[0].segment_count, 3);
        assert_eq!(nets[0].endpoint_count, 2);
    }

    #[test]
    fn snapshots_are_read_only() {
        let mut level = basic_level();
        let _ = Blocks::build_line(&mut level);
        let hash_before = {
            level.step();
            level.state_hash()
        };
        let _ = level.snapshot_chunks();
        let _ = level.snapshot_blocks();
        let _ = level.snapshot_entities();
        let _ = level.snapshot_networks();
        let _ = level.snapshot_packets();
        // Taking snapshots must not perturb the next step's outcome.
        let mut twin = basic_level();
        let _ = Blocks::build_line(&mut twin);
        twin.step();
        assert_eq!(hash_before, twin.state_hash());
    }

    #[test]
    fn packet_snapshot_tracks_in_flight_shipments() {
        let mut level = basic_level();
        let _ = Blocks::build_line(&mut level);
        let mut guard = 0;
        while level.nets.packets.is_empty() && guard < 10 {
            level.step();
            guard += 1;
        }
        let packets = level.snapshot_packets();
        assert!(!packets.is_empty());
        assert!(packets.iter().all(|p| p.quantity > 0));
    }
}
