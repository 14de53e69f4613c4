use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a placed block instance in the tile grid.
    pub struct BlockId;

    /// Identifies a moving or living entity in the level.
    pub struct EntityId;

    /// Identifies a tube network (a connected component of segments).
    pub struct NetworkId;

    /// Identifies a resource packet in transit.
    pub struct PacketId;
}

/// Identifies a resource type in the registry. Cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceTypeId(pub u32);

/// Identifies a block template in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockTypeId(pub u32);

/// Identifies a crafting recipe in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecipeId(pub u32);

/// Identifies an entity template in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityTypeId(pub u32);

/// Correlates a queued structural edit with its outcome report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EditId(pub u64);
