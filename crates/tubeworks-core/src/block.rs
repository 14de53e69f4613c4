//! Placed blocks and their per-tick behavior contract.
//!
//! A block is a slotmap-owned instance occupying one or more tiles. Its
//! capability set is expressed as the [`Behavior`] enum: built-in variants
//! use enum dispatch, mod-supplied variants go through the boxed
//! [`CustomBehavior`] trait and receive the same update contract.
//!
//! Blocks never mutate a neighbor directly. Anything a block produces
//! leaves through the transport layer's acceptance protocol; anything it
//! receives arrives as a packet delivery into its buffer.

use crate::fixed::{Fixed64, Ticks};
use crate::geom::{Direction, Footprint, TilePos};
use crate::id::{BlockId, BlockTypeId, NetworkId, RecipeId, ResourceTypeId};
use crate::resource::ResourceBuffer;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Block instance
// ---------------------------------------------------------------------------

/// A placed block. Owned by the tile grid's block arena; tiles refer to it
/// by [`BlockId`], and it refers to tiles only by coordinate.
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockData {
    pub block_type: BlockTypeId,
    /// Minimum-corner tile of the footprint.
    pub origin: TilePos,
    pub footprint: Footprint,
    pub behavior: Behavior,
}

impl BlockData {
    /// All tiles occupied by this block.
    pub fn tiles(&self) -> impl Iterator<Item = TilePos> {
        self.footprint.tiles(self.origin)
    }

    /// Whether this block covers the given tile.
    pub fn occupies(&self, pos: TilePos) -> bool {
        pos.x >= self.origin.x
            && pos.y >= self.origin.y
            && pos.x < self.origin.x + self.footprint.width as i32
            && pos.y < self.origin.y + self.footprint.height as i32
    }

    /// Connection ports this block exposes on its origin tile, as
    /// (direction, role) pairs. Transport attachment probes these.
    pub fn ports(&self) -> Vec<(Direction, PortRole)> {
        match &self.behavior {
            Behavior::Producer(p) => vec![(p.port, PortRole::Output)],
            Behavior::Consumer(c) => vec![(c.port, PortRole::Input)],
            Behavior::Storage(s) => s.ports.iter().map(|&d| (d, PortRole::Input)).collect(),
            Behavior::Converter(c) => {
                vec![(c.in_port, PortRole::Input), (c.out_port, PortRole::Output)]
            }
            Behavior::Tube(_) => Vec::new(),
            Behavior::Custom(slot) => slot
                .behavior
                .as_ref()
                .map(|b| b.ports())
                .unwrap_or_default(),
        }
    }

    /// Whether this block can sit at the boundary of a tube network.
    pub fn is_endpoint(&self) -> bool {
        !matches!(self.behavior, Behavior::Tube(_)) && !self.ports().is_empty()
    }
}

/// What a connection port does, from the block's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortRole {
    /// The block emits packets through this port.
    Output,
    /// The block accepts deliveries through this port.
    Input,
}

// ---------------------------------------------------------------------------
// Behavior variants
// ---------------------------------------------------------------------------

/// Capability-tagged behavior of a placed block.
#[derive(Debug, Serialize, Deserialize)]
pub enum Behavior {
    /// Emits a resource on a fixed interval (miners, wells).
    Producer(ProducerState),
    /// Accepts and sinks a resource (exporters, burners).
    Consumer(ConsumerState),
    /// Passive capacity-bounded depot.
    Storage(StorageState),
    /// Consumes inputs and crafts an output via a registry recipe.
    Converter(ConverterState),
    /// One segment of the transport graph.
    Tube(TubeState),
    /// Mod-supplied behavior implementing [`CustomBehavior`].
    Custom(CustomSlot),
}

/// State for a producing block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerState {
    pub resource: ResourceTypeId,
    /// Units per emission.
    pub quantity: u32,
    /// Ticks between emissions.
    pub interval: Ticks,
    /// Ticks accumulated toward the next emission.
    pub progress: Ticks,
    /// Staged output awaiting dispatch into the network.
    pub output: ResourceBuffer,
    /// The connection point through which packets leave.
    pub port: Direction,
    /// When set, production runs only on ore ground of the matching type.
    pub require_ore: bool,
}

/// State for a consuming block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerState {
    /// Accepted resource type. `None` accepts anything.
    pub accepts: Option<ResourceTypeId>,
    pub buffer: ResourceBuffer,
    pub port: Direction,
    /// Units drained from the buffer per tick.
    pub consume_rate: u32,
    pub total_consumed: u64,
}

impl ConsumerState {
    /// Whether a delivery of `quantity` units of `resource` would be
    /// accepted right now. The whole quantity transfers or none of it.
    pub fn accepts_delivery(&self, resource: ResourceTypeId, quantity: u32) -> bool {
        self.accepts.is_none_or(|a| a == resource) && self.buffer.has_space_for(quantity)
    }
}

/// State for a storage block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageState {
    pub buffer: ResourceBuffer,
    /// Connection points on the origin tile.
    pub ports: Vec<Direction>,
}

/// State for a converting (crafting) block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverterState {
    /// Selected recipe. `None` lets the registry match one against the
    /// input buffer each time the converter goes idle.
    pub recipe: Option<RecipeId>,
    pub input: ResourceBuffer,
    pub output: ResourceBuffer,
    pub in_port: Direction,
    pub out_port: Direction,
    /// Remaining ticks of the craft in progress, with its recipe.
    pub crafting: Option<(RecipeId, Ticks)>,
}

impl ConverterState {
    pub fn accepts_delivery(&self, quantity: u32) -> bool {
        self.input.has_space_for(quantity)
    }
}

// ---------------------------------------------------------------------------
// Tube segments
// ---------------------------------------------------------------------------

/// One connection point of a tube segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPoint {
    /// Nothing attached; a matching neighbor may attach later.
    Open,
    /// Permanently sealed by the segment's template.
    Closed,
    /// Attached to the adjacent tube segment. Always mutual.
    Tube(BlockId),
    /// Attached to an adjacent endpoint block's port. Always mutual with
    /// that block's port facing back at this segment.
    Endpoint(BlockId),
}

/// State for a tube segment block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TubeState {
    /// Connection points indexed by [`Direction::index`].
    pub connections: [ConnectionPoint; 4],
    /// The network this segment belongs to. Exactly one at all times.
    pub network: NetworkId,
    /// Packet progress gained per tick on this segment.
    pub speed: Fixed64,
    /// Maximum packets resident on this segment's lane.
    pub lane_capacity: u32,
}

impl TubeState {
    pub fn connection(&self, dir: Direction) -> ConnectionPoint {
        self.connections[dir.index()]
    }

    pub fn set_connection(&mut self, dir: Direction, cp: ConnectionPoint) {
        self.connections[dir.index()] = cp;
    }

    /// Directions attached to another tube segment.
    pub fn tube_neighbors(&self) -> impl Iterator<Item = (Direction, BlockId)> + '_ {
        Direction::ALL.into_iter().filter_map(|d| match self.connection(d) {
            ConnectionPoint::Tube(id) => Some((d, id)),
            _ => None,
        })
    }

    /// Directions attached to an endpoint block.
    pub fn endpoint_neighbors(&self) -> impl Iterator<Item = (Direction, BlockId)> + '_ {
        Direction::ALL.into_iter().filter_map(|d| match self.connection(d) {
            ConnectionPoint::Endpoint(id) => Some((d, id)),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Custom (mod-supplied) behaviors
// ---------------------------------------------------------------------------

/// Holder for a mod-supplied behavior. The boxed behavior is skipped during
/// serialization; `state` carries its serialized form, and the registry
/// factory rebinds the box on restore.
#[derive(Debug, Serialize, Deserialize)]
pub struct CustomSlot {
    /// Registry name of the behavior type, used to find the factory.
    pub type_name: String,
    /// Serialized behavior state, refreshed when a snapshot is taken.
    pub state: Vec<u8>,
    #[serde(skip)]
    pub behavior: Option<Box<dyn CustomBehavior>>,
}

/// The update contract implemented by mod-supplied block behaviors.
/// Built-ins and custom behaviors are driven identically by the tick loop.
pub trait CustomBehavior: std::fmt::Debug + Send {
    /// Registry name. Must match the name the factory was registered under.
    fn type_name(&self) -> &str;

    /// Called once per tick with read access to the block's neighborhood.
    /// Side effects happen only through requests pushed onto the context.
    fn update(&mut self, ctx: &mut BlockContext<'_>);

    /// Connection ports exposed on the origin tile.
    fn ports(&self) -> Vec<(Direction, PortRole)> {
        Vec::new()
    }

    /// Accept or refuse a packet delivery. Refusal drives backpressure.
    fn accepts_delivery(&self, _resource: ResourceTypeId, _quantity: u32) -> bool {
        false
    }

    /// Take delivery of a packet's full quantity. Called only after
    /// `accepts_delivery` returned true in the same phase.
    fn receive(&mut self, _resource: ResourceTypeId, _quantity: u32) {}

    /// Serialize internal state for snapshots.
    fn serialize_state(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Restore internal state from a snapshot.
    fn load_state(&mut self, _data: &[u8]) -> Result<(), BehaviorError> {
        Ok(())
    }
}

/// Errors surfaced by custom behaviors.
#[derive(Debug, thiserror::Error)]
pub enum BehaviorError {
    #[error("behavior state decode failed: {0}")]
    DecodeFailed(String),
    #[error("no factory registered for behavior type {0:?}")]
    UnknownType(String),
}

// ---------------------------------------------------------------------------
// Block update context
// ---------------------------------------------------------------------------

/// Read-only neighborhood view plus a request sink, passed to updatable
/// blocks each tick. Requests are applied at the next tick's edit phase so
/// an update can never observe a half-applied structural change.
pub struct BlockContext<'a> {
    /// Current tick number.
    pub tick: Ticks,
    /// The block being updated.
    pub block: BlockId,
    pub origin: TilePos,
    /// Occupants of the four adjacent tiles, by direction index.
    pub neighbors: &'a [Option<BlockId>; 4],
    /// Requests collected during this update.
    pub requests: &'a mut Vec<BlockRequest>,
}

impl BlockContext<'_> {
    /// Queue a request against the simulation.
    pub fn request(&mut self, req: BlockRequest) {
        self.requests.push(req);
    }
}

/// Side effects a block may request from its update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRequest {
    /// Remove this block at the next edit phase.
    RemoveSelf,
    /// Replace this block with another template at the next edit phase.
    ReplaceSelf(BlockTypeId),
    /// Dispatch resources into the attached network through a port.
    Emit {
        port: Direction,
        resource: ResourceTypeId,
        quantity: u32,
    },
}
