//! Immutable registry of resource types, block templates, and recipes.
//!
//! Built with [`RegistryBuilder`] before the level is created and frozen
//! from then on: mod-supplied templates register through the same builder
//! calls as built-ins, and once the first tick runs nothing distinguishes
//! the two. Recipes are the crafting collaborator's contract: the core only
//! ever asks "given these inputs, what output and duration applies".

use crate::block::{
    Behavior, ConsumerState, ConverterState, CustomBehavior, CustomSlot, ProducerState,
    StorageState, TubeState,
};
use crate::block::ConnectionPoint;
use crate::fixed::{Fixed64, Ticks};
use crate::geom::{Direction, Footprint};
use crate::id::{BlockTypeId, RecipeId, ResourceTypeId};
use crate::resource::{ResourceBuffer, ResourceStack};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// A resource type definition.
#[derive(Debug, Clone)]
pub struct ResourceDef {
    pub name: String,
}

/// A crafting recipe: inputs in, one output stack out, after a duration.
#[derive(Debug, Clone)]
pub struct RecipeDef {
    pub name: String,
    pub inputs: Vec<ResourceStack>,
    pub output: ResourceStack,
    pub duration: Ticks,
}

/// A block template: footprint plus a behavior prototype instantiated on
/// every placement.
pub struct BlockTemplate {
    pub name: String,
    pub footprint: Footprint,
    pub proto: BehaviorProto,
}

impl fmt::Debug for BlockTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockTemplate")
            .field("name", &self.name)
            .field("footprint", &self.footprint)
            .finish_non_exhaustive()
    }
}

/// Factory producing a fresh boxed custom behavior per placement.
pub type CustomFactory = Box<dyn Fn() -> Box<dyn CustomBehavior> + Send + Sync>;

/// Stateless prototype for each behavior variant.
pub enum BehaviorProto {
    Producer {
        resource: ResourceTypeId,
        quantity: u32,
        interval: Ticks,
        output_capacity: u32,
        port: Direction,
        require_ore: bool,
    },
    Consumer {
        accepts: Option<ResourceTypeId>,
        capacity: u32,
        port: Direction,
        consume_rate: u32,
    },
    Storage {
        capacity: u32,
        ports: Vec<Direction>,
    },
    Converter {
        recipe: Option<RecipeId>,
        input_capacity: u32,
        output_capacity: u32,
        in_port: Direction,
        out_port: Direction,
    },
    Tube {
        speed: Fixed64,
        lane_capacity: u32,
        /// Connection points sealed by the template (dead ends).
        closed: Vec<Direction>,
    },
    Custom {
        type_name: String,
    },
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a frozen [`Registry`]. Register everything (mods included),
/// then call [`RegistryBuilder::freeze`].
#[derive(Default)]
pub struct RegistryBuilder {
    resources: Vec<ResourceDef>,
    resource_names: HashMap<String, ResourceTypeId>,
    recipes: Vec<RecipeDef>,
    recipe_names: HashMap<String, RecipeId>,
    blocks: Vec<BlockTemplate>,
    block_names: HashMap<String, BlockTypeId>,
    factories: HashMap<String, CustomFactory>,
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("resources", &self.resources)
            .field("resource_names", &self.resource_names)
            .field("recipes", &self.recipes)
            .field("recipe_names", &self.recipe_names)
            .field("blocks", &self.blocks)
            .field("block_names", &self.block_names)
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource type. Returns its id.
    pub fn register_resource(&mut self, name: &str) -> ResourceTypeId {
        let id = ResourceTypeId(self.resources.len() as u32);
        self.resources.push(ResourceDef {
            name: name.to_string(),
        });
        self.resource_names.insert(name.to_string(), id);
        id
    }

    /// Register a recipe. Returns its id.
    pub fn register_recipe(
        &mut self,
        name: &str,
        inputs: Vec<ResourceStack>,
        output: ResourceStack,
        duration: Ticks,
    ) -> RecipeId {
        let id = RecipeId(self.recipes.len() as u32);
        self.recipes.push(RecipeDef {
            name: name.to_string(),
            inputs,
            output,
            duration,
        });
        self.recipe_names.insert(name.to_string(), id);
        id
    }

    /// Register a block template. Returns its id.
    pub fn register_block(&mut self, name: &str, footprint: Footprint, proto: BehaviorProto) -> BlockTypeId {
        let id = BlockTypeId(self.blocks.len() as u32);
        self.blocks.push(BlockTemplate {
            name: name.to_string(),
            footprint,
            proto,
        });
        self.block_names.insert(name.to_string(), id);
        id
    }

    /// Register a factory for a custom behavior type. Templates using
    /// `BehaviorProto::Custom` with the same `type_name` instantiate
    /// through it, as does snapshot restore.
    pub fn register_custom_behavior(&mut self, type_name: &str, factory: CustomFactory) {
        self.factories.insert(type_name.to_string(), factory);
    }

    /// Look up a resource registered so far, before freezing. Used by data
    /// loaders resolving name references during registration.
    pub fn preview_resource(&self, name: &str) -> Option<ResourceTypeId> {
        self.resource_names.get(name).copied()
    }

    /// Look up a recipe registered so far, before freezing.
    pub fn preview_recipe(&self, name: &str) -> Option<RecipeId> {
        self.recipe_names.get(name).copied()
    }

    /// Freeze the registry. No further registration is possible.
    pub fn freeze(self) -> Registry {
        Registry {
            resources: self.resources,
            resource_names: self.resource_names,
            recipes: self.recipes,
            recipe_names: self.recipe_names,
            blocks: self.blocks,
            block_names: self.block_names,
            factories: self.factories,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The frozen registry.
pub struct Registry {
    resources: Vec<ResourceDef>,
    resource_names: HashMap<String, ResourceTypeId>,
    recipes: Vec<RecipeDef>,
    recipe_names: HashMap<String, RecipeId>,
    blocks: Vec<BlockTemplate>,
    block_names: HashMap<String, BlockTypeId>,
    factories: HashMap<String, CustomFactory>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("resources", &self.resources.len())
            .field("recipes", &self.recipes.len())
            .field("blocks", &self.blocks.len())
            .field("custom_factories", &self.factories.len())
            .finish()
    }
}

impl Registry {
    pub fn resource(&self, id: ResourceTypeId) -> Option<&ResourceDef> {
        self.resources.get(id.0 as usize)
    }

    pub fn resource_by_name(&self, name: &str) -> Option<ResourceTypeId> {
        self.resource_names.get(name).copied()
    }

    pub fn recipe(&self, id: RecipeId) -> Option<&RecipeDef> {
        self.recipes.get(id.0 as usize)
    }

    pub fn recipe_by_name(&self, name: &str) -> Option<RecipeId> {
        self.recipe_names.get(name).copied()
    }

    pub fn block_template(&self, id: BlockTypeId) -> Option<&BlockTemplate> {
        self.blocks.get(id.0 as usize)
    }

    pub fn block_by_name(&self, name: &str) -> Option<BlockTypeId> {
        self.block_names.get(name).copied()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// The crafting contract: the first registered recipe whose inputs are
    /// all present in `available`. Pure with respect to simulation state.
    pub fn recipe_matching(&self, available: &ResourceBuffer) -> Option<RecipeId> {
        self.recipes.iter().position(|r| {
            r.inputs
                .iter()
                .all(|input| available.quantity(input.resource) >= input.quantity)
        })
        .map(|i| RecipeId(i as u32))
    }

    /// Instantiate a fresh behavior from a template's prototype. Returns
    /// `None` for a custom template whose factory was never registered.
    pub fn instantiate(&self, id: BlockTypeId) -> Option<Behavior> {
        let template = self.block_template(id)?;
        Some(match &template.proto {
            BehaviorProto::Producer {
                resource,
                quantity,
                interval,
                output_capacity,
                port,
                require_ore,
            } => Behavior::Producer(ProducerState {
                resource: *resource,
                quantity: *quantity,
                interval: *interval,
                progress: 0,
                output: ResourceBuffer::new(*output_capacity),
                port: *port,
                require_ore: *require_ore,
            }),
            BehaviorProto::Consumer {
                accepts,
                capacity,
                port,
                consume_rate,
            } => Behavior::Consumer(ConsumerState {
                accepts: *accepts,
                buffer: ResourceBuffer::new(*capacity),
                port: *port,
                consume_rate: *consume_rate,
                total_consumed: 0,
            }),
            BehaviorProto::Storage { capacity, ports } => Behavior::Storage(StorageState {
                buffer: ResourceBuffer::new(*capacity),
                ports: ports.clone(),
            }),
            BehaviorProto::Converter {
                recipe,
                input_capacity,
                output_capacity,
                in_port,
                out_port,
            } => Behavior::Converter(ConverterState {
                recipe: *recipe,
                input: ResourceBuffer::new(*input_capacity),
                output: ResourceBuffer::new(*output_capacity),
                in_port: *in_port,
                out_port: *out_port,
                crafting: None,
            }),
            BehaviorProto::Tube {
                speed,
                lane_capacity,
                closed,
            } => {
                let mut connections = [ConnectionPoint::Open; 4];
                for dir in closed {
                    connections[dir.index()] = ConnectionPoint::Closed;
                }
                Behavior::Tube(TubeState {
                    connections,
                    network: crate::id::NetworkId::default(),
                    speed: *speed,
                    lane_capacity: *lane_capacity,
                })
            }
            BehaviorProto::Custom { type_name } => {
                let factory = self.factories.get(type_name)?;
                Behavior::Custom(CustomSlot {
                    type_name: type_name.clone(),
                    state: Vec::new(),
                    behavior: Some(factory()),
                })
            }
        })
    }

    /// Instantiate a custom behavior by registered name. Used by snapshot
    /// restore to rebind deserialized custom slots.
    pub fn make_custom(&self, type_name: &str) -> Option<Box<dyn CustomBehavior>> {
        self.factories.get(type_name).map(|f| f())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_registry() -> (Registry, ResourceTypeId, ResourceTypeId) {
        let mut b = RegistryBuilder::new();
        let ore = b.register_resource("ore");
        let plate = b.register_resource("plate");
        b.register_recipe(
            "smelt_plate",
            vec![ResourceStack::new(ore, 2)],
            ResourceStack::new(plate, 1),
            4,
        );
        (b.freeze(), ore, plate)
    }

    #[test]
    fn resource_lookup_by_name() {
        let (reg, ore, plate) = basic_registry();
        assert_eq!(reg.resource_by_name("ore"), Some(ore));
        assert_eq!(reg.resource_by_name("plate"), Some(plate));
        assert_eq!(reg.resource_by_name("unknown"), None);
        assert_eq!(reg.resource(ore).unwrap().name, "ore");
    }

    #[test]
    fn recipe_matching_needs_full_inputs() {
        let (reg, ore, _) = basic_registry();
        let mut buf = ResourceBuffer::new(10);
        assert_eq!(reg.recipe_matching(&buf), None);
        let _ = buf.add(ore, 1);
        assert_eq!(reg.recipe_matching(&buf), None);
        let _ = buf.add(ore, 1);
        assert_eq!(reg.recipe_matching(&buf), Some(RecipeId(0)));
    }

    #[test]
    fn instantiate_producer_template() {
        let mut b = RegistryBuilder::new();
        let ore = b.register_resource("ore");
        let miner = b.register_block(
            "miner",
            Footprint::single(),
            BehaviorProto::Producer {
                resource: ore,
                quantity: 5,
                interval: 10,
                output_capacity: 20,
                port: Direction::East,
                require_ore: true,
            },
        );
        let reg = b.freeze();
        match reg.instantiate(miner) {
            Some(Behavior::Producer(p)) => {
                assert_eq!(p.resource, ore);
                assert_eq!(p.quantity, 5);
                assert_eq!(p.progress, 0);
                assert!(p.require_ore);
            }
            other => panic!("expected producer, got {other:?}"),
        }
    }

    #[test]
    fn instantiate_tube_with_closed_ends() {
        let mut b = RegistryBuilder::new();
        let tube = b.register_block(
            "tube_corner",
            Footprint::single(),
            BehaviorProto::Tube {
                speed: Fixed64::from_num(0.5),
                lane_capacity: 2,
                closed: vec![Direction::North, Direction::West],
            },
        );
        let reg = b.freeze();
        match reg.instantiate(tube) {
            Some(Behavior::Tube(t)) => {
                assert_eq!(t.connection(Direction::North), ConnectionPoint::Closed);
                assert_eq!(t.connection(Direction::West), ConnectionPoint::Closed);
                assert_eq!(t.connection(Direction::East), ConnectionPoint::Open);
                assert_eq!(t.lane_capacity, 2);
            }
            other => panic!("expected tube, got {other:?}"),
        }
    }

    #[test]
    fn custom_template_without_factory_fails_to_instantiate() {
        let mut b = RegistryBuilder::new();
        let custom = b.register_block(
            "mystery",
            Footprint::single(),
            BehaviorProto::Custom {
                type_name: "mystery".to_string(),
            },
        );
        let reg = b.freeze();
        assert!(reg.instantiate(custom).is_none());
    }

    #[test]
    fn recipe_matching_prefers_registration_order() {
        let mut b = RegistryBuilder::new();
        let ore = b.register_resource("ore");
        let plate = b.register_resource("plate");
        let gear = b.register_resource("gear");
        let first = b.register_recipe(
            "plates",
            vec![ResourceStack::new(ore, 1)],
            ResourceStack::new(plate, 1),
            2,
        );
        let _second = b.register_recipe(
            "gears",
            vec![ResourceStack::new(ore, 1)],
            ResourceStack::new(gear, 1),
            2,
        );
        let reg = b.freeze();
        let mut buf = ResourceBuffer::new(10);
        let _ = buf.add(ore, 5);
        assert_eq!(reg.recipe_matching(&buf), Some(first));
    }
}
