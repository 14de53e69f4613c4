//! Shared builders for tests: a small registry and a canonical
//! producer -> tubes -> consumer line.

use crate::block::Behavior;
use crate::command_queue::{Command, EditOutcome};
use crate::fixed::Fixed64;
use crate::geom::{Direction, Footprint, TilePos};
use crate::id::BlockId;
use crate::level::Level;
use crate::registry::{BehaviorProto, Registry, RegistryBuilder};
use crate::resource::ResourceStack;
use crate::sim::SimulationStrategy;

/// A registry with the block set most tests need:
/// - resources `ore`, `plate`; recipe `smelt` (2 ore -> 1 plate, 3 ticks)
/// - `tube` (speed 1, lane capacity 4), `tube_narrow` (capacity 1),
///   `tube_capped_north`
/// - `extractor` (produces ore anywhere), `miner` (needs ore ground)
/// - `smelter` (west in, east out), `exporter` (consumer), `depot` (storage)
pub fn test_registry() -> Registry {
    let mut b = RegistryBuilder::new();
    let ore = b.register_resource("ore");
    let plate = b.register_resource("plate");
    let smelt = b.register_recipe(
        "smelt",
        vec![ResourceStack::new(ore, 2)],
        ResourceStack::new(plate, 1),
        3,
    );

    b.register_block(
        "tube",
        Footprint::single(),
        BehaviorProto::Tube {
            speed: Fixed64::from_num(1),
            lane_capacity: 4,
            closed: vec![],
        },
    );
    b.register_block(
        "tube_narrow",
        Footprint::single(),
        BehaviorProto::Tube {
            speed: Fixed64::from_num(1),
            lane_capacity: 1,
            closed: vec![],
        },
    );
    b.register_block(
        "tube_capped_north",
        Footprint::single(),
        BehaviorProto::Tube {
            speed: Fixed64::from_num(1),
            lane_capacity: 4,
            closed: vec![Direction::North],
        },
    );
    b.register_block(
        "extractor",
        Footprint::single(),
        BehaviorProto::Producer {
            resource: ore,
            quantity: 5,
            interval: 2,
            output_capacity: 20,
            port: Direction::East,
            require_ore: false,
        },
    );
    b.register_block(
        "miner",
        Footprint::single(),
        BehaviorProto::Producer {
            resource: ore,
            quantity: 5,
            interval: 2,
            output_capacity: 20,
            port: Direction::East,
            require_ore: true,
        },
    );
    b.register_block(
        "smelter",
        Footprint::single(),
        BehaviorProto::Converter {
            recipe: Some(smelt),
            input_capacity: 20,
            output_capacity: 20,
            in_port: Direction::West,
            out_port: Direction::East,
        },
    );
    b.register_block(
        "exporter",
        Footprint::single(),
        BehaviorProto::Consumer {
            accepts: None,
            capacity: 100,
            port: Direction::West,
            consume_rate: 0,
        },
    );
    b.register_block(
        "depot",
        Footprint::single(),
        BehaviorProto::Storage {
            capacity: 100,
            ports: vec![Direction::West],
        },
    );
    b.freeze()
}

/// A fresh tick-driven level over [`test_registry`].
pub fn basic_level() -> Level {
    Level::new(test_registry(), SimulationStrategy::Tick)
}

/// Block ids from [`Blocks::build_line`].
pub struct Blocks {
    pub producer: BlockId,
    pub consumer: BlockId,
    pub tube_positions: Vec<TilePos>,
}

impl Blocks {
    /// extractor at (0,0) -> tubes at (1..=3, 0) -> exporter at (4,0).
    pub fn build_line(level: &mut Level) -> Blocks {
        let extractor = level.registry.block_by_name("extractor").unwrap();
        let tube = level.registry.block_by_name("tube").unwrap();
        let exporter = level.registry.block_by_name("exporter").unwrap();

        let producer = place(level, extractor, TilePos::new(0, 0));
        let mut tube_positions = Vec::new();
        for x in 1..=3 {
            let pos = TilePos::new(x, 0);
            place(level, tube, pos);
            tube_positions.push(pos);
        }
        let consumer = place(level, exporter, TilePos::new(4, 0));
        Blocks {
            producer,
            consumer,
            tube_positions,
        }
    }
}

/// Place a template immediately, panicking on rejection.
pub fn place(level: &mut Level, template: crate::id::BlockTypeId, origin: TilePos) -> BlockId {
    match level.apply_now(Command::PlaceBlock { template, origin }) {
        EditOutcome::Applied {
            block: Some(id), ..
        } => id,
        other => panic!("placement at {origin:?} failed: {other:?}"),
    }
}

/// Total units currently held by a consumer block's buffer.
pub fn consumer_held(level: &Level, consumer: BlockId) -> u32 {
    match &level.grid.block(consumer).expect("consumer exists").behavior {
        Behavior::Consumer(c) => c.buffer.total(),
        other => panic!("expected consumer, got {other:?}"),
    }
}
