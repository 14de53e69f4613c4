//! The level: simulation context and the fixed per-tick phase pipeline.
//!
//! One [`Level`] owns the tile grid, the tube networks, the entity arena,
//! the frozen registry, the command queue, and the event bus. Each step runs
//! the same phase order:
//!
//! 1. **Edits** -- drain queued commands (player, mod, reactive handlers)
//!    and apply them, updating networks; revalidate packet paths.
//! 2. **Blocks** -- every updatable block runs its per-tick contract;
//!    producers and converters stage output and dispatch shipments.
//! 3. **Transport** -- every network advances its packets.
//! 4. **Entities** -- motion integration, collision clamping, weapon-volume
//!    overlap checks.
//! 5. **Events** -- buffered events deliver to subscribers; reactive
//!    handlers return commands for the next tick's edit phase.
//! 6. **Bookkeeping** -- tick counter and state hash.
//!
//! The ordering is an invariant: structural edits never interleave with the
//! transport advance, so a packet is never evaluated against a topology
//! that changed under it within the same tick. A failure in one tile,
//! network, or entity skips that item and never aborts the tick.

use crate::block::{Behavior, BlockContext, BlockData, BlockRequest};
use crate::command_queue::{Command, CommandQueue, EditOutcome};
use crate::entity::{self, EffectVolume, EntityData, Health};
use crate::event::{Event, EventBus};
use crate::fixed::Ticks;
use crate::geom::{ChunkPos, TilePos, TileRect};
use crate::grid::{Ground, TileGrid};
use crate::id::{BlockId, EditId, EntityId, NetworkId, ResourceTypeId};
use crate::registry::Registry;
use crate::sim::{AdvanceResult, SimState, SimulationStrategy, StateHash};
use crate::transport::{self, DispatchResult};
use crate::geom::Direction;
use crate::network::NetworkSet;
use slotmap::SlotMap;

// ---------------------------------------------------------------------------
// Level
// ---------------------------------------------------------------------------

/// The simulation context. Collaborators interact only through commands,
/// events, and read-only snapshots; the tile grid and networks are owned
/// exclusively by the simulation.
#[derive(Debug)]
pub struct Level {
    pub grid: TileGrid,
    pub nets: NetworkSet,
    pub entities: SlotMap<EntityId, EntityData>,
    pub registry: Registry,
    pub commands: CommandQueue,
    pub event_bus: EventBus,
    pub sim_state: SimState,
    pub(crate) strategy: SimulationStrategy,
    pub(crate) paused: bool,
    /// Weapon-effect areas active for the coming tick, set by the weapon
    /// collaborator between ticks.
    pub(crate) effect_volumes: Vec<EffectVolume>,
    pub(crate) last_state_hash: u64,
    /// Events delivered at the end of the most recent step.
    pub(crate) last_tick_events: Vec<Event>,
}

impl Level {
    /// Create a level over an unbounded grid.
    pub fn new(registry: Registry, strategy: SimulationStrategy) -> Self {
        Self::with_grid(registry, strategy, TileGrid::new())
    }

    /// Create a level with placement restricted to `bounds`.
    pub fn with_bounds(registry: Registry, strategy: SimulationStrategy, bounds: TileRect) -> Self {
        Self::with_grid(registry, strategy, TileGrid::with_bounds(bounds))
    }

    fn with_grid(registry: Registry, strategy: SimulationStrategy, grid: TileGrid) -> Self {
        Self {
            grid,
            nets: NetworkSet::new(),
            entities: SlotMap::with_key(),
            registry,
            commands: CommandQueue::with_max_history(0),
            event_bus: EventBus::default(),
            sim_state: SimState::new(),
            strategy,
            paused: false,
            effect_volumes: Vec::new(),
            last_state_hash: 0,
            last_tick_events: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Host-facing controls
    // -----------------------------------------------------------------------

    /// Queue a command for the next tick's edit phase.
    pub fn submit(&mut self, command: Command) -> EditId {
        self.commands.push(command)
    }

    /// Apply a command immediately. Tick-boundary use only (level setup,
    /// editors, tests); during play, prefer [`Level::submit`]. Flushes every
    /// pending command, so earlier submissions apply too.
    pub fn apply_now(&mut self, command: Command) -> EditOutcome {
        self.commands.push(command);
        self.flush_edits()
            .pop()
            .expect("flush applies at least the pushed command")
    }

    /// Replace the active weapon-effect volumes for the coming tick.
    pub fn set_effect_volumes(&mut self, volumes: Vec<EffectVolume>) {
        self.effect_volumes = volumes;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// The state hash computed at the end of the most recent step.
    pub fn state_hash(&self) -> u64 {
        self.last_state_hash
    }

    /// Events delivered at the end of the most recent step, in delivery
    /// order.
    pub fn last_tick_events(&self) -> &[Event] {
        &self.last_tick_events
    }

    pub fn current_tick(&self) -> Ticks {
        self.sim_state.tick
    }

    /// Unload chunks with no blocks and no entity overlap. Host-invoked at
    /// tick boundaries (typically by the persistence layer after saving
    /// them out). Returns the unloaded chunk positions.
    pub fn unload_idle_chunks(&mut self) -> Vec<ChunkPos> {
        let live: Vec<TileRect> = self.entities.values().map(|e| e.footprint()).collect();
        let unloaded = self.grid.unload_idle_chunks(&live);
        for &chunk in &unloaded {
            self.event_bus.emit(Event::ChunkUnloaded {
                chunk,
                tick: self.sim_state.tick,
            });
        }
        unloaded
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    /// Run exactly one simulation step. No-op while paused.
    pub fn step(&mut self) -> AdvanceResult {
        let mut result = AdvanceResult::default();
        if self.paused {
            return result;
        }
        self.step_internal(&mut result);
        result
    }

    /// Advance by `dt` ticks of host time. In `Tick` mode this runs one
    /// step regardless of `dt`; in `Delta` mode it accumulates time and
    /// runs as many fixed steps as fit.
    pub fn advance(&mut self, dt: Ticks) -> AdvanceResult {
        let mut result = AdvanceResult::default();
        if self.paused {
            return result;
        }
        match self.strategy {
            SimulationStrategy::Tick => {
                self.step_internal(&mut result);
            }
            SimulationStrategy::Delta { fixed_timestep } => {
                let fixed = fixed_timestep.max(1);
                self.sim_state.accumulator += dt;
                while self.sim_state.accumulator >= fixed {
                    self.sim_state.accumulator -= fixed;
                    self.step_internal(&mut result);
                }
            }
        }
        result
    }

    fn step_internal(&mut self, result: &mut AdvanceResult) {
        // Phase 1: structural edits.
        let reactive = self.event_bus.drain_pending_commands();
        self.commands.push_batch(reactive);
        let outcomes = self.flush_edits();
        result.edits.extend(outcomes);

        // Phase 2: block updates.
        self.update_blocks();

        // Phase 3: transport.
        let tick = self.sim_state.tick;
        let network_ids: Vec<NetworkId> = self.nets.networks.keys().collect();
        for net_id in network_ids {
            transport::advance_network(
                &mut self.nets,
                &mut self.grid,
                &self.registry,
                net_id,
                tick,
                &mut self.event_bus,
            );
        }

        // Phase 4: entities.
        self.update_entities();

        // Phase 5: event delivery.
        self.last_tick_events = self.event_bus.deliver();

        // Phase 6: bookkeeping.
        self.sim_state.tick += 1;
        self.last_state_hash = self.compute_state_hash();
        result.steps_run += 1;
    }

    // -----------------------------------------------------------------------
    // Phase 1: edits
    // -----------------------------------------------------------------------

    /// Drain and apply every pending command, then revalidate packet paths
    /// against the edited topology.
    fn flush_edits(&mut self) -> Vec<EditOutcome> {
        let tick = self.sim_state.tick;
        let drained = self.commands.drain(tick);
        if drained.is_empty() {
            return Vec::new();
        }
        let mut outcomes = Vec::with_capacity(drained.len());
        for (edit, command) in drained {
            let outcome = self.apply_command(edit, command);
            if let EditOutcome::Rejected { edit, ref reason } = outcome {
                self.event_bus.emit(Event::EditRejected {
                    edit,
                    reason: reason.clone(),
                    tick,
                });
            }
            outcomes.push(outcome);
        }
        transport::revalidate_packets(
            &mut self.nets,
            &self.grid,
            &self.registry,
            tick,
            &mut self.event_bus,
        );
        outcomes
    }

    fn apply_command(&mut self, edit: EditId, command: Command) -> EditOutcome {
        let tick = self.sim_state.tick;
        match command {
            Command::PlaceBlock { template, origin } => {
                let Some(tmpl) = self.registry.block_template(template) else {
                    return EditOutcome::Rejected {
                        edit,
                        reason: format!("unknown block template {template:?}"),
                    };
                };
                let footprint = tmpl.footprint;
                let Some(behavior) = self.registry.instantiate(template) else {
                    return EditOutcome::Rejected {
                        edit,
                        reason: format!("template {template:?} has no registered factory"),
                    };
                };
                let data = BlockData {
                    block_type: template,
                    origin,
                    footprint,
                    behavior,
                };
                match self.grid.place_block(data) {
                    Ok(id) => {
                        let is_tube = matches!(
                            self.grid.block(id).map(|b| &b.behavior),
                            Some(Behavior::Tube(_))
                        );
                        if is_tube {
                            self.nets
                                .segment_placed(&mut self.grid, id, tick, &mut self.event_bus);
                        } else if self.grid.block(id).is_some_and(|b| b.is_endpoint()) {
                            self.nets.endpoint_placed(&mut self.grid, id);
                        }
                        self.event_bus.emit(Event::BlockPlaced {
                            block: id,
                            block_type: template,
                            tick,
                        });
                        EditOutcome::Applied {
                            edit,
                            block: Some(id),
                            entity: None,
                        }
                    }
                    Err(e) => EditOutcome::Rejected {
                        edit,
                        reason: e.to_string(),
                    },
                }
            }
            Command::RemoveBlock { pos } => match self.grid.remove_block_at(pos) {
                Some((id, data)) => {
                    match &data.behavior {
                        Behavior::Tube(state) => {
                            self.nets.segment_removed(
                                &mut self.grid,
                                id,
                                state,
                                tick,
                                &mut self.event_bus,
                            );
                        }
                        _ if data.is_endpoint() => {
                            self.nets.endpoint_removed(
                                &mut self.grid,
                                id,
                                data.origin,
                                &data.ports(),
                            );
                        }
                        _ => {}
                    }
                    self.event_bus.emit(Event::BlockRemoved {
                        block: id,
                        block_type: data.block_type,
                        tick,
                    });
                    EditOutcome::Applied {
                        edit,
                        block: Some(id),
                        entity: None,
                    }
                }
                None => EditOutcome::Rejected {
                    edit,
                    reason: format!("no block at {pos:?}"),
                },
            },
            Command::SetRecipe { pos, recipe } => {
                if let Some(r) = recipe {
                    if self.registry.recipe(r).is_none() {
                        return EditOutcome::Rejected {
                            edit,
                            reason: format!("unknown recipe {r:?}"),
                        };
                    }
                }
                let converter = self
                    .grid
                    .block_at(pos)
                    .and_then(|id| self.grid.block_mut(id));
                match converter {
                    Some(BlockData {
                        behavior: Behavior::Converter(c),
                        ..
                    }) => {
                        c.recipe = recipe;
                        EditOutcome::Applied {
                            edit,
                            block: None,
                            entity: None,
                        }
                    }
                    _ => EditOutcome::Rejected {
                        edit,
                        reason: format!("no converter at {pos:?}"),
                    },
                }
            }
            Command::SetGround { pos, ground } => {
                self.grid.set_ground(pos, ground);
                EditOutcome::Applied {
                    edit,
                    block: None,
                    entity: None,
                }
            }
            Command::SpawnEntity { spawn } => {
                if entity::position_blocked(&self.grid, spawn.pos, spawn.hitbox) {
                    return EditOutcome::Rejected {
                        edit,
                        reason: format!("spawn position {:?} is blocked", spawn.pos),
                    };
                }
                let id = self.entities.insert(EntityData {
                    entity_type: spawn.entity_type,
                    pos: spawn.pos,
                    vel: spawn.vel,
                    hitbox: spawn.hitbox,
                    health: spawn.max_health.map(Health::full),
                });
                self.event_bus.emit(Event::EntitySpawned { entity: id, tick });
                EditOutcome::Applied {
                    edit,
                    block: None,
                    entity: Some(id),
                }
            }
            Command::DespawnEntity { entity } => match self.entities.remove(entity) {
                Some(_) => {
                    self.event_bus.emit(Event::EntityDespawned { entity, tick });
                    EditOutcome::Applied {
                        edit,
                        block: None,
                        entity: Some(entity),
                    }
                }
                None => EditOutcome::Rejected {
                    edit,
                    reason: format!("no entity {entity:?}"),
                },
            },
            Command::SetEntityVelocity { entity, velocity } => {
                match self.entities.get_mut(entity) {
                    Some(e) => {
                        e.vel = velocity;
                        EditOutcome::Applied {
                            edit,
                            block: None,
                            entity: Some(entity),
                        }
                    }
                    None => EditOutcome::Rejected {
                        edit,
                        reason: format!("no entity {entity:?}"),
                    },
                }
            }
            Command::ApplyDamage { entity, amount } => {
                let Some(e) = self.entities.get_mut(entity) else {
                    return EditOutcome::Rejected {
                        edit,
                        reason: format!("no entity {entity:?}"),
                    };
                };
                let Some(health) = e.health.as_mut() else {
                    return EditOutcome::Rejected {
                        edit,
                        reason: format!("entity {entity:?} has no health"),
                    };
                };
                health.current = health.current.saturating_sub(amount);
                if health.is_dead() {
                    self.entities.remove(entity);
                    self.event_bus.emit(Event::EntityDied { entity, tick });
                }
                EditOutcome::Applied {
                    edit,
                    block: None,
                    entity: Some(entity),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase 2: blocks
    // -----------------------------------------------------------------------

    fn update_blocks(&mut self) {
        let tick = self.sim_state.tick;
        let ids: Vec<BlockId> = self.grid.blocks.keys().collect();

        // (block, port, resource, quantity, came_from_custom)
        let mut emissions: Vec<(BlockId, Direction, ResourceTypeId, u32, bool)> = Vec::new();
        let mut structural: Vec<(TilePos, BlockRequest)> = Vec::new();

        for id in ids {
            let Some(block) = self.grid.blocks.get(id) else {
                continue;
            };
            let origin = block.origin;
            let ground = self.grid.ground_at_loaded(origin);
            let neighbors = self.grid.neighbors_of(origin);

            let Some(block) = self.grid.blocks.get_mut(id) else {
                continue;
            };
            match &mut block.behavior {
                Behavior::Producer(p) => {
                    let ore_ok = !p.require_ore
                        || matches!(ground, Ground::Ore { resource, .. } if resource == p.resource);
                    if ore_ok {
                        p.progress += 1;
                        if p.progress >= p.interval {
                            if p.output.has_space_for(p.quantity) {
                                let overflow = p.output.add(p.resource, p.quantity);
                                debug_assert_eq!(overflow, 0);
                                p.progress = 0;
                                self.event_bus.emit(Event::ResourceProduced {
                                    block: id,
                                    resource: p.resource,
                                    quantity: p.quantity,
                                    tick,
                                });
                            }
                            // No space: stalled at the interval boundary,
                            // retried once the staging buffer drains.
                        }
                    }
                    if p.output.quantity(p.resource) >= p.quantity {
                        emissions.push((id, p.port, p.resource, p.quantity, false));
                    }
                }
                Behavior::Consumer(c) => {
                    if c.consume_rate > 0 {
                        let mut budget = c.consume_rate;
                        while budget > 0 {
                            let Some(stack) = c.buffer.stacks().first().copied() else {
                                break;
                            };
                            let take = budget.min(stack.quantity);
                            let removed = c.buffer.remove(stack.resource, take);
                            c.total_consumed += u64::from(removed);
                            budget -= removed;
                            self.event_bus.emit(Event::ResourceConsumed {
                                block: id,
                                resource: stack.resource,
                                quantity: removed,
                                tick,
                            });
                        }
                    }
                }
                Behavior::Converter(c) => {
                    // Finish or progress the craft in flight.
                    if let Some((recipe_id, remaining)) = c.crafting {
                        if remaining > 1 {
                            c.crafting = Some((recipe_id, remaining - 1));
                        } else if let Some(recipe) = self.registry.recipe(recipe_id) {
                            if c.output.has_space_for(recipe.output.quantity) {
                                let overflow =
                                    c.output.add(recipe.output.resource, recipe.output.quantity);
                                debug_assert_eq!(overflow, 0);
                                c.crafting = None;
                                self.event_bus.emit(Event::CraftCompleted {
                                    block: id,
                                    recipe: recipe_id,
                                    tick,
                                });
                            } else {
                                // Output full: hold completion until space.
                                c.crafting = Some((recipe_id, 0));
                            }
                        } else {
                            c.crafting = None;
                        }
                    }

                    // Start a new craft when idle.
                    if c.crafting.is_none() {
                        let candidate = c.recipe.or_else(|| self.registry.recipe_matching(&c.input));
                        if let Some(recipe_id) = candidate {
                            if let Some(recipe) = self.registry.recipe(recipe_id) {
                                let have_inputs = recipe
                                    .inputs
                                    .iter()
                                    .all(|i| c.input.quantity(i.resource) >= i.quantity);
                                if have_inputs {
                                    for i in &recipe.inputs {
                                        let removed = c.input.remove(i.resource, i.quantity);
                                        debug_assert_eq!(removed, i.quantity);
                                    }
                                    c.crafting = Some((recipe_id, recipe.duration.max(1)));
                                    self.event_bus.emit(Event::CraftStarted {
                                        block: id,
                                        recipe: recipe_id,
                                        tick,
                                    });
                                }
                            }
                        }
                    }

                    // Ship finished goods.
                    if let Some(stack) = c.output.stacks().first().copied() {
                        emissions.push((id, c.out_port, stack.resource, stack.quantity, false));
                    }
                }
                Behavior::Storage(_) | Behavior::Tube(_) => {}
                Behavior::Custom(slot) => {
                    let mut requests = Vec::new();
                    if let Some(b) = slot.behavior.as_mut() {
                        let mut ctx = BlockContext {
                            tick,
                            block: id,
                            origin,
                            neighbors: &neighbors,
                            requests: &mut requests,
                        };
                        b.update(&mut ctx);
                    } else {
                        tracing::warn!(
                            type_name = %slot.type_name,
                            "custom behavior unbound; skipping update"
                        );
                    }
                    for request in requests {
                        match request {
                            BlockRequest::Emit {
                                port,
                                resource,
                                quantity,
                            } => emissions.push((id, port, resource, quantity, true)),
                            other => structural.push((origin, other)),
                        }
                    }
                }
            }
        }

        // Dispatch staged shipments through the transport acceptance
        // protocol. A refused shipment stays staged (backpressure).
        for (id, port, resource, quantity, from_custom) in emissions {
            let result = transport::dispatch(
                &mut self.nets,
                &self.grid,
                &self.registry,
                id,
                port,
                resource,
                quantity,
                tick,
                &mut self.event_bus,
            );
            match result {
                DispatchResult::Dispatched(_) => {
                    if !from_custom {
                        if let Some(block) = self.grid.blocks.get_mut(id) {
                            match &mut block.behavior {
                                Behavior::Producer(p) => {
                                    let removed = p.output.remove(resource, quantity);
                                    debug_assert_eq!(removed, quantity);
                                }
                                Behavior::Converter(c) => {
                                    let removed = c.output.remove(resource, quantity);
                                    debug_assert_eq!(removed, quantity);
                                }
                                _ => {}
                            }
                        }
                    }
                }
                DispatchResult::EntryFull
                | DispatchResult::NoRoute
                | DispatchResult::NotAttached => {
                    // Custom behaviors committed the resources before
                    // emitting; hand them back so nothing is lost.
                    if from_custom {
                        if let Some(block) = self.grid.blocks.get_mut(id) {
                            if let Behavior::Custom(slot) = &mut block.behavior {
                                if let Some(b) = slot.behavior.as_mut() {
                                    b.receive(resource, quantity);
                                }
                            }
                        }
                    }
                }
            }
        }

        // Removal/replacement requests queue as ordinary commands for the
        // next tick's edit phase.
        for (origin, request) in structural {
            match request {
                BlockRequest::RemoveSelf => {
                    self.commands.push(Command::RemoveBlock { pos: origin });
                }
                BlockRequest::ReplaceSelf(template) => {
                    self.commands.push(Command::RemoveBlock { pos: origin });
                    self.commands.push(Command::PlaceBlock { template, origin });
                }
                BlockRequest::Emit { .. } => unreachable!("emit handled above"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase 4: entities
    // -----------------------------------------------------------------------

    fn update_entities(&mut self) {
        let tick = self.sim_state.tick;
        let ids: Vec<EntityId> = self.entities.keys().collect();
        for id in ids {
            let Some(e) = self.entities.get_mut(id) else {
                continue;
            };
            let _blocked = entity::integrate(&self.grid, e);
        }

        let hits = self.collect_hits();
        for (entity, volume) in hits {
            self.event_bus.emit(Event::EntityHit {
                entity,
                volume,
                tick,
            });
        }
    }

    #[cfg(not(feature = "parallel"))]
    fn collect_hits(&self) -> Vec<(EntityId, u64)> {
        entity::collect_hits(
            self.entities.iter().map(|(id, e)| (e, id)),
            &self.effect_volumes,
        )
    }

    /// Read-only overlap tests fan out across threads; results collect in
    /// entity order, so the outcome is identical to the serial path. This
    /// completes before any mutation below runs.
    #[cfg(feature = "parallel")]
    fn collect_hits(&self) -> Vec<(EntityId, u64)> {
        use rayon::prelude::*;
        let snapshot: Vec<(EntityId, EntityData)> = self
            .entities
            .iter()
            .map(|(id, e)| (id, e.clone()))
            .collect();
        snapshot
            .par_iter()
            .flat_map_iter(|(id, e)| {
                entity::collect_hits(std::iter::once((e, *id)), &self.effect_volumes)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Phase 6: state hash
    // -----------------------------------------------------------------------

    fn compute_state_hash(&self) -> u64 {
        let mut h = StateHash::new();
        h.write_u64(self.sim_state.tick);

        h.write_u64(self.grid.loaded_chunk_count() as u64);
        for chunk in self.grid.chunks() {
            h.write_i32(chunk.pos.x);
            h.write_i32(chunk.pos.y);
            for ground in chunk.ground() {
                match ground {
                    Ground::Soil => h.write_u32(0),
                    Ground::Rock => h.write_u32(1),
                    Ground::Ore { resource, richness } => {
                        h.write_u32(2);
                        h.write_u32(resource.0);
                        h.write_u32(*richness);
                    }
                }
            }
            for occupant in chunk.occupants() {
                h.write_u32(u32::from(occupant.is_some()));
            }
        }

        h.write_u64(self.grid.block_count() as u64);
        for id in self.grid.block_ids() {
            let Some(block) = self.grid.block(id) else {
                continue;
            };
            h.write_u32(block.block_type.0);
            h.write_i32(block.origin.x);
            h.write_i32(block.origin.y);
            match &block.behavior {
                Behavior::Producer(p) => {
                    h.write_u64(p.progress);
                    h.write_u32(p.output.total());
                }
                Behavior::Consumer(c) => {
                    h.write_u32(c.buffer.total());
                    h.write_u64(c.total_consumed);
                }
                Behavior::Storage(s) => h.write_u32(s.buffer.total()),
                Behavior::Converter(c) => {
                    h.write_u32(c.input.total());
                    h.write_u32(c.output.total());
                    h.write_u64(c.crafting.map(|(_, rem)| rem).unwrap_or(u64::MAX));
                }
                Behavior::Tube(t) => {
                    h.write_u32(t.lane_capacity);
                    h.write_fixed64(t.speed);
                }
                Behavior::Custom(slot) => {
                    let state = slot
                        .behavior
                        .as_ref()
                        .map(|b| b.serialize_state())
                        .unwrap_or_default();
                    h.write(&state);
                }
            }
        }

        // Packets hash in each network's logical (insertion) order, not
        // arena order: arena slot reuse is not stable across a snapshot
        // round-trip, insertion order is.
        h.write_u64(self.nets.network_count() as u64);
        for (_, net) in &self.nets.networks {
            h.write_u64(net.segments.len() as u64);
            h.write_u64(net.endpoints.len() as u64);
            h.write_u64(net.packets.len() as u64);
            for pid in &net.packets {
                let Some(packet) = self.nets.packet(*pid) else {
                    continue;
                };
                h.write_u32(packet.resource.0);
                h.write_u32(packet.quantity);
                h.write_fixed64(packet.progress);
                if let Some(seg) = self.grid.block(packet.segment) {
                    h.write_i32(seg.origin.x);
                    h.write_i32(seg.origin.y);
                }
            }
        }

        h.write_u64(self.entities.len() as u64);
        for (_, e) in &self.entities {
            h.write_fixed64(e.pos.x);
            h.write_fixed64(e.pos.y);
            h.write_fixed64(e.vel.x);
            h.write_fixed64(e.vel.y);
            if let Some(health) = e.health {
                h.write_u32(health.current);
            }
        }

        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ConnectionPoint;
    use crate::entity::{EntitySpawn, Hitbox};
    use crate::fixed::f64_to_fixed64 as fx;
    use crate::geom::Vec2Fix;
    use crate::id::EntityTypeId;
    use crate::test_utils::*;

    #[test]
    fn full_chain_produces_and_delivers() {
        let mut level = basic_level();
        let lookup = Blocks::build_line(&mut level);

        // Producer interval 2, quantity 5, three tube segments at speed 1.
        for _ in 0..12 {
            level.step();
        }
        let consumed = consumer_held(&level, lookup.consumer);
        assert!(consumed >= 5, "at least one shipment must arrive, got {consumed}");
        assert_eq!(consumed % 5, 0, "shipments are indivisible");
    }

    #[test]
    fn queued_edit_applies_next_step() {
        let mut level = basic_level();
        let tube = level.registry.block_by_name("tube").unwrap();
        let edit = level.submit(Command::PlaceBlock {
            template: tube,
            origin: TilePos::new(0, 0),
        });
        assert_eq!(level.grid.block_count(), 0, "not yet applied");

        let result = level.step();
        assert_eq!(result.edits.len(), 1);
        assert_eq!(result.edits[0].edit(), edit);
        assert!(result.edits[0].is_applied());
        assert_eq!(level.grid.block_count(), 1);
    }

    #[test]
    fn conflicting_edits_reject_second_with_event() {
        let mut level = basic_level();
        let tube = level.registry.block_by_name("tube").unwrap();
        let _a = level.submit(Command::PlaceBlock {
            template: tube,
            origin: TilePos::new(0, 0),
        });
        let b = level.submit(Command::PlaceBlock {
            template: tube,
            origin: TilePos::new(0, 0),
        });

        let result = level.step();
        assert!(result.edits[0].is_applied());
        assert!(!result.edits[1].is_applied());
        assert!(level
            .last_tick_events()
            .iter()
            .any(|e| matches!(e, Event::EditRejected { edit, .. } if *edit == b)));
        assert_eq!(level.grid.block_count(), 1);
    }

    #[test]
    fn removing_missing_block_is_rejected_not_fatal() {
        let mut level = basic_level();
        let outcome = level.apply_now(Command::RemoveBlock {
            pos: TilePos::new(40, 40),
        });
        assert!(matches!(outcome, EditOutcome::Rejected { .. }));
        // The level keeps ticking.
        level.step();
        assert_eq!(level.current_tick(), 1);
    }

    #[test]
    fn tick_counter_and_hash_advance() {
        let mut level = basic_level();
        assert_eq!(level.current_tick(), 0);
        level.step();
        level.step();
        assert_eq!(level.current_tick(), 2);
        assert_ne!(level.state_hash(), 0);
    }

    #[test]
    fn paused_level_does_not_step() {
        let mut level = basic_level();
        level.pause();
        let result = level.step();
        assert_eq!(result.steps_run, 0);
        assert_eq!(level.current_tick(), 0);
        level.resume();
        level.step();
        assert_eq!(level.current_tick(), 1);
    }

    #[test]
    fn delta_mode_runs_accumulated_steps() {
        let registry = test_registry();
        let mut level = Level::new(registry, SimulationStrategy::Delta { fixed_timestep: 4 });
        let r = level.advance(10);
        assert_eq!(r.steps_run, 2);
        assert_eq!(level.sim_state.accumulator, 2);
        let r = level.advance(2);
        assert_eq!(r.steps_run, 1);
        assert_eq!(level.current_tick(), 3);
    }

    #[test]
    fn determinism_same_commands_same_hash() {
        let run = || {
            let mut level = basic_level();
            let _ = Blocks::build_line(&mut level);
            let spawn = EntitySpawn {
                entity_type: EntityTypeId(0),
                pos: Vec2Fix::new(fx(10.5), fx(10.5)),
                vel: Vec2Fix::new(fx(0.25), fx(0.0)),
                hitbox: Hitbox::new(fx(0.4), fx(0.4)),
                max_health: Some(20),
            };
            level.apply_now(Command::SpawnEntity { spawn });
            for _ in 0..20 {
                level.step();
            }
            level.state_hash()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn structural_edits_never_interleave_with_transport() {
        // A removal submitted mid-flight applies at the next edit phase,
        // before any packet moves that tick: the packet count through the
        // removed segment never observes a half-edited topology. Here we
        // just pin the observable consequence: the edit lands before
        // transport, so a packet that would have crossed is rerouted or
        // reported lost in the same tick's events.
        let mut level = basic_level();
        let lookup = Blocks::build_line(&mut level);
        // Run until a packet is in flight.
        let mut guard = 0;
        while level.nets.packets.is_empty() && guard < 20 {
            level.step();
            guard += 1;
        }
        assert!(!level.nets.packets.is_empty(), "no packet ever dispatched");

        level.submit(Command::RemoveBlock {
            pos: lookup.tube_positions[1],
        });
        level.step();
        // Whatever happened, no packet references the removed segment.
        for (_, p) in &level.nets.packets {
            assert!(level.grid.block(p.segment).is_some());
            for seg in &p.path {
                assert!(level.grid.block(*seg).is_some());
            }
        }
    }

    #[test]
    fn entity_motion_and_damage_lifecycle() {
        let mut level = basic_level();
        let spawn = EntitySpawn {
            entity_type: EntityTypeId(0),
            pos: Vec2Fix::new(fx(20.5), fx(20.5)),
            vel: Vec2Fix::new(fx(0.5), fx(0.0)),
            hitbox: Hitbox::new(fx(0.3), fx(0.3)),
            max_health: Some(10),
        };
        let outcome = level.apply_now(Command::SpawnEntity { spawn });
        let EditOutcome::Applied {
            entity: Some(id), ..
        } = outcome
        else {
            panic!("spawn failed: {outcome:?}");
        };

        level.step();
        let e = level.entities.get(id).unwrap();
        assert_eq!(e.pos.x, fx(21.0));

        // Weapon collaborator applies lethal damage; the entity dies and
        // is removed, with a death event.
        level.submit(Command::ApplyDamage {
            entity: id,
            amount: 10,
        });
        level.step();
        assert!(level.entities.get(id).is_none());
        assert!(level
            .last_tick_events()
            .iter()
            .any(|e| matches!(e, Event::EntityDied { entity, .. } if *entity == id)));
    }

    #[test]
    fn effect_volume_generates_hit_events() {
        let mut level = basic_level();
        let spawn = EntitySpawn {
            entity_type: EntityTypeId(0),
            pos: Vec2Fix::new(fx(5.5), fx(5.5)),
            vel: Vec2Fix::ZERO,
            hitbox: Hitbox::new(fx(0.4), fx(0.4)),
            max_health: Some(10),
        };
        let outcome = level.apply_now(Command::SpawnEntity { spawn });
        let EditOutcome::Applied {
            entity: Some(id), ..
        } = outcome
        else {
            panic!("spawn failed");
        };

        level.set_effect_volumes(vec![EffectVolume {
            id: 9,
            min: Vec2Fix::new(fx(5.0), fx(5.0)),
            max: Vec2Fix::new(fx(6.0), fx(6.0)),
        }]);
        level.step();
        assert!(level
            .last_tick_events()
            .iter()
            .any(|e| matches!(e, Event::EntityHit { entity, volume: 9, .. } if *entity == id)));
    }

    #[test]
    fn reactive_handler_despawns_on_death_report() {
        // The weapon collaborator pattern: react to hits by despawning.
        let mut level = basic_level();
        let spawn = EntitySpawn {
            entity_type: EntityTypeId(0),
            pos: Vec2Fix::new(fx(5.5), fx(5.5)),
            vel: Vec2Fix::ZERO,
            hitbox: Hitbox::new(fx(0.4), fx(0.4)),
            max_health: Some(10),
        };
        let outcome = level.apply_now(Command::SpawnEntity { spawn });
        let EditOutcome::Applied {
            entity: Some(id), ..
        } = outcome
        else {
            panic!("spawn failed");
        };

        level.event_bus.on_reactive(
            crate::event::EventKind::EntityHit,
            Box::new(|e| {
                if let Event::EntityHit { entity, .. } = e {
                    vec![Command::DespawnEntity { entity: *entity }]
                } else {
                    Vec::new()
                }
            }),
        );
        level.set_effect_volumes(vec![EffectVolume {
            id: 1,
            min: Vec2Fix::new(fx(5.0), fx(5.0)),
            max: Vec2Fix::new(fx(6.0), fx(6.0)),
        }]);

        level.step(); // hit event delivered; handler queues despawn
        assert!(level.entities.get(id).is_some());
        level.set_effect_volumes(Vec::new());
        level.step(); // despawn applies in the next edit phase
        assert!(level.entities.get(id).is_none());
    }

    #[test]
    fn converter_crafts_from_delivered_inputs() {
        let mut level = basic_level();
        let ore = level.registry.resource_by_name("ore").unwrap();
        let plate = level.registry.resource_by_name("plate").unwrap();

        // miner -> tube -> smelter -> tube -> depot
        let miner = level.registry.block_by_name("miner").unwrap();
        let tube = level.registry.block_by_name("tube").unwrap();
        let smelter = level.registry.block_by_name("smelter").unwrap();
        let depot = level.registry.block_by_name("depot").unwrap();

        level.apply_now(Command::SetGround {
            pos: TilePos::new(0, 0),
            ground: Ground::Ore {
                resource: ore,
                richness: 1000,
            },
        });
        for (template, x) in [(miner, 0), (tube, 1), (smelter, 2), (tube, 3), (depot, 4)] {
            let outcome = level.apply_now(Command::PlaceBlock {
                template,
                origin: TilePos::new(x, 0),
            });
            assert!(outcome.is_applied(), "placement at {x} failed: {outcome:?}");
        }

        for _ in 0..40 {
            level.step();
        }

        let depot_id = level.grid.block_at(TilePos::new(4, 0)).unwrap();
        let held = match &level.grid.block(depot_id).unwrap().behavior {
            Behavior::Storage(s) => s.buffer.quantity(plate),
            _ => panic!("expected storage"),
        };
        assert!(held > 0, "smelted plates must reach the depot");
    }

    #[test]
    fn miner_requires_matching_ore_ground() {
        let mut level = basic_level();
        let miner = level.registry.block_by_name("miner").unwrap();
        // No ore under the miner: it never produces.
        level.apply_now(Command::PlaceBlock {
            template: miner,
            origin: TilePos::new(0, 0),
        });
        for _ in 0..10 {
            level.step();
        }
        let id = level.grid.block_at(TilePos::new(0, 0)).unwrap();
        match &level.grid.block(id).unwrap().behavior {
            Behavior::Producer(p) => assert_eq!(p.output.total(), 0),
            _ => panic!("expected producer"),
        }
    }

    #[test]
    fn networks_stay_consistent_through_stepped_edits() {
        let mut level = basic_level();
        let tube = level.registry.block_by_name("tube").unwrap();
        for x in 0..6 {
            level.submit(Command::PlaceBlock {
                template: tube,
                origin: TilePos::new(x, 0),
            });
        }
        level.step();
        assert_eq!(level.nets.network_count(), 1);

        level.submit(Command::RemoveBlock {
            pos: TilePos::new(3, 0),
        });
        level.step();
        assert_eq!(level.nets.network_count(), 2);

        // Tube states and membership agree.
        for (nid, net) in &level.nets.networks {
            for seg in &net.segments {
                match &level.grid.block(*seg).unwrap().behavior {
                    Behavior::Tube(t) => assert_eq!(t.network, nid),
                    _ => panic!("non-tube in membership"),
                }
            }
        }
    }

    #[test]
    fn sealed_tube_template_keeps_closed_points() {
        let mut level = basic_level();
        let capped = level.registry.block_by_name("tube_capped_north").unwrap();
        let outcome = level.apply_now(Command::PlaceBlock {
            template: capped,
            origin: TilePos::new(0, 0),
        });
        let EditOutcome::Applied {
            block: Some(id), ..
        } = outcome
        else {
            panic!("placement failed");
        };
        match &level.grid.block(id).unwrap().behavior {
            Behavior::Tube(t) => {
                assert_eq!(t.connection(Direction::North), ConnectionPoint::Closed);
            }
            _ => panic!("expected tube"),
        }
    }
}
