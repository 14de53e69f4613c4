//! Resource packets and the per-tick transport advance.
//!
//! Packets are discrete, indivisible shipments riding the tube graph. Each
//! tick every network processes its packets oldest-inserted first: progress
//! accumulates by segment speed, and a packet at the end of its segment
//! asks the next hop for entry. Entry is granted only under the lane's
//! packet-count capacity; refusal holds the packet at progress 1.0 and it
//! retries next tick, so contention delays packets but never destroys them.
//! Merge points rotate admission across inbound directions so no producer
//! starves. Routing is breadth-first to the nearest endpoint accepting the
//! resource type, expanding in direction-index order, which fixes every
//! tie deterministically.

use crate::block::{Behavior, BlockData, ConnectionPoint};
use crate::event::{Event, EventBus};
use crate::fixed::{Fixed64, Ticks};
use crate::geom::Direction;
use crate::grid::TileGrid;
use crate::id::{BlockId, NetworkId, PacketId, ResourceTypeId};
use crate::network::{tube_state, NetworkSet};
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// A discrete shipment of one resource type in transit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub resource: ResourceTypeId,
    pub quantity: u32,
    /// The segment whose lane this packet currently occupies.
    pub segment: BlockId,
    /// Progress along the current segment, 0.0 to 1.0.
    pub progress: Fixed64,
    /// Remaining segments to traverse after the current one.
    pub path: Vec<BlockId>,
    /// The endpoint block this packet delivers to.
    pub dest: BlockId,
    /// The connection point (on the current segment) the packet entered
    /// through. Drives round-robin admission fairness at merge points.
    pub entered_from: Direction,
}

/// Outcome of a producer-side dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// A packet was created and entered the network.
    Dispatched(PacketId),
    /// The port is not attached to any segment.
    NotAttached,
    /// No endpoint accepting this resource type is reachable.
    NoRoute,
    /// The entry segment's lane is at capacity. Retry next tick.
    EntryFull,
}

// ---------------------------------------------------------------------------
// Endpoint acceptance
// ---------------------------------------------------------------------------

/// Whether an endpoint would ever take this resource type, ignoring current
/// buffer space. Routing uses this; delivery re-checks space.
pub fn endpoint_accepts_type(block: &BlockData, registry: &Registry, resource: ResourceTypeId) -> bool {
    match &block.behavior {
        Behavior::Consumer(c) => c.accepts.is_none_or(|a| a == resource),
        Behavior::Storage(_) => true,
        Behavior::Converter(c) => match c.recipe {
            Some(recipe) => registry
                .recipe(recipe)
                .is_some_and(|r| r.inputs.iter().any(|i| i.resource == resource)),
            None => true,
        },
        Behavior::Custom(slot) => slot
            .behavior
            .as_ref()
            .is_some_and(|b| b.accepts_delivery(resource, 0)),
        Behavior::Producer(_) | Behavior::Tube(_) => false,
    }
}

/// Whether an endpoint can take the full quantity right now.
fn endpoint_accepts_now(block: &BlockData, registry: &Registry, resource: ResourceTypeId, quantity: u32) -> bool {
    match &block.behavior {
        Behavior::Consumer(c) => c.accepts_delivery(resource, quantity),
        Behavior::Storage(s) => s.buffer.has_space_for(quantity),
        Behavior::Converter(c) => {
            endpoint_accepts_type(block, registry, resource) && c.accepts_delivery(quantity)
        }
        Behavior::Custom(slot) => slot
            .behavior
            .as_ref()
            .is_some_and(|b| b.accepts_delivery(resource, quantity)),
        Behavior::Producer(_) | Behavior::Tube(_) => false,
    }
}

/// Transfer a delivered quantity into an endpoint's buffer. Callers check
/// acceptance first; the transfer is all-or-nothing.
fn endpoint_receive(block: &mut BlockData, resource: ResourceTypeId, quantity: u32) {
    match &mut block.behavior {
        Behavior::Consumer(c) => {
            let overflow = c.buffer.add(resource, quantity);
            debug_assert_eq!(overflow, 0, "delivery must be atomic");
        }
        Behavior::Storage(s) => {
            let overflow = s.buffer.add(resource, quantity);
            debug_assert_eq!(overflow, 0, "delivery must be atomic");
        }
        Behavior::Converter(c) => {
            let overflow = c.input.add(resource, quantity);
            debug_assert_eq!(overflow, 0, "delivery must be atomic");
        }
        Behavior::Custom(slot) => {
            if let Some(b) = slot.behavior.as_mut() {
                b.receive(resource, quantity);
            }
        }
        Behavior::Producer(_) | Behavior::Tube(_) => {
            debug_assert!(false, "producers and tubes never take deliveries");
        }
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Breadth-first route from `start` to the nearest endpoint accepting
/// `resource`. Returns the remaining path after `start` plus the
/// destination block. Expansion and endpoint checks run in direction-index
/// order, so equal-length routes always resolve the same way.
pub fn find_route(
    grid: &TileGrid,
    registry: &Registry,
    start: BlockId,
    resource: ResourceTypeId,
) -> Option<(Vec<BlockId>, BlockId)> {
    let mut parents: BTreeMap<BlockId, BlockId> = BTreeMap::new();
    let mut visited: BTreeSet<BlockId> = BTreeSet::new();
    let mut queue: VecDeque<BlockId> = VecDeque::new();
    visited.insert(start);
    queue.push_back(start);

    while let Some(current) = queue.pop_front() {
        let Some(t) = tube_state(grid, current) else {
            continue;
        };

        // Endpoint check before deeper expansion: nearest wins, and within
        // one segment the lowest direction index wins.
        for dir in Direction::ALL {
            if let ConnectionPoint::Endpoint(block_id) = t.connection(dir) {
                let Some(block) = grid.block(block_id) else {
                    continue;
                };
                if endpoint_accepts_type(block, registry, resource) {
                    // Reconstruct start..=current, then drop start.
                    let mut path = vec![current];
                    let mut cursor = current;
                    while let Some(&parent) = parents.get(&cursor) {
                        path.push(parent);
                        cursor = parent;
                    }
                    path.reverse();
                    path.remove(0);
                    return Some((path, block_id));
                }
            }
        }

        for dir in Direction::ALL {
            if let ConnectionPoint::Tube(neighbor) = t.connection(dir) {
                if visited.insert(neighbor) {
                    parents.insert(neighbor, current);
                    queue.push_back(neighbor);
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Occupancy
// ---------------------------------------------------------------------------

/// Packets currently resident on a segment's lane.
pub fn lane_occupancy(nets: &NetworkSet, network: NetworkId, segment: BlockId) -> u32 {
    let Some(net) = nets.network(network) else {
        return 0;
    };
    net.packets
        .iter()
        .filter(|pid| {
            nets.packet(**pid)
                .is_some_and(|p| p.segment == segment)
        })
        .count() as u32
}

// ---------------------------------------------------------------------------
// Dispatch (producer emission)
// ---------------------------------------------------------------------------

/// Try to inject a shipment from an endpoint block into the tube attached
/// at `port`. Acceptance protocol applies at the entry lane: a full lane
/// refuses the shipment and the producer retries next tick.
pub fn dispatch(
    nets: &mut NetworkSet,
    grid: &TileGrid,
    registry: &Registry,
    from: BlockId,
    port: Direction,
    resource: ResourceTypeId,
    quantity: u32,
    tick: Ticks,
    events: &mut EventBus,
) -> DispatchResult {
    let Some(block) = grid.block(from) else {
        return DispatchResult::NotAttached;
    };
    let entry_pos = block.origin.step(port);
    let Some(entry) = grid.block_at(entry_pos) else {
        return DispatchResult::NotAttached;
    };
    let Some(entry_tube) = tube_state(grid, entry) else {
        return DispatchResult::NotAttached;
    };
    if entry_tube.connection(port.opposite()) != ConnectionPoint::Endpoint(from) {
        return DispatchResult::NotAttached;
    }
    let network = entry_tube.network;
    let capacity = entry_tube.lane_capacity;

    if lane_occupancy(nets, network, entry) >= capacity {
        return DispatchResult::EntryFull;
    }

    let Some((path, dest)) = find_route(grid, registry, entry, resource) else {
        return DispatchResult::NoRoute;
    };

    let packet = Packet {
        resource,
        quantity,
        segment: entry,
        progress: Fixed64::ZERO,
        path,
        dest,
        entered_from: port.opposite(),
    };
    let pid = nets.packets.insert(packet);
    if let Some(net) = nets.networks.get_mut(network) {
        net.packets.push(pid);
    }
    events.emit(Event::PacketDispatched {
        packet: pid,
        network,
        resource,
        quantity,
        tick,
    });
    DispatchResult::Dispatched(pid)
}

// ---------------------------------------------------------------------------
// Per-tick advance
// ---------------------------------------------------------------------------

/// Advance one network by one tick: accumulate progress, deliver packets
/// that reached their destination, then admit packets into their next
/// segments under capacity and round-robin fairness.
pub fn advance_network(
    nets: &mut NetworkSet,
    grid: &mut TileGrid,
    registry: &Registry,
    network: NetworkId,
    tick: Ticks,
    events: &mut EventBus,
) {
    let order: Vec<PacketId> = match nets.network(network) {
        Some(net) => net.packets.clone(),
        None => return,
    };
    if order.is_empty() {
        return;
    }

    let one = Fixed64::from_num(1);

    // Current lane occupancy. Updated live as packets move and leave, so a
    // slot drained earlier in the pass is available later in the same tick.
    let mut occupancy: BTreeMap<BlockId, u32> = BTreeMap::new();
    for pid in &order {
        if let Some(p) = nets.packets.get(*pid) {
            *occupancy.entry(p.segment).or_insert(0) += 1;
        }
    }

    // Advance progress, clamped to the end of the segment.
    for pid in &order {
        let Some(packet) = nets.packets.get(*pid) else {
            continue;
        };
        let speed = match tube_state(grid, packet.segment) {
            Some(t) => t.speed,
            None => continue,
        };
        let packet = nets.packets.get_mut(*pid).expect("packet exists");
        packet.progress = (packet.progress + speed).min(one);
    }

    // Deliveries first: a packet leaving the network frees its lane slot
    // for admissions below.
    let mut delivered: Vec<PacketId> = Vec::new();
    for pid in &order {
        let Some(packet) = nets.packets.get(*pid) else {
            continue;
        };
        if packet.progress < one || !packet.path.is_empty() {
            continue;
        }
        let (dest, resource, quantity, segment) =
            (packet.dest, packet.resource, packet.quantity, packet.segment);

        // The destination must still be attached to the packet's segment.
        let attached = tube_state(grid, segment)
            .map(|t| {
                Direction::ALL
                    .into_iter()
                    .any(|d| t.connection(d) == ConnectionPoint::Endpoint(dest))
            })
            .unwrap_or(false);
        if !attached {
            // Topology changed since the last edit-phase revalidation could
            // see it; leave the packet held, the next revalidation decides.
            continue;
        }

        let accepts = grid
            .block(dest)
            .is_some_and(|b| endpoint_accepts_now(b, registry, resource, quantity));
        if !accepts {
            continue; // Backpressure: held at 1.0, retried next tick.
        }

        let dest_block = grid.block_mut(dest).expect("checked above");
        endpoint_receive(dest_block, resource, quantity);
        events.emit(Event::PacketDelivered {
            dest,
            resource,
            quantity,
            tick,
        });
        *occupancy.entry(segment).or_insert(1) -= 1;
        nets.packets.remove(*pid);
        delivered.push(*pid);
    }
    if !delivered.is_empty() {
        if let Some(net) = nets.networks.get_mut(network) {
            net.packets.retain(|p| !delivered.contains(p));
        }
    }

    // Admissions: group packets wanting entry by target segment, then admit
    // under capacity, rotating across inbound directions.
    let mut wanting: Vec<(BlockId, PacketId)> = Vec::new(); // (target, packet)
    for pid in &order {
        if delivered.contains(pid) {
            continue;
        }
        let Some(packet) = nets.packets.get(*pid) else {
            continue;
        };
        if packet.progress >= one {
            if let Some(&target) = packet.path.first() {
                wanting.push((target, *pid));
            }
        }
    }

    // Targets in first-appearance order for determinism.
    let mut targets: Vec<BlockId> = Vec::new();
    for (target, _) in &wanting {
        if !targets.contains(target) {
            targets.push(*target);
        }
    }

    for target in targets {
        let (capacity, target_origin) = match (tube_state(grid, target), grid.block(target)) {
            (Some(t), Some(b)) => (t.lane_capacity, b.origin),
            _ => continue,
        };
        let mut free = capacity.saturating_sub(*occupancy.get(&target).unwrap_or(&0));
        if free == 0 {
            continue;
        }

        // Candidates keyed by the target's inbound connection point.
        let mut by_dir: [VecDeque<PacketId>; 4] =
            [VecDeque::new(), VecDeque::new(), VecDeque::new(), VecDeque::new()];
        for (t, pid) in &wanting {
            if *t != target {
                continue;
            }
            let Some(packet) = nets.packets.get(*pid) else {
                continue;
            };
            let Some(from_block) = grid.block(packet.segment) else {
                continue;
            };
            let inbound = Direction::ALL.into_iter().find(|d| {
                target_origin.step(*d) == from_block.origin
            });
            if let Some(dir) = inbound {
                by_dir[dir.index()].push_back(*pid);
            }
        }

        let mut cursor = nets
            .networks
            .get(network)
            .and_then(|n| n.rr_cursors.get(&target).copied())
            .unwrap_or(0) as usize;

        while free > 0 {
            // Rotate from the cursor to the first direction with a waiting
            // packet; oldest within that direction goes first.
            let mut admitted = None;
            for step in 0..4 {
                let dir_idx = (cursor + step) % 4;
                if let Some(pid) = by_dir[dir_idx].pop_front() {
                    admitted = Some((pid, dir_idx));
                    break;
                }
            }
            let Some((pid, dir_idx)) = admitted else {
                break;
            };
            cursor = (dir_idx + 1) % 4;

            let packet = nets.packets.get_mut(pid).expect("candidate exists");
            let old_segment = packet.segment;
            packet.segment = target;
            packet.progress = Fixed64::ZERO;
            packet.path.remove(0);
            packet.entered_from = Direction::from_index(dir_idx);
            *occupancy.entry(old_segment).or_insert(1) -= 1;
            *occupancy.entry(target).or_insert(0) += 1;
            free -= 1;
        }

        if let Some(net) = nets.networks.get_mut(network) {
            net.rr_cursors.insert(target, cursor as u8);
        }
    }
}

// ---------------------------------------------------------------------------
// Revalidation after structural edits
// ---------------------------------------------------------------------------

/// Re-check every packet's path against the current topology. A packet
/// whose path or destination went stale gets one fresh route search from
/// its current segment; with no route left it is destroyed and a lost
/// shipment is reported, never silently dropped.
pub fn revalidate_packets(
    nets: &mut NetworkSet,
    grid: &TileGrid,
    registry: &Registry,
    tick: Ticks,
    events: &mut EventBus,
) {
    let network_ids: Vec<NetworkId> = nets.networks.keys().collect();
    for net_id in network_ids {
        let members: BTreeSet<BlockId> = match nets.network(net_id) {
            Some(net) => net.segments.iter().copied().collect(),
            None => continue,
        };
        let order: Vec<PacketId> = nets.network(net_id).map(|n| n.packets.clone()).unwrap_or_default();

        let mut lost: Vec<PacketId> = Vec::new();
        for pid in order {
            let Some(packet) = nets.packets.get(pid) else {
                continue;
            };

            let final_segment = packet.path.last().copied().unwrap_or(packet.segment);
            let path_ok = members.contains(&packet.segment)
                && packet.path.iter().all(|s| members.contains(s))
                && tube_state(grid, final_segment)
                    .map(|t| {
                        Direction::ALL
                            .into_iter()
                            .any(|d| t.connection(d) == ConnectionPoint::Endpoint(packet.dest))
                    })
                    .unwrap_or(false)
                && grid
                    .block(packet.dest)
                    .is_some_and(|b| endpoint_accepts_type(b, registry, packet.resource));
            if path_ok {
                continue;
            }

            // One fresh search from the current segment.
            match find_route(grid, registry, packet.segment, packet.resource) {
                Some((path, dest)) => {
                    // A held packet stays at the segment end; the next
                    // advance admits it toward the new hop.
                    let packet = nets.packets.get_mut(pid).expect("packet exists");
                    packet.path = path;
                    packet.dest = dest;
                }
                None => {
                    if let Some(p) = nets.packets.remove(pid) {
                        events.emit(Event::LostShipment {
                            network: net_id,
                            resource: p.resource,
                            quantity: p.quantity,
                            tick,
                        });
                        lost.push(pid);
                    }
                }
            }
        }
        if !lost.is_empty() {
            if let Some(net) = nets.networks.get_mut(net_id) {
                net.packets.retain(|p| !lost.contains(p));
            }
        }
    }
}
