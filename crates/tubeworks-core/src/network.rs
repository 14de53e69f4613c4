//! Tube network membership: connectivity maintenance over the tile grid.
//!
//! A network is the maximal connected set of tube segments reachable through
//! attached connection points, plus the endpoint blocks at its boundary.
//! Every segment belongs to exactly one network at all times. Placement
//! merges networks by letting the larger identity absorb the smaller
//! (O(size of smaller) relinking); removal flood-fills the local remainder
//! to detect splits, so structural edits never recompute the whole level.

use crate::block::{Behavior, ConnectionPoint, TubeState};
use crate::event::{Event, EventBus};
use crate::fixed::Ticks;
use crate::geom::Direction;
use crate::grid::TileGrid;
use crate::id::{BlockId, NetworkId, PacketId};
use crate::transport::Packet;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

// ---------------------------------------------------------------------------
// Network data
// ---------------------------------------------------------------------------

/// Maintenance state of a network. `Building` only while a structural edit
/// is rewiring it; always `Stable` between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkState {
    Building,
    Stable,
}

/// An endpoint block attached at a network's boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// The producer/consumer/storage/converter block.
    pub block: BlockId,
    /// The segment it is attached to.
    pub segment: BlockId,
    /// Direction from the segment toward the endpoint.
    pub dir: Direction,
}

/// One connected component of tube segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub segments: Vec<BlockId>,
    pub endpoints: Vec<Endpoint>,
    pub state: NetworkState,
    /// Resident packets, oldest-inserted first. Transport processes them in
    /// this order; merges append, preserving each side's relative order.
    pub packets: Vec<PacketId>,
    /// Per-segment round-robin admission cursor (inbound direction index).
    pub rr_cursors: BTreeMap<BlockId, u8>,
}

impl Network {
    fn new() -> Self {
        Self {
            segments: Vec::new(),
            endpoints: Vec::new(),
            state: NetworkState::Stable,
            packets: Vec::new(),
            rr_cursors: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn contains_segment(&self, id: BlockId) -> bool {
        self.segments.contains(&id)
    }
}

// ---------------------------------------------------------------------------
// NetworkSet
// ---------------------------------------------------------------------------

/// All networks in the level, plus the packet arena.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NetworkSet {
    pub networks: SlotMap<NetworkId, Network>,
    pub packets: SlotMap<PacketId, Packet>,
}

/// Read the tube state of a block, if it is a segment.
pub fn tube_state(grid: &TileGrid, id: BlockId) -> Option<&TubeState> {
    match &grid.block(id)?.behavior {
        Behavior::Tube(t) => Some(t),
        _ => None,
    }
}

/// Mutable tube state of a block, if it is a segment.
pub fn tube_state_mut(grid: &mut TileGrid, id: BlockId) -> Option<&mut TubeState> {
    match &mut grid.block_mut(id)?.behavior {
        Behavior::Tube(t) => Some(t),
        _ => None,
    }
}

/// What a neighbor probe found in one direction.
#[derive(Clone, Copy)]
enum Probe {
    TubeAttach { neighbor: BlockId, network: NetworkId },
    EndpointAttach { neighbor: BlockId },
}

impl NetworkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn network(&self, id: NetworkId) -> Option<&Network> {
        self.networks.get(id)
    }

    pub fn network_mut(&mut self, id: NetworkId) -> Option<&mut Network> {
        self.networks.get_mut(id)
    }

    pub fn network_count(&self) -> usize {
        self.networks.len()
    }

    pub fn packet(&self, id: PacketId) -> Option<&Packet> {
        self.packets.get(id)
    }

    /// The network a segment belongs to.
    pub fn network_of_segment(&self, grid: &TileGrid, segment: BlockId) -> Option<NetworkId> {
        tube_state(grid, segment).map(|t| t.network)
    }

    // -----------------------------------------------------------------------
    // Segment placement
    // -----------------------------------------------------------------------

    /// Wire a freshly placed segment into the graph: probe all four
    /// neighbors, attach mutually, and merge any distinct neighbor networks
    /// into one. Returns the network the segment ended up in.
    pub fn segment_placed(
        &mut self,
        grid: &mut TileGrid,
        id: BlockId,
        tick: Ticks,
        events: &mut EventBus,
    ) -> NetworkId {
        let origin = grid.block(id).expect("placed segment must exist").origin;
        let my_closed: [bool; 4] = {
            let t = tube_state(grid, id).expect("segment must have tube state");
            let mut closed = [false; 4];
            for dir in Direction::ALL {
                closed[dir.index()] = t.connection(dir) == ConnectionPoint::Closed;
            }
            closed
        };

        // Read pass: classify each neighbor.
        let mut probes: [Option<Probe>; 4] = [None, None, None, None];
        for dir in Direction::ALL {
            if my_closed[dir.index()] {
                continue;
            }
            let npos = origin.step(dir);
            let Some(nid) = grid.block_at(npos) else {
                continue;
            };
            let Some(nblock) = grid.block(nid) else {
                continue;
            };
            match &nblock.behavior {
                Behavior::Tube(nt) => {
                    // Tubes are single-tile; attachment requires the facing
                    // connection point to be openable.
                    if nt.connection(dir.opposite()) != ConnectionPoint::Closed {
                        probes[dir.index()] = Some(Probe::TubeAttach {
                            neighbor: nid,
                            network: nt.network,
                        });
                    }
                }
                _ => {
                    // Endpoint blocks attach through a port on their origin
                    // tile facing back at this segment.
                    let faces_me = nblock.origin == npos
                        && nblock
                            .ports()
                            .iter()
                            .any(|(pdir, _)| *pdir == dir.opposite());
                    if faces_me {
                        probes[dir.index()] = Some(Probe::EndpointAttach { neighbor: nid });
                    }
                }
            }
        }

        // Mutual attachment.
        for dir in Direction::ALL {
            match probes[dir.index()] {
                Some(Probe::TubeAttach { neighbor, .. }) => {
                    if let Some(t) = tube_state_mut(grid, neighbor) {
                        t.set_connection(dir.opposite(), ConnectionPoint::Tube(id));
                    }
                    if let Some(t) = tube_state_mut(grid, id) {
                        t.set_connection(dir, ConnectionPoint::Tube(neighbor));
                    }
                }
                Some(Probe::EndpointAttach { neighbor }) => {
                    if let Some(t) = tube_state_mut(grid, id) {
                        t.set_connection(dir, ConnectionPoint::Endpoint(neighbor));
                    }
                }
                None => {}
            }
        }

        // Collect the distinct neighbor networks, in probe order.
        let mut neighbor_nets: Vec<NetworkId> = Vec::new();
        for probe in probes.iter().flatten() {
            if let Probe::TubeAttach { network, .. } = probe {
                if !neighbor_nets.contains(network) {
                    neighbor_nets.push(*network);
                }
            }
        }

        // Choose the surviving network: the largest neighbor, or a fresh
        // singleton when the segment touches no other tube.
        let kept = match neighbor_nets
            .iter()
            .copied()
            .max_by_key(|nid| self.networks.get(*nid).map(|n| n.len()).unwrap_or(0))
        {
            Some(largest) => largest,
            None => self.networks.insert(Network::new()),
        };

        if let Some(net) = self.networks.get_mut(kept) {
            net.state = NetworkState::Building;
        }

        // Absorb the smaller neighbor networks into the survivor.
        for other_id in neighbor_nets {
            if other_id == kept {
                continue;
            }
            let Some(other) = self.networks.remove(other_id) else {
                continue;
            };
            for seg in &other.segments {
                if let Some(t) = tube_state_mut(grid, *seg) {
                    t.network = kept;
                }
            }
            let net = self
                .networks
                .get_mut(kept)
                .expect("surviving network must exist");
            net.segments.extend(other.segments);
            net.endpoints.extend(other.endpoints);
            net.packets.extend(other.packets);
            net.rr_cursors.extend(other.rr_cursors);
            events.emit(Event::NetworksMerged {
                kept,
                absorbed: other_id,
                tick,
            });
        }

        // The new segment joins the survivor, bringing its endpoint
        // attachments with it.
        if let Some(t) = tube_state_mut(grid, id) {
            t.network = kept;
        }
        let endpoint_links: Vec<Endpoint> = tube_state(grid, id)
            .map(|t| {
                t.endpoint_neighbors()
                    .map(|(dir, block)| Endpoint {
                        block,
                        segment: id,
                        dir,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let net = self
            .networks
            .get_mut(kept)
            .expect("surviving network must exist");
        net.segments.push(id);
        for link in endpoint_links {
            if !net.endpoints.contains(&link) {
                net.endpoints.push(link);
            }
        }
        net.state = NetworkState::Stable;
        kept
    }

    // -----------------------------------------------------------------------
    // Segment removal
    // -----------------------------------------------------------------------

    /// Unwire a removed segment: detach neighbors, destroy packets stranded
    /// on the removed segment, and split the network when the removal
    /// disconnects it. Call after the block has left the grid, passing its
    /// final tube state.
    pub fn segment_removed(
        &mut self,
        grid: &mut TileGrid,
        removed: BlockId,
        removed_state: &TubeState,
        tick: Ticks,
        events: &mut EventBus,
    ) {
        let net_id = removed_state.network;

        // Detach tube neighbors.
        for (dir, neighbor) in removed_state.tube_neighbors() {
            if let Some(t) = tube_state_mut(grid, neighbor) {
                if t.connection(dir.opposite()) == ConnectionPoint::Tube(removed) {
                    t.set_connection(dir.opposite(), ConnectionPoint::Open);
                }
            }
        }

        let Some(net) = self.networks.get_mut(net_id) else {
            return;
        };
        net.state = NetworkState::Building;

        // Packets riding the removed segment have no position left to
        // occupy; they are destroyed loudly, never silently.
        let stranded: Vec<PacketId> = net
            .packets
            .iter()
            .copied()
            .filter(|pid| {
                self.packets
                    .get(*pid)
                    .is_some_and(|p| p.segment == removed)
            })
            .collect();
        for pid in stranded {
            if let Some(packet) = self.packets.remove(pid) {
                events.emit(Event::LostShipment {
                    network: net_id,
                    resource: packet.resource,
                    quantity: packet.quantity,
                    tick,
                });
            }
            if let Some(net) = self.networks.get_mut(net_id) {
                net.packets.retain(|p| *p != pid);
            }
        }

        let net = self
            .networks
            .get_mut(net_id)
            .expect("network still exists");
        net.segments.retain(|s| *s != removed);
        net.endpoints.retain(|e| e.segment != removed);
        net.rr_cursors.remove(&removed);

        if net.segments.is_empty() {
            self.networks.remove(net_id);
            return;
        }

        // Local connectivity recomputation: flood-fill the remaining
        // membership. One component means no split.
        let components = Self::components(grid, &net.segments);
        if components.len() <= 1 {
            net.state = NetworkState::Stable;
            return;
        }

        self.split_network(grid, net_id, components, tick, events);
    }

    /// Partition `net_id` into the given components. The largest component
    /// keeps the existing identity; the rest become fresh networks.
    fn split_network(
        &mut self,
        grid: &mut TileGrid,
        net_id: NetworkId,
        mut components: Vec<Vec<BlockId>>,
        tick: Ticks,
        events: &mut EventBus,
    ) {
        // Largest keeps the old identity; stable order otherwise.
        components.sort_by_key(|c| std::cmp::Reverse(c.len()));

        let old = self
            .networks
            .get_mut(net_id)
            .expect("split target must exist");
        let old_endpoints = std::mem::take(&mut old.endpoints);
        let old_packets = std::mem::take(&mut old.packets);
        let old_cursors = std::mem::take(&mut old.rr_cursors);

        let mut resulting: Vec<NetworkId> = Vec::new();
        for (i, component) in components.into_iter().enumerate() {
            let target = if i == 0 {
                net_id
            } else {
                self.networks.insert(Network::new())
            };
            let member: BTreeSet<BlockId> = component.iter().copied().collect();
            for seg in &component {
                if let Some(t) = tube_state_mut(grid, *seg) {
                    t.network = target;
                }
            }
            let net = self.networks.get_mut(target).expect("component network");
            net.segments = component;
            net.endpoints = old_endpoints
                .iter()
                .copied()
                .filter(|e| member.contains(&e.segment))
                .collect();
            net.packets = old_packets
                .iter()
                .copied()
                .filter(|pid| {
                    self.packets
                        .get(*pid)
                        .is_some_and(|p| member.contains(&p.segment))
                })
                .collect();
            net.rr_cursors = old_cursors
                .iter()
                .filter(|(seg, _)| member.contains(seg))
                .map(|(seg, cur)| (*seg, *cur))
                .collect();
            net.state = NetworkState::Stable;
            resulting.push(target);
        }

        events.emit(Event::NetworkSplit {
            from: net_id,
            into: resulting,
            tick,
        });
    }

    /// Connected components over a membership list, following mutual tube
    /// attachments. Seeds iterate in membership order for determinism.
    fn components(grid: &TileGrid, segments: &[BlockId]) -> Vec<Vec<BlockId>> {
        let member: BTreeSet<BlockId> = segments.iter().copied().collect();
        let mut visited: BTreeSet<BlockId> = BTreeSet::new();
        let mut components = Vec::new();

        for &seed in segments {
            if visited.contains(&seed) {
                continue;
            }
            let mut component = Vec::new();
            let mut queue = VecDeque::new();
            queue.push_back(seed);
            visited.insert(seed);
            while let Some(current) = queue.pop_front() {
                component.push(current);
                let Some(t) = tube_state(grid, current) else {
                    continue;
                };
                for (_, neighbor) in t.tube_neighbors() {
                    if member.contains(&neighbor) && visited.insert(neighbor) {
                        queue.push_back(neighbor);
                    }
                }
            }
            components.push(component);
        }
        components
    }

    // -----------------------------------------------------------------------
    // Endpoint attachment
    // -----------------------------------------------------------------------

    /// Attach a freshly placed endpoint block to adjacent segments.
    pub fn endpoint_placed(&mut self, grid: &mut TileGrid, id: BlockId) {
        let Some(block) = grid.block(id) else {
            return;
        };
        let origin = block.origin;
        let ports = block.ports();

        for (dir, _) in ports {
            let npos = origin.step(dir);
            let Some(seg) = grid.block_at(npos) else {
                continue;
            };
            let attached = match tube_state_mut(grid, seg) {
                Some(t) if t.connection(dir.opposite()) == ConnectionPoint::Open => {
                    t.set_connection(dir.opposite(), ConnectionPoint::Endpoint(id));
                    Some(t.network)
                }
                _ => None,
            };
            if let Some(net_id) = attached {
                if let Some(net) = self.networks.get_mut(net_id) {
                    let link = Endpoint {
                        block: id,
                        segment: seg,
                        dir: dir.opposite(),
                    };
                    if !net.endpoints.contains(&link) {
                        net.endpoints.push(link);
                    }
                }
            }
        }
    }

    /// Detach a removed endpoint block from every segment that referenced
    /// it. Pass the block's final data (it has already left the grid).
    pub fn endpoint_removed(
        &mut self,
        grid: &mut TileGrid,
        id: BlockId,
        origin: crate::geom::TilePos,
        ports: &[(Direction, crate::block::PortRole)],
    ) {
        for (dir, _) in ports {
            let npos = origin.step(*dir);
            let Some(seg) = grid.block_at(npos) else {
                continue;
            };
            let detached = match tube_state_mut(grid, seg) {
                Some(t) if t.connection(dir.opposite()) == ConnectionPoint::Endpoint(id) => {
                    t.set_connection(dir.opposite(), ConnectionPoint::Open);
                    Some(t.network)
                }
                _ => None,
            };
            if let Some(net_id) = detached {
                if let Some(net) = self.networks.get_mut(net_id) {
                    net.endpoints.retain(|e| e.block != id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Behavior, BlockData, ConsumerState, ProducerState};
    use crate::fixed::Fixed64;
    use crate::geom::{Footprint, TilePos};
    use crate::id::{BlockTypeId, ResourceTypeId};
    use crate::resource::ResourceBuffer;

    fn tube_block(origin: TilePos) -> BlockData {
        BlockData {
            block_type: BlockTypeId(0),
            origin,
            footprint: Footprint::single(),
            behavior: Behavior::Tube(TubeState {
                connections: [ConnectionPoint::Open; 4],
                network: NetworkId::default(),
                speed: Fixed64::from_num(1),
                lane_capacity: 4,
            }),
        }
    }

    fn place_tube(
        grid: &mut TileGrid,
        nets: &mut NetworkSet,
        events: &mut EventBus,
        pos: TilePos,
    ) -> (BlockId, NetworkId) {
        let id = grid.place_block(tube_block(pos)).unwrap();
        let net = nets.segment_placed(grid, id, 0, events);
        (id, net)
    }

    fn remove_tube(
        grid: &mut TileGrid,
        nets: &mut NetworkSet,
        events: &mut EventBus,
        pos: TilePos,
    ) {
        let (id, data) = grid.remove_block_at(pos).unwrap();
        let Behavior::Tube(state) = data.behavior else {
            panic!("expected tube");
        };
        nets.segment_removed(grid, id, &state, 0, events);
    }

    #[test]
    fn two_adjacent_segments_form_one_network() {
        let mut grid = TileGrid::new();
        let mut nets = NetworkSet::new();
        let mut events = EventBus::default();

        let (a, net_a) = place_tube(&mut grid, &mut nets, &mut events, TilePos::new(0, 0));
        let (b, net_b) = place_tube(&mut grid, &mut nets, &mut events, TilePos::new(1, 0));

        assert_eq!(net_a, net_b);
        assert_eq!(nets.network_count(), 1);
        let net = nets.network(net_a).unwrap();
        assert_eq!(net.len(), 2);
        assert!(net.contains_segment(a));
        assert!(net.contains_segment(b));

        // Attachment is mutual.
        let ta = tube_state(&grid, a).unwrap();
        let tb = tube_state(&grid, b).unwrap();
        assert_eq!(ta.connection(Direction::East), ConnectionPoint::Tube(b));
        assert_eq!(tb.connection(Direction::West), ConnectionPoint::Tube(a));
    }

    #[test]
    fn removing_end_segment_shrinks_network() {
        let mut grid = TileGrid::new();
        let mut nets = NetworkSet::new();
        let mut events = EventBus::default();

        let (_, _) = place_tube(&mut grid, &mut nets, &mut events, TilePos::new(0, 0));
        let (b, net) = place_tube(&mut grid, &mut nets, &mut events, TilePos::new(1, 0));

        remove_tube(&mut grid, &mut nets, &mut events, TilePos::new(0, 0));

        assert_eq!(nets.network_count(), 1);
        let net = nets.network(net).unwrap();
        assert_eq!(net.len(), 1);
        assert!(net.contains_segment(b));
        // The survivor's facing connection point reopened.
        assert_eq!(
            tube_state(&grid, b).unwrap().connection(Direction::West),
            ConnectionPoint::Open
        );
    }

    #[test]
    fn removing_last_segment_removes_network() {
        let mut grid = TileGrid::new();
        let mut nets = NetworkSet::new();
        let mut events = EventBus::default();

        place_tube(&mut grid, &mut nets, &mut events, TilePos::new(0, 0));
        remove_tube(&mut grid, &mut nets, &mut events, TilePos::new(0, 0));
        assert_eq!(nets.network_count(), 0);
    }

    #[test]
    fn bridging_segment_merges_two_networks() {
        let mut grid = TileGrid::new();
        let mut nets = NetworkSet::new();
        let mut events = EventBus::default();

        // Two separate lines with a gap at (2, 0).
        place_tube(&mut grid, &mut nets, &mut events, TilePos::new(0, 0));
        place_tube(&mut grid, &mut nets, &mut events, TilePos::new(1, 0));
        place_tube(&mut grid, &mut nets, &mut events, TilePos::new(3, 0));
        place_tube(&mut grid, &mut nets, &mut events, TilePos::new(4, 0));
        place_tube(&mut grid, &mut nets, &mut events, TilePos::new(5, 0));
        assert_eq!(nets.network_count(), 2);

        let (_, merged) = place_tube(&mut grid, &mut nets, &mut events, TilePos::new(2, 0));
        assert_eq!(nets.network_count(), 1);
        let net = nets.network(merged).unwrap();
        assert_eq!(net.len(), 6);

        // All members agree on their network id.
        for &seg in &net.segments {
            assert_eq!(tube_state(&grid, seg).unwrap().network, merged);
        }

        let delivered = events.deliver();
        assert!(delivered
            .iter()
            .any(|e| matches!(e, Event::NetworksMerged { .. })));
    }

    #[test]
    fn merge_keeps_larger_network_identity() {
        let mut grid = TileGrid::new();
        let mut nets = NetworkSet::new();
        let mut events = EventBus::default();

        // Large line (3 segments) and small line (1 segment).
        place_tube(&mut grid, &mut nets, &mut events, TilePos::new(0, 0));
        place_tube(&mut grid, &mut nets, &mut events, TilePos::new(1, 0));
        let (_, large) = place_tube(&mut grid, &mut nets, &mut events, TilePos::new(2, 0));
        let (_, small) = place_tube(&mut grid, &mut nets, &mut events, TilePos::new(4, 0));
        assert_ne!(large, small);

        let (_, merged) = place_tube(&mut grid, &mut nets, &mut events, TilePos::new(3, 0));
        assert_eq!(merged, large, "larger network's identity survives");
        assert!(nets.network(small).is_none());
    }

    #[test]
    fn removing_middle_segment_splits_network() {
        let mut grid = TileGrid::new();
        let mut nets = NetworkSet::new();
        let mut events = EventBus::default();

        for x in 0..5 {
            place_tube(&mut grid, &mut nets, &mut events, TilePos::new(x, 0));
        }
        assert_eq!(nets.network_count(), 1);

        remove_tube(&mut grid, &mut nets, &mut events, TilePos::new(2, 0));
        assert_eq!(nets.network_count(), 2);

        let sizes: Vec<usize> = nets.networks.values().map(|n| n.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 4);
        assert!(sizes.contains(&2));

        let delivered = events.deliver();
        let split = delivered
            .iter()
            .find(|e| matches!(e, Event::NetworkSplit { .. }));
        match split {
            Some(Event::NetworkSplit { into, .. }) => assert_eq!(into.len(), 2),
            other => panic!("expected split event, got {other:?}"),
        }
    }

    #[test]
    fn every_segment_in_exactly_one_network_after_edits() {
        let mut grid = TileGrid::new();
        let mut nets = NetworkSet::new();
        let mut events = EventBus::default();

        // A cross shape, then remove the center.
        place_tube(&mut grid, &mut nets, &mut events, TilePos::new(1, 1));
        place_tube(&mut grid, &mut nets, &mut events, TilePos::new(1, 0));
        place_tube(&mut grid, &mut nets, &mut events, TilePos::new(1, 2));
        place_tube(&mut grid, &mut nets, &mut events, TilePos::new(0, 1));
        place_tube(&mut grid, &mut nets, &mut events, TilePos::new(2, 1));
        assert_eq!(nets.network_count(), 1);

        remove_tube(&mut grid, &mut nets, &mut events, TilePos::new(1, 1));
        assert_eq!(nets.network_count(), 4);

        // Membership and tube state agree everywhere.
        let mut seen: BTreeSet<BlockId> = BTreeSet::new();
        for (nid, net) in &nets.networks {
            for &seg in &net.segments {
                assert!(seen.insert(seg), "segment appears in two networks");
                assert_eq!(tube_state(&grid, seg).unwrap().network, nid);
            }
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn producer_and_consumer_attach_as_endpoints() {
        let mut grid = TileGrid::new();
        let mut nets = NetworkSet::new();
        let mut events = EventBus::default();

        let (seg, net) = place_tube(&mut grid, &mut nets, &mut events, TilePos::new(1, 0));

        // Producer west of the segment, port facing east.
        let producer = grid
            .place_block(BlockData {
                block_type: BlockTypeId(1),
                origin: TilePos::new(0, 0),
                footprint: Footprint::single(),
                behavior: Behavior::Producer(ProducerState {
                    resource: ResourceTypeId(0),
                    quantity: 1,
                    interval: 1,
                    progress: 0,
                    output: ResourceBuffer::new(10),
                    port: Direction::East,
                    require_ore: false,
                }),
            })
            .unwrap();
        nets.endpoint_placed(&mut grid, producer);

        // Consumer east of the segment, port facing west.
        let consumer = grid
            .place_block(BlockData {
                block_type: BlockTypeId(2),
                origin: TilePos::new(2, 0),
                footprint: Footprint::single(),
                behavior: Behavior::Consumer(ConsumerState {
                    accepts: None,
                    buffer: ResourceBuffer::new(10),
                    port: Direction::West,
                    consume_rate: 0,
                    total_consumed: 0,
                }),
            })
            .unwrap();
        nets.endpoint_placed(&mut grid, consumer);

        let network = nets.network(net).unwrap();
        assert_eq!(network.endpoints.len(), 2);
        assert!(network.endpoints.iter().any(|e| e.block == producer));
        assert!(network.endpoints.iter().any(|e| e.block == consumer));

        // The segment's connection points record both attachments.
        let t = tube_state(&grid, seg).unwrap();
        assert_eq!(
            t.connection(Direction::West),
            ConnectionPoint::Endpoint(producer)
        );
        assert_eq!(
            t.connection(Direction::East),
            ConnectionPoint::Endpoint(consumer)
        );
    }

    #[test]
    fn endpoint_removal_reopens_connection_point() {
        let mut grid = TileGrid::new();
        let mut nets = NetworkSet::new();
        let mut events = EventBus::default();

        let (seg, net) = place_tube(&mut grid, &mut nets, &mut events, TilePos::new(1, 0));
        let consumer = grid
            .place_block(BlockData {
                block_type: BlockTypeId(2),
                origin: TilePos::new(2, 0),
                footprint: Footprint::single(),
                behavior: Behavior::Consumer(ConsumerState {
                    accepts: None,
                    buffer: ResourceBuffer::new(10),
                    port: Direction::West,
                    consume_rate: 0,
                    total_consumed: 0,
                }),
            })
            .unwrap();
        nets.endpoint_placed(&mut grid, consumer);
        assert_eq!(nets.network(net).unwrap().endpoints.len(), 1);

        let (id, data) = grid.remove_block_at(TilePos::new(2, 0)).unwrap();
        nets.endpoint_removed(&mut grid, id, data.origin, &data.ports());

        assert!(nets.network(net).unwrap().endpoints.is_empty());
        assert_eq!(
            tube_state(&grid, seg).unwrap().connection(Direction::East),
            ConnectionPoint::Open
        );
    }

    #[test]
    fn closed_connection_points_never_attach() {
        let mut grid = TileGrid::new();
        let mut nets = NetworkSet::new();
        let mut events = EventBus::default();

        // Segment at (0,0) with a sealed east end.
        let mut sealed = tube_block(TilePos::new(0, 0));
        if let Behavior::Tube(t) = &mut sealed.behavior {
            t.set_connection(Direction::East, ConnectionPoint::Closed);
        }
        let a = grid.place_block(sealed).unwrap();
        let net_a = nets.segment_placed(&mut grid, a, 0, &mut events);

        let (b, net_b) = place_tube(&mut grid, &mut nets, &mut events, TilePos::new(1, 0));

        assert_ne!(net_a, net_b, "sealed ends must not connect");
        assert_eq!(nets.network_count(), 2);
        assert_eq!(
            tube_state(&grid, b).unwrap().connection(Direction::West),
            ConnectionPoint::Open
        );
    }
}
