//! Invariant auditing and self-healing.
//!
//! [`audit`] sweeps the cross-referenced structures (tile occupancy versus
//! block footprints, connection-point mutuality, network membership, lane
//! capacity) and reports every violation it finds. [`enforce`] is the
//! production entry point: in debug builds a violation halts the tick for
//! diagnosis; in release builds it is logged and the affected connection is
//! forced back into sync so the simulation keeps running.

use crate::block::ConnectionPoint;
use crate::geom::Direction;
use crate::id::{BlockId, NetworkId, PacketId};
use crate::level::Level;
use crate::network::{tube_state, tube_state_mut};
use std::collections::BTreeMap;

/// A detected cross-reference inconsistency.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("tile {tile:?} occupancy does not match block {block:?} footprint")]
    OccupancyMismatch {
        block: BlockId,
        tile: crate::geom::TilePos,
    },
    #[error("segment {segment:?} attachment toward {dir:?} is not mutual")]
    AsymmetricAttachment {
        segment: BlockId,
        dir: Direction,
    },
    #[error("segment {segment:?} claims network {claimed:?} but membership disagrees")]
    MembershipMismatch {
        segment: BlockId,
        claimed: NetworkId,
    },
    #[error("network {network:?} contains disconnected segments")]
    DisconnectedNetwork { network: NetworkId },
    #[error("segment {segment:?} lane holds {occupancy} packets over capacity {capacity}")]
    LaneOverCapacity {
        segment: BlockId,
        occupancy: u32,
        capacity: u32,
    },
    #[error("packet {packet:?} rides a segment outside its network")]
    DanglingPacket { packet: PacketId },
}

/// Sweep the level for invariant violations. Read-only.
pub fn audit(level: &Level) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    // Tile <-> block symmetry.
    for id in level.grid.block_ids() {
        let Some(block) = level.grid.block(id) else {
            continue;
        };
        for tile in block.tiles() {
            if level.grid.block_at(tile) != Some(id) {
                violations.push(InvariantViolation::OccupancyMismatch { block: id, tile });
            }
        }
    }
    for chunk in level.grid.chunks() {
        let origin = chunk.pos.origin_tile();
        for (idx, occupant) in chunk.occupants().iter().enumerate() {
            let Some(id) = occupant else {
                continue;
            };
            let tile = crate::geom::TilePos::new(
                origin.x + (idx as i32 % crate::geom::CHUNK_SIZE_TILES),
                origin.y + (idx as i32 / crate::geom::CHUNK_SIZE_TILES),
            );
            let ok = level.grid.block(*id).is_some_and(|b| b.occupies(tile));
            if !ok {
                violations.push(InvariantViolation::OccupancyMismatch { block: *id, tile });
            }
        }
    }

    // Connection-point mutuality.
    for id in level.grid.block_ids() {
        let Some(t) = tube_state(&level.grid, id) else {
            continue;
        };
        for dir in Direction::ALL {
            match t.connection(dir) {
                ConnectionPoint::Tube(neighbor) => {
                    let mutual = tube_state(&level.grid, neighbor)
                        .is_some_and(|nt| nt.connection(dir.opposite()) == ConnectionPoint::Tube(id));
                    if !mutual {
                        violations.push(InvariantViolation::AsymmetricAttachment {
                            segment: id,
                            dir,
                        });
                    }
                }
                ConnectionPoint::Endpoint(endpoint) => {
                    let mutual = level.grid.block(endpoint).is_some_and(|b| {
                        b.ports().iter().any(|(pdir, _)| *pdir == dir.opposite())
                            && b.origin
                                == level
                                    .grid
                                    .block(id)
                                    .map(|seg| seg.origin.step(dir))
                                    .unwrap_or(b.origin)
                    });
                    if !mutual {
                        violations.push(InvariantViolation::AsymmetricAttachment {
                            segment: id,
                            dir,
                        });
                    }
                }
                ConnectionPoint::Open | ConnectionPoint::Closed => {}
            }
        }
    }

    // Membership: every segment in exactly one network, agreeing with its
    // own tube state.
    let mut membership: BTreeMap<BlockId, Vec<NetworkId>> = BTreeMap::new();
    for (net_id, net) in &level.nets.networks {
        for &seg in &net.segments {
            membership.entry(seg).or_default().push(net_id);
        }
    }
    for id in level.grid.block_ids() {
        let Some(t) = tube_state(&level.grid, id) else {
            continue;
        };
        let listed = membership.get(&id).map(Vec::as_slice).unwrap_or(&[]);
        if listed != [t.network] {
            violations.push(InvariantViolation::MembershipMismatch {
                segment: id,
                claimed: t.network,
            });
        }
    }

    // Connectivity: no network may contain a disconnected pair.
    for (net_id, net) in &level.nets.networks {
        if net.segments.is_empty() {
            continue;
        }
        let mut reached = std::collections::BTreeSet::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(net.segments[0]);
        reached.insert(net.segments[0]);
        while let Some(current) = queue.pop_front() {
            if let Some(t) = tube_state(&level.grid, current) {
                for (_, n) in t.tube_neighbors() {
                    if net.segments.contains(&n) && reached.insert(n) {
                        queue.push_back(n);
                    }
                }
            }
        }
        if reached.len() != net.segments.len() {
            violations.push(InvariantViolation::DisconnectedNetwork { network: net_id });
        }
    }

    // Lane capacity and packet residency.
    let mut occupancy: BTreeMap<BlockId, u32> = BTreeMap::new();
    for (pid, packet) in &level.nets.packets {
        *occupancy.entry(packet.segment).or_insert(0) += 1;
        let in_some_network = level
            .nets
            .networks
            .iter()
            .any(|(_, net)| net.packets.contains(&pid) && net.segments.contains(&packet.segment));
        if !in_some_network {
            violations.push(InvariantViolation::DanglingPacket { packet: pid });
        }
    }
    for (segment, count) in occupancy {
        if let Some(t) = tube_state(&level.grid, segment) {
            if count > t.lane_capacity {
                violations.push(InvariantViolation::LaneOverCapacity {
                    segment,
                    occupancy: count,
                    capacity: t.lane_capacity,
                });
            }
        }
    }

    violations
}

/// Audit and react per build profile: halt in debug, heal in release.
/// Returns the violations found (already healed where possible).
pub fn enforce(level: &mut Level) -> Vec<InvariantViolation> {
    let violations = audit(level);
    if violations.is_empty() {
        return violations;
    }

    if cfg!(debug_assertions) {
        panic!("invariant violations detected: {violations:?}");
    }

    for violation in &violations {
        tracing::warn!(%violation, "invariant violation; forcing re-sync");
        if let InvariantViolation::AsymmetricAttachment { segment, dir } = violation {
            heal_attachment(level, *segment, *dir);
        }
    }
    violations
}

/// Recompute one connection point from geometry: mutually attach when both
/// sides exist and are openable, otherwise fall back to `Open`.
fn heal_attachment(level: &mut Level, segment: BlockId, dir: Direction) {
    let Some(origin) = level.grid.block(segment).map(|b| b.origin) else {
        return;
    };
    let neighbor = level.grid.block_at(origin.step(dir));
    let resolved = match neighbor {
        Some(nid) => match tube_state(&level.grid, nid) {
            Some(nt) if nt.connection(dir.opposite()) != ConnectionPoint::Closed => {
                Some(ConnectionPoint::Tube(nid))
            }
            _ => None,
        },
        None => None,
    };
    let resolved = resolved.unwrap_or(ConnectionPoint::Open);

    if let ConnectionPoint::Tube(nid) = resolved {
        if let Some(nt) = tube_state_mut(&mut level.grid, nid) {
            nt.set_connection(dir.opposite(), ConnectionPoint::Tube(segment));
        }
    }
    if let Some(t) = tube_state_mut(&mut level.grid, segment) {
        t.set_connection(dir, resolved);
    }
}
