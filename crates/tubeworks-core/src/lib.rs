//! Tubeworks Core -- the level simulation and resource-transport engine
//! for tile-based factory games.
//!
//! This crate provides the chunked tile grid, the tube connectivity graph,
//! discrete packet transport with backpressure, entity motion, events,
//! snapshots, and the deterministic fixed-point arithmetic everything is
//! built on.
//!
//! # Per-Tick Phase Pipeline
//!
//! Each call to [`level::Level::step`] advances the simulation by one tick
//! through a fixed phase order:
//!
//! 1. **Edits** -- apply queued structural edits (placements, removals,
//!    entity commands), maintaining network membership.
//! 2. **Blocks** -- every updatable block runs its per-tick contract.
//! 3. **Transport** -- networks advance their packets under capacity and
//!    round-robin fairness.
//! 4. **Entities** -- motion integration and collision resolution.
//! 5. **Events** -- buffered events deliver to subscribers.
//! 6. **Bookkeeping** -- tick counter and state hash.
//!
//! Structural edits never interleave with the transport advance: a packet
//! is never evaluated against a topology that changed under it mid-tick.
//!
//! # Command Pattern
//!
//! All external mutation goes through queued commands, applied at the next
//! tick boundary:
//!
//! ```rust,ignore
//! let edit = level.submit(Command::PlaceBlock { template, origin });
//! let result = level.step();
//! assert!(result.edits.iter().any(|o| o.edit() == edit && o.is_applied()));
//! ```
//!
//! # Key Types
//!
//! - [`level::Level`] -- simulation context and phase orchestrator.
//! - [`grid::TileGrid`] -- chunked tile storage owning every placed block.
//! - [`network::NetworkSet`] -- tube networks with incremental merge/split.
//! - [`transport::Packet`] -- discrete resource shipment in transit.
//! - [`registry::Registry`] -- frozen resource/recipe/block definitions;
//!   mod-supplied variants register through the same builder.
//! - [`event::EventBus`] -- ring-buffered events delivered post-tick.
//! - [`serialize`] -- versioned bitcode snapshots, restorable bit-for-bit.
//! - [`fixed::Fixed64`] -- Q32.32 fixed-point for deterministic math.

pub mod block;
pub mod command_queue;
#[cfg(feature = "data-loader")]
pub mod data_loader;
pub mod entity;
pub mod event;
pub mod fixed;
pub mod geom;
pub mod grid;
pub mod id;
pub mod level;
pub mod network;
pub mod query;
pub mod registry;
pub mod resource;
pub mod serialize;
pub mod sim;
pub mod transport;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
