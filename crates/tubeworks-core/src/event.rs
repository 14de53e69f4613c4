//! Typed simulation events with ring-buffered delivery.
//!
//! Events are emitted during the edit, block, transport, and entity phases
//! and delivered in a batch after the entity phase. Subscribers never run
//! mid-phase, so a handler can never observe (or cause) a half-applied
//! mutation. Passive listeners are read-only; reactive handlers return
//! commands that join the queue for the next tick's edit phase.

use crate::command_queue::Command;
use crate::fixed::Ticks;
use crate::geom::ChunkPos;
use crate::id::{BlockId, BlockTypeId, EditId, EntityId, NetworkId, PacketId, RecipeId, ResourceTypeId};

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A simulation event. Every event carries the tick at which it occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // -- Structural edits --
    BlockPlaced {
        block: BlockId,
        block_type: BlockTypeId,
        tick: Ticks,
    },
    BlockRemoved {
        block: BlockId,
        block_type: BlockTypeId,
        tick: Ticks,
    },
    EditRejected {
        edit: EditId,
        reason: String,
        tick: Ticks,
    },

    // -- Production --
    ResourceProduced {
        block: BlockId,
        resource: ResourceTypeId,
        quantity: u32,
        tick: Ticks,
    },
    ResourceConsumed {
        block: BlockId,
        resource: ResourceTypeId,
        quantity: u32,
        tick: Ticks,
    },
    CraftStarted {
        block: BlockId,
        recipe: RecipeId,
        tick: Ticks,
    },
    CraftCompleted {
        block: BlockId,
        recipe: RecipeId,
        tick: Ticks,
    },

    // -- Transport --
    PacketDispatched {
        packet: PacketId,
        network: NetworkId,
        resource: ResourceTypeId,
        quantity: u32,
        tick: Ticks,
    },
    PacketDelivered {
        dest: BlockId,
        resource: ResourceTypeId,
        quantity: u32,
        tick: Ticks,
    },
    LostShipment {
        network: NetworkId,
        resource: ResourceTypeId,
        quantity: u32,
        tick: Ticks,
    },

    // -- Network topology --
    NetworksMerged {
        kept: NetworkId,
        absorbed: NetworkId,
        tick: Ticks,
    },
    NetworkSplit {
        from: NetworkId,
        into: Vec<NetworkId>,
        tick: Ticks,
    },

    // -- Entities --
    EntitySpawned {
        entity: EntityId,
        tick: Ticks,
    },
    EntityDespawned {
        entity: EntityId,
        tick: Ticks,
    },
    EntityHit {
        entity: EntityId,
        volume: u64,
        tick: Ticks,
    },
    EntityDied {
        entity: EntityId,
        tick: Ticks,
    },

    // -- World --
    ChunkUnloaded {
        chunk: ChunkPos,
        tick: Ticks,
    },
}

/// Discriminant tag for event types, used for suppression and subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BlockPlaced,
    BlockRemoved,
    EditRejected,
    ResourceProduced,
    ResourceConsumed,
    CraftStarted,
    CraftCompleted,
    PacketDispatched,
    PacketDelivered,
    LostShipment,
    NetworksMerged,
    NetworkSplit,
    EntitySpawned,
    EntityDespawned,
    EntityHit,
    EntityDied,
    ChunkUnloaded,
}

/// Total number of event kinds.
const EVENT_KIND_COUNT: usize = 17;

impl Event {
    /// The discriminant kind for this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::BlockPlaced { .. } => EventKind::BlockPlaced,
            Event::BlockRemoved { .. } => EventKind::BlockRemoved,
            Event::EditRejected { .. } => EventKind::EditRejected,
            Event::ResourceProduced { .. } => EventKind::ResourceProduced,
            Event::ResourceConsumed { .. } => EventKind::ResourceConsumed,
            Event::CraftStarted { .. } => EventKind::CraftStarted,
            Event::CraftCompleted { .. } => EventKind::CraftCompleted,
            Event::PacketDispatched { .. } => EventKind::PacketDispatched,
            Event::PacketDelivered { .. } => EventKind::PacketDelivered,
            Event::LostShipment { .. } => EventKind::LostShipment,
            Event::NetworksMerged { .. } => EventKind::NetworksMerged,
            Event::NetworkSplit { .. } => EventKind::NetworkSplit,
            Event::EntitySpawned { .. } => EventKind::EntitySpawned,
            Event::EntityDespawned { .. } => EventKind::EntityDespawned,
            Event::EntityHit { .. } => EventKind::EntityHit,
            Event::EntityDied { .. } => EventKind::EntityDied,
            Event::ChunkUnloaded { .. } => EventKind::ChunkUnloaded,
        }
    }
}

impl EventKind {
    fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// EventBuffer -- pre-allocated ring buffer
// ---------------------------------------------------------------------------

/// A fixed-capacity ring buffer. When full, the oldest events are dropped
/// and counted.
#[derive(Debug)]
pub struct EventBuffer {
    events: Vec<Option<Event>>,
    head: usize,
    len: usize,
    total_written: u64,
}

impl EventBuffer {
    /// Create a ring buffer. A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            total_written: 0,
        }
    }

    pub fn push(&mut self, event: Event) {
        self.events[self.head] = Some(event);
        self.head = (self.head + 1) % self.capacity();
        if self.len < self.capacity() {
            self.len += 1;
        }
        self.total_written += 1;
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Events dropped because the buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.total_written.saturating_sub(self.capacity() as u64)
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        let start = if self.len < self.capacity() { 0 } else { self.head };
        (0..self.len).filter_map(move |i| {
            self.events[(start + i) % self.capacity()].as_ref()
        })
    }

    pub fn clear(&mut self) {
        for slot in &mut self.events {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// A passive listener receives events read-only.
pub type PassiveListener = Box<dyn FnMut(&Event)>;

/// A reactive handler receives an event and returns commands to enqueue for
/// the next tick's edit phase.
pub type ReactiveHandler = Box<dyn FnMut(&Event) -> Vec<Command>>;

enum Subscriber {
    Passive(PassiveListener),
    Reactive(ReactiveHandler),
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subscriber::Passive(_) => write!(f, "Passive(<fn>)"),
            Subscriber::Reactive(_) => write!(f, "Reactive(<fn>)"),
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// One ring buffer per event kind, subscriber lists, suppression flags.
pub struct EventBus {
    buffers: [Option<EventBuffer>; EVENT_KIND_COUNT],
    suppressed: [bool; EVENT_KIND_COUNT],
    subscribers: Vec<(EventKind, Subscriber)>,
    /// Commands collected from reactive handlers, drained by the level after
    /// delivery and applied during the next edit phase.
    pending_commands: Vec<Command>,
    default_capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("suppressed", &self.suppressed)
            .field("subscribers", &self.subscribers.len())
            .field("pending_commands", &self.pending_commands.len())
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Create a bus with the given per-kind buffer capacity.
    pub fn new(default_capacity: usize) -> Self {
        Self {
            buffers: Default::default(),
            suppressed: [false; EVENT_KIND_COUNT],
            subscribers: Vec::new(),
            pending_commands: Vec::new(),
            default_capacity,
        }
    }

    /// Suppress an event kind. Suppressed events are never buffered; the
    /// kind's buffer is dropped so suppression has zero ongoing cost.
    pub fn suppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = true;
        self.buffers[kind.index()] = None;
    }

    pub fn is_suppressed(&self, kind: EventKind) -> bool {
        self.suppressed[kind.index()]
    }

    /// Buffer an event for delivery at the end of the tick.
    pub fn emit(&mut self, event: Event) {
        let idx = event.kind().index();
        if self.suppressed[idx] {
            return;
        }
        self.buffers[idx]
            .get_or_insert_with(|| EventBuffer::new(self.default_capacity))
            .push(event);
    }

    /// Register a passive listener. Listeners run in registration order.
    pub fn on_passive(&mut self, kind: EventKind, listener: PassiveListener) {
        self.subscribers.push((kind, Subscriber::Passive(listener)));
    }

    /// Register a reactive handler. Returned commands apply next tick.
    pub fn on_reactive(&mut self, kind: EventKind, handler: ReactiveHandler) {
        self.subscribers.push((kind, Subscriber::Reactive(handler)));
    }

    /// Number of events currently buffered for a kind.
    pub fn buffered_count(&self, kind: EventKind) -> usize {
        self.buffers[kind.index()]
            .as_ref()
            .map(|b| b.len())
            .unwrap_or(0)
    }

    /// Deliver all buffered events to subscribers and drain the buffers.
    /// Returns the delivered events in kind-index order, oldest first within
    /// a kind, so callers can inspect what the tick produced.
    pub fn deliver(&mut self) -> Vec<Event> {
        let mut delivered = Vec::new();
        for idx in 0..EVENT_KIND_COUNT {
            let Some(buffer) = self.buffers[idx].as_mut() else {
                continue;
            };
            let events: Vec<Event> = buffer.iter().cloned().collect();
            buffer.clear();
            for event in events {
                let kind = event.kind();
                for (sub_kind, subscriber) in &mut self.subscribers {
                    if *sub_kind != kind {
                        continue;
                    }
                    match subscriber {
                        Subscriber::Passive(listener) => listener(&event),
                        Subscriber::Reactive(handler) => {
                            self.pending_commands.extend(handler(&event));
                        }
                    }
                }
                delivered.push(event);
            }
        }
        delivered
    }

    /// Take the commands produced by reactive handlers since the last drain.
    pub fn drain_pending_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.pending_commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn hit_event(volume: u64) -> Event {
        Event::EntityHit {
            entity: EntityId::default(),
            volume,
            tick: 1,
        }
    }

    #[test]
    fn ring_buffer_drops_oldest_when_full() {
        let mut buf = EventBuffer::new(2);
        buf.push(hit_event(1));
        buf.push(hit_event(2));
        buf.push(hit_event(3));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.dropped_count(), 1);
        let volumes: Vec<u64> = buf
            .iter()
            .map(|e| match e {
                Event::EntityHit { volume, .. } => *volume,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(volumes, vec![2, 3]);
    }

    #[test]
    fn emit_and_deliver_to_passive_listener() {
        let mut bus = EventBus::new(16);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        bus.on_passive(
            EventKind::EntityHit,
            Box::new(move |e| {
                if let Event::EntityHit { volume, .. } = e {
                    seen2.borrow_mut().push(*volume);
                }
            }),
        );
        bus.emit(hit_event(7));
        bus.emit(hit_event(8));
        let delivered = bus.deliver();
        assert_eq!(delivered.len(), 2);
        assert_eq!(*seen.borrow(), vec![7, 8]);
    }

    #[test]
    fn suppressed_kind_never_buffers() {
        let mut bus = EventBus::new(16);
        bus.suppress(EventKind::EntityHit);
        bus.emit(hit_event(1));
        assert_eq!(bus.buffered_count(EventKind::EntityHit), 0);
        assert!(bus.deliver().is_empty());
    }

    #[test]
    fn reactive_handler_commands_are_collected() {
        let mut bus = EventBus::new(16);
        bus.on_reactive(
            EventKind::EntityDied,
            Box::new(|e| {
                if let Event::EntityDied { entity, .. } = e {
                    vec![Command::DespawnEntity { entity: *entity }]
                } else {
                    Vec::new()
                }
            }),
        );
        bus.emit(Event::EntityDied {
            entity: EntityId::default(),
            tick: 3,
        });
        let _ = bus.deliver();
        let commands = bus.drain_pending_commands();
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], Command::DespawnEntity { .. }));
    }

    #[test]
    fn deliver_drains_buffers() {
        let mut bus = EventBus::new(16);
        bus.emit(hit_event(1));
        assert_eq!(bus.deliver().len(), 1);
        assert!(bus.deliver().is_empty(), "events must not deliver twice");
    }

    #[test]
    fn listener_only_sees_its_kind() {
        let mut bus = EventBus::new(16);
        let count = Rc::new(RefCell::new(0usize));
        let count2 = count.clone();
        bus.on_passive(
            EventKind::EntityDied,
            Box::new(move |_| {
                *count2.borrow_mut() += 1;
            }),
        );
        bus.emit(hit_event(1));
        bus.emit(Event::EntityDied {
            entity: EntityId::default(),
            tick: 0,
        });
        let _ = bus.deliver();
        assert_eq!(*count.borrow(), 1);
    }
}
