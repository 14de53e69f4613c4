//! Resource stacks and capacity-bounded buffers.
//!
//! Buffers are the only place resources rest outside a packet: producer
//! output staging, consumer intake, storage contents, converter input and
//! output. Every transfer into a buffer goes through [`ResourceBuffer::add`],
//! whose overflow return is what the transport acceptance protocol checks
//! before committing a delivery.

use crate::id::ResourceTypeId;
use serde::{Deserialize, Serialize};

/// A quantity of a single resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStack {
    pub resource: ResourceTypeId,
    pub quantity: u32,
}

impl ResourceStack {
    pub fn new(resource: ResourceTypeId, quantity: u32) -> Self {
        Self { resource, quantity }
    }
}

/// A capacity-bounded buffer of resource stacks. Capacity counts total units
/// across all types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBuffer {
    stacks: Vec<ResourceStack>,
    capacity: u32,
}

impl ResourceBuffer {
    pub fn new(capacity: u32) -> Self {
        Self {
            stacks: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Add units of a resource. Returns the amount that did not fit.
    #[must_use = "overflow indicates units that did not fit"]
    pub fn add(&mut self, resource: ResourceTypeId, quantity: u32) -> u32 {
        let space = self.capacity.saturating_sub(self.total());
        let accepted = quantity.min(space);
        if accepted > 0 {
            if let Some(stack) = self.stacks.iter_mut().find(|s| s.resource == resource) {
                stack.quantity += accepted;
            } else {
                self.stacks.push(ResourceStack::new(resource, accepted));
            }
        }
        quantity - accepted
    }

    /// Remove units of a resource. Returns the amount actually removed.
    #[must_use = "may remove fewer units than requested"]
    pub fn remove(&mut self, resource: ResourceTypeId, quantity: u32) -> u32 {
        if let Some(stack) = self.stacks.iter_mut().find(|s| s.resource == resource) {
            let removed = quantity.min(stack.quantity);
            stack.quantity -= removed;
            if stack.quantity == 0 {
                self.stacks.retain(|s| s.quantity > 0);
            }
            removed
        } else {
            0
        }
    }

    /// Units of a specific resource currently held.
    pub fn quantity(&self, resource: ResourceTypeId) -> u32 {
        self.stacks
            .iter()
            .find(|s| s.resource == resource)
            .map(|s| s.quantity)
            .unwrap_or(0)
    }

    /// Total units across all resource types.
    pub fn total(&self) -> u32 {
        self.stacks.iter().map(|s| s.quantity).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Whether the buffer can take `quantity` more units right now.
    pub fn has_space_for(&self, quantity: u32) -> bool {
        self.total() + quantity <= self.capacity
    }

    /// All held stacks, in insertion order.
    pub fn stacks(&self) -> &[ResourceStack] {
        &self.stacks
    }
}
