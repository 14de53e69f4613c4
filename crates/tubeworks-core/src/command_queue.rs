//! Queued structural edits and entity commands.
//!
//! Player, mod, and collaborator actions never touch the level directly:
//! they submit [`Command`]s, which the tick loop drains and applies in
//! submission order at the start of the next tick. A command invalidated by
//! the time it applies (for example two placements racing for one tile) is
//! rejected and reported, never silently dropped.

use crate::entity::EntitySpawn;
use crate::fixed::Ticks;
use crate::geom::{TilePos, Vec2Fix};
use crate::grid::Ground;
use crate::id::{BlockId, BlockTypeId, EditId, EntityId, RecipeId};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A single queued operation against the level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Place a block from a registry template.
    PlaceBlock {
        template: BlockTypeId,
        origin: TilePos,
    },
    /// Remove whatever block covers a tile.
    RemoveBlock { pos: TilePos },
    /// Select or clear a converter's recipe.
    SetRecipe {
        pos: TilePos,
        recipe: Option<RecipeId>,
    },
    /// Rewrite the ground layer of a tile.
    SetGround { pos: TilePos, ground: Ground },
    /// Spawn an entity.
    SpawnEntity { spawn: EntitySpawn },
    /// Remove an entity (despawn, or the weapon collaborator reporting a
    /// death as a removal request).
    DespawnEntity { entity: EntityId },
    /// Set an entity's velocity.
    SetEntityVelocity { entity: EntityId, velocity: Vec2Fix },
    /// Apply damage decided by the weapon collaborator.
    ApplyDamage { entity: EntityId, amount: u32 },
}

/// The reported result of one applied command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Applied {
        edit: EditId,
        /// Set when the command created a block.
        block: Option<BlockId>,
        /// Set when the command created an entity.
        entity: Option<EntityId>,
    },
    Rejected {
        edit: EditId,
        reason: String,
    },
}

impl EditOutcome {
    pub fn edit(&self) -> EditId {
        match self {
            EditOutcome::Applied { edit, .. } | EditOutcome::Rejected { edit, .. } => *edit,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, EditOutcome::Applied { .. })
    }
}

// ---------------------------------------------------------------------------
// CommandQueue
// ---------------------------------------------------------------------------

/// Commands waiting for the next tick's edit phase, with optional history.
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: Vec<(EditId, Command)>,
    history: Vec<(Ticks, EditId, Command)>,
    max_history: usize,
    next_edit: u64,
}

impl CommandQueue {
    /// A queue with no history tracking.
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue that retains up to `max_history` applied entries.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            max_history,
            ..Self::default()
        }
    }

    /// Queue a command. The returned [`EditId`] correlates with the outcome
    /// reported when the command applies.
    pub fn push(&mut self, command: Command) -> EditId {
        let edit = EditId(self.next_edit);
        self.next_edit += 1;
        self.pending.push((edit, command));
        edit
    }

    /// Queue several commands. Returns their ids in order.
    pub fn push_batch(&mut self, commands: impl IntoIterator<Item = Command>) -> Vec<EditId> {
        commands.into_iter().map(|c| self.push(c)).collect()
    }

    /// Cancel a pending command before it applies. Returns true if it was
    /// still pending.
    pub fn cancel(&mut self, edit: EditId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|(e, _)| *e != edit);
        self.pending.len() != before
    }

    /// Drain all pending commands in submission order, recording them in
    /// history against the given tick.
    pub fn drain(&mut self, tick: Ticks) -> Vec<(EditId, Command)> {
        let commands: Vec<(EditId, Command)> = self.pending.drain(..).collect();
        if self.max_history > 0 {
            for (edit, cmd) in &commands {
                self.history.push((tick, *edit, cmd.clone()));
            }
            let excess = self.history.len().saturating_sub(self.max_history);
            if excess > 0 {
                self.history.drain(..excess);
            }
        }
        commands
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn history(&self) -> &[(Ticks, EditId, Command)] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}
