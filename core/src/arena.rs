//! Append-only node arena with checkpoint support.
//!
//! Graph nodes are never mutated or removed once pushed. Growing the network
//! pushes new records and relinks by index; superseded records simply stop
//! being reachable. A `NodeId` therefore stays valid for the whole run.
//!
//! Checkpoints let a builder push a batch of nodes, validate them, and roll
//! the arena back if validation fails before anything points at them.

use crate::error::{GrowError, GrowResult};

/// Stable index of a record in an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl NodeId {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Bump arena over a growable vector.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Append a record and return its id.
    pub fn push(&mut self, item: T) -> NodeId {
        self.items.push(item);
        NodeId(self.items.len() - 1)
    }

    pub fn get(&self, id: NodeId) -> GrowResult<&T> {
        self.items.get(id.0).ok_or(GrowError::UnknownNode(id.0))
    }

    /// Save a checkpoint of the current allocation offset.
    #[inline(always)]
    pub fn save_checkpoint(&self) -> usize {
        self.items.len()
    }

    /// Drop every record pushed after `checkpoint`.
    #[inline(always)]
    pub fn restore_checkpoint(&mut self, checkpoint: usize) {
        if checkpoint <= self.items.len() {
            self.items.truncate(checkpoint);
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &T)> {
        self.items.iter().enumerate().map(|(i, item)| (NodeId(i), item))
    }
}
