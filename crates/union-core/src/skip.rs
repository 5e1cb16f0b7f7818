//! Skip-connection stack
//!
//! Feature maps saved on the down path are consumed in reverse order on the
//! up path. The stack counts pushes and pops so a backbone can prove its
//! down and up halves were paired as constructed.

use crate::error::LayerError;

/// Push/pop accounting for one forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkipTrace {
    /// Tensors saved on the down path
    pub pushes: usize,
    /// Tensors consumed on the up path
    pub pops: usize,
    /// Unpaired tensors dropped when the pass finished
    pub released: usize,
}

/// LIFO stack of skip tensors
#[derive(Debug)]
pub struct SkipStack<T> {
    items: Vec<T>,
    pushes: usize,
    pops: usize,
}

impl<T> Default for SkipStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SkipStack<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            pushes: 0,
            pops: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            pushes: 0,
            pops: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.pushes += 1;
        tracing::trace!(depth = self.items.len(), "skip push");
    }

    /// Pops the most recent skip
    pub fn pop(&mut self) -> Result<T, LayerError> {
        let item = self.items.pop().ok_or(LayerError::SkipUnderflow {
            pushes: self.pushes,
            pops: self.pops,
        })?;
        self.pops += 1;
        tracing::trace!(depth = self.items.len(), "skip pop");
        Ok(item)
    }

    /// Most recent skip without removing it
    pub fn peek(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn pushes(&self) -> usize {
        self.pushes
    }

    pub fn pops(&self) -> usize {
        self.pops
    }

    /// Ends the pass, requiring every push to have been popped
    pub fn finish(self) -> Result<SkipTrace, LayerError> {
        self.finish_with_unpaired(0)
    }

    /// Ends the pass, releasing exactly `unpaired` leftover skips
    ///
    /// Any other number of leftovers means the down and up halves were not
    /// paired as constructed.
    pub fn finish_with_unpaired(self, unpaired: usize) -> Result<SkipTrace, LayerError> {
        let remaining = self.items.len();
        if remaining != unpaired {
            return Err(LayerError::UnbalancedSkips {
                pushes: self.pushes,
                pops: self.pops,
                remaining,
                expected_unpaired: unpaired,
            });
        }
        Ok(SkipTrace {
            pushes: self.pushes,
            pops: self.pops,
            released: remaining,
        })
    }
}
