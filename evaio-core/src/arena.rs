//! Generational arena for operation records.
//!
//! Records live in slots addressed by [`OpHandle`]. Removing a record bumps
//! the slot's generation, so handles issued before the removal (including
//! the `aio_data` of a late kernel completion) no longer resolve.

use crate::op::{AioOp, OpHandle};

/// Generation counter type.
pub type Generation = u32;

/// Reserved generation values.
pub mod generation {
    use super::Generation;

    /// First valid generation.
    pub const FIRST: Generation = 1;
    /// A slot that reaches this generation is retired instead of reused.
    pub const OVERFLOW_GUARD: Generation = u32::MAX - 1;
}

#[derive(Debug)]
struct Slot {
    generation: Generation,
    entry: Option<AioOp>,
}

/// Slot storage with a free list.
#[derive(Debug, Default)]
pub(crate) struct OpArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl OpArena {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Insert a record built from its own handle.
    pub(crate) fn insert_with<F>(&mut self, build: F) -> OpHandle
    where
        F: FnOnce(OpHandle) -> AioOp,
    {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                assert!(
                    self.slots.len() < u32::MAX as usize,
                    "operation arena exhausted"
                );
                self.slots.push(Slot {
                    generation: generation::FIRST,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.entry.is_none());
        let handle = OpHandle::new(index, slot.generation);
        slot.entry = Some(build(handle));
        self.len += 1;
        handle
    }

    fn slot(&self, handle: OpHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
    }

    pub(crate) fn get(&self, handle: OpHandle) -> Option<&AioOp> {
        self.slot(handle).and_then(|slot| slot.entry.as_ref())
    }

    pub(crate) fn get_mut(&mut self, handle: OpHandle) -> Option<&mut AioOp> {
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.entry.as_mut())
    }

    /// Remove a record and invalidate every handle to it.
    pub(crate) fn remove(&mut self, handle: OpHandle) -> Option<AioOp> {
        let index = handle.index();
        let slot = self
            .slots
            .get_mut(index as usize)
            .filter(|slot| slot.generation == handle.generation())?;
        let op = slot.entry.take()?;

        self.len -= 1;
        if slot.generation < generation::OVERFLOW_GUARD {
            slot.generation += 1;
            self.free.push(index);
        }
        Some(op)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (OpHandle, &AioOp)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .map(|op| (OpHandle::new(index as u32, slot.generation), op))
        })
    }
}
