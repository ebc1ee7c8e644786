//! Pending queue: operations enqueued but not yet accepted by the kernel.

use std::collections::VecDeque;

use crate::op::OpHandle;

/// FIFO of queued operation handles.
///
/// The submission pipeline removes from the front in the common case;
/// cancellation and partial acceptance may remove from anywhere.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    entries: VecDeque<OpHandle>,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_back(&mut self, handle: OpHandle) {
        self.entries.push_back(handle);
    }

    /// Remove `handle`. Returns `false` if it was not queued.
    pub(crate) fn remove(&mut self, handle: OpHandle) -> bool {
        if self.entries.front() == Some(&handle) {
            self.entries.pop_front();
            return true;
        }
        match self.entries.iter().position(|h| *h == handle) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &OpHandle> + '_ {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(i: u32) -> OpHandle {
        OpHandle::new(i, 1)
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = PendingQueue::new();
        queue.push_back(h(1));
        queue.push_back(h(2));
        queue.push_back(h(3));
        let order: Vec<_> = queue.iter().copied().collect();
        assert_eq!(order, vec![h(1), h(2), h(3)]);
    }

    #[test]
    fn test_remove_front_middle_missing() {
        let mut queue = PendingQueue::new();
        for i in 0..4 {
            queue.push_back(h(i));
        }
        assert!(queue.remove(h(0)));
        assert!(queue.remove(h(2)));
        assert!(!queue.remove(h(2)));
        assert!(!queue.remove(h(9)));
        let order: Vec<_> = queue.iter().copied().collect();
        assert_eq!(order, vec![h(1), h(3)]);
        assert_eq!(queue.len(), 2);
    }
}
