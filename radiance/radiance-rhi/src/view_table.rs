//! Host-side bookkeeping for the GPU-visible view table.
//!
//! Slots are bump-allocated. A released slot goes to a pending list stamped with the
//! submission that may still read it, and only becomes allocatable again once that
//! submission is complete.

use std::collections::VecDeque;

use crate::{RhiError, ViewHandle, ViewKind};

#[derive(Debug)]
pub struct ViewTable {
    capacity: u32,
    /// Kind per bump-allocated slot; `None` for released slots.
    kinds: Vec<Option<ViewKind>>,
    free: Vec<u32>,
    pending: VecDeque<(u32, u64)>,
}

impl ViewTable {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            kinds: Vec::new(),
            free: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Next slot the bump pointer would hand out.
    pub fn bump_position(&self) -> u32 {
        self.kinds.len() as u32
    }

    /// Number of slots currently holding a view.
    pub fn live_count(&self) -> usize {
        self.kinds.iter().filter(|k| k.is_some()).count()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn kind(&self, handle: ViewHandle) -> Option<ViewKind> {
        self.kinds.get(handle.index() as usize).copied().flatten()
    }

    /// Take a slot from the free-list, or bump-allocate one.
    pub fn allocate(&mut self, kind: ViewKind) -> Result<ViewHandle, RhiError> {
        if let Some(index) = self.free.pop() {
            self.kinds[index as usize] = Some(kind);
            return Ok(ViewHandle(index));
        }
        let index = self.kinds.len() as u32;
        if index >= self.capacity {
            return Err(RhiError::ViewTableFull { capacity: self.capacity });
        }
        self.kinds.push(Some(kind));
        Ok(ViewHandle(index))
    }

    /// Record that `handle` now describes a view of `kind` (in-place rewrite).
    pub fn rewrite(&mut self, handle: ViewHandle, kind: ViewKind) {
        let slot = self.kinds.get_mut(handle.index() as usize);
        debug_assert!(
            matches!(slot, Some(Some(_))),
            "rewriting view slot {} that is not allocated",
            handle.index()
        );
        if let Some(slot) = slot {
            *slot = Some(kind);
        }
    }

    /// Queue `handle` for reuse once submission `after` is complete.
    pub fn release(&mut self, handle: ViewHandle, after: u64) {
        let index = handle.index();
        debug_assert!(self.kind(handle).is_some(), "double release of view slot {}", index);
        if let Some(slot) = self.kinds.get_mut(index as usize) {
            *slot = None;
        }
        debug_assert!(self.pending.back().map_or(true, |&(_, s)| s <= after));
        self.pending.push_back((index, after));
    }

    /// Move every pending slot whose submission is complete to the free-list.
    /// Returns the number of slots reclaimed.
    pub fn reclaim(&mut self, completed: u64) -> usize {
        let mut reclaimed = 0;
        while let Some(&(index, submission)) = self.pending.front() {
            if submission > completed {
                break;
            }
            self.pending.pop_front();
            self.free.push(index);
            reclaimed += 1;
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocates_sequential_slots() {
        let mut table = ViewTable::new(8);
        let a = table.allocate(ViewKind::ReadOnly).unwrap();
        let b = table.allocate(ViewKind::ReadWrite).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        assert_eq!(table.kind(b), Some(ViewKind::ReadWrite));
        assert_eq!(table.bump_position(), 2);
    }

    #[test]
    fn exhausting_capacity_fails() {
        let mut table = ViewTable::new(2);
        table.allocate(ViewKind::ReadOnly).unwrap();
        table.allocate(ViewKind::ReadOnly).unwrap();
        assert!(matches!(
            table.allocate(ViewKind::ReadOnly),
            Err(RhiError::ViewTableFull { capacity: 2 })
        ));
    }

    #[test]
    fn released_slot_waits_for_completion() {
        let mut table = ViewTable::new(4);
        let tlas = table.allocate(ViewKind::AccelerationStructure).unwrap();
        table.release(tlas, 5);
        assert_eq!(table.kind(tlas), None);

        assert_eq!(table.reclaim(4), 0);
        let fresh = table.allocate(ViewKind::AccelerationStructure).unwrap();
        assert_ne!(fresh, tlas);

        assert_eq!(table.reclaim(5), 1);
        let reused = table.allocate(ViewKind::AccelerationStructure).unwrap();
        assert_eq!(reused, tlas);
    }

    #[test]
    fn rewrite_keeps_slot() {
        let mut table = ViewTable::new(4);
        let h = table.allocate(ViewKind::ReadOnly).unwrap();
        table.rewrite(h, ViewKind::ReadWrite);
        assert_eq!(table.kind(h), Some(ViewKind::ReadWrite));
        assert_eq!(table.bump_position(), 1);
    }
}
