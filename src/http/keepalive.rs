//! Idle-connection pool: an intrusive doubly-linked list over a `Slab`
//! arena, giving O(1) insert/remove/touch and O(1) identification of the
//! connections that have been idle longest, for the keep-alive sweep.
//!
//! Keys connections by `Slab` index the same way connection tables
//! elsewhere in this crate do; the linked-list threading on top is new,
//! needed here for idle-timeout eviction in arrival order.

use std::time::Instant;

use slab::Slab;

struct Node {
    id: usize,
    deadline: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Opaque handle returned by [`KeepAlivePool::insert`]; pass it back to
/// `touch` or `remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(usize);

pub struct KeepAlivePool {
    arena: Slab<Node>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl Default for KeepAlivePool {
    fn default() -> Self {
        Self::new()
    }
}

impl KeepAlivePool {
    pub fn new() -> Self {
        Self {
            arena: Slab::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Marks `id` idle until `deadline`, appending it to the tail (most
    /// recently idled).
    pub fn insert(&mut self, id: usize, deadline: Instant) -> Handle {
        let key = self.arena.insert(Node {
            id,
            deadline,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => self.arena[tail].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        Handle(key)
    }

    fn unlink(&mut self, key: usize) {
        let (prev, next) = {
            let node = &self.arena[key];
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.arena[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.arena[n].prev = prev,
            None => self.tail = prev,
        }
    }

    /// Removes a connection from the idle pool (it has become active
    /// again, e.g. a new request arrived).
    pub fn remove(&mut self, handle: Handle) {
        if !self.arena.contains(handle.0) {
            return;
        }
        self.unlink(handle.0);
        self.arena.remove(handle.0);
    }

    /// Resets a connection's deadline and moves it to the tail, as though
    /// freshly inserted, without allocating a new arena slot.
    pub fn touch(&mut self, handle: Handle, deadline: Instant) {
        if !self.arena.contains(handle.0) {
            return;
        }
        self.unlink(handle.0);
        self.arena[handle.0].prev = self.tail;
        self.arena[handle.0].next = None;
        self.arena[handle.0].deadline = deadline;
        match self.tail {
            Some(tail) => self.arena[tail].next = Some(handle.0),
            None => self.head = Some(handle.0),
        }
        self.tail = Some(handle.0);
    }

    /// Removes and returns every connection id whose deadline has passed,
    /// oldest first. The list is ordered by deadline (insert/touch always
    /// append to the tail with a later-or-equal deadline), so this stops at
    /// the first still-live entry rather than scanning the whole pool.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<usize> {
        let mut expired = Vec::new();
        while let Some(head) = self.head {
            if self.arena[head].deadline > now {
                break;
            }
            let id = self.arena[head].id;
            self.unlink(head);
            self.arena.remove(head);
            expired.push(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sweep_evicts_only_expired_entries_oldest_first() {
        let mut pool = KeepAlivePool::new();
        let base = Instant::now();
        pool.insert(1, base);
        pool.insert(2, base + Duration::from_secs(10));
        let expired = pool.sweep_expired(base);
        assert_eq!(expired, vec![1]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn remove_unlinks_from_the_middle() {
        let mut pool = KeepAlivePool::new();
        let base = Instant::now();
        let h1 = pool.insert(1, base);
        let h2 = pool.insert(2, base);
        let h3 = pool.insert(3, base);
        pool.remove(h2);
        assert_eq!(pool.len(), 2);
        let expired = pool.sweep_expired(base);
        assert_eq!(expired, vec![1, 3]);
        let _ = (h1, h3);
    }

    #[test]
    fn touch_moves_entry_to_tail_with_new_deadline() {
        let mut pool = KeepAlivePool::new();
        let base = Instant::now();
        let h1 = pool.insert(1, base);
        pool.insert(2, base);
        pool.touch(h1, base + Duration::from_secs(10));
        // 1 is no longer the earliest deadline, so only 2 should expire now.
        let expired = pool.sweep_expired(base);
        assert_eq!(expired, vec![2]);
    }
}
