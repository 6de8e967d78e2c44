// src/transport/slab.rs
//
// O(1) free-list connection table, shared by the two single-threaded
// readiness-based transports (epoll, epoll+AIO). A growable `Vec`
// rather than a fixed-capacity array, since no maximum connection count
// is fixed here.

use crate::conn::Connection;

pub struct ConnSlab {
    slots: Vec<Option<Connection>>,
    free: Vec<usize>,
}

impl ConnSlab {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    pub fn insert(&mut self, conn: Connection) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(conn);
            idx
        } else {
            self.slots.push(Some(conn));
            self.slots.len() - 1
        }
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Connection> {
        self.slots.get_mut(idx).and_then(|s| s.as_mut())
    }

    pub fn remove(&mut self, idx: usize) -> Option<Connection> {
        let conn = self.slots.get_mut(idx).and_then(|s| s.take());
        if conn.is_some() {
            self.free.push(idx);
        }
        conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove_reuses_the_freed_slot() {
        let mut slab = ConnSlab::new();
        let a = slab.insert(Connection::new(3));
        let b = slab.insert(Connection::new(4));
        assert_ne!(a, b);
        slab.remove(a);
        let c = slab.insert(Connection::new(5));
        assert_eq!(a, c);
    }

    #[test]
    fn get_mut_on_a_removed_slot_is_none() {
        let mut slab = ConnSlab::new();
        let a = slab.insert(Connection::new(3));
        slab.remove(a);
        assert!(slab.get_mut(a).is_none());
    }
}
