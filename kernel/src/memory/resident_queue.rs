// kernel/src/memory/resident_queue.rs
//
// Per-process FIFO of resident pages. Each process gets its own queue
// (no global replacement, matching the Non-goal in the Non-goals list);
// `user_image::grow` enrolls newly mapped pages and `fault::handle_page_fault`
// evicts the oldest one once the process is at its `MAX_RESIDENT` cap.
//
// Arena + index doubly-linked list instead of an owned `Vec<Node>` with
// `Box`ed links: a process carries exactly `MAX_RESIDENT` pages, so a fixed
// array of slots with next/prev indices avoids a heap allocation per
// enrolled page and sidesteps the ownership cycle a naive doubly-linked
// list would need.

use super::MAX_RESIDENT;

const NIL: usize = usize::MAX;

#[derive(Clone, Copy)]
struct Slot {
    addr: u64,
    next: usize,
    prev: usize,
    used: bool,
}

impl Slot {
    const fn empty() -> Self {
        Self { addr: 0, next: NIL, prev: NIL, used: false }
    }
}

/// FIFO queue of resident page addresses, capped at `MAX_RESIDENT` entries.
pub struct ResidentQueue {
    slots: [Slot; MAX_RESIDENT],
    head: usize, // oldest (next to evict)
    tail: usize, // newest
    len: usize,
}

impl ResidentQueue {
    pub const fn new() -> Self {
        Self {
            slots: [Slot::empty(); MAX_RESIDENT],
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_full(&self) -> bool {
        self.len >= MAX_RESIDENT
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.used)
    }

    /// Enroll a newly mapped page at the tail (most recently added). Errs
    /// if the queue is already at `MAX_RESIDENT` — callers must evict first.
    pub fn enroll(&mut self, addr: u64) -> Result<(), &'static str> {
        if self.is_full() {
            return Err("resident_queue: enroll on a full queue");
        }
        let idx = self.free_slot().ok_or("resident_queue: no free slot despite len < MAX_RESIDENT")?;
        self.slots[idx] = Slot { addr, next: NIL, prev: self.tail, used: true };

        if self.tail != NIL {
            self.slots[self.tail].next = idx;
        } else {
            self.head = idx;
        }
        self.tail = idx;
        self.len += 1;
        Ok(())
    }

    /// Remove the oldest entry and return its address. `None` if empty.
    pub fn evict_oldest(&mut self) -> Option<u64> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        let addr = self.slots[idx].addr;
        self.unlink(idx);
        Some(addr)
    }

    /// Remove a specific address from the queue, wherever it sits (used
    /// when a page is unmapped outside the normal eviction path — e.g.
    /// `user_image::shrink`). No-op if not present.
    pub fn remove(&mut self, addr: u64) -> bool {
        let idx = match self.slots.iter().position(|s| s.used && s.addr == addr) {
            Some(i) => i,
            None => return false,
        };
        self.unlink(idx);
        true
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);

        if prev != NIL {
            self.slots[prev].next = next;
        } else {
            self.head = next;
        }

        if next != NIL {
            self.slots[next].prev = prev;
        } else {
            self.tail = prev;
        }

        self.slots[idx] = Slot::empty();
        self.len -= 1;
    }

    /// Iterate oldest-to-newest (for debugging/dumps).
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        ResidentQueueIter { queue: self, current: self.head }
    }
}

struct ResidentQueueIter<'a> {
    queue: &'a ResidentQueue,
    current: usize,
}

impl<'a> Iterator for ResidentQueueIter<'a> {
    type Item = u64;
    fn next(&mut self) -> Option<u64> {
        if self.current == NIL {
            return None;
        }
        let slot = self.queue.slots[self.current];
        self.current = slot.next;
        Some(slot.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enroll_and_evict_is_fifo() {
        let mut q = ResidentQueue::new();
        q.enroll(0x1000).unwrap();
        q.enroll(0x2000).unwrap();
        q.enroll(0x3000).unwrap();

        assert_eq!(q.evict_oldest(), Some(0x1000));
        assert_eq!(q.evict_oldest(), Some(0x2000));
        assert_eq!(q.len(), 1);
        assert_eq!(q.evict_oldest(), Some(0x3000));
        assert_eq!(q.evict_oldest(), None);
    }

    #[test]
    fn remove_from_middle_preserves_order() {
        let mut q = ResidentQueue::new();
        q.enroll(0x1000).unwrap();
        q.enroll(0x2000).unwrap();
        q.enroll(0x3000).unwrap();

        assert!(q.remove(0x2000));
        assert_eq!(q.iter().collect::<alloc::vec::Vec<_>>(), alloc::vec![0x1000, 0x3000]);
        assert!(!q.remove(0x2000));
    }

    #[test]
    fn enroll_past_capacity_errors() {
        let mut q = ResidentQueue::new();
        for i in 0..MAX_RESIDENT {
            q.enroll((i as u64) * 0x1000).unwrap();
        }
        assert!(q.is_full());
        assert!(q.enroll(0xdead_0000).is_err());
    }
}
