// kernel/src/memory/frame.rs
//
// Physical frame allocation plus the refcount table the fork/copy-on-write
// engine depends on. The buddy allocator in `allocator::buddy_allocator`
// remains the actual source of physical memory; this module only ever asks
// it for order-12 (one page) blocks and layers a refcount on top.

use spin::Mutex;
use x86_64::structures::paging::PhysFrame;

use crate::allocator::buddy_allocator::BUDDY;
use super::PAGE_SIZE;

const ORDER_ONE_PAGE: usize = 12;

/// Upper bound on physical frames this table can track refcounts for.
/// 262144 frames * 4 KiB = 1 GiB, comfortably above what the teaching
/// kernel's QEMU target is booted with.
const MAX_TRACKED_FRAMES: usize = 262_144;

struct RefcountTable {
    counts: [u8; MAX_TRACKED_FRAMES],
}

impl RefcountTable {
    const fn new() -> Self {
        Self { counts: [0; MAX_TRACKED_FRAMES] }
    }
}

static REFCOUNTS: Mutex<RefcountTable> = Mutex::new(RefcountTable::new());

fn frame_index(frame: PhysFrame) -> Result<usize, &'static str> {
    let idx = (frame.start_address().as_u64() / PAGE_SIZE) as usize;
    if idx >= MAX_TRACKED_FRAMES {
        return Err("frame: physical address outside tracked range");
    }
    Ok(idx)
}

/// Allocate one zero-refcounted... no, one-refcounted frame. The caller owns
/// the single reference; `fork`'s CoW path is the only thing that `incr`s it
/// further.
pub fn alloc() -> Result<PhysFrame, &'static str> {
    let addr = unsafe { BUDDY.lock().allocate(ORDER_ONE_PAGE) }
        .ok_or("frame: out of physical memory")?;
    let frame = PhysFrame::containing_address(addr);
    let idx = frame_index(frame)?;
    let mut table = REFCOUNTS.lock();
    if table.counts[idx] != 0 {
        panic!("frame: buddy allocator handed back a frame with a live refcount");
    }
    table.counts[idx] = 1;
    crate::serial_println!("frame: alloc {:#x}", addr.as_u64());
    Ok(frame)
}

/// Decrement the frame's refcount; free it back to the buddy allocator once
/// it reaches zero. Returns the refcount the frame had *after* this drop,
/// which the shrink/fault code uses to distinguish "I own this outright" (0)
/// from "someone else still shares it" (>0).
pub fn free(frame: PhysFrame) -> Result<u8, &'static str> {
    let idx = frame_index(frame)?;
    let mut table = REFCOUNTS.lock();
    if table.counts[idx] == 0 {
        return Err("frame: double free");
    }
    table.counts[idx] -= 1;
    let remaining = table.counts[idx];
    if remaining == 0 {
        drop(table);
        unsafe { BUDDY.lock().deallocate(frame.start_address(), ORDER_ONE_PAGE) };
        crate::serial_println!("frame: free {:#x}", frame.start_address().as_u64());
    }
    Ok(remaining)
}

/// Bump a frame's refcount. Used by `fork` when a page is shared
/// copy-on-write instead of duplicated.
pub fn incr(frame: PhysFrame) -> Result<u8, &'static str> {
    let idx = frame_index(frame)?;
    let mut table = REFCOUNTS.lock();
    if table.counts[idx] == 0 {
        return Err("frame: incr on an unallocated frame");
    }
    table.counts[idx] = table.counts[idx]
        .checked_add(1)
        .ok_or("frame: refcount overflow")?;
    Ok(table.counts[idx])
}

/// Current refcount of a frame (0 means unallocated/free).
pub fn refcount(frame: PhysFrame) -> Result<u8, &'static str> {
    let idx = frame_index(frame)?;
    Ok(REFCOUNTS.lock().counts[idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use x86_64::PhysAddr;

    fn fake_addr(frame: usize) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new((frame as u64) * PAGE_SIZE))
    }

    #[test]
    fn refcount_starts_at_zero_for_untouched_frame() {
        assert_eq!(refcount(fake_addr(5)).unwrap(), 0);
    }

    #[test]
    fn incr_and_free_track_sharers() {
        let idx = 1000;
        REFCOUNTS.lock().counts[idx] = 1;
        let addr = fake_addr(idx);

        assert_eq!(incr(addr).unwrap(), 2);
        assert_eq!(free(addr).unwrap(), 1);
        assert_eq!(free(addr).unwrap(), 0);
        assert!(free(addr).is_err());
    }

    #[test]
    fn incr_on_unallocated_frame_is_rejected() {
        let addr = fake_addr(2000);
        assert!(REFCOUNTS.lock().counts[2000] == 0);
        assert!(incr(addr).is_err());
    }

    #[test]
    fn frame_index_rejects_out_of_range_address() {
        let frame = fake_addr(MAX_TRACKED_FRAMES);
        assert!(frame_index(frame).is_err());
    }
}
