// kernel/src/memory/swap.rs
//
// Per-process swap-slot table and the block-file backend it swaps pages
// through. One slot per swapped page, at a fixed offset (`slot_index *
// PAGE_SIZE`) in the process's swap file — mirrors the original's
// `swap_pages[]` array and its fixed-offset `get_swap_offset`. I/O moves in
// four equal quarter-page chunks, matching `fifo_swap`'s `SWAP_BUF_SIZE`
// loop exactly; there's no reason to change a detail that has no bearing on
// correctness, and it keeps the grounding literal.
//
// There's no disk driver in this kernel, so `BlockFile` is a small trait
// (same coupling-point shape as `process::file::FileHandle`) with one
// concrete heap-backed implementation standing in for a real backing store.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::{MAX_RESIDENT, PAGE_SIZE};

const QUARTER: usize = (PAGE_SIZE / 4) as usize;

/// A block-addressable backing store for swapped pages. One `write_quarter`/
/// `read_quarter` call moves `PAGE_SIZE/4` bytes at `byte_offset`.
pub trait BlockFile: Send {
    fn read_quarter(&mut self, byte_offset: usize, buf: &mut [u8]) -> Result<(), &'static str>;
    fn write_quarter(&mut self, byte_offset: usize, buf: &[u8]) -> Result<(), &'static str>;
}

/// Stand-in swap backing store: a heap-allocated byte vector that grows to
/// fit the highest slot touched. Not persistent across reboots.
pub struct HeapBackedBlockFile {
    bytes: Vec<u8>,
}

impl HeapBackedBlockFile {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    fn ensure_capacity(&mut self, end: usize) {
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
    }
}

impl BlockFile for HeapBackedBlockFile {
    fn read_quarter(&mut self, byte_offset: usize, buf: &mut [u8]) -> Result<(), &'static str> {
        let end = byte_offset + buf.len();
        if end > self.bytes.len() {
            // Never-written region reads as zero, same as a freshly
            // allocated swap file on disk.
            buf.fill(0);
            return Ok(());
        }
        buf.copy_from_slice(&self.bytes[byte_offset..end]);
        Ok(())
    }

    fn write_quarter(&mut self, byte_offset: usize, buf: &[u8]) -> Result<(), &'static str> {
        let end = byte_offset + buf.len();
        self.ensure_capacity(end);
        self.bytes[byte_offset..end].copy_from_slice(buf);
        Ok(())
    }
}

/// Move a full page between a frame and a swap file at `slot_index`, in
/// four quarter-page chunks. `to_swap = true` writes frame -> file,
/// `to_swap = false` reads file -> frame.
fn transfer_quarters(
    file: &mut dyn BlockFile,
    slot_index: usize,
    frame: x86_64::structures::paging::PhysFrame,
    to_swap: bool,
) -> Result<(), &'static str> {
    let base_offset = slot_index * (PAGE_SIZE as usize);
    let mut chunk = [0u8; QUARTER];

    for q in 0..4 {
        let frame_offset = q * QUARTER;
        let file_offset = base_offset + frame_offset;

        if to_swap {
            unsafe { super::page_table::OwnedPageTable::read_from_frame(frame, &mut chunk, frame_offset) };
            file.write_quarter(file_offset, &chunk)?;
        } else {
            file.read_quarter(file_offset, &mut chunk)?;
            unsafe { super::page_table::OwnedPageTable::write_to_frame(frame, &chunk, frame_offset) };
        }
    }

    Ok(())
}

/// One swap slot: which user virtual page currently owns it, if any.
#[derive(Clone, Copy)]
struct Slot {
    owner: Option<u64>,
}

/// Fixed-capacity table of swap slots for one process. Capacity matches
/// `MAX_RESIDENT` — a process can have at most that many pages swapped out
/// at once, same bound as how many it can keep resident.
pub struct SwapTable {
    slots: [Slot; MAX_RESIDENT],
    file: Mutex<Box<dyn BlockFile>>,
}

impl SwapTable {
    pub fn new(file: Box<dyn BlockFile>) -> Self {
        Self {
            slots: [Slot { owner: None }; MAX_RESIDENT],
            file: Mutex::new(file),
        }
    }

    pub fn with_heap_backing() -> Self {
        Self::new(Box::new(HeapBackedBlockFile::new()))
    }

    fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.owner.is_none())
    }

    pub fn find_owner(&self, addr: u64) -> Option<usize> {
        self.slots.iter().position(|s| s.owner == Some(addr))
    }

    /// Reserve a slot for `addr` and write the frame's contents into it.
    /// The caller is responsible for unmapping/freeing the frame afterward.
    pub fn swap_out(&mut self, addr: u64, frame: x86_64::structures::paging::PhysFrame) -> Result<usize, &'static str> {
        let idx = self.find_free().ok_or("swap: no free slot")?;
        transfer_quarters(&mut **self.file.lock(), idx, frame, true)?;
        self.slots[idx].owner = Some(addr);
        crate::serial_println!("swap: out va={:#x} slot={}", addr, idx);
        Ok(idx)
    }

    /// Read a previously swapped page back into `frame`, then free the slot.
    pub fn swap_in(&mut self, addr: u64, frame: x86_64::structures::paging::PhysFrame) -> Result<(), &'static str> {
        let idx = self.find_owner(addr).ok_or("swap: swap_in on an address with no slot")?;
        transfer_quarters(&mut **self.file.lock(), idx, frame, false)?;
        self.slots[idx].owner = None;
        crate::serial_println!("swap: in va={:#x} slot={}", addr, idx);
        Ok(())
    }

    /// Swap `va` in and `victim_addr` out in place, without ever needing a
    /// second free slot: `frame` is the victim's own resident frame, and
    /// `va`'s existing slot is reused to hold the victim's bytes instead of
    /// being released and re-reserved elsewhere. Four quarter-page steps
    /// swap the slot's contents with the frame's, so the frame ends up
    /// holding what the slot held (`va`'s data) and the slot ends up
    /// holding what the frame held (the victim's data); the slot's owner
    /// is then handed from `va` to `victim_addr`. Used by the fault
    /// handler's swap-in-with-eviction path — this is what lets swap-in
    /// make progress even when every slot is already occupied.
    pub fn exchange(
        &mut self,
        va: u64,
        victim_addr: u64,
        frame: x86_64::structures::paging::PhysFrame,
    ) -> Result<(), &'static str> {
        let idx = self.find_owner(va).ok_or("swap: exchange on an address with no slot")?;
        let base_offset = idx * (PAGE_SIZE as usize);
        let mut file = self.file.lock();

        for q in 0..4 {
            let frame_offset = q * QUARTER;
            let file_offset = base_offset + frame_offset;

            let mut slot_chunk = [0u8; QUARTER];
            let mut frame_chunk = [0u8; QUARTER];
            file.read_quarter(file_offset, &mut slot_chunk)?;
            unsafe { super::page_table::OwnedPageTable::read_from_frame(frame, &mut frame_chunk, frame_offset) };

            unsafe { super::page_table::OwnedPageTable::write_to_frame(frame, &slot_chunk, frame_offset) };
            file.write_quarter(file_offset, &frame_chunk)?;
        }
        drop(file);

        self.slots[idx].owner = Some(victim_addr);
        crate::serial_println!("swap: exchanged va={:#x} <-> victim={:#x} slot={}", va, victim_addr, idx);
        Ok(())
    }

    /// Release a slot without reading it back (process exit / shrink).
    pub fn release(&mut self, addr: u64) -> Result<(), &'static str> {
        let idx = self.find_owner(addr).ok_or("swap: release on an address with no slot")?;
        self.slots[idx].owner = None;
        Ok(())
    }

    /// Duplicate the contents of `addr`'s slot in this table into a fresh
    /// slot in `dst`, for fork. Both slots end up holding identical bytes,
    /// independent of each other — the resolved answer to the fork+swapped-
    /// page open question: the child gets its own copy, never a slot shared
    /// with the parent.
    pub fn duplicate_into(&self, addr: u64, dst: &mut SwapTable) -> Result<usize, &'static str> {
        let src_idx = self.find_owner(addr).ok_or("swap: duplicate source has no slot")?;
        let dst_idx = dst.find_free().ok_or("swap: no free slot to duplicate into")?;

        let mut buf = vec![0u8; PAGE_SIZE as usize];
        let src_base = src_idx * (PAGE_SIZE as usize);
        let dst_base = dst_idx * (PAGE_SIZE as usize);

        {
            let mut src_file = self.file.lock();
            for q in 0..4 {
                let off = q * QUARTER;
                src_file.read_quarter(src_base + off, &mut buf[off..off + QUARTER])?;
            }
        }
        {
            let mut dst_file = dst.file.lock();
            for q in 0..4 {
                let off = q * QUARTER;
                dst_file.write_quarter(dst_base + off, &buf[off..off + QUARTER])?;
            }
        }

        dst.slots[dst_idx].owner = Some(addr);
        Ok(dst_idx)
    }

    pub fn is_full(&self) -> bool {
        self.find_free().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_free_and_find_owner_roundtrip() {
        let mut table = SwapTable::with_heap_backing();
        assert_eq!(table.find_owner(0x1000), None);
        table.slots[0].owner = Some(0x1000);
        assert_eq!(table.find_owner(0x1000), Some(0));
        assert!(table.find_free().is_some());
    }

    #[test]
    fn release_frees_the_slot() {
        let mut table = SwapTable::with_heap_backing();
        table.slots[3].owner = Some(0x4000);
        assert!(table.release(0x4000).is_ok());
        assert_eq!(table.find_owner(0x4000), None);
        assert!(table.release(0x4000).is_err());
    }

    #[test]
    fn is_full_once_every_slot_taken() {
        let mut table = SwapTable::with_heap_backing();
        for i in 0..MAX_RESIDENT {
            table.slots[i].owner = Some((i as u64) * PAGE_SIZE);
        }
        assert!(table.is_full());
    }

    #[test]
    fn heap_backed_block_file_reads_back_what_it_writes() {
        let mut file = HeapBackedBlockFile::new();
        let data = [0xABu8; QUARTER];
        file.write_quarter(QUARTER * 2, &data).unwrap();

        let mut out = [0u8; QUARTER];
        file.read_quarter(QUARTER * 2, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn heap_backed_block_file_unwritten_region_reads_zero() {
        let mut file = HeapBackedBlockFile::new();
        let mut out = [0xFFu8; QUARTER];
        file.read_quarter(PAGE_SIZE as usize * 4, &mut out).unwrap();
        assert_eq!(out, [0u8; QUARTER]);
    }
}
