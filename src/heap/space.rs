//! The heap's address-space carving: two equal new-space semispaces and a
//! page-grown old space. Spaces hand out aligned blocks; object headers and
//! collection policy live with the heap itself.

use crate::object::{ForwardingCorpse, HeapObject, FORWARDING_CORPSE_CID};
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::memory::{self, Protection, VirtualMemory};
use crate::util::Address;

/// One half of new space. Fully committed up front; allocation is a bounds
/// check and a bump. The first object sits one word past the page-aligned
/// base so that every object address carries the new-space alignment
/// signature.
#[derive(Debug)]
pub(crate) struct SemiSpace {
    memory: VirtualMemory,
    top: Address,
}

impl SemiSpace {
    pub fn new(size: usize) -> std::io::Result<SemiSpace> {
        let memory = VirtualMemory::reserve(size)?;
        memory.commit(size, Protection::ReadWrite)?;
        let top = memory.base() + NEW_OBJECT_ALIGNMENT_OFFSET;
        Ok(SemiSpace { memory, top })
    }

    pub fn allocation_base(&self) -> Address {
        self.memory.base() + NEW_OBJECT_ALIGNMENT_OFFSET
    }

    pub fn top(&self) -> Address {
        self.top
    }

    pub fn limit(&self) -> Address {
        self.memory.limit()
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.memory.contains(addr)
    }

    pub fn used(&self) -> usize {
        self.top - self.allocation_base()
    }

    pub fn reset(&mut self) {
        self.top = self.allocation_base();
    }

    /// Zero the used range so the space is allocation-ready when it next
    /// becomes the target of a flip.
    pub fn zero_used(&mut self) {
        memory::zero(self.allocation_base(), self.used());
        self.reset();
    }

    pub fn try_allocate(&mut self, size: usize) -> Option<Address> {
        debug_assert!(size & OBJECT_ALIGNMENT_MASK == 0);
        if self.top + size > self.limit() {
            return None;
        }
        let result = self.top;
        debug_assert!(result & OBJECT_ALIGNMENT_MASK == NEW_OBJECT_ALIGNMENT_OFFSET);
        self.top += size;
        Some(result)
    }

    /// Visit every object between the allocation base and `top`.
    pub fn walk<F: FnMut(HeapObject)>(&self, mut f: F) {
        let mut addr = self.allocation_base();
        while addr < self.top {
            let object = HeapObject::from_address(addr);
            addr += object.heap_size();
            f(object);
        }
    }
}

/// Old space: a single reservation committed page by page, with a bump
/// pointer for fresh allocation and a first-fit free list of swept blocks.
/// Free blocks reuse the forwarding-corpse class id so heap walks can skip
/// them by header alone; corpses proper only ever exist in from-space
/// mid-scavenge, so the two cannot be confused.
#[derive(Debug)]
pub(crate) struct OldSpace {
    memory: VirtualMemory,
    top: Address,
    committed: Address,
    free_list: Option<HeapObject>,
}

impl OldSpace {
    pub fn new(capacity: usize) -> std::io::Result<OldSpace> {
        let memory = VirtualMemory::reserve(capacity)?;
        let base = memory.base();
        Ok(OldSpace {
            memory,
            top: base,
            committed: base,
            free_list: None,
        })
    }

    pub fn base(&self) -> Address {
        self.memory.base()
    }

    pub fn top(&self) -> Address {
        self.top
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.memory.base() && addr < self.top
    }

    pub fn used(&self) -> usize {
        self.top - self.memory.base()
    }

    pub fn try_allocate(&mut self, size: usize) -> Option<Address> {
        debug_assert!(size & OBJECT_ALIGNMENT_MASK == 0);
        if let Some(addr) = self.take_first_fit(size) {
            memory::zero(addr, size);
            return Some(addr);
        }
        if self.top + size > self.memory.limit() {
            return None;
        }
        if self.top + size > self.committed && !self.commit_up_to(self.top + size) {
            return None;
        }
        let result = self.top;
        debug_assert!(result & OBJECT_ALIGNMENT_MASK == OLD_OBJECT_ALIGNMENT_OFFSET);
        self.top += size;
        memory::zero(result, size);
        Some(result)
    }

    /// Commit pages so that `addr` becomes accessible, over-committing in
    /// page-sized steps to amortize the mprotect calls.
    fn commit_up_to(&mut self, addr: Address) -> bool {
        let wanted = conversions::page_align_up(addr);
        match self.memory.commit(wanted - self.memory.base(), Protection::ReadWrite) {
            Ok(()) => {
                self.committed = wanted;
                true
            }
            Err(e) => {
                warn!("old space failed to commit up to {}: {}", wanted, e);
                false
            }
        }
    }

    fn take_first_fit(&mut self, size: usize) -> Option<Address> {
        let mut prev: Option<HeapObject> = None;
        let mut cursor = self.free_list;
        while let Some(block) = cursor {
            let block_size = block.heap_size();
            let next = free_block_next(block);
            if block_size >= size {
                // Unlink, then return any tail as a smaller free block.
                match prev {
                    None => self.free_list = next,
                    Some(p) => set_free_block_next(p, next),
                }
                let remainder = block_size - size;
                if remainder > 0 {
                    self.add_free_block(block.address() + size, remainder);
                }
                return Some(block.address());
            }
            prev = Some(block);
            cursor = next;
        }
        None
    }

    pub fn add_free_block(&mut self, addr: Address, size: usize) {
        debug_assert!(size >= OBJECT_ALIGNMENT && size & OBJECT_ALIGNMENT_MASK == 0);
        let block = HeapObject::initialize(addr, FORWARDING_CORPSE_CID, size);
        if block.heap_size() != size {
            // Size tag overflowed; record the size in the overflow word the
            // way a corpse does.
            ForwardingCorpse::cast(block).set_overflow_size(size);
        }
        set_free_block_next(block, self.free_list);
        self.free_list = Some(block);
        debug_assert_eq!(block.heap_size(), size);
    }

    /// Drop the free list wholesale; the sweeper rebuilds it.
    pub fn clear_free_list(&mut self) {
        self.free_list = None;
    }

    /// Give a trailing free run back to the bump pointer instead of the
    /// free list.
    pub fn retreat_top(&mut self, new_top: Address) {
        debug_assert!(new_top <= self.top);
        self.top = new_top;
    }

    /// Visit every live object between base and `top`, skipping free
    /// blocks.
    pub fn walk<F: FnMut(HeapObject)>(&self, mut f: F) {
        let mut addr = self.memory.base();
        while addr < self.top {
            let object = HeapObject::from_address(addr);
            addr += object.heap_size();
            if object.cid() != FORWARDING_CORPSE_CID {
                f(object);
            }
        }
    }
}

fn free_block_next(block: HeapObject) -> Option<HeapObject> {
    let raw = unsafe { block.slot_address(1).load::<usize>() };
    if raw == 0 {
        None
    } else {
        Some(HeapObject::from_address(unsafe { Address::from_usize(raw) }))
    }
}

fn set_free_block_next(block: HeapObject, next: Option<HeapObject>) {
    let raw = next.map_or(0, |n| n.address().as_usize());
    unsafe { block.slot_address(1).store::<usize>(raw) }
}
