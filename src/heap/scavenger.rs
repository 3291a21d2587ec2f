//! The Cheney scavenger: flip, root and remembered-set scan, to-space scan,
//! ephemeron fixed point, weak-array fixup, ephemeron mourning, release.

use std::collections::VecDeque;
use std::time::Instant;

use crate::heap::Heap;
use crate::object::*;
use crate::util::constants::*;
use crate::util::Address;

/// Per-collection state. Lives on the collector's stack; nothing in here
/// survives the scavenge.
struct ScavengeState {
    /// To-space scan pointer, chasing the allocation pointer.
    scan: Address,
    /// Objects promoted to old space this cycle, pending their scan.
    promoted: VecDeque<HeapObject>,
    /// Head of the weak-array list threaded through size slots.
    weak_list: Value,
    /// Displaced size slots of listed weak arrays, in link order. The
    /// header size tag alone is ambiguous by one slot when alignment
    /// padding is present.
    weak_sizes: Vec<usize>,
    /// Ephemerons encountered by the scan, awaiting the fixed point.
    ephemerons: Vec<Ephemeron>,
    /// From-space addresses below this boundary have survived a previous
    /// scavenge and are promoted.
    survivor_boundary: Address,
}

impl Heap {
    pub(crate) fn scavenge(&mut self) {
        let timer = Instant::now();
        let used_before = self.active.used();
        let old_before = self.old.used();

        // Flip.
        std::mem::swap(&mut self.active, &mut self.inactive);
        self.active.reset();
        let survivor_boundary = if self.options.tenure_on_first_survival {
            self.inactive.limit()
        } else {
            self.survivor_end
        };
        let mut state = ScavengeState {
            scan: self.active.top(),
            promoted: VecDeque::new(),
            weak_list: Value::from_smi(0),
            weak_sizes: Vec::new(),
            ephemerons: Vec::new(),
            survivor_boundary,
        };

        // Strong roots.
        self.nil = self.scavenge_value(&mut state, self.nil);
        self.object_store = self.scavenge_value(&mut state, self.object_store);
        for i in 0..self.roots.len() {
            let value = self.roots[i];
            self.roots[i] = self.scavenge_value(&mut state, value);
        }
        for i in 0..self.pending_finalizers.len() {
            let value = self.pending_finalizers[i];
            self.pending_finalizers[i] = self.scavenge_value(&mut state, value);
        }
        // Class-table entries survive scavenges; an old instance tethers
        // its class only through a header cid, which no scavenge scan
        // sees. Dead classes are reclaimed by major collections, which
        // know instance liveness.
        for cid in FIRST_LEGAL_CID..self.class_table.len() {
            let entry = self.class_table[cid];
            if entry.is_heap_object() {
                self.class_table[cid] = self.scavenge_value(&mut state, entry);
            }
        }

        // Remembered set: scan old objects that held new-space references.
        // Each re-enlists itself only if it still does.
        let remembered = std::mem::take(&mut self.remembered);
        for object in &remembered {
            object.set_is_remembered(false);
        }
        for object in remembered {
            self.scavenge_old_object(&mut state, object);
        }

        self.drain_scan(&mut state);
        self.process_ephemerons(&mut state);
        self.mourn_weak_arrays(&mut state);

        self.survivor_end = self.active.top();
        self.inactive.zero_used();
        self.scavenge_count += 1;
        debug!(
            "scavenge #{}: {}k new -> {}k survivors, {}k promoted, {} remembered, {:?}",
            self.scavenge_count,
            used_before >> 10,
            self.active.used() >> 10,
            (self.old.used() - old_before) >> 10,
            self.remembered.len(),
            timer.elapsed()
        );
        #[cfg(feature = "sanity")]
        self.verify();
    }

    /// Forward one reference. From-space targets are copied to to-space or
    /// promoted, leaving a forwarding corpse; corpses resolve to their
    /// recorded target; everything else passes through.
    fn scavenge_value(&mut self, state: &mut ScavengeState, value: Value) -> Value {
        if value.is_immediate_or_old() {
            return value;
        }
        let object = value.heap_object();
        if !self.inactive.contains(object.address()) {
            // Already copied to to-space this cycle.
            return value;
        }
        if object.is_forwarding_corpse() {
            return object.forwarding_target().to_value();
        }
        let size = object.heap_size();
        let promote =
            size >= self.options.large_object_size || object.address() < state.survivor_boundary;
        let (addr, promoted) = if promote {
            match self.old.try_allocate(size) {
                Some(addr) => (addr, true),
                // Old space is full; surviving in to-space is always
                // possible since to-space is as large as from-space.
                None => (self.to_space_allocate(size), false),
            }
        } else {
            (self.to_space_allocate(size), false)
        };
        unsafe {
            std::ptr::copy_nonoverlapping(
                object.address().to_ptr::<u8>(),
                addr.to_mut_ptr::<u8>(),
                size,
            );
        }
        let target = HeapObject::from_address(addr);
        object.forward_to(target);
        if promoted {
            state.promoted.push_back(target);
        }
        target.to_value()
    }

    fn to_space_allocate(&mut self, size: usize) -> Address {
        match self.active.try_allocate(size) {
            Some(addr) => addr,
            None => unreachable!("to-space exhausted during scavenge"),
        }
    }

    /// Process copied and promoted objects until both queues are empty.
    fn drain_scan(&mut self, state: &mut ScavengeState) {
        loop {
            if state.scan < self.active.top() {
                let object = HeapObject::from_address(state.scan);
                state.scan += object.heap_size();
                self.scavenge_new_object(state, object);
            } else if let Some(object) = state.promoted.pop_front() {
                self.scavenge_old_object(state, object);
            } else {
                break;
            }
        }
    }

    fn scavenge_new_object(&mut self, state: &mut ScavengeState, object: HeapObject) {
        match object.cid() {
            WEAK_ARRAY_CID => self.enlist_weak_array(state, WeakArray::cast(object)),
            EPHEMERON_CID => state.ephemerons.push(Ephemeron::cast(object)),
            _ => {
                if let Some((from, to)) = object.pointers() {
                    self.scavenge_range(state, from, to);
                }
            }
        }
    }

    /// Like `scavenge_new_object` for an old-space object (from the
    /// remembered set or freshly promoted), additionally maintaining its
    /// remembered bit.
    fn scavenge_old_object(&mut self, state: &mut ScavengeState, object: HeapObject) {
        match object.cid() {
            WEAK_ARRAY_CID => self.enlist_weak_array(state, WeakArray::cast(object)),
            EPHEMERON_CID => state.ephemerons.push(Ephemeron::cast(object)),
            _ => {
                if let Some((from, to)) = object.pointers() {
                    self.scavenge_range(state, from, to);
                }
                self.remember_if_holds_new(object);
            }
        }
    }

    fn scavenge_range(&mut self, state: &mut ScavengeState, from: Address, to: Address) {
        let mut slot = from;
        while slot <= to {
            let value = unsafe { slot.load::<Value>() };
            if value.is_heap_object() {
                let forwarded = self.scavenge_value(state, value);
                if forwarded != value {
                    unsafe { slot.store::<Value>(forwarded) };
                }
            }
            slot += BYTES_IN_WORD;
        }
    }

    pub(crate) fn remember_if_holds_new(&mut self, object: HeapObject) {
        debug_assert!(object.is_old_object());
        if object.is_remembered() {
            return;
        }
        if let Some((from, to)) = object.pointers() {
            let mut slot = from;
            while slot <= to {
                let value = unsafe { slot.load::<Value>() };
                if value.is_new_object() {
                    self.remember(object);
                    return;
                }
                slot += BYTES_IN_WORD;
            }
        }
    }

    fn enlist_weak_array(&mut self, state: &mut ScavengeState, weak: WeakArray) {
        state.weak_sizes.push(weak.size());
        weak.set_next(state.weak_list);
        state.weak_list = weak.object().to_value();
    }

    /// Ephemeron fixed point and mourning. Each inner pass forwards at
    /// least one key or terminates; passes are bounded by the number of
    /// live ephemerons. Mourning may copy finalizer graphs, which can
    /// surface further ephemerons, hence the outer loop.
    fn process_ephemerons(&mut self, state: &mut ScavengeState) {
        loop {
            loop {
                let mut progress = false;
                let mut i = 0;
                while i < state.ephemerons.len() {
                    let ephemeron = state.ephemerons[i];
                    if self.key_survives(ephemeron.key()) {
                        let key = self.scavenge_value(state, ephemeron.key());
                        ephemeron.set_key(key);
                        let value = self.scavenge_value(state, ephemeron.value());
                        ephemeron.set_value(value);
                        let finalizer = self.scavenge_value(state, ephemeron.finalizer());
                        ephemeron.set_finalizer(finalizer);
                        self.drain_scan(state);
                        if ephemeron.object().is_old_object() {
                            self.remember_if_holds_new(ephemeron.object());
                        }
                        state.ephemerons.swap_remove(i);
                        progress = true;
                    } else {
                        i += 1;
                    }
                }
                if !progress {
                    break;
                }
            }
            if state.ephemerons.is_empty() {
                break;
            }
            // The remaining keys are unreachable: mourn. The key and value
            // slots are cleared so no from-space reference outlives the
            // collection; the finalizer is kept alive on the pending queue
            // for the interpreter to run at a safe point.
            let doomed = std::mem::take(&mut state.ephemerons);
            let mourned = doomed.len();
            for ephemeron in doomed {
                let nil = self.nil;
                ephemeron.set_key(nil);
                ephemeron.set_value(nil);
                let finalizer = ephemeron.finalizer();
                ephemeron.set_finalizer(nil);
                if finalizer != nil {
                    let finalizer = self.scavenge_value(state, finalizer);
                    self.pending_finalizers.push(finalizer);
                    self.drain_scan(state);
                }
            }
            trace!("mourned {} ephemerons", mourned);
            if state.ephemerons.is_empty() {
                break;
            }
        }
    }

    fn key_survives(&self, key: Value) -> bool {
        if key.is_immediate_or_old() {
            return true;
        }
        let object = key.heap_object();
        if !self.inactive.contains(object.address()) {
            return true;
        }
        object.is_forwarding_corpse()
    }

    /// Walk the weak list: restore sizes, rewrite forwarded elements, nil
    /// the rest.
    fn mourn_weak_arrays(&mut self, state: &mut ScavengeState) {
        let mut cursor = state.weak_list;
        while cursor.is_heap_object() {
            let weak = WeakArray::cast(cursor.heap_object());
            cursor = weak.next();
            let size = state.weak_sizes.pop().expect("weak list out of sync");
            debug_assert!(weak.size_from_header() == size || weak.size_from_header() == size + 1);
            weak.set_size(size);
            for i in 0..size {
                let value = weak.element(i);
                if !value.is_heap_object() {
                    continue;
                }
                let target = value.heap_object();
                if !self.inactive.contains(target.address()) {
                    continue;
                }
                if target.is_forwarding_corpse() {
                    weak.set_element(i, target.forwarding_target().to_value());
                } else {
                    weak.set_element(i, self.nil);
                }
            }
            if weak.object().is_old_object() {
                self.remember_if_holds_new(weak.object());
            }
        }
        debug_assert!(state.weak_sizes.is_empty());
        state.weak_list = Value::from_smi(0);
    }

}
