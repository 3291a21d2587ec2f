//! Major collection: mark–sweep over old space. Runs right after a
//! scavenge, so new space holds only live objects; they are treated as
//! roots and double as their own visited flags via the mark bit, which is
//! cleared again before the mutator resumes.

use std::time::Instant;

use crate::heap::Heap;
use crate::object::*;
use crate::util::constants::*;
use crate::util::Address;

struct MarkState {
    stack: Vec<HeapObject>,
    weak_arrays: Vec<WeakArray>,
    ephemerons: Vec<Ephemeron>,
}

impl Heap {
    pub(crate) fn mark_sweep(&mut self) {
        let timer = Instant::now();
        let old_before = self.old.used();

        let mut state = MarkState {
            stack: Vec::new(),
            weak_arrays: Vec::new(),
            ephemerons: Vec::new(),
        };

        // Roots: the registered slots, the well-known objects, the pending
        // finalizers, and every (live by construction) new-space object.
        self.mark_value(&mut state, self.nil);
        self.mark_value(&mut state, self.object_store);
        for i in 0..self.roots.len() {
            self.mark_value(&mut state, self.roots[i]);
        }
        for i in 0..self.pending_finalizers.len() {
            self.mark_value(&mut state, self.pending_finalizers[i]);
        }
        let mut new_objects = Vec::new();
        self.active.walk(|object| new_objects.push(object));
        for object in new_objects {
            self.mark_object(&mut state, object);
        }
        self.drain_mark(&mut state);
        self.process_marked_ephemerons(&mut state);
        self.fix_marked_weak_arrays(&mut state);

        // Weak class table and remembered set, while mark bits are valid.
        for cid in FIRST_LEGAL_CID..self.class_table.len() {
            let entry = self.class_table[cid];
            if entry.is_heap_object() && !entry.heap_object().is_marked() {
                trace!("class {} died during major collection", cid);
                self.vacate_cid(cid);
            }
        }
        self.remembered.retain(|object| object.is_marked());

        self.sweep_old_space();
        self.active.walk(|object| object.set_is_marked(false));

        self.major_count += 1;
        debug!(
            "major #{}: old space {}k -> {}k, {:?}",
            self.major_count,
            old_before >> 10,
            self.old.used() >> 10,
            timer.elapsed()
        );
        #[cfg(feature = "sanity")]
        self.verify();
    }

    fn mark_value(&mut self, state: &mut MarkState, value: Value) {
        if value.is_heap_object() {
            self.mark_object(state, value.heap_object());
        }
    }

    fn mark_object(&mut self, state: &mut MarkState, object: HeapObject) {
        if !object.is_marked() {
            object.set_is_marked(true);
            state.stack.push(object);
        }
    }

    fn drain_mark(&mut self, state: &mut MarkState) {
        while let Some(object) = state.stack.pop() {
            // An instance keeps its class alive even though the only link
            // is the header cid through the class table.
            let class = self.class_at(object.cid());
            self.mark_value(state, class);
            match object.cid() {
                WEAK_ARRAY_CID => state.weak_arrays.push(WeakArray::cast(object)),
                EPHEMERON_CID => state.ephemerons.push(Ephemeron::cast(object)),
                _ => {
                    if let Some((from, to)) = object.pointers() {
                        self.mark_range(state, from, to);
                    }
                }
            }
        }
    }

    fn mark_range(&mut self, state: &mut MarkState, from: Address, to: Address) {
        let mut slot = from;
        while slot <= to {
            let value = unsafe { slot.load::<Value>() };
            self.mark_value(state, value);
            slot += BYTES_IN_WORD;
        }
    }

    /// The marking flavor of the ephemeron fixed point: a key is live once
    /// it is immediate or marked; values and finalizers of live keys are
    /// marked in turn, and the survivors' finalizer graphs surfaced by
    /// mourning loop back through the fixed point.
    fn process_marked_ephemerons(&mut self, state: &mut MarkState) {
        loop {
            loop {
                let mut progress = false;
                let mut i = 0;
                while i < state.ephemerons.len() {
                    let ephemeron = state.ephemerons[i];
                    let key = ephemeron.key();
                    if key.is_smi() || key.heap_object().is_marked() {
                        self.mark_value(state, ephemeron.value());
                        self.mark_value(state, ephemeron.finalizer());
                        self.drain_mark(state);
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
            let doomed = std::mem::take(&mut state.ephemerons);
            for ephemeron in doomed {
                let nil = self.nil;
                ephemeron.set_key(nil);
                ephemeron.set_value(nil);
                let finalizer = ephemeron.finalizer();
                ephemeron.set_finalizer(nil);
                if finalizer != nil {
                    self.mark_value(state, finalizer);
                    self.drain_mark(state);
                    self.pending_finalizers.push(finalizer);
                }
            }
            if state.ephemerons.is_empty() {
                break;
            }
        }
    }

    fn fix_marked_weak_arrays(&mut self, state: &mut MarkState) {
        for weak in state.weak_arrays.drain(..) {
            for i in 0..weak.size() {
                let value = weak.element(i);
                if value.is_heap_object() && !value.heap_object().is_marked() {
                    weak.set_element(i, self.nil);
                }
            }
        }
    }

    /// Linear sweep: coalesce unmarked objects and stale free blocks into
    /// free-list runs, clear surviving marks, and give a trailing run back
    /// to the bump pointer.
    fn sweep_old_space(&mut self) {
        self.old.clear_free_list();
        let base = self.old.base();
        let top = self.old.top();
        let mut free_run: Option<Address> = None;
        let mut addr = base;
        while addr < top {
            let object = HeapObject::from_address(addr);
            let size = object.heap_size();
            let live = object.cid() != FORWARDING_CORPSE_CID && object.is_marked();
            if live {
                object.set_is_marked(false);
                if let Some(start) = free_run.take() {
                    self.old.add_free_block(start, addr - start);
                }
            } else if free_run.is_none() {
                free_run = Some(addr);
            }
            addr += size;
        }
        if let Some(start) = free_run {
            self.old.retreat_top(start);
        }
    }
}
