//! The managed heap: allocation, the generational collector, the class
//! table, and the root/handle discipline the interpreter builds on.
//!
//! New objects are bump-allocated into the active new-space semispace and
//! survive by being copied during a [scavenge](Heap::collect); objects that
//! survive long enough, and large objects immediately, are promoted to old
//! space, which a major collection reclaims by mark–sweep. Old objects that
//! reference new objects carry the remembered bit and sit in the remembered
//! set, maintained by [`Heap::store_pointer`].
//!
//! Any `Value` external code holds across an allocation must be registered
//! as a root (or re-fetched); allocation entry points, safe points, and
//! explicit `collect` calls are the only places objects move.

mod mark_sweep;
mod scavenger;
mod space;

use std::fmt;

use crate::object::*;
use crate::util::constants::*;
use crate::util::conversions::allocation_size;
use crate::util::options::HeapOptions;
use crate::util::Address;

use self::space::{OldSpace, SemiSpace};

/// Errors the heap reports to the embedder. Each leaves the heap in a
/// usable state: a failed allocation changes neither the graph nor the
/// roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No allocation possible even after a major collection.
    OutOfMemory,
    /// The operating system refused address space.
    OutOfAddressSpace,
    /// More root slots registered than the configured ceiling.
    RootOverflow,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeapError::OutOfMemory => write!(f, "out of memory"),
            HeapError::OutOfAddressSpace => write!(f, "out of address space"),
            HeapError::RootOverflow => write!(f, "too many registered roots"),
        }
    }
}

impl std::error::Error for HeapError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionMode {
    /// Copy new-space survivors between semispaces.
    Scavenge,
    /// Scavenge, then mark–sweep old space.
    Major,
}

/// A registered root slot. The heap rewrites the slot's value whenever a
/// collection moves its target.
#[derive(Debug, PartialEq, Eq)]
pub struct RootHandle(usize);

/// A stack mark for bulk-releasing roots registered after it.
#[derive(Debug)]
pub struct HandleScope(usize);

#[derive(Debug)]
pub struct Heap {
    /// The semispace being allocated into.
    active: SemiSpace,
    /// The other semispace; from-space during a scavenge, idle otherwise.
    inactive: SemiSpace,
    old: OldSpace,
    /// End of the survivor region in `active`: objects below this address
    /// at the next flip have survived a prior scavenge and are promoted.
    survivor_end: Address,
    class_table: Vec<Value>,
    free_cids: Vec<ClassId>,
    remembered: Vec<HeapObject>,
    roots: Vec<Value>,
    free_root_slots: Vec<usize>,
    nil: Value,
    object_store: Value,
    pending_finalizers: Vec<Value>,
    hash_state: u64,
    scavenge_count: usize,
    major_count: usize,
    options: HeapOptions,
}

impl Heap {
    pub fn new(options: HeapOptions) -> Result<Heap, HeapError> {
        assert!(options.validate(), "bad heap options: {:?}", options);
        // The generation-by-alignment trick and the single-branch
        // write-barrier predicate both depend on these exact constants.
        assert_eq!(HEAP_OBJECT_TAG, 1);
        assert_eq!(OBJECT_ALIGNMENT, 2 * BYTES_IN_WORD);
        assert_eq!(NEW_OBJECT_ALIGNMENT_OFFSET, BYTES_IN_WORD);
        assert_eq!(NEW_OBJECT_BITS, BYTES_IN_WORD | 1);

        let active = SemiSpace::new(options.semispace_size).map_err(oom_address_space)?;
        let inactive = SemiSpace::new(options.semispace_size).map_err(oom_address_space)?;
        let old = OldSpace::new(options.old_space_capacity).map_err(oom_address_space)?;
        assert!(active.allocation_base() & OBJECT_ALIGNMENT_MASK == NEW_OBJECT_ALIGNMENT_OFFSET);
        assert!(old.base() & OBJECT_ALIGNMENT_MASK == OLD_OBJECT_ALIGNMENT_OFFSET);

        let survivor_end = active.allocation_base();
        let mut heap = Heap {
            active,
            inactive,
            old,
            survivor_end,
            class_table: vec![Value::from_smi(0); FIRST_REGULAR_OBJECT_CID + 1],
            free_cids: Vec::new(),
            remembered: Vec::new(),
            roots: Vec::new(),
            free_root_slots: Vec::new(),
            nil: Value::from_smi(0),
            object_store: Value::from_smi(0),
            pending_finalizers: Vec::new(),
            hash_state: seed_hash_state(),
            scavenge_count: 0,
            major_count: 0,
            options,
        };

        // Bootstrap nil: a slotless regular object carrying the first
        // regular cid. An image restore replaces it and the bootstrap
        // object is swept by the next major collection.
        let nil = heap.allocate_old(2 * BYTES_IN_WORD, FIRST_REGULAR_OBJECT_CID)?;
        heap.nil = nil.to_value();
        info!(
            "heap ready: {}k new-space semispaces, {}M old-space reservation",
            heap.options.semispace_size >> 10,
            heap.options.old_space_capacity >> 20
        );
        Ok(heap)
    }

    pub fn options(&self) -> &HeapOptions {
        &self.options
    }

    pub fn nil(&self) -> Value {
        self.nil
    }

    pub(crate) fn set_nil(&mut self, nil: Value) {
        debug_assert!(nil.is_heap_object());
        self.nil = nil;
    }

    pub fn object_store(&self) -> Value {
        self.object_store
    }

    pub fn set_object_store(&mut self, store: Value) {
        self.object_store = store;
    }

    pub fn scavenge_count(&self) -> usize {
        self.scavenge_count
    }

    pub fn major_count(&self) -> usize {
        self.major_count
    }

    // -----------------------------------------------------------------------
    // Allocation

    /// Allocate `bytes` (rounded up to the object alignment) with the given
    /// class id. Fast path bumps new space; on exhaustion a scavenge runs
    /// and the allocation is retried, falling back to old space. The object
    /// is zeroed except for its header.
    pub fn allocate(&mut self, bytes: usize, cid: ClassId) -> Result<HeapObject, HeapError> {
        debug_assert!(cid >= FIRST_LEGAL_CID);
        let size = allocation_size(bytes);
        if size >= self.options.large_object_size {
            return self.allocate_old(bytes, cid);
        }
        // The weak-list protocol recovers a weak array's size from its
        // header, so its size tag must not overflow.
        debug_assert!(cid != WEAK_ARRAY_CID || size <= SIZE_TAG_MAX);
        if let Some(addr) = self.active.try_allocate(size) {
            return Ok(HeapObject::initialize(addr, cid, size));
        }
        self.scavenge();
        if let Some(addr) = self.active.try_allocate(size) {
            return Ok(HeapObject::initialize(addr, cid, size));
        }
        self.allocate_old(bytes, cid)
    }

    /// Allocate directly in old space, bypassing new space. Used by the
    /// deserializer and for large objects.
    pub fn allocate_old(&mut self, bytes: usize, cid: ClassId) -> Result<HeapObject, HeapError> {
        debug_assert!(cid != ILLEGAL_CID);
        let size = allocation_size(bytes);
        debug_assert!(cid != WEAK_ARRAY_CID || size <= SIZE_TAG_MAX);
        if let Some(addr) = self.old.try_allocate(size) {
            return Ok(HeapObject::initialize(addr, cid, size));
        }
        self.collect(CollectionMode::Major);
        match self.old.try_allocate(size) {
            Some(addr) => Ok(HeapObject::initialize(addr, cid, size)),
            None => Err(HeapError::OutOfMemory),
        }
    }

    /// Old-space allocation that never collects. The deserializer builds a
    /// graph whose objects are unreachable until the roots are installed;
    /// a collection in that window would sweep them.
    pub(crate) fn allocate_old_no_gc(
        &mut self,
        bytes: usize,
        cid: ClassId,
    ) -> Result<HeapObject, HeapError> {
        debug_assert!(cid != ILLEGAL_CID);
        let size = allocation_size(bytes);
        match self.old.try_allocate(size) {
            Some(addr) => Ok(HeapObject::initialize(addr, cid, size)),
            None => Err(HeapError::OutOfMemory),
        }
    }

    // -----------------------------------------------------------------------
    // Typed allocation helpers. Arguments are rooted across the allocation,
    // so callers may pass values without re-fetching.

    pub fn new_regular_object(
        &mut self,
        cid: ClassId,
        num_slots: usize,
    ) -> Result<RegularObject, HeapError> {
        debug_assert!(cid >= FIRST_REGULAR_OBJECT_CID);
        let object = self.allocate((FIRST_FIELD_SLOT + num_slots) * BYTES_IN_WORD, cid)?;
        let regular = RegularObject::cast(object);
        let nil = self.nil;
        for i in 0..num_slots {
            regular.set_slot(i, nil);
        }
        Ok(regular)
    }

    pub fn new_array(&mut self, size: usize) -> Result<Array, HeapError> {
        let object = self.allocate((3 + size) * BYTES_IN_WORD, ARRAY_CID)?;
        let array = Array::cast(object);
        array.set_size(size);
        let nil = self.nil;
        for i in 0..size {
            array.set_element(i, nil);
        }
        Ok(array)
    }

    pub fn new_weak_array(&mut self, size: usize) -> Result<WeakArray, HeapError> {
        let object = self.allocate((3 + size) * BYTES_IN_WORD, WEAK_ARRAY_CID)?;
        let array = WeakArray::cast(object);
        array.set_size(size);
        let nil = self.nil;
        for i in 0..size {
            array.set_element(i, nil);
        }
        Ok(array)
    }

    pub fn new_byte_array(&mut self, bytes: &[u8]) -> Result<ByteArray, HeapError> {
        let object = self.allocate(3 * BYTES_IN_WORD + bytes.len(), BYTE_ARRAY_CID)?;
        let array = ByteArray::cast(object);
        array.set_size(bytes.len());
        for (i, b) in bytes.iter().enumerate() {
            array.set_element(i, *b);
        }
        Ok(array)
    }

    pub fn new_byte_string(&mut self, bytes: &[u8]) -> Result<ByteString, HeapError> {
        let object = self.allocate(4 * BYTES_IN_WORD + bytes.len(), BYTE_STRING_CID)?;
        let string = ByteString::cast(object);
        string.set_size(bytes.len());
        for (i, b) in bytes.iter().enumerate() {
            string.set_element(i, *b);
        }
        Ok(string)
    }

    pub fn new_wide_string(&mut self, code_points: &[u32]) -> Result<WideString, HeapError> {
        let object = self.allocate(4 * BYTES_IN_WORD + 4 * code_points.len(), WIDE_STRING_CID)?;
        let string = WideString::cast(object);
        string.set_size(code_points.len());
        for (i, c) in code_points.iter().enumerate() {
            string.set_element(i, *c);
        }
        Ok(string)
    }

    pub fn new_medium_integer(&mut self, value: i64) -> Result<MediumInteger, HeapError> {
        let object = self.allocate(2 * BYTES_IN_WORD + 8, MINT_CID)?;
        let mint = MediumInteger::cast(object);
        mint.set_value(value);
        Ok(mint)
    }

    pub fn new_float64(&mut self, value: f64) -> Result<Float64, HeapError> {
        let object = self.allocate(2 * BYTES_IN_WORD + 8, FLOAT64_CID)?;
        let float = Float64::cast(object);
        float.set_value(value);
        Ok(float)
    }

    pub fn new_large_integer(
        &mut self,
        negative: bool,
        digits: &[usize],
    ) -> Result<LargeInteger, HeapError> {
        let object = self.allocate((4 + digits.len()) * BYTES_IN_WORD, BIGINT_CID)?;
        let bigint = LargeInteger::cast(object);
        bigint.set_negative(negative);
        bigint.set_digit_count(digits.len());
        for (i, d) in digits.iter().enumerate() {
            bigint.set_digit(i, *d);
        }
        Ok(bigint)
    }

    pub fn new_ephemeron(
        &mut self,
        key: Value,
        value: Value,
        finalizer: Value,
    ) -> Result<Ephemeron, HeapError> {
        let key_handle = self.add_root(key)?;
        let value_handle = match self.add_root(value) {
            Ok(handle) => handle,
            Err(e) => {
                self.remove_root(key_handle);
                return Err(e);
            }
        };
        let finalizer_handle = match self.add_root(finalizer) {
            Ok(handle) => handle,
            Err(e) => {
                self.remove_root(value_handle);
                self.remove_root(key_handle);
                return Err(e);
            }
        };
        let result = self.allocate(5 * BYTES_IN_WORD, EPHEMERON_CID);
        let finalizer = self.remove_root(finalizer_handle);
        let value = self.remove_root(value_handle);
        let key = self.remove_root(key_handle);
        let ephemeron = Ephemeron::cast(result?);
        self.store_pointer(ephemeron.object(), ephemeron.key_address(), key);
        self.store_pointer(ephemeron.object(), ephemeron.value_address(), value);
        self.store_pointer(ephemeron.object(), ephemeron.finalizer_address(), finalizer);
        Ok(ephemeron)
    }

    pub fn new_activation(&mut self) -> Result<Activation, HeapError> {
        let object = self.allocate(
            (Activation::TEMPS_SLOT + Activation::MAX_TEMPS) * BYTES_IN_WORD,
            ACTIVATION_CID,
        )?;
        let activation = Activation::cast(object);
        let nil = self.nil;
        activation.set_sender(nil);
        activation.set_bci(Value::from_smi(0));
        activation.set_method(nil);
        activation.set_closure(nil);
        activation.set_receiver(nil);
        activation.set_stack_depth(0);
        Ok(activation)
    }

    pub fn new_closure(&mut self, num_copied: usize) -> Result<Closure, HeapError> {
        let object = self.allocate((6 + num_copied) * BYTES_IN_WORD, CLOSURE_CID)?;
        let closure = Closure::cast(object);
        closure.set_num_copied(num_copied);
        let nil = self.nil;
        closure.set_defining_activation(nil);
        closure.set_initial_bci(Value::from_smi(0));
        closure.set_num_args(Value::from_smi(0));
        for i in 0..num_copied {
            closure.set_copied(i, nil);
        }
        Ok(closure)
    }

    // -----------------------------------------------------------------------
    // Stores and the write barrier

    /// Store `value` into a slot of `object`, maintaining the remembered
    /// set. The predicate compiles to a single branch: old sources have a
    /// zero generation signature, new targets have both signature bits set.
    pub fn store_pointer(&mut self, object: HeapObject, slot: Address, value: Value) {
        debug_assert!(slot >= object.address() && slot < object.address() + object.heap_size());
        unsafe { slot.store::<Value>(value) };
        if object.address() & NEW_OBJECT_BITS == 0 && value.raw() & NEW_OBJECT_BITS == NEW_OBJECT_BITS
        {
            self.remember(object);
        }
    }

    pub(crate) fn remember(&mut self, object: HeapObject) {
        debug_assert!(object.is_old_object());
        if !object.is_remembered() {
            object.set_is_remembered(true);
            self.remembered.push(object);
        }
    }

    // -----------------------------------------------------------------------
    // Class table

    /// The Behavior registered for `cid`, or nil while the slot is vacant.
    pub fn class_at(&self, cid: ClassId) -> Value {
        match self.class_table.get(cid) {
            Some(entry) if entry.is_heap_object() => *entry,
            _ => self.nil,
        }
    }

    /// Assign the next free regular cid to `behavior`. Entries are weak: a
    /// collection vacates the slot of a dead class and recycles its cid.
    pub fn register_class(&mut self, behavior: Value) -> ClassId {
        debug_assert!(behavior.is_heap_object());
        let cid = match self.free_cids.pop() {
            Some(cid) => cid,
            None => {
                self.class_table.push(Value::from_smi(0));
                self.class_table.len() - 1
            }
        };
        self.class_table[cid] = behavior;
        trace!("registered class {:?} as cid {}", behavior, cid);
        cid
    }

    /// Install `behavior` at a specific cid; used when restoring an image.
    pub fn install_class(&mut self, cid: ClassId, behavior: Value) {
        debug_assert!(cid >= FIRST_LEGAL_CID);
        if self.class_table.len() <= cid {
            self.class_table.resize(cid + 1, Value::from_smi(0));
        }
        self.class_table[cid] = behavior;
    }

    /// The Behavior of any value: immediates through the class table's smi
    /// entry, heap objects through their header cid.
    pub fn class_of(&self, value: Value) -> Value {
        if value.is_smi() {
            self.class_at(SMI_CID)
        } else {
            self.class_at(value.heap_object().cid())
        }
    }

    /// The occupied class-table entries, for the serializer.
    pub(crate) fn class_table_snapshot(&self) -> Vec<(ClassId, Value)> {
        self.class_table
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_heap_object())
            .map(|(cid, entry)| (cid, *entry))
            .collect()
    }

    pub(crate) fn vacate_cid(&mut self, cid: ClassId) {
        self.class_table[cid] = Value::from_smi(0);
        if cid >= FIRST_REGULAR_OBJECT_CID {
            self.free_cids.push(cid);
        }
    }

    // -----------------------------------------------------------------------
    // Roots and handles

    /// Register an external variable slot as a root. The heap keeps the
    /// slot's referent alive and rewrites the slot when the referent moves.
    pub fn add_root(&mut self, value: Value) -> Result<RootHandle, HeapError> {
        let slot = match self.free_root_slots.pop() {
            Some(slot) => slot,
            None => {
                if self.roots.len() >= self.options.root_ceiling {
                    return Err(HeapError::RootOverflow);
                }
                self.roots.push(Value::from_smi(0));
                self.roots.len() - 1
            }
        };
        self.roots[slot] = value;
        Ok(RootHandle(slot))
    }

    /// Unregister a root and return its current (possibly moved) value.
    pub fn remove_root(&mut self, handle: RootHandle) -> Value {
        let value = self.roots[handle.0];
        self.roots[handle.0] = Value::from_smi(0);
        self.free_root_slots.push(handle.0);
        value
    }

    pub fn root(&self, handle: &RootHandle) -> Value {
        self.roots[handle.0]
    }

    pub fn set_root(&mut self, handle: &RootHandle, value: Value) {
        self.roots[handle.0] = value;
    }

    /// Open a stack-discipline scope; every root registered afterwards is
    /// released by the matching `close_handle_scope`.
    pub fn open_handle_scope(&self) -> HandleScope {
        HandleScope(self.roots.len())
    }

    pub fn close_handle_scope(&mut self, scope: HandleScope) {
        self.roots.truncate(scope.0);
        self.free_root_slots.retain(|&slot| slot < scope.0);
    }

    // -----------------------------------------------------------------------
    // Safe points and identity hashes

    /// Drain the finalizers queued by ephemeron mourning. The interpreter
    /// calls this on method return and backward branches and runs each
    /// finalizer as a surface-language closure.
    pub fn safepoint(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.pending_finalizers)
    }

    /// The identity hash of a value, assigning a heap object's lazily on
    /// first request. Stable across moves and collections.
    pub fn ensure_identity_hash(&mut self, value: Value) -> Value {
        if value.is_smi() {
            return value;
        }
        let object = value.heap_object();
        if object.identity_hash().raw() == 0 {
            let hash = self.next_hash();
            object.set_identity_hash(Value::from_smi(hash));
        }
        object.identity_hash()
    }

    /// Per-heap random mixed into string content hashes.
    pub fn string_hash_random(&self) -> isize {
        (self.hash_state >> 16) as isize & 0x3FFFFFF
    }

    fn next_hash(&mut self) -> isize {
        // xorshift64*; masked into positive smi range, never zero.
        loop {
            let mut x = self.hash_state;
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;
            self.hash_state = x;
            let hash = (x.wrapping_mul(0x2545F4914F6CDD1D) >> 32) as isize & 0x3FFFFFF;
            if hash != 0 {
                return hash;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Iteration and collection

    /// Visit every live object in both generations. Used by the serializer
    /// and the offline analyzer; the heap must be quiescent.
    pub fn walk<F: FnMut(HeapObject)>(&self, mut f: F) {
        self.active.walk(&mut f);
        self.old.walk(&mut f);
    }

    pub fn collect(&mut self, mode: CollectionMode) {
        match mode {
            CollectionMode::Scavenge => self.scavenge(),
            CollectionMode::Major => {
                self.scavenge();
                self.mark_sweep();
            }
        }
    }

    /// Bytes currently allocated in new space.
    pub fn new_space_used(&self) -> usize {
        self.active.used()
    }

    /// Bytes currently allocated in old space, free blocks included.
    pub fn old_space_used(&self) -> usize {
        self.old.used()
    }

    // -----------------------------------------------------------------------
    // Verification

    /// Walk the whole heap checking structural invariants: legal headers,
    /// flag discipline, generation alignment, no dangling from-space
    /// references, and remembered-bit soundness. Run after every collection
    /// under the `sanity` feature; always available to tests.
    pub fn verify(&self) {
        let mut check_object = |object: HeapObject| {
            assert_ne!(object.cid(), ILLEGAL_CID);
            assert!(!object.is_marked(), "{:?} marked outside a collection", object);
            assert_eq!(object.unused_header_bits(), 0);
            if object.is_new_object() {
                assert!(self.active.contains(object.address()));
                assert!(!object.is_remembered());
            }
            let mut holds_new = false;
            if let Some((from, to)) = object.pointers() {
                let mut slot = from;
                while slot <= to {
                    let value = unsafe { slot.load::<Value>() };
                    if value.is_heap_object() {
                        let target = value.heap_object();
                        assert!(
                            self.active.contains(target.address())
                                || self.old.contains(target.address()),
                            "{:?} slot {} points outside the heap",
                            object,
                            slot
                        );
                        assert!(!self.inactive.contains(target.address()));
                        assert!(!target.is_forwarding_corpse());
                        assert_eq!(value.is_new_object(), target.is_new_object());
                        holds_new |= value.is_new_object();
                    }
                    slot += BYTES_IN_WORD;
                }
            }
            if holds_new && object.is_old_object() {
                assert!(
                    object.is_remembered(),
                    "{:?} holds new-space references but is not remembered",
                    object
                );
            }
        };
        self.walk(&mut check_object);
    }
}

fn oom_address_space(e: std::io::Error) -> HeapError {
    warn!("address space reservation failed: {}", e);
    HeapError::OutOfAddressSpace
}

fn seed_hash_state() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(t) => t.as_nanos() as u64 | 1,
        Err(_) => 0x9E3779B97F4A7C15,
    }
}
