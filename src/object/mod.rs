//! Tagged values, object headers, class ids, and per-class object views.
//!
//! A [`Value`] is one machine word whose low bit selects between an
//! immediate small integer and a heap reference. A [`HeapObject`] is the
//! untagged base address of an object: word 0 is the header, word 1 the
//! identity-hash slot, fields follow. The views in this module
//! (`Array`, `Ephemeron`, `Activation`, ...) reinterpret a `HeapObject`
//! according to its class id; they are the single definition of object
//! layout that the collector, the snapshot codec, and the analyzer share.
//!
//! Accessors here trust their receiver: casting a view checks the class id
//! in debug builds only, and loads go straight through raw addresses. The
//! heap is responsible for only handing out views of live objects.

use std::fmt;

use crate::util::constants::*;
use crate::util::conversions::allocation_size;
use crate::util::Address;

/// A class identifier. Values below [`FIRST_REGULAR_OBJECT_CID`] denote
/// built-in layouts; everything above is a regular object whose class the
/// heap's class table resolves.
pub type ClassId = usize;

pub const ILLEGAL_CID: ClassId = 0;
pub const FORWARDING_CORPSE_CID: ClassId = 1;
pub const FIRST_LEGAL_CID: ClassId = 2;
pub const SMI_CID: ClassId = 2;
pub const MINT_CID: ClassId = 3;
pub const BIGINT_CID: ClassId = 4;
pub const FLOAT64_CID: ClassId = 5;
pub const BYTE_ARRAY_CID: ClassId = 6;
pub const BYTE_STRING_CID: ClassId = 7;
pub const WIDE_STRING_CID: ClassId = 8;
pub const ARRAY_CID: ClassId = 9;
pub const WEAK_ARRAY_CID: ClassId = 10;
pub const EPHEMERON_CID: ClassId = 11;
pub const ACTIVATION_CID: ClassId = 12;
pub const CLOSURE_CID: ClassId = 13;
pub const FIRST_REGULAR_OBJECT_CID: ClassId = 14;

/// Does a 64-bit integer fit in an immediate small integer on this word
/// size? The interpreter boxes into a medium integer when it does not.
pub const fn smi_fits(value: i64) -> bool {
    value >= SMI_MIN as i64 && value <= SMI_MAX as i64
}

// ---------------------------------------------------------------------------
// Header encoding

const fn bit(header: usize, index: usize) -> bool {
    header & (1 << index) != 0
}

const fn with_bit(header: usize, index: usize, value: bool) -> usize {
    if value {
        header | (1 << index)
    } else {
        header & !(1 << index)
    }
}

const fn field(header: usize, offset: usize, size: usize) -> usize {
    (header >> offset) & ((1 << size) - 1)
}

const fn with_field(header: usize, offset: usize, size: usize, value: usize) -> usize {
    let mask = ((1 << size) - 1) << offset;
    (header & !mask) | ((value << offset) & mask)
}

// ---------------------------------------------------------------------------
// Value

/// A tagged machine word: either an immediate small integer or a heap
/// reference. The tag is the low bit; see `util::constants`.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Value(usize);

impl Value {
    /// Reinterpret a raw word as a value.
    ///
    /// # Safety
    /// If the word carries the heap tag it must point at a live object.
    pub const unsafe fn from_raw(raw: usize) -> Value {
        Value(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    pub fn from_smi(value: isize) -> Value {
        debug_assert!(smi_fits(value as i64));
        Value((value << SMI_TAG_SHIFT) as usize)
    }

    pub fn smi_value(self) -> isize {
        debug_assert!(self.is_smi());
        (self.0 as isize) >> SMI_TAG_SHIFT
    }

    pub const fn is_smi(self) -> bool {
        self.0 & TAG_MASK == SMI_TAG
    }

    pub const fn is_heap_object(self) -> bool {
        self.0 & TAG_MASK == HEAP_OBJECT_TAG
    }

    pub fn heap_object(self) -> HeapObject {
        debug_assert!(self.is_heap_object());
        HeapObject(unsafe { Address::from_usize(self.0 - HEAP_OBJECT_TAG) })
    }

    pub fn is_new_object(self) -> bool {
        self.0 & NEW_OBJECT_BITS == NEW_OBJECT_BITS
    }

    pub fn is_old_object(self) -> bool {
        self.is_heap_object() && !self.is_new_object()
    }

    /// Like `!is_heap_object() || is_old_object()`, but a single branch.
    pub const fn is_immediate_or_old(self) -> bool {
        self.0 & NEW_OBJECT_BITS != NEW_OBJECT_BITS
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_smi() {
            write!(f, "smi({})", self.smi_value())
        } else {
            write!(f, "obj({:#x})", self.0 - HEAP_OBJECT_TAG)
        }
    }
}

// ---------------------------------------------------------------------------
// HeapObject

const HEADER_SLOT: usize = 0;
const HASH_SLOT: usize = 1;
/// First field slot of every object.
pub const FIRST_FIELD_SLOT: usize = 2;

/// The untagged base address of a heap object. All slot arithmetic is in
/// word-sized units from this base.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct HeapObject(Address);

impl HeapObject {
    pub fn from_address(addr: Address) -> HeapObject {
        debug_assert!(addr.is_aligned_to(BYTES_IN_WORD));
        HeapObject(addr)
    }

    pub fn address(self) -> Address {
        self.0
    }

    pub fn to_value(self) -> Value {
        Value(self.0.as_usize() | HEAP_OBJECT_TAG)
    }

    pub fn is_new_object(self) -> bool {
        self.0 & NEW_OBJECT_ALIGNMENT_OFFSET == NEW_OBJECT_ALIGNMENT_OFFSET
    }

    pub fn is_old_object(self) -> bool {
        !self.is_new_object()
    }

    /// Address of the `index`th word of the object.
    pub fn slot_address(self, index: usize) -> Address {
        self.0 + (index << LOG_BYTES_IN_WORD)
    }

    /// # Safety is delegated to the allocator: slots of a live object are
    /// always mapped.
    pub fn load_slot(self, index: usize) -> Value {
        unsafe { self.slot_address(index).load::<Value>() }
    }

    pub fn store_slot(self, index: usize, value: Value) {
        unsafe { self.slot_address(index).store::<Value>(value) }
    }

    fn header(self) -> usize {
        unsafe { self.slot_address(HEADER_SLOT).load::<usize>() }
    }

    fn set_header(self, header: usize) {
        unsafe { self.slot_address(HEADER_SLOT).store::<usize>(header) }
    }

    /// Write a fresh header for an object of `heap_size` aligned bytes and
    /// zero its identity-hash slot. Sizes beyond the size tag's range get a
    /// zero tag and must belong to a class the size is derivable from.
    pub fn initialize(addr: Address, cid: ClassId, heap_size: usize) -> HeapObject {
        debug_assert!(cid != ILLEGAL_CID);
        debug_assert!(heap_size & OBJECT_ALIGNMENT_MASK == 0);
        debug_assert!(heap_size > 0);
        let mut size_tag = heap_size >> LOG_OBJECT_ALIGNMENT;
        if size_tag >= 1 << SIZE_FIELD_SIZE {
            size_tag = 0;
            debug_assert!(cid < FIRST_REGULAR_OBJECT_CID);
        }
        let mut header = 0;
        header = with_field(header, SIZE_FIELD_OFFSET, SIZE_FIELD_SIZE, size_tag);
        header = with_field(header, CLASS_ID_FIELD_OFFSET, CLASS_ID_FIELD_SIZE, cid);
        let object = HeapObject::from_address(addr);
        object.set_header(header);
        object.store_slot(HASH_SLOT, Value::from_smi(0));
        debug_assert_eq!(object.cid(), cid);
        debug_assert!(!object.is_marked());
        object
    }

    pub fn cid(self) -> ClassId {
        field(self.header(), CLASS_ID_FIELD_OFFSET, CLASS_ID_FIELD_SIZE)
    }

    pub fn set_cid(self, cid: ClassId) {
        self.set_header(with_field(
            self.header(),
            CLASS_ID_FIELD_OFFSET,
            CLASS_ID_FIELD_SIZE,
            cid,
        ));
    }

    pub fn is_marked(self) -> bool {
        bit(self.header(), MARK_BIT)
    }

    pub fn set_is_marked(self, value: bool) {
        self.set_header(with_bit(self.header(), MARK_BIT, value));
    }

    pub fn is_remembered(self) -> bool {
        bit(self.header(), REMEMBERED_BIT)
    }

    pub fn set_is_remembered(self, value: bool) {
        self.set_header(with_bit(self.header(), REMEMBERED_BIT, value));
    }

    pub fn is_canonical(self) -> bool {
        bit(self.header(), CANONICAL_BIT)
    }

    pub fn set_is_canonical(self, value: bool) {
        self.set_header(with_bit(self.header(), CANONICAL_BIT, value));
    }

    /// The four carried-but-unused flag bits plus the reserved bit; always
    /// zero until the surface language grows semantics for them.
    pub fn unused_header_bits(self) -> usize {
        self.header()
            & ((1 << IN_CLASS_TABLE_BIT)
                | (1 << WATCHED_BIT)
                | (1 << SHALLOW_IMMUTABLE_BIT)
                | (1 << DEEP_IMMUTABLE_BIT)
                | (1 << HEADER_RESERVED_BIT))
    }

    /// Raw identity hash word; zero until lazily assigned by the heap.
    pub fn identity_hash(self) -> Value {
        self.load_slot(HASH_SLOT)
    }

    pub fn set_identity_hash(self, hash: Value) {
        self.store_slot(HASH_SLOT, hash);
    }

    /// Aligned size from the header's size tag, zero meaning "ask the
    /// class".
    fn size_from_tag(self) -> usize {
        field(self.header(), SIZE_FIELD_OFFSET, SIZE_FIELD_SIZE) << LOG_OBJECT_ALIGNMENT
    }

    /// The object's aligned size in bytes.
    pub fn heap_size(self) -> usize {
        let from_tag = self.size_from_tag();
        if from_tag != 0 {
            return from_tag;
        }
        self.size_from_class()
    }

    fn size_from_class(self) -> usize {
        let words = |n: usize| allocation_size(n << LOG_BYTES_IN_WORD);
        match self.cid() {
            FORWARDING_CORPSE_CID => ForwardingCorpse::cast(self).overflow_size(),
            MINT_CID | FLOAT64_CID => {
                allocation_size((FIRST_FIELD_SLOT << LOG_BYTES_IN_WORD) + 8)
            }
            BIGINT_CID => words(4 + LargeInteger::cast(self).digit_count()),
            BYTE_ARRAY_CID => {
                allocation_size((3 << LOG_BYTES_IN_WORD) + ByteArray::cast(self).size())
            }
            BYTE_STRING_CID => {
                allocation_size((4 << LOG_BYTES_IN_WORD) + ByteString::cast(self).size())
            }
            WIDE_STRING_CID => {
                allocation_size((4 << LOG_BYTES_IN_WORD) + 4 * WideString::cast(self).size())
            }
            ARRAY_CID => words(3 + Array::cast(self).size()),
            WEAK_ARRAY_CID => words(3 + WeakArray::cast(self).size()),
            EPHEMERON_CID => words(5),
            ACTIVATION_CID => words(8 + Activation::MAX_TEMPS),
            CLOSURE_CID => words(6 + Closure::cast(self).num_copied()),
            cid => unreachable!("size of cid {} is not derivable", cid),
        }
    }

    /// The inclusive range of reference-typed slot addresses, or `None`
    /// for raw payloads. This is the one pointer-visitation contract the
    /// scavenger, the marker, the serializer and the analyzer all use.
    /// Ephemeron slots are reported here but the collector only walks them
    /// in its fixed-point phase; activation temps beyond the stack depth
    /// are not reported.
    pub fn pointers(self) -> Option<(Address, Address)> {
        let first = |slot: usize| self.slot_address(slot);
        match self.cid() {
            FORWARDING_CORPSE_CID | MINT_CID | BIGINT_CID | FLOAT64_CID | BYTE_ARRAY_CID
            | BYTE_STRING_CID | WIDE_STRING_CID => None,
            ARRAY_CID | WEAK_ARRAY_CID => {
                let size = Array::cast_any_array(self).size();
                if size == 0 {
                    None
                } else {
                    Some((first(3), first(2 + size)))
                }
            }
            EPHEMERON_CID => Some((first(Ephemeron::KEY_SLOT), first(Ephemeron::FINALIZER_SLOT))),
            ACTIVATION_CID => {
                let depth = Activation::cast(self).stack_depth();
                Some((first(FIRST_FIELD_SLOT), first(7 + depth)))
            }
            CLOSURE_CID => {
                let copied = Closure::cast(self).num_copied();
                Some((first(FIRST_FIELD_SLOT), first(5 + copied)))
            }
            ILLEGAL_CID | SMI_CID => unreachable!("cid {} has no heap layout", self.cid()),
            _ => {
                let slots = self.heap_size() >> LOG_BYTES_IN_WORD;
                Some((first(FIRST_FIELD_SLOT), first(slots - 1)))
            }
        }
    }

    /// Overwrite this (from-space) object with a forwarding corpse naming
    /// its to-space survivor. The corpse keeps the original aligned size:
    /// in the header's size tag when it fits, in the overflow word
    /// otherwise.
    pub fn forward_to(self, target: HeapObject) {
        let size = self.heap_size();
        let had_size_tag = self.size_from_tag() != 0;
        self.set_cid(FORWARDING_CORPSE_CID);
        let corpse = ForwardingCorpse::cast(self);
        corpse.set_target(target.to_value());
        if !had_size_tag {
            corpse.set_overflow_size(size);
        }
    }

    pub fn is_forwarding_corpse(self) -> bool {
        self.cid() == FORWARDING_CORPSE_CID
    }

    pub fn forwarding_target(self) -> HeapObject {
        ForwardingCorpse::cast(self).target().heap_object()
    }
}

impl fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HeapObject({:#x}, cid {})", self.0, self.cid())
    }
}

// ---------------------------------------------------------------------------
// Views

macro_rules! object_view {
    ($(#[$meta:meta])* $name:ident, $cid:expr) => {
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq)]
        pub struct $name(HeapObject);

        impl $name {
            pub fn cast(object: HeapObject) -> $name {
                debug_assert_eq!(object.cid(), $cid);
                $name(object)
            }

            pub fn object(self) -> HeapObject {
                self.0
            }
        }
    };
}

object_view!(
    /// A dead from-space object overwritten with its survivor's address.
    ForwardingCorpse,
    FORWARDING_CORPSE_CID
);

impl ForwardingCorpse {
    const TARGET_SLOT: usize = 1;
    const OVERFLOW_SIZE_SLOT: usize = 2;

    pub fn target(self) -> Value {
        self.0.load_slot(Self::TARGET_SLOT)
    }

    pub fn set_target(self, target: Value) {
        self.0.store_slot(Self::TARGET_SLOT, target);
    }

    pub(crate) fn overflow_size(self) -> usize {
        unsafe { self.0.slot_address(Self::OVERFLOW_SIZE_SLOT).load::<usize>() }
    }

    pub(crate) fn set_overflow_size(self, size: usize) {
        unsafe { self.0.slot_address(Self::OVERFLOW_SIZE_SLOT).store::<usize>(size) }
    }
}

object_view!(
    /// Boxed 64-bit integer.
    MediumInteger,
    MINT_CID
);

impl MediumInteger {
    pub fn value(self) -> i64 {
        unsafe { self.0.slot_address(FIRST_FIELD_SLOT).load::<i64>() }
    }

    pub fn set_value(self, value: i64) {
        unsafe { self.0.slot_address(FIRST_FIELD_SLOT).store::<i64>(value) }
    }
}

object_view!(Float64, FLOAT64_CID);

impl Float64 {
    pub fn value(self) -> f64 {
        unsafe { self.0.slot_address(FIRST_FIELD_SLOT).load::<f64>() }
    }

    pub fn set_value(self, value: f64) {
        unsafe { self.0.slot_address(FIRST_FIELD_SLOT).store::<f64>(value) }
    }
}

object_view!(
    /// Arbitrary-precision integer: sign word, digit count, raw digits.
    LargeInteger,
    BIGINT_CID
);

impl LargeInteger {
    const NEGATIVE_SLOT: usize = 2;
    const DIGIT_COUNT_SLOT: usize = 3;
    const DIGITS_SLOT: usize = 4;

    pub fn negative(self) -> bool {
        unsafe { self.0.slot_address(Self::NEGATIVE_SLOT).load::<usize>() != 0 }
    }

    pub fn set_negative(self, negative: bool) {
        unsafe {
            self.0
                .slot_address(Self::NEGATIVE_SLOT)
                .store::<usize>(negative as usize)
        }
    }

    pub fn digit_count(self) -> usize {
        unsafe { self.0.slot_address(Self::DIGIT_COUNT_SLOT).load::<usize>() }
    }

    pub fn set_digit_count(self, count: usize) {
        unsafe { self.0.slot_address(Self::DIGIT_COUNT_SLOT).store::<usize>(count) }
    }

    pub fn digit(self, index: usize) -> usize {
        debug_assert!(index < self.digit_count());
        unsafe { self.0.slot_address(Self::DIGITS_SLOT + index).load::<usize>() }
    }

    pub fn set_digit(self, index: usize, digit: usize) {
        debug_assert!(index < self.digit_count());
        unsafe {
            self.0
                .slot_address(Self::DIGITS_SLOT + index)
                .store::<usize>(digit)
        }
    }
}

object_view!(Array, ARRAY_CID);

impl Array {
    pub const SIZE_SLOT: usize = 2;
    pub const ELEMENTS_SLOT: usize = 3;

    /// Weak arrays share the array layout; the collector reads both
    /// through this view when only the shape matters.
    fn cast_any_array(object: HeapObject) -> Array {
        debug_assert!(object.cid() == ARRAY_CID || object.cid() == WEAK_ARRAY_CID);
        Array(object)
    }

    pub fn size(self) -> usize {
        self.0.load_slot(Self::SIZE_SLOT).smi_value() as usize
    }

    pub fn set_size(self, size: usize) {
        self.0.store_slot(Self::SIZE_SLOT, Value::from_smi(size as isize));
    }

    pub fn element(self, index: usize) -> Value {
        debug_assert!(index < self.size());
        self.0.load_slot(Self::ELEMENTS_SLOT + index)
    }

    pub fn set_element(self, index: usize, value: Value) {
        debug_assert!(index < self.size());
        self.0.store_slot(Self::ELEMENTS_SLOT + index, value);
    }

    pub fn element_address(self, index: usize) -> Address {
        self.0.slot_address(Self::ELEMENTS_SLOT + index)
    }
}

object_view!(
    /// An array whose elements do not keep their targets alive. During a
    /// collection the size slot doubles as the link of the weak list; the
    /// size is recovered from the header's size tag afterwards.
    WeakArray,
    WEAK_ARRAY_CID
);

impl WeakArray {
    pub fn size(self) -> usize {
        self.0.load_slot(Array::SIZE_SLOT).smi_value() as usize
    }

    pub fn set_size(self, size: usize) {
        self.0
            .store_slot(Array::SIZE_SLOT, Value::from_smi(size as isize));
    }

    pub fn element(self, index: usize) -> Value {
        self.0.load_slot(Array::ELEMENTS_SLOT + index)
    }

    pub fn set_element(self, index: usize, value: Value) {
        self.0.store_slot(Array::ELEMENTS_SLOT + index, value);
    }

    pub fn element_address(self, index: usize) -> Address {
        self.0.slot_address(Array::ELEMENTS_SLOT + index)
    }

    /// The weak-list link, overloading the size slot.
    pub fn next(self) -> Value {
        self.0.load_slot(Array::SIZE_SLOT)
    }

    pub fn set_next(self, next: Value) {
        self.0.store_slot(Array::SIZE_SLOT, next);
    }

    /// Element count from the header size tag, valid while the size slot
    /// is overloaded as a list link.
    pub fn size_from_header(self) -> usize {
        (self.0.heap_size() >> LOG_BYTES_IN_WORD) - Array::ELEMENTS_SLOT
    }
}

object_view!(
    /// (key, value, finalizer), with value and finalizer live only while
    /// the key is reachable through some other path.
    Ephemeron,
    EPHEMERON_CID
);

impl Ephemeron {
    pub const KEY_SLOT: usize = 2;
    pub const VALUE_SLOT: usize = 3;
    pub const FINALIZER_SLOT: usize = 4;

    pub fn key(self) -> Value {
        self.0.load_slot(Self::KEY_SLOT)
    }

    pub fn set_key(self, key: Value) {
        self.0.store_slot(Self::KEY_SLOT, key);
    }

    pub fn value(self) -> Value {
        self.0.load_slot(Self::VALUE_SLOT)
    }

    pub fn set_value(self, value: Value) {
        self.0.store_slot(Self::VALUE_SLOT, value);
    }

    pub fn finalizer(self) -> Value {
        self.0.load_slot(Self::FINALIZER_SLOT)
    }

    pub fn set_finalizer(self, finalizer: Value) {
        self.0.store_slot(Self::FINALIZER_SLOT, finalizer);
    }

    pub fn key_address(self) -> Address {
        self.0.slot_address(Self::KEY_SLOT)
    }

    pub fn value_address(self) -> Address {
        self.0.slot_address(Self::VALUE_SLOT)
    }

    pub fn finalizer_address(self) -> Address {
        self.0.slot_address(Self::FINALIZER_SLOT)
    }
}

object_view!(ByteArray, BYTE_ARRAY_CID);

impl ByteArray {
    const SIZE_SLOT: usize = 2;
    const ELEMENTS_SLOT: usize = 3;

    pub fn size(self) -> usize {
        self.0.load_slot(Self::SIZE_SLOT).smi_value() as usize
    }

    pub fn set_size(self, size: usize) {
        self.0.store_slot(Self::SIZE_SLOT, Value::from_smi(size as isize));
    }

    pub fn element(self, index: usize) -> u8 {
        debug_assert!(index < self.size());
        unsafe { self.element_address(index).load::<u8>() }
    }

    pub fn set_element(self, index: usize, value: u8) {
        debug_assert!(index < self.size());
        unsafe { self.element_address(index).store::<u8>(value) }
    }

    pub fn element_address(self, index: usize) -> Address {
        self.0.slot_address(Self::ELEMENTS_SLOT) + index
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.element_address(0).to_ptr::<u8>(), self.size()) }
    }
}

object_view!(
    /// 8-bit string with a cached content hash.
    ByteString,
    BYTE_STRING_CID
);

impl ByteString {
    const SIZE_SLOT: usize = 2;
    const HASH_SLOT: usize = 3;
    const ELEMENTS_SLOT: usize = 4;

    pub fn size(self) -> usize {
        self.0.load_slot(Self::SIZE_SLOT).smi_value() as usize
    }

    pub fn set_size(self, size: usize) {
        self.0.store_slot(Self::SIZE_SLOT, Value::from_smi(size as isize));
    }

    pub fn hash(self) -> Value {
        self.0.load_slot(Self::HASH_SLOT)
    }

    pub fn set_hash(self, hash: Value) {
        self.0.store_slot(Self::HASH_SLOT, hash);
    }

    /// FNV-1a over the elements, mixed with the heap's per-run random and
    /// masked into positive smi range; cached, never zero once computed.
    pub fn ensure_hash(self, hash_random: isize) -> Value {
        if self.hash().raw() == 0 {
            let mut h = self.size() as isize + 1;
            for i in 0..self.size() {
                h ^= self.element(i) as isize;
                h = h.wrapping_mul(16777619);
            }
            h ^= hash_random;
            h &= 0x3FFFFFF;
            if h == 0 {
                h = 1;
            }
            self.set_hash(Value::from_smi(h));
        }
        self.hash()
    }

    pub fn element(self, index: usize) -> u8 {
        debug_assert!(index < self.size());
        unsafe { self.element_address(index).load::<u8>() }
    }

    pub fn set_element(self, index: usize, value: u8) {
        debug_assert!(index < self.size());
        unsafe { self.element_address(index).store::<u8>(value) }
    }

    pub fn element_address(self, index: usize) -> Address {
        self.0.slot_address(Self::ELEMENTS_SLOT) + index
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.element_address(0).to_ptr::<u8>(), self.size()) }
    }
}

object_view!(
    /// 32-bit-codepoint string with a cached content hash.
    WideString,
    WIDE_STRING_CID
);

impl WideString {
    const SIZE_SLOT: usize = 2;
    const HASH_SLOT: usize = 3;
    const ELEMENTS_SLOT: usize = 4;

    pub fn size(self) -> usize {
        self.0.load_slot(Self::SIZE_SLOT).smi_value() as usize
    }

    pub fn set_size(self, size: usize) {
        self.0.store_slot(Self::SIZE_SLOT, Value::from_smi(size as isize));
    }

    pub fn hash(self) -> Value {
        self.0.load_slot(Self::HASH_SLOT)
    }

    pub fn set_hash(self, hash: Value) {
        self.0.store_slot(Self::HASH_SLOT, hash);
    }

    pub fn ensure_hash(self, hash_random: isize) -> Value {
        if self.hash().raw() == 0 {
            let mut h = self.size() as isize + 1;
            for i in 0..self.size() {
                h ^= self.element(i) as isize;
                h = h.wrapping_mul(16777619);
            }
            h ^= hash_random;
            h &= 0x3FFFFFF;
            if h == 0 {
                h = 1;
            }
            self.set_hash(Value::from_smi(h));
        }
        self.hash()
    }

    pub fn element(self, index: usize) -> u32 {
        debug_assert!(index < self.size());
        unsafe { self.element_address(index).load::<u32>() }
    }

    pub fn set_element(self, index: usize, value: u32) {
        debug_assert!(index < self.size());
        unsafe { self.element_address(index).store::<u32>(value) }
    }

    pub fn element_address(self, index: usize) -> Address {
        self.0.slot_address(Self::ELEMENTS_SLOT) + 4 * index
    }

    pub fn as_code_points(&self) -> &[u32] {
        unsafe { std::slice::from_raw_parts(self.element_address(0).to_ptr::<u32>(), self.size()) }
    }
}

object_view!(
    /// On-heap call frame: sender, bci, method, closure, receiver, stack
    /// depth, and a fixed-capacity operand/temp buffer.
    Activation,
    ACTIVATION_CID
);

impl Activation {
    pub const MAX_TEMPS: usize = 35;

    pub const SENDER_SLOT: usize = 2;
    pub const BCI_SLOT: usize = 3;
    pub const METHOD_SLOT: usize = 4;
    pub const CLOSURE_SLOT: usize = 5;
    pub const RECEIVER_SLOT: usize = 6;
    pub const STACK_DEPTH_SLOT: usize = 7;
    pub const TEMPS_SLOT: usize = 8;

    pub fn sender(self) -> Value {
        self.0.load_slot(Self::SENDER_SLOT)
    }

    pub fn set_sender(self, sender: Value) {
        self.0.store_slot(Self::SENDER_SLOT, sender);
    }

    pub fn bci(self) -> Value {
        self.0.load_slot(Self::BCI_SLOT)
    }

    pub fn set_bci(self, bci: Value) {
        self.0.store_slot(Self::BCI_SLOT, bci);
    }

    pub fn method(self) -> Value {
        self.0.load_slot(Self::METHOD_SLOT)
    }

    pub fn set_method(self, method: Value) {
        self.0.store_slot(Self::METHOD_SLOT, method);
    }

    pub fn closure(self) -> Value {
        self.0.load_slot(Self::CLOSURE_SLOT)
    }

    pub fn set_closure(self, closure: Value) {
        self.0.store_slot(Self::CLOSURE_SLOT, closure);
    }

    pub fn receiver(self) -> Value {
        self.0.load_slot(Self::RECEIVER_SLOT)
    }

    pub fn set_receiver(self, receiver: Value) {
        self.0.store_slot(Self::RECEIVER_SLOT, receiver);
    }

    pub fn stack_depth(self) -> usize {
        self.0.load_slot(Self::STACK_DEPTH_SLOT).smi_value() as usize
    }

    pub fn set_stack_depth(self, depth: usize) {
        debug_assert!(depth <= Self::MAX_TEMPS);
        self.0
            .store_slot(Self::STACK_DEPTH_SLOT, Value::from_smi(depth as isize));
    }

    pub fn temp(self, index: usize) -> Value {
        debug_assert!(index < self.stack_depth());
        self.0.load_slot(Self::TEMPS_SLOT + index)
    }

    pub fn set_temp(self, index: usize, value: Value) {
        debug_assert!(index < Self::MAX_TEMPS);
        self.0.store_slot(Self::TEMPS_SLOT + index, value);
    }
}

object_view!(
    /// A block closure: defining activation, initial bci, argument count,
    /// and the values copied out of the defining scope.
    Closure,
    CLOSURE_CID
);

impl Closure {
    pub const NUM_COPIED_SLOT: usize = 2;
    pub const DEFINING_ACTIVATION_SLOT: usize = 3;
    pub const INITIAL_BCI_SLOT: usize = 4;
    pub const NUM_ARGS_SLOT: usize = 5;
    pub const COPIED_SLOT: usize = 6;

    pub fn num_copied(self) -> usize {
        self.0.load_slot(Self::NUM_COPIED_SLOT).smi_value() as usize
    }

    pub fn set_num_copied(self, count: usize) {
        self.0
            .store_slot(Self::NUM_COPIED_SLOT, Value::from_smi(count as isize));
    }

    pub fn defining_activation(self) -> Value {
        self.0.load_slot(Self::DEFINING_ACTIVATION_SLOT)
    }

    pub fn set_defining_activation(self, activation: Value) {
        self.0.store_slot(Self::DEFINING_ACTIVATION_SLOT, activation);
    }

    pub fn initial_bci(self) -> Value {
        self.0.load_slot(Self::INITIAL_BCI_SLOT)
    }

    pub fn set_initial_bci(self, bci: Value) {
        self.0.store_slot(Self::INITIAL_BCI_SLOT, bci);
    }

    pub fn num_args(self) -> Value {
        self.0.load_slot(Self::NUM_ARGS_SLOT)
    }

    pub fn set_num_args(self, num_args: Value) {
        self.0.store_slot(Self::NUM_ARGS_SLOT, num_args);
    }

    pub fn copied(self, index: usize) -> Value {
        debug_assert!(index < self.num_copied());
        self.0.load_slot(Self::COPIED_SLOT + index)
    }

    pub fn set_copied(self, index: usize, value: Value) {
        debug_assert!(index < self.num_copied());
        self.0.store_slot(Self::COPIED_SLOT + index, value);
    }
}

/// A user-defined object: a header plus `heap_size / word - 2` reference
/// slots.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct RegularObject(HeapObject);

impl RegularObject {
    pub fn cast(object: HeapObject) -> RegularObject {
        debug_assert!(object.cid() >= FIRST_REGULAR_OBJECT_CID);
        RegularObject(object)
    }

    pub fn object(self) -> HeapObject {
        self.0
    }

    pub fn num_slots(self) -> usize {
        (self.0.heap_size() >> LOG_BYTES_IN_WORD) - FIRST_FIELD_SLOT
    }

    pub fn slot(self, index: usize) -> Value {
        debug_assert!(index < self.num_slots());
        self.0.load_slot(FIRST_FIELD_SLOT + index)
    }

    pub fn set_slot(self, index: usize, value: Value) {
        debug_assert!(index < self.num_slots());
        self.0.store_slot(FIRST_FIELD_SLOT + index, value);
    }
}

// Regular objects with slot offsets known to the runtime schema. These are
// ordinary regular objects; the views below just name the slots the heap,
// the snapshot codec, and the analyzer reach into.

/// A class or metaclass. Slot order is fixed by the surface language's
/// runtime schema.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Behavior(RegularObject);

impl Behavior {
    pub const SUPERCLASS_SLOT: usize = 0;
    pub const METHODS_SLOT: usize = 1;
    pub const ENCLOSING_OBJECT_SLOT: usize = 2;
    pub const MIXIN_SLOT: usize = 3;
    pub const CLASS_ID_SLOT: usize = 4;
    pub const FORMAT_SLOT: usize = 5;
    /// `name` for a class, `this_class` for a metaclass.
    pub const NAME_SLOT: usize = 6;

    pub fn cast(object: HeapObject) -> Behavior {
        Behavior(RegularObject::cast(object))
    }

    pub fn object(self) -> HeapObject {
        self.0.object()
    }

    pub fn superclass(self) -> Value {
        self.0.slot(Self::SUPERCLASS_SLOT)
    }

    pub fn methods(self) -> Value {
        self.0.slot(Self::METHODS_SLOT)
    }

    pub fn id(self) -> Value {
        self.0.slot(Self::CLASS_ID_SLOT)
    }

    pub fn set_id(self, id: Value) {
        self.0.set_slot(Self::CLASS_ID_SLOT, id);
    }

    pub fn format(self) -> Value {
        self.0.slot(Self::FORMAT_SLOT)
    }

    /// The name slot if this behavior has one ('Class' layout).
    pub fn name(self) -> Option<Value> {
        if self.0.num_slots() > Self::NAME_SLOT {
            Some(self.0.slot(Self::NAME_SLOT))
        } else {
            None
        }
    }
}

/// The distinguished root object naming the well-known singletons and the
/// built-in behaviors.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ObjectStore(RegularObject);

impl ObjectStore {
    pub const ARRAY_SIZE_SLOT: usize = 0;
    pub const NIL_SLOT: usize = 1;
    pub const FALSE_SLOT: usize = 2;
    pub const TRUE_SLOT: usize = 3;
    pub const SCHEDULER_SLOT: usize = 4;

    pub fn cast(object: HeapObject) -> ObjectStore {
        ObjectStore(RegularObject::cast(object))
    }

    pub fn object(self) -> HeapObject {
        self.0.object()
    }

    pub fn nil_obj(self) -> Value {
        self.0.slot(Self::NIL_SLOT)
    }

    pub fn false_obj(self) -> Value {
        self.0.slot(Self::FALSE_SLOT)
    }

    pub fn true_obj(self) -> Value {
        self.0.slot(Self::TRUE_SLOT)
    }

    pub fn scheduler(self) -> Value {
        self.0.slot(Self::SCHEDULER_SLOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::*;

    #[test]
    fn tag_is_unambiguous() {
        for raw in [0usize, 1, 2, 0x1000, 0x1001, usize::MAX] {
            let value = unsafe { Value::from_raw(raw) };
            assert_ne!(value.is_smi(), value.is_heap_object());
        }
    }

    #[test]
    fn smi_round_trip() {
        for i in [0isize, 1, -1, 42, -42, SMI_MAX, SMI_MIN] {
            assert_eq!(Value::from_smi(i).smi_value(), i);
        }
    }

    #[test]
    fn smi_fits_range() {
        assert!(smi_fits(0));
        assert!(smi_fits(SMI_MAX as i64));
        assert!(smi_fits(SMI_MIN as i64));
        assert!(!smi_fits(SMI_MAX as i64 + 1));
        assert!(!smi_fits(SMI_MIN as i64 - 1));
    }

    #[test]
    fn immediate_or_old_is_single_branch() {
        // The fast path depends on the tag sitting in bit zero and the
        // generation offset being exactly one word.
        assert_eq!(HEAP_OBJECT_TAG, 1);
        assert_eq!(NEW_OBJECT_ALIGNMENT_OFFSET, BYTES_IN_WORD);
        let smi = Value::from_smi(7);
        assert!(smi.is_immediate_or_old());
        let old = unsafe { Value::from_raw(0x10000 | HEAP_OBJECT_TAG) };
        assert!(old.is_immediate_or_old());
        assert!(old.is_old_object());
        let new = unsafe { Value::from_raw((0x10000 + BYTES_IN_WORD) | HEAP_OBJECT_TAG) };
        assert!(!new.is_immediate_or_old());
        assert!(new.is_new_object());
    }

    #[repr(align(16))]
    struct AlignedBuffer([u8; 1024]);

    fn buffer_object(buf: &mut AlignedBuffer, cid: ClassId, heap_size: usize) -> HeapObject {
        let base = Address::from_mut_ptr(buf.0.as_mut_ptr());
        assert!(base.is_aligned_to(OBJECT_ALIGNMENT));
        HeapObject::initialize(base, cid, heap_size)
    }

    #[test]
    fn header_round_trip() {
        let mut buf = AlignedBuffer([0; 1024]);
        let obj = buffer_object(&mut buf, FIRST_REGULAR_OBJECT_CID, 4 * OBJECT_ALIGNMENT);
        assert_eq!(obj.cid(), FIRST_REGULAR_OBJECT_CID);
        assert_eq!(obj.heap_size(), 4 * OBJECT_ALIGNMENT);
        assert!(!obj.is_marked());
        assert!(!obj.is_remembered());
        assert!(!obj.is_canonical());
        obj.set_is_marked(true);
        obj.set_is_canonical(true);
        assert!(obj.is_marked());
        assert!(obj.is_canonical());
        assert_eq!(obj.cid(), FIRST_REGULAR_OBJECT_CID);
        assert_eq!(obj.heap_size(), 4 * OBJECT_ALIGNMENT);
        obj.set_is_marked(false);
        assert!(!obj.is_marked());
        assert_eq!(obj.unused_header_bits(), 0);
    }

    #[test]
    fn regular_object_pointers() {
        let mut buf = AlignedBuffer([0; 1024]);
        let obj = buffer_object(&mut buf, FIRST_REGULAR_OBJECT_CID, 4 * OBJECT_ALIGNMENT);
        let (from, to) = obj.pointers().unwrap();
        assert_eq!(from, obj.slot_address(2));
        // 8 words total on 64-bit; last slot is word 7.
        let slots = obj.heap_size() / BYTES_IN_WORD;
        assert_eq!(to, obj.slot_address(slots - 1));
    }

    #[test]
    fn array_pointers_cover_elements_only() {
        let mut buf = AlignedBuffer([0; 1024]);
        let size = crate::util::conversions::allocation_size((3 + 5) * BYTES_IN_WORD);
        let obj = buffer_object(&mut buf, ARRAY_CID, size);
        let array = Array::cast(obj);
        array.set_size(5);
        let (from, to) = obj.pointers().unwrap();
        assert_eq!(from, array.element_address(0));
        assert_eq!(to, array.element_address(4));
    }

    #[test]
    fn empty_array_has_no_pointers() {
        let mut buf = AlignedBuffer([0; 1024]);
        let size = crate::util::conversions::allocation_size(3 * BYTES_IN_WORD);
        let obj = buffer_object(&mut buf, ARRAY_CID, size);
        Array::cast(obj).set_size(0);
        assert!(obj.pointers().is_none());
    }

    #[test]
    fn byte_array_is_raw() {
        let mut buf = AlignedBuffer([0; 1024]);
        let size = crate::util::conversions::allocation_size(3 * BYTES_IN_WORD + 10);
        let obj = buffer_object(&mut buf, BYTE_ARRAY_CID, size);
        let bytes = ByteArray::cast(obj);
        bytes.set_size(10);
        assert!(obj.pointers().is_none());
        bytes.set_element(3, 0xCD);
        assert_eq!(bytes.element(3), 0xCD);
        assert_eq!(bytes.as_bytes()[3], 0xCD);
    }

    #[test]
    fn activation_pointers_track_stack_depth() {
        let mut buf = AlignedBuffer([0; 1024]);
        let size = crate::util::conversions::allocation_size(
            (Activation::TEMPS_SLOT + Activation::MAX_TEMPS) * BYTES_IN_WORD,
        );
        let obj = buffer_object(&mut buf, ACTIVATION_CID, size);
        let activation = Activation::cast(obj);
        activation.set_stack_depth(0);
        let (_, to) = obj.pointers().unwrap();
        assert_eq!(to, obj.slot_address(Activation::STACK_DEPTH_SLOT));
        activation.set_stack_depth(3);
        let (_, to) = obj.pointers().unwrap();
        assert_eq!(to, obj.slot_address(Activation::TEMPS_SLOT + 2));
    }

    #[test]
    fn forwarding_preserves_size() {
        let mut buf = AlignedBuffer([0; 1024]);
        let size = 4 * OBJECT_ALIGNMENT;
        let obj = buffer_object(&mut buf, FIRST_REGULAR_OBJECT_CID, size);
        let mut target_buf = AlignedBuffer([0; 1024]);
        let target = buffer_object(&mut target_buf, FIRST_REGULAR_OBJECT_CID, size);
        obj.forward_to(target);
        assert!(obj.is_forwarding_corpse());
        assert_eq!(obj.forwarding_target(), target);
        assert_eq!(obj.heap_size(), size);
    }

    #[test]
    fn string_hash_is_stable_and_nonzero() {
        let mut buf = AlignedBuffer([0; 1024]);
        let size = crate::util::conversions::allocation_size(4 * BYTES_IN_WORD + 5);
        let obj = buffer_object(&mut buf, BYTE_STRING_CID, size);
        let string = ByteString::cast(obj);
        string.set_size(5);
        for (i, b) in b"hello".iter().enumerate() {
            string.set_element(i, *b);
        }
        let h1 = string.ensure_hash(0x1234);
        let h2 = string.ensure_hash(0x9999); // cached, random ignored
        assert_eq!(h1, h2);
        assert!(h1.smi_value() > 0);
    }
}
