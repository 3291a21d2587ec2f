//! The snapshot (de)serializer: a self-describing byte image that rebuilds
//! an object graph into old space.
//!
//! Layout: a 16-byte preamble (magic, version, word size, endianness,
//! object count), the root indices, a sequence of clusters, the class-table
//! section, and a trailing CRC-32. Each cluster names a class id and
//! carries per-object shape/payload followed by per-object slot values.
//! Slot values are varints: even values are object-table indices (index 0
//! is nil), odd values are zigzag-coded small integers. Indices are
//! assigned in emission order starting at 1.
//!
//! Deserialization is two passes over the byte slice: pass one validates
//! the envelope and allocates every object into old space so indices
//! resolve to stable addresses; pass two fills slots and installs the
//! class table and roots. No heap is published unless the whole image
//! parses.

use std::collections::HashMap;
use std::collections::VecDeque;

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};

use crate::heap::{CollectionMode, Heap, HeapError};
use crate::object::*;
use crate::util::constants::*;
use crate::util::options::HeapOptions;

const MAGIC: &[u8; 4] = b"SMLT";
const VERSION_MAJOR: u8 = 1;
const VERSION_MINOR: u8 = 0;
const PREAMBLE_SIZE: usize = 16;
const CRC_SIZE: usize = 4;

/// Guard against nonsense element counts before they reach the allocator.
const MAX_ELEMENTS: u64 = 1 << 40;

/// Everything that can be wrong with an image. Any of these aborts
/// deserialization with no live heap published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotError {
    TruncatedStream,
    BadMagic,
    VersionMismatch,
    WordSizeMismatch,
    UnexpectedEndianness,
    UnknownCid(ClassId),
    IndexOutOfRange(u64),
    ChecksumMismatch,
    MalformedCluster,
    /// The target heap could not hold the image.
    HeapExhausted(HeapError),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SnapshotError::TruncatedStream => write!(f, "truncated stream"),
            SnapshotError::BadMagic => write!(f, "bad magic"),
            SnapshotError::VersionMismatch => write!(f, "unsupported snapshot version"),
            SnapshotError::WordSizeMismatch => write!(f, "word size does not match this host"),
            SnapshotError::UnexpectedEndianness => write!(f, "unrecognized endianness flag"),
            SnapshotError::UnknownCid(cid) => write!(f, "unknown class id {}", cid),
            SnapshotError::IndexOutOfRange(index) => {
                write!(f, "object index {} out of range", index)
            }
            SnapshotError::ChecksumMismatch => write!(f, "checksum mismatch"),
            SnapshotError::MalformedCluster => write!(f, "malformed cluster"),
            SnapshotError::HeapExhausted(e) => write!(f, "heap exhausted: {}", e),
        }
    }
}

impl std::error::Error for SnapshotError {}

// ---------------------------------------------------------------------------
// CRC-32 (IEEE)

lazy_static! {
    static ref CRC_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut crc = i as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
            }
            *entry = crc;
        }
        table
    };
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = !0u32;
    for b in bytes {
        crc = (crc >> 8) ^ CRC_TABLE[((crc ^ *b as u32) & 0xFF) as usize];
    }
    !crc
}

// ---------------------------------------------------------------------------
// Varints and slot coding

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn zigzag_encode(value: isize) -> u64 {
    ((value << 1) ^ (value >> (BITS_IN_WORD - 1))) as u64
}

fn zigzag_decode(value: u64) -> isize {
    ((value >> 1) as isize) ^ -((value & 1) as isize)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    big_endian: bool,
}

impl<'a> Reader<'a> {
    fn read_u8(&mut self) -> Result<u8, SnapshotError> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or(SnapshotError::TruncatedStream)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        if self.pos + len > self.bytes.len() {
            return Err(SnapshotError::TruncatedStream);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, SnapshotError> {
        let slice = self.read_bytes(4)?;
        Ok(if self.big_endian {
            BigEndian::read_u32(slice)
        } else {
            LittleEndian::read_u32(slice)
        })
    }

    fn read_u64(&mut self) -> Result<u64, SnapshotError> {
        let slice = self.read_bytes(8)?;
        Ok(if self.big_endian {
            BigEndian::read_u64(slice)
        } else {
            LittleEndian::read_u64(slice)
        })
    }

    fn read_varint(&mut self) -> Result<u64, SnapshotError> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(SnapshotError::MalformedCluster);
            }
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_count(&mut self) -> Result<usize, SnapshotError> {
        let value = self.read_varint()?;
        if value > MAX_ELEMENTS {
            return Err(SnapshotError::MalformedCluster);
        }
        Ok(value as usize)
    }
}

// ---------------------------------------------------------------------------
// Serialization

/// Serialize the live graph reachable from nil and the object store.
/// Canonical strings are emitted once, deduplicated by content; every
/// serialized object's class is serialized with it and recorded in the
/// class-table section.
pub fn serialize(heap: &Heap) -> Vec<u8> {
    let mut graph = GraphIndex::discover(heap);
    let clusters = graph.clusters();
    let object_count: u64 = clusters.iter().map(|(_, objects)| objects.len() as u64).sum();
    graph.assign_indices(&clusters);

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(VERSION_MAJOR);
    out.push(VERSION_MINOR);
    out.push(BYTES_IN_WORD as u8);
    out.push(0); // little endian
    out.write_u64::<LittleEndian>(object_count).unwrap();
    write_varint(&mut out, graph.index_of_value(heap.object_store()));
    write_varint(&mut out, graph.index_of_value(heap.nil()));

    for (cid, objects) in &clusters {
        write_varint(&mut out, *cid as u64);
        write_varint(&mut out, objects.len() as u64);
        for object in objects {
            emit_shape(&mut out, *cid, *object);
        }
        for object in objects {
            for value in slot_values(*cid, *object) {
                write_varint(&mut out, graph.encode_slot(value));
            }
        }
    }

    // Class-table section: one entry per regular cluster cid; index 0
    // stands in for a class the heap has no Behavior for.
    let registered: HashMap<ClassId, Value> = heap.class_table_snapshot().into_iter().collect();
    let regular_cids: Vec<ClassId> = clusters
        .iter()
        .map(|(cid, _)| *cid)
        .filter(|cid| *cid >= FIRST_REGULAR_OBJECT_CID)
        .collect();
    write_varint(&mut out, regular_cids.len() as u64);
    for cid in regular_cids {
        write_varint(&mut out, cid as u64);
        let index = registered
            .get(&cid)
            .map_or(0, |behavior| graph.index_of_value(*behavior));
        write_varint(&mut out, index);
    }

    let crc = crc32(&out);
    out.write_u32::<LittleEndian>(crc).unwrap();
    debug!(
        "serialized {} objects in {} clusters, {} bytes",
        object_count,
        clusters.len(),
        out.len()
    );
    out
}

/// Discovery state: the reachable set, canonical-string aliases, and the
/// emission-order index of every representative.
struct GraphIndex {
    order: Vec<HeapObject>,
    /// address -> representative address (identity for most objects).
    aliases: HashMap<usize, usize>,
    indices: HashMap<usize, u64>,
    nil_address: usize,
}

impl GraphIndex {
    fn discover(heap: &Heap) -> GraphIndex {
        let mut graph = GraphIndex {
            order: Vec::new(),
            aliases: HashMap::new(),
            indices: HashMap::new(),
            nil_address: heap.nil().heap_object().address().as_usize(),
        };
        let mut canonical: HashMap<(ClassId, Vec<u8>), usize> = HashMap::new();
        let mut queue = VecDeque::new();
        let mut enqueue = |graph: &mut GraphIndex,
                           queue: &mut VecDeque<HeapObject>,
                           value: Value| {
            if !value.is_heap_object() {
                return;
            }
            let object = value.heap_object();
            let addr = object.address().as_usize();
            if graph.aliases.contains_key(&addr) {
                return;
            }
            // Canonical strings with identical content collapse onto their
            // first-seen representative.
            if object.is_canonical()
                && (object.cid() == BYTE_STRING_CID || object.cid() == WIDE_STRING_CID)
            {
                let content = string_content(object);
                let key = (object.cid(), content);
                if let Some(rep) = canonical.get(&key) {
                    graph.aliases.insert(addr, *rep);
                    return;
                }
                canonical.insert(key, addr);
            }
            graph.aliases.insert(addr, addr);
            graph.order.push(object);
            queue.push_back(object);
        };

        enqueue(&mut graph, &mut queue, heap.nil());
        enqueue(&mut graph, &mut queue, heap.object_store());
        while let Some(object) = queue.pop_front() {
            enqueue(&mut graph, &mut queue, heap.class_of(object.to_value()));
            if let Some((from, to)) = object.pointers() {
                let mut slot = from;
                while slot <= to {
                    let value = unsafe { slot.load::<Value>() };
                    enqueue(&mut graph, &mut queue, value);
                    slot += BYTES_IN_WORD;
                }
            }
        }
        graph
    }

    /// Partition the discovered set: built-in cids ascending, then regular
    /// cids in first-encounter order.
    fn clusters(&self) -> Vec<(ClassId, Vec<HeapObject>)> {
        let mut by_cid: HashMap<ClassId, Vec<HeapObject>> = HashMap::new();
        let mut regular_order = Vec::new();
        for object in &self.order {
            let cid = object.cid();
            if cid >= FIRST_REGULAR_OBJECT_CID && !by_cid.contains_key(&cid) {
                regular_order.push(cid);
            }
            by_cid.entry(cid).or_default().push(*object);
        }
        let mut clusters = Vec::new();
        for cid in FIRST_LEGAL_CID..FIRST_REGULAR_OBJECT_CID {
            if let Some(objects) = by_cid.remove(&cid) {
                clusters.push((cid, objects));
            }
        }
        for cid in regular_order {
            if let Some(objects) = by_cid.remove(&cid) {
                clusters.push((cid, objects));
            }
        }
        clusters
    }

    fn assign_indices(&mut self, clusters: &[(ClassId, Vec<HeapObject>)]) {
        let mut next = 1u64;
        for (_, objects) in clusters {
            for object in objects {
                self.indices.insert(object.address().as_usize(), next);
                next += 1;
            }
        }
    }

    fn index_of(&self, object: HeapObject) -> u64 {
        let addr = object.address().as_usize();
        let rep = *self.aliases.get(&addr).expect("unindexed object");
        self.indices[&rep]
    }

    fn index_of_value(&self, value: Value) -> u64 {
        if value.is_heap_object() {
            self.index_of(value.heap_object())
        } else {
            0
        }
    }

    fn encode_slot(&self, value: Value) -> u64 {
        if value.is_smi() {
            (zigzag_encode(value.smi_value()) << 1) | 1
        } else {
            let object = value.heap_object();
            if object.address().as_usize() == self.nil_address {
                0
            } else {
                self.index_of(object) << 1
            }
        }
    }
}

fn string_content(object: HeapObject) -> Vec<u8> {
    match object.cid() {
        BYTE_STRING_CID => ByteString::cast(object).as_bytes().to_vec(),
        WIDE_STRING_CID => {
            let string = WideString::cast(object);
            let mut bytes = Vec::with_capacity(4 * string.size());
            for c in string.as_code_points() {
                bytes.extend_from_slice(&c.to_le_bytes());
            }
            bytes
        }
        _ => unreachable!("not a string cid"),
    }
}

fn emit_shape(out: &mut Vec<u8>, cid: ClassId, object: HeapObject) {
    match cid {
        MINT_CID => out
            .write_u64::<LittleEndian>(MediumInteger::cast(object).value() as u64)
            .unwrap(),
        FLOAT64_CID => out
            .write_u64::<LittleEndian>(Float64::cast(object).value().to_bits())
            .unwrap(),
        BIGINT_CID => {
            let bigint = LargeInteger::cast(object);
            out.push(bigint.negative() as u8);
            write_varint(out, bigint.digit_count() as u64);
            for i in 0..bigint.digit_count() {
                #[cfg(target_pointer_width = "64")]
                out.write_u64::<LittleEndian>(bigint.digit(i) as u64).unwrap();
                #[cfg(target_pointer_width = "32")]
                out.write_u32::<LittleEndian>(bigint.digit(i) as u32).unwrap();
            }
        }
        BYTE_ARRAY_CID => {
            let bytes = ByteArray::cast(object);
            write_varint(out, bytes.size() as u64);
            out.extend_from_slice(bytes.as_bytes());
        }
        BYTE_STRING_CID => {
            let string = ByteString::cast(object);
            write_varint(out, string.size() as u64);
            out.push(object.is_canonical() as u8);
            out.extend_from_slice(string.as_bytes());
        }
        WIDE_STRING_CID => {
            let string = WideString::cast(object);
            write_varint(out, string.size() as u64);
            out.push(object.is_canonical() as u8);
            for c in string.as_code_points() {
                out.write_u32::<LittleEndian>(*c).unwrap();
            }
        }
        ARRAY_CID => write_varint(out, Array::cast(object).size() as u64),
        WEAK_ARRAY_CID => write_varint(out, WeakArray::cast(object).size() as u64),
        EPHEMERON_CID => {}
        ACTIVATION_CID => write_varint(out, Activation::cast(object).stack_depth() as u64),
        CLOSURE_CID => write_varint(out, Closure::cast(object).num_copied() as u64),
        _ => write_varint(out, RegularObject::cast(object).num_slots() as u64),
    }
}

/// The reference-typed slots of an object, in the order the wire format
/// fixes. Must mirror `store_parsed_slot`.
fn slot_values(cid: ClassId, object: HeapObject) -> Vec<Value> {
    match cid {
        MINT_CID | FLOAT64_CID | BIGINT_CID | BYTE_ARRAY_CID | BYTE_STRING_CID
        | WIDE_STRING_CID => Vec::new(),
        ARRAY_CID => {
            let array = Array::cast(object);
            (0..array.size()).map(|i| array.element(i)).collect()
        }
        WEAK_ARRAY_CID => {
            let array = WeakArray::cast(object);
            (0..array.size()).map(|i| array.element(i)).collect()
        }
        EPHEMERON_CID => {
            let e = Ephemeron::cast(object);
            vec![e.key(), e.value(), e.finalizer()]
        }
        ACTIVATION_CID => {
            let a = Activation::cast(object);
            let mut values = vec![a.sender(), a.bci(), a.method(), a.closure(), a.receiver()];
            for i in 0..a.stack_depth() {
                values.push(a.temp(i));
            }
            values
        }
        CLOSURE_CID => {
            let c = Closure::cast(object);
            let mut values = vec![c.defining_activation(), c.initial_bci(), c.num_args()];
            for i in 0..c.num_copied() {
                values.push(c.copied(i));
            }
            values
        }
        _ => {
            let regular = RegularObject::cast(object);
            (0..regular.num_slots()).map(|i| regular.slot(i)).collect()
        }
    }
}

// ---------------------------------------------------------------------------
// Deserialization

/// Rebuild a heap from an image. On success the returned heap has the
/// image's nil, object store, and class table installed and has been
/// compacted by a major collection; on any error nothing is published.
pub fn deserialize(bytes: &[u8], options: HeapOptions) -> Result<Heap, SnapshotError> {
    if bytes.len() < PREAMBLE_SIZE + CRC_SIZE {
        return Err(SnapshotError::TruncatedStream);
    }
    if &bytes[0..4] != MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    if bytes[4] != VERSION_MAJOR {
        return Err(SnapshotError::VersionMismatch);
    }
    if bytes[6] as usize != BYTES_IN_WORD {
        return Err(SnapshotError::WordSizeMismatch);
    }
    let big_endian = match bytes[7] {
        0 => false,
        1 => true,
        _ => return Err(SnapshotError::UnexpectedEndianness),
    };
    let body = &bytes[..bytes.len() - CRC_SIZE];
    let stored_crc = {
        let trailer = &bytes[bytes.len() - CRC_SIZE..];
        if big_endian {
            BigEndian::read_u32(trailer)
        } else {
            LittleEndian::read_u32(trailer)
        }
    };
    if crc32(body) != stored_crc {
        return Err(SnapshotError::ChecksumMismatch);
    }

    let mut reader = Reader {
        bytes: body,
        pos: 8,
        big_endian,
    };
    let object_count = reader.read_u64()? as usize;
    if object_count as u64 > MAX_ELEMENTS {
        return Err(SnapshotError::MalformedCluster);
    }
    let store_index = reader.read_varint()?;
    let nil_index = reader.read_varint()?;

    let mut heap = Heap::new(options).map_err(SnapshotError::HeapExhausted)?;
    let mut table: Vec<HeapObject> = Vec::with_capacity(object_count);
    let mut clusters: Vec<ClusterRecord> = Vec::new();

    // Pass 1: allocate every object so indices resolve to stable
    // addresses; remember where each cluster's slot section starts.
    while table.len() < object_count {
        let cid = reader.read_count()?;
        let count = reader.read_count()?;
        if count == 0 || table.len() + count > object_count {
            return Err(SnapshotError::MalformedCluster);
        }
        let mut slot_counts = Vec::with_capacity(count);
        for _ in 0..count {
            let (object, slots) = allocate_object(&mut reader, &mut heap, cid)?;
            table.push(object);
            slot_counts.push(slots);
        }
        let slots_pos = reader.pos;
        for slots in &slot_counts {
            for _ in 0..*slots {
                reader.read_varint()?;
            }
        }
        clusters.push(ClusterRecord {
            cid,
            first: table.len() - count,
            count,
            slot_counts,
            slots_pos,
        });
    }

    let classes_pos = reader.pos;
    let nil = resolve_index(nil_index, &table)?;
    heap.set_nil(nil.to_value());

    // Pass 2: fill slots from each cluster's recorded slot section.
    for cluster in &clusters {
        reader.pos = cluster.slots_pos;
        for i in 0..cluster.count {
            let object = table[cluster.first + i];
            for j in 0..cluster.slot_counts[i] {
                let coded = reader.read_varint()?;
                let value = decode_slot(coded, &heap, &table)?;
                store_parsed_slot(object, cluster.cid, j, value);
            }
        }
    }
    reader.pos = classes_pos;

    // Class-table section.
    let class_entries = reader.read_count()?;
    let mut emitted_cids = Vec::with_capacity(class_entries);
    for _ in 0..class_entries {
        let cid = reader.read_count()?;
        if cid < FIRST_LEGAL_CID {
            return Err(SnapshotError::UnknownCid(cid));
        }
        let index = reader.read_varint()?;
        emitted_cids.push(cid);
        if index != 0 {
            let behavior = resolve_index(index, &table)?;
            heap.install_class(cid, behavior.to_value());
        }
    }
    if reader.pos != body.len() {
        return Err(SnapshotError::MalformedCluster);
    }
    // Every regular cid in the stream must have been emitted, even if the
    // image knows no Behavior for it.
    for cluster in &clusters {
        if cluster.cid >= FIRST_REGULAR_OBJECT_CID && !emitted_cids.contains(&cluster.cid) {
            return Err(SnapshotError::UnknownCid(cluster.cid));
        }
    }

    let store = if store_index == 0 {
        heap.nil()
    } else {
        resolve_index(store_index, &table)?.to_value()
    };
    heap.set_object_store(store);

    // Sweep the bootstrap objects the image replaced.
    heap.collect(CollectionMode::Major);
    info!(
        "deserialized {} objects in {} clusters",
        object_count,
        clusters.len()
    );
    Ok(heap)
}

struct ClusterRecord {
    cid: ClassId,
    first: usize,
    count: usize,
    slot_counts: Vec<usize>,
    slots_pos: usize,
}

fn resolve_index(index: u64, table: &[HeapObject]) -> Result<HeapObject, SnapshotError> {
    if index == 0 || index as usize > table.len() {
        return Err(SnapshotError::IndexOutOfRange(index));
    }
    Ok(table[index as usize - 1])
}

fn decode_slot(coded: u64, heap: &Heap, table: &[HeapObject]) -> Result<Value, SnapshotError> {
    if coded & 1 == 1 {
        Ok(Value::from_smi(zigzag_decode(coded >> 1)))
    } else if coded == 0 {
        Ok(heap.nil())
    } else {
        Ok(resolve_index(coded >> 1, table)?.to_value())
    }
}

/// Allocate one object from its shape/payload, returning it and its wire
/// slot count. Mirrors `emit_shape`/`slot_values`.
fn allocate_object(
    reader: &mut Reader,
    heap: &mut Heap,
    cid: ClassId,
) -> Result<(HeapObject, usize), SnapshotError> {
    let alloc = |heap: &mut Heap, bytes: usize| {
        heap.allocate_old_no_gc(bytes, cid)
            .map_err(SnapshotError::HeapExhausted)
    };
    match cid {
        MINT_CID => {
            let value = reader.read_u64()? as i64;
            let object = alloc(heap, 2 * BYTES_IN_WORD + 8)?;
            MediumInteger::cast(object).set_value(value);
            Ok((object, 0))
        }
        FLOAT64_CID => {
            let bits = reader.read_u64()?;
            let object = alloc(heap, 2 * BYTES_IN_WORD + 8)?;
            Float64::cast(object).set_value(f64::from_bits(bits));
            Ok((object, 0))
        }
        BIGINT_CID => {
            let negative = match reader.read_u8()? {
                0 => false,
                1 => true,
                _ => return Err(SnapshotError::MalformedCluster),
            };
            let digits = reader.read_count()?;
            let object = alloc(heap, (4 + digits) * BYTES_IN_WORD)?;
            let bigint = LargeInteger::cast(object);
            bigint.set_negative(negative);
            bigint.set_digit_count(digits);
            for i in 0..digits {
                #[cfg(target_pointer_width = "64")]
                bigint.set_digit(i, reader.read_u64()? as usize);
                #[cfg(target_pointer_width = "32")]
                bigint.set_digit(i, reader.read_u32()? as usize);
            }
            Ok((object, 0))
        }
        BYTE_ARRAY_CID => {
            let size = reader.read_count()?;
            let payload = reader.read_bytes(size)?;
            let object = alloc(heap, 3 * BYTES_IN_WORD + size)?;
            let bytes = ByteArray::cast(object);
            bytes.set_size(size);
            for (i, b) in payload.iter().enumerate() {
                bytes.set_element(i, *b);
            }
            Ok((object, 0))
        }
        BYTE_STRING_CID => {
            let size = reader.read_count()?;
            let canonical = match reader.read_u8()? {
                0 => false,
                1 => true,
                _ => return Err(SnapshotError::MalformedCluster),
            };
            let payload = reader.read_bytes(size)?;
            let object = alloc(heap, 4 * BYTES_IN_WORD + size)?;
            let string = ByteString::cast(object);
            string.set_size(size);
            for (i, b) in payload.iter().enumerate() {
                string.set_element(i, *b);
            }
            object.set_is_canonical(canonical);
            Ok((object, 0))
        }
        WIDE_STRING_CID => {
            let size = reader.read_count()?;
            let canonical = match reader.read_u8()? {
                0 => false,
                1 => true,
                _ => return Err(SnapshotError::MalformedCluster),
            };
            let object = alloc(heap, 4 * BYTES_IN_WORD + 4 * size)?;
            let string = WideString::cast(object);
            string.set_size(size);
            for i in 0..size {
                string.set_element(i, reader.read_u32()?);
            }
            object.set_is_canonical(canonical);
            Ok((object, 0))
        }
        ARRAY_CID => {
            let size = reader.read_count()?;
            let object = alloc(heap, (3 + size) * BYTES_IN_WORD)?;
            Array::cast(object).set_size(size);
            Ok((object, size))
        }
        WEAK_ARRAY_CID => {
            let size = reader.read_count()?;
            let object = alloc(heap, (3 + size) * BYTES_IN_WORD)?;
            WeakArray::cast(object).set_size(size);
            Ok((object, size))
        }
        EPHEMERON_CID => {
            let object = alloc(heap, 5 * BYTES_IN_WORD)?;
            Ok((object, 3))
        }
        ACTIVATION_CID => {
            let depth = reader.read_count()?;
            if depth > Activation::MAX_TEMPS {
                return Err(SnapshotError::MalformedCluster);
            }
            let object = alloc(
                heap,
                (Activation::TEMPS_SLOT + Activation::MAX_TEMPS) * BYTES_IN_WORD,
            )?;
            Activation::cast(object).set_stack_depth(depth);
            Ok((object, 5 + depth))
        }
        CLOSURE_CID => {
            let copied = reader.read_count()?;
            let object = alloc(heap, (6 + copied) * BYTES_IN_WORD)?;
            Closure::cast(object).set_num_copied(copied);
            Ok((object, 3 + copied))
        }
        cid if cid >= FIRST_REGULAR_OBJECT_CID => {
            let slots = reader.read_count()?;
            let object = alloc(heap, (FIRST_FIELD_SLOT + slots) * BYTES_IN_WORD)?;
            Ok((object, slots))
        }
        cid => Err(SnapshotError::UnknownCid(cid)),
    }
}

/// Store the `j`th wire slot into its place. Must mirror `slot_values`.
fn store_parsed_slot(object: HeapObject, cid: ClassId, j: usize, value: Value) {
    match cid {
        ARRAY_CID => Array::cast(object).set_element(j, value),
        WEAK_ARRAY_CID => WeakArray::cast(object).set_element(j, value),
        EPHEMERON_CID => {
            let e = Ephemeron::cast(object);
            match j {
                0 => e.set_key(value),
                1 => e.set_value(value),
                _ => e.set_finalizer(value),
            }
        }
        ACTIVATION_CID => {
            let a = Activation::cast(object);
            match j {
                0 => a.set_sender(value),
                1 => a.set_bci(value),
                2 => a.set_method(value),
                3 => a.set_closure(value),
                4 => a.set_receiver(value),
                _ => a.set_temp(j - 5, value),
            }
        }
        CLOSURE_CID => {
            let c = Closure::cast(object);
            match j {
                0 => c.set_defining_activation(value),
                1 => c.set_initial_bci(value),
                2 => c.set_num_args(value),
                _ => c.set_copied(j - 3, value),
            }
        }
        _ => RegularObject::cast(object).set_slot(j, value),
    }
}
