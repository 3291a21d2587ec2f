//! Snapshot round trips and rejection of corrupted images.

mod common;

use std::collections::HashMap;

use smalt_om::object::*;
use smalt_om::snapshot::{self, SnapshotError};
use smalt_om::util::constants::BYTES_IN_WORD;
use smalt_om::{CollectionMode, Heap, Value};

/// One instance of every built-in heap cid, plus one regular class with
/// two instances, all hanging off a store array.
fn build_census_heap(heap: &mut Heap) -> usize {
    let store = heap.new_array(14).unwrap();
    let store_handle = heap.add_root(store.object().to_value()).unwrap();
    let mut put = |heap: &mut Heap, index: usize, value: Value| {
        let store = Array::cast(heap.root(&store_handle).heap_object());
        heap.store_pointer(store.object(), store.element_address(index), value);
    };

    let mint = heap.new_medium_integer(1 << 40).unwrap().object().to_value();
    put(heap, 0, mint);
    let bigint = heap.new_large_integer(true, &[3, 4]).unwrap().object().to_value();
    put(heap, 1, bigint);
    let float = heap.new_float64(2.5).unwrap().object().to_value();
    put(heap, 2, float);
    let bytes = heap.new_byte_array(&[9, 8, 7]).unwrap().object().to_value();
    put(heap, 3, bytes);
    let string = heap.new_byte_string(b"census").unwrap().object().to_value();
    put(heap, 4, string);
    let wide = heap.new_wide_string(&[0x1F600, 65]).unwrap().object().to_value();
    put(heap, 5, wide);
    let array = heap.new_array(2).unwrap().object().to_value();
    put(heap, 6, array);
    let weak = heap.new_weak_array(1).unwrap().object().to_value();
    put(heap, 7, weak);
    let key = heap.new_array(0).unwrap().object().to_value();
    put(heap, 8, key);
    let ephemeron = heap
        .new_ephemeron(key, Value::from_smi(3), heap.nil())
        .unwrap()
        .object()
        .to_value();
    put(heap, 9, ephemeron);
    let activation = heap.new_activation().unwrap();
    activation.set_stack_depth(2);
    activation.set_temp(0, Value::from_smi(10));
    activation.set_temp(1, Value::from_smi(11));
    put(heap, 10, activation.object().to_value());
    let closure = heap.new_closure(1).unwrap().object().to_value();
    put(heap, 11, closure);

    // A regular class that is its own class, with two instances. Instance
    // `a` also carries an explicit slot back to the class, so the class is
    // reachable both ways: through a slot and through header cids.
    let class = heap.new_regular_object(FIRST_REGULAR_OBJECT_CID, 7).unwrap();
    let cid = heap.register_class(class.object().to_value());
    class.object().set_cid(cid);
    class.set_slot(Behavior::CLASS_ID_SLOT, Value::from_smi(cid as isize));
    let a = heap.new_regular_object(cid, 1).unwrap();
    let class_value = heap.class_at(cid); // re-fetched; the allocation may have moved it
    heap.store_pointer(a.object(), a.object().slot_address(2), class_value);
    put(heap, 12, a.object().to_value());
    let b = heap.new_regular_object(cid, 1).unwrap();
    put(heap, 13, b.object().to_value());

    let store = heap.remove_root(store_handle);
    heap.set_object_store(store);
    cid
}

fn census(heap: &Heap) -> HashMap<usize, usize> {
    let mut counts = HashMap::new();
    heap.walk(|object| {
        *counts.entry(object.cid()).or_insert(0) += 1;
    });
    counts
}

#[test]
fn round_trip_preserves_instance_census() {
    let mut heap = common::small_heap();
    let cid = build_census_heap(&mut heap);
    let image = snapshot::serialize(&heap);

    let restored = snapshot::deserialize(&image, common::small_options()).unwrap();
    let counts = census(&restored);

    assert_eq!(counts[&MINT_CID], 1);
    assert_eq!(counts[&BIGINT_CID], 1);
    assert_eq!(counts[&FLOAT64_CID], 1);
    assert_eq!(counts[&BYTE_ARRAY_CID], 1);
    assert_eq!(counts[&BYTE_STRING_CID], 1);
    assert_eq!(counts[&WIDE_STRING_CID], 1);
    // The store itself, the array instance, and the ephemeron key.
    assert_eq!(counts[&ARRAY_CID], 3);
    assert_eq!(counts[&WEAK_ARRAY_CID], 1);
    assert_eq!(counts[&EPHEMERON_CID], 1);
    assert_eq!(counts[&ACTIVATION_CID], 1);
    assert_eq!(counts[&CLOSURE_CID], 1);
    // The class and its two instances.
    assert_eq!(counts[&cid], 3);
    // The image nil.
    assert_eq!(counts[&FIRST_REGULAR_OBJECT_CID], 1);

    // Payloads made the trip too.
    let store = Array::cast(restored.object_store().heap_object());
    assert_eq!(
        MediumInteger::cast(store.element(0).heap_object()).value(),
        1 << 40
    );
    let bigint = LargeInteger::cast(store.element(1).heap_object());
    assert!(bigint.negative());
    assert_eq!(bigint.digit_count(), 2);
    assert_eq!(bigint.digit(1), 4);
    assert_eq!(Float64::cast(store.element(2).heap_object()).value(), 2.5);
    assert_eq!(ByteArray::cast(store.element(3).heap_object()).as_bytes(), &[9, 8, 7]);
    assert_eq!(
        ByteString::cast(store.element(4).heap_object()).as_bytes(),
        b"census"
    );
    assert_eq!(
        WideString::cast(store.element(5).heap_object()).as_code_points(),
        &[0x1F600, 65]
    );
    let activation = Activation::cast(store.element(10).heap_object());
    assert_eq!(activation.stack_depth(), 2);
    assert_eq!(activation.temp(1), Value::from_smi(11));
    // The restored class is installed at its cid and is what instance `a`
    // points back to.
    let a = RegularObject::cast(store.element(12).heap_object());
    assert_eq!(store.element(12).heap_object().cid(), cid);
    assert_eq!(restored.class_at(cid), a.slot(0));
    restored.verify();
}

#[test]
fn round_trip_is_byte_stable() {
    let mut heap = common::small_heap();
    build_census_heap(&mut heap);
    let image = snapshot::serialize(&heap);
    let restored = snapshot::deserialize(&image, common::small_options()).unwrap();
    let image_again = snapshot::serialize(&restored);
    assert_eq!(image, image_again);
}

#[test]
fn canonical_strings_are_shared_on_restore() {
    let mut heap = common::small_heap();
    let store = heap.new_array(2).unwrap();
    let store_handle = heap.add_root(store.object().to_value()).unwrap();
    for i in 0..2 {
        let symbol = heap.new_byte_string(b"doesNotUnderstand:").unwrap();
        symbol.object().set_is_canonical(true);
        let store = Array::cast(heap.root(&store_handle).heap_object());
        heap.store_pointer(
            store.object(),
            store.element_address(i),
            symbol.object().to_value(),
        );
    }
    let store = Array::cast(heap.root(&store_handle).heap_object());
    assert_ne!(store.element(0), store.element(1), "distinct before the trip");
    let store = heap.remove_root(store_handle);
    heap.set_object_store(store);

    let image = snapshot::serialize(&heap);
    let restored = snapshot::deserialize(&image, common::small_options()).unwrap();

    let store = Array::cast(restored.object_store().heap_object());
    assert_eq!(store.element(0), store.element(1), "shared after the trip");
    let symbol = ByteString::cast(store.element(0).heap_object());
    assert!(symbol.object().is_canonical());
    assert_eq!(symbol.as_bytes(), b"doesNotUnderstand:");
}

#[test]
fn nil_slots_decode_to_the_image_nil() {
    let mut heap = common::small_heap();
    let store = heap.new_array(2).unwrap();
    let handle = heap.add_root(store.object().to_value()).unwrap();
    let value = heap.new_medium_integer(5).unwrap().object().to_value();
    let store = Array::cast(heap.root(&handle).heap_object());
    heap.store_pointer(store.object(), store.element_address(0), value);
    // Element 1 stays nil; it must decode to the image's nil object.
    let store = heap.remove_root(handle);
    heap.set_object_store(store);

    let image = snapshot::serialize(&heap);
    let restored = snapshot::deserialize(&image, common::small_options()).unwrap();
    let store = Array::cast(restored.object_store().heap_object());
    assert_eq!(
        MediumInteger::cast(store.element(0).heap_object()).value(),
        5
    );
    assert_eq!(store.element(1), restored.nil());
    assert!(restored.nil().is_heap_object());
}

#[test]
fn corrupted_magic_is_rejected() {
    let mut heap = common::small_heap();
    build_census_heap(&mut heap);
    let mut image = snapshot::serialize(&heap);
    image[1] ^= 0x20;
    let err = snapshot::deserialize(&image, common::small_options()).unwrap_err();
    assert_eq!(err, SnapshotError::BadMagic);
}

#[test]
fn corrupted_body_fails_the_checksum() {
    let mut heap = common::small_heap();
    build_census_heap(&mut heap);
    let mut image = snapshot::serialize(&heap);
    let middle = image.len() / 2;
    image[middle] ^= 0xFF;
    let err = snapshot::deserialize(&image, common::small_options()).unwrap_err();
    assert_eq!(err, SnapshotError::ChecksumMismatch);
}

#[test]
fn truncated_image_is_rejected() {
    let mut heap = common::small_heap();
    build_census_heap(&mut heap);
    let image = snapshot::serialize(&heap);
    for len in [0, 4, 15, image.len() / 2] {
        let err = snapshot::deserialize(&image[..len], common::small_options()).unwrap_err();
        assert!(
            err == SnapshotError::TruncatedStream || err == SnapshotError::ChecksumMismatch,
            "truncation to {} gave {:?}",
            len,
            err
        );
    }
}

#[test]
fn version_and_word_size_mismatches_are_rejected() {
    let mut heap = common::small_heap();
    build_census_heap(&mut heap);
    let image = snapshot::serialize(&heap);

    let mut wrong_version = image.clone();
    wrong_version[4] += 1;
    assert_eq!(
        snapshot::deserialize(&wrong_version, common::small_options()).unwrap_err(),
        SnapshotError::VersionMismatch
    );

    let mut wrong_word = image.clone();
    wrong_word[6] = if BYTES_IN_WORD == 8 { 4 } else { 8 };
    assert_eq!(
        snapshot::deserialize(&wrong_word, common::small_options()).unwrap_err(),
        SnapshotError::WordSizeMismatch
    );

    let mut wrong_endian = image;
    wrong_endian[7] = 9;
    assert_eq!(
        snapshot::deserialize(&wrong_endian, common::small_options()).unwrap_err(),
        SnapshotError::UnexpectedEndianness
    );
}

#[test]
fn restored_heap_collects_cleanly() {
    let mut heap = common::small_heap();
    build_census_heap(&mut heap);
    let image = snapshot::serialize(&heap);
    let mut restored = snapshot::deserialize(&image, common::small_options()).unwrap();

    let before = census(&restored);
    restored.collect(CollectionMode::Major);
    assert_eq!(census(&restored), before, "everything restored is reachable");
    restored.verify();
}
