//! Weak arrays and ephemerons across minor and major collections.

mod common;

use smalt_om::object::{Array, ByteString, Ephemeron, Value, WeakArray};
use smalt_om::CollectionMode;

#[test]
fn weak_array_slots_nil_or_forward() {
    let mut heap = common::small_heap();

    // Five distinct targets, external references kept to 0, 2 and 4 only.
    let weak = heap.new_weak_array(5).unwrap();
    let weak_handle = heap.add_root(weak.object().to_value()).unwrap();
    let mut kept = Vec::new();
    for i in 0..5 {
        let target = heap.new_array(1).unwrap().object().to_value();
        let weak = WeakArray::cast(heap.root(&weak_handle).heap_object());
        heap.store_pointer(weak.object(), weak.element_address(i), target);
        if i % 2 == 0 {
            kept.push(heap.add_root(target).unwrap());
        }
    }

    heap.collect(CollectionMode::Scavenge);

    let weak = WeakArray::cast(heap.root(&weak_handle).heap_object());
    assert_eq!(weak.size(), 5);
    assert_eq!(weak.element(1), heap.nil());
    assert_eq!(weak.element(3), heap.nil());
    for (slot, handle) in [0usize, 2, 4].iter().zip(&kept) {
        assert_eq!(weak.element(*slot), heap.root(handle));
        assert!(weak.element(*slot).is_heap_object());
    }
    heap.verify();
}

#[test]
fn weak_array_survives_major_collection() {
    use smalt_om::object::ARRAY_CID;
    use smalt_om::util::constants::BYTES_IN_WORD;

    let mut heap = common::small_heap();
    let weak = heap.new_weak_array(2).unwrap();
    let weak_handle = heap.add_root(weak.object().to_value()).unwrap();

    // Both targets are old, so only a major collection can reclaim one.
    let kept = Array::cast(heap.allocate_old(3 * BYTES_IN_WORD, ARRAY_CID).unwrap());
    kept.set_size(0);
    let kept_handle = heap.add_root(kept.object().to_value()).unwrap();
    let dropped = Array::cast(heap.allocate_old(3 * BYTES_IN_WORD, ARRAY_CID).unwrap());
    dropped.set_size(0);
    let weak = WeakArray::cast(heap.root(&weak_handle).heap_object());
    heap.store_pointer(weak.object(), weak.element_address(0), heap.root(&kept_handle));
    heap.store_pointer(weak.object(), weak.element_address(1), dropped.object().to_value());

    heap.collect(CollectionMode::Scavenge);
    let weak = WeakArray::cast(heap.root(&weak_handle).heap_object());
    assert_eq!(weak.element(1), dropped.object().to_value(), "old targets survive a scavenge");

    heap.collect(CollectionMode::Major);

    let weak = WeakArray::cast(heap.root(&weak_handle).heap_object());
    assert_eq!(weak.element(0), heap.root(&kept_handle));
    assert_eq!(weak.element(1), heap.nil());
    heap.verify();
}

#[test]
fn ephemeron_with_unreachable_key_is_mourned() {
    let mut heap = common::small_heap();

    let finalizer = heap.new_byte_string(b"finalize me").unwrap().object().to_value();
    let finalizer_handle = heap.add_root(finalizer).unwrap();
    let key = heap.new_array(0).unwrap().object().to_value();
    let finalizer = heap.remove_root(finalizer_handle);
    let ephemeron = heap
        .new_ephemeron(key, Value::from_smi(7), finalizer)
        .unwrap();
    let handle = heap.add_root(ephemeron.object().to_value()).unwrap();
    // No other path to the key or the finalizer.

    heap.collect(CollectionMode::Scavenge);

    let ephemeron = Ephemeron::cast(heap.root(&handle).heap_object());
    assert_eq!(ephemeron.key(), heap.nil());
    assert_eq!(ephemeron.value(), heap.nil());
    assert_eq!(ephemeron.finalizer(), heap.nil());

    let pending = heap.safepoint();
    assert_eq!(pending.len(), 1);
    let queued = ByteString::cast(pending[0].heap_object());
    assert_eq!(queued.as_bytes(), b"finalize me");
    // The queue drains exactly once.
    assert!(heap.safepoint().is_empty());
    heap.verify();
}

#[test]
fn ephemeron_with_reachable_key_keeps_its_value() {
    let mut heap = common::small_heap();

    let key = heap.new_array(0).unwrap().object().to_value();
    let key_handle = heap.add_root(key).unwrap();
    let value = heap.new_array(1).unwrap().object().to_value();
    let ephemeron = heap.new_ephemeron(heap.root(&key_handle), value, heap.nil()).unwrap();
    let handle = heap.add_root(ephemeron.object().to_value()).unwrap();

    heap.collect(CollectionMode::Scavenge);

    let ephemeron = Ephemeron::cast(heap.root(&handle).heap_object());
    assert_eq!(ephemeron.key(), heap.root(&key_handle));
    assert!(ephemeron.value().is_heap_object());
    assert!(heap.safepoint().is_empty());
    heap.verify();
}

#[test]
fn ephemeron_chains_reach_a_fixed_point() {
    let mut heap = common::small_heap();

    // k2 is reachable only through e1's value; e1's key is external. Both
    // ephemerons must resolve, in whatever order the list is processed.
    let k1 = heap.new_array(0).unwrap().object().to_value();
    let k1_handle = heap.add_root(k1).unwrap();
    let k2 = heap.new_array(0).unwrap().object().to_value();
    let e2 = heap.new_ephemeron(k2, Value::from_smi(5), heap.nil()).unwrap();
    let e2_handle = heap.add_root(e2.object().to_value()).unwrap();
    // Re-fetch k2 through e2; the ephemeron allocation may have moved it.
    let k2 = Ephemeron::cast(heap.root(&e2_handle).heap_object()).key();
    let e1 = heap
        .new_ephemeron(heap.root(&k1_handle), k2, heap.nil())
        .unwrap();
    let e1_handle = heap.add_root(e1.object().to_value()).unwrap();

    heap.collect(CollectionMode::Scavenge);

    let e1 = Ephemeron::cast(heap.root(&e1_handle).heap_object());
    let e2 = Ephemeron::cast(heap.root(&e2_handle).heap_object());
    assert_eq!(e1.key(), heap.root(&k1_handle));
    assert!(e2.key().is_heap_object(), "k2 is reachable through e1");
    assert_eq!(e1.value(), e2.key());
    assert_eq!(e2.value(), Value::from_smi(5));
    assert!(heap.safepoint().is_empty());
    heap.verify();
}

#[test]
fn ephemeron_key_only_reachable_via_its_own_value_dies() {
    let mut heap = common::small_heap();

    // The key is also the ephemeron's value: still unreachable from
    // outside, so the ephemeron must be mourned, not resolved.
    let key = heap.new_array(0).unwrap().object().to_value();
    let ephemeron = heap.new_ephemeron(key, key, heap.nil()).unwrap();
    let handle = heap.add_root(ephemeron.object().to_value()).unwrap();

    heap.collect(CollectionMode::Scavenge);

    let ephemeron = Ephemeron::cast(heap.root(&handle).heap_object());
    assert_eq!(ephemeron.key(), heap.nil());
    assert_eq!(ephemeron.value(), heap.nil());
    heap.verify();
}

#[test]
fn ephemeron_mourning_in_major_collection() {
    let mut heap = common::small_heap();

    let key = heap.new_array(0).unwrap().object().to_value();
    let key_handle = heap.add_root(key).unwrap();
    let finalizer = heap.new_byte_string(b"old gen").unwrap().object().to_value();
    let ephemeron = heap
        .new_ephemeron(heap.root(&key_handle), Value::from_smi(1), finalizer)
        .unwrap();
    let handle = heap.add_root(ephemeron.object().to_value()).unwrap();

    // Tenure ephemeron and key, then drop the key and collect old space.
    heap.collect(CollectionMode::Scavenge);
    heap.collect(CollectionMode::Scavenge);
    let ephemeron = Ephemeron::cast(heap.root(&handle).heap_object());
    assert!(ephemeron.object().is_old_object());
    heap.remove_root(key_handle);

    heap.collect(CollectionMode::Major);

    let ephemeron = Ephemeron::cast(heap.root(&handle).heap_object());
    assert_eq!(ephemeron.key(), heap.nil());
    let pending = heap.safepoint();
    assert_eq!(pending.len(), 1);
    assert_eq!(ByteString::cast(pending[0].heap_object()).as_bytes(), b"old gen");
    heap.verify();
}

#[test]
fn dead_weak_array_disappears_quietly() {
    let mut heap = common::small_heap();
    let target = heap.new_array(0).unwrap().object().to_value();
    let target_handle = heap.add_root(target).unwrap();
    {
        let weak = heap.new_weak_array(1).unwrap();
        heap.store_pointer(weak.object(), weak.element_address(0), heap.root(&target_handle));
        // Weak array dropped here.
    }
    heap.collect(CollectionMode::Scavenge);
    assert!(heap.root(&target_handle).is_heap_object());
    heap.verify();
}

#[test]
fn weak_array_inside_array_graph() {
    let mut heap = common::small_heap();
    // A strong array holding a weak array holding the strong array: the
    // cycle must survive with the weak slot forwarded, not nilled.
    let strong = heap.new_array(1).unwrap();
    let strong_handle = heap.add_root(strong.object().to_value()).unwrap();
    let weak = heap.new_weak_array(1).unwrap();
    let strong = Array::cast(heap.root(&strong_handle).heap_object());
    heap.store_pointer(strong.object(), strong.element_address(0), weak.object().to_value());
    heap.store_pointer(weak.object(), weak.element_address(0), strong.object().to_value());

    heap.collect(CollectionMode::Scavenge);

    let strong = Array::cast(heap.root(&strong_handle).heap_object());
    let weak = WeakArray::cast(strong.element(0).heap_object());
    assert_eq!(weak.element(0), strong.object().to_value());
    assert_eq!(weak.size(), 1);
    heap.verify();
}
