//! Root registration, handle scopes, the root ceiling, and the weak class
//! table.

mod common;

use smalt_om::object::{Value, FIRST_REGULAR_OBJECT_CID};
use smalt_om::{CollectionMode, Heap, HeapError, HeapOptions};

#[test]
fn roots_track_moving_objects() {
    let mut heap = common::small_heap();
    let object = heap.new_array(1).unwrap().object();
    let handle = heap.add_root(object.to_value()).unwrap();
    heap.collect(CollectionMode::Scavenge);
    let moved = heap.root(&handle);
    assert!(moved.is_heap_object());
    assert_ne!(moved, object.to_value(), "a scavenge moves new objects");
    heap.verify();
}

#[test]
fn removed_roots_no_longer_pin() {
    let mut heap = common::small_heap();
    let object = heap.new_array(1).unwrap().object();
    let handle = heap.add_root(object.to_value()).unwrap();
    let before = heap.new_space_used();
    heap.remove_root(handle);
    heap.collect(CollectionMode::Scavenge);
    assert!(heap.new_space_used() < before);
}

#[test]
fn root_ceiling_is_enforced() {
    common::setup();
    let mut heap = Heap::new(HeapOptions {
        root_ceiling: 8,
        ..common::small_options()
    })
    .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        handles.push(heap.add_root(Value::from_smi(i)).unwrap());
    }
    assert_eq!(
        heap.add_root(Value::from_smi(9)).unwrap_err(),
        HeapError::RootOverflow
    );
    // Releasing one slot makes room again.
    heap.remove_root(handles.pop().unwrap());
    assert!(heap.add_root(Value::from_smi(10)).is_ok());
}

#[test]
fn handle_scopes_release_in_bulk() {
    let mut heap = common::small_heap();
    let outer = heap.add_root(Value::from_smi(1)).unwrap();

    let scope = heap.open_handle_scope();
    for _ in 0..10 {
        let value = heap.new_array(0).unwrap().object().to_value();
        heap.add_root(value).unwrap();
    }
    heap.close_handle_scope(scope);

    assert_eq!(heap.root(&outer), Value::from_smi(1));
    // The scoped handles no longer pin anything.
    heap.collect(CollectionMode::Scavenge);
    assert_eq!(heap.new_space_used(), 0);
    heap.verify();
}

#[test]
fn class_table_entries_are_weak() {
    let mut heap = common::small_heap();

    let class = heap.new_regular_object(FIRST_REGULAR_OBJECT_CID, 7).unwrap();
    let cid = heap.register_class(class.object().to_value());
    class.object().set_cid(cid);
    assert_eq!(heap.class_at(cid), class.object().to_value());

    // Scavenges keep the registered class alive (and track its moves).
    heap.collect(CollectionMode::Scavenge);
    assert!(heap.class_at(cid).is_heap_object());
    heap.collect(CollectionMode::Scavenge);
    assert!(heap.class_at(cid).heap_object().is_old_object());

    // With no instances and no other references, a major collection
    // reclaims the class and vacates its entry.
    heap.collect(CollectionMode::Major);
    assert_eq!(heap.class_at(cid), heap.nil());

    // The cid is recycled for the next registration.
    let other = heap.new_regular_object(FIRST_REGULAR_OBJECT_CID, 7).unwrap();
    let recycled = heap.register_class(other.object().to_value());
    assert_eq!(recycled, cid);
}

#[test]
fn live_instances_keep_their_class_through_a_major_collection() {
    let mut heap = common::small_heap();

    let class = heap.new_regular_object(FIRST_REGULAR_OBJECT_CID, 7).unwrap();
    let cid = heap.register_class(class.object().to_value());
    class.object().set_cid(cid);
    let instance = heap.new_regular_object(cid, 0).unwrap();
    let handle = heap.add_root(instance.object().to_value()).unwrap();

    // The instance's header cid is the class's only tether.
    heap.collect(CollectionMode::Major);

    let class = heap.class_at(cid);
    assert!(class.is_heap_object(), "instance kept its class alive");
    assert_eq!(heap.class_of(heap.root(&handle)), class);
    heap.verify();
}

#[test]
fn class_of_immediates_goes_through_the_table() {
    let mut heap = common::small_heap();
    // Nothing registered for smis in a bootstrap heap.
    assert_eq!(heap.class_of(Value::from_smi(3)), heap.nil());

    let smi_class = heap.new_regular_object(FIRST_REGULAR_OBJECT_CID, 7).unwrap();
    heap.install_class(smalt_om::object::SMI_CID, smi_class.object().to_value());
    assert_eq!(
        heap.class_of(Value::from_smi(3)),
        smi_class.object().to_value()
    );
}

#[test]
fn safepoint_is_empty_without_mourning() {
    let mut heap = common::small_heap();
    heap.new_array(4).unwrap();
    heap.collect(CollectionMode::Scavenge);
    assert!(heap.safepoint().is_empty());
}
