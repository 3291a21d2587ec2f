#![allow(dead_code)]

use smalt_om::{Heap, HeapOptions};

/// Install the logger once; later calls are no-ops.
pub fn setup() {
    let _ = smalt_om::util::logger::init();
}

/// Small spaces so collections actually happen in tests.
pub fn small_options() -> HeapOptions {
    HeapOptions {
        semispace_size: 256 << 10,
        old_space_capacity: 8 << 20,
        large_object_size: 16 << 10,
        root_ceiling: 256,
        tenure_on_first_survival: false,
    }
}

pub fn small_heap() -> Heap {
    setup();
    Heap::new(small_options()).unwrap()
}
