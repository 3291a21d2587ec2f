//! Heap sizing and collection policy. Plain data with defaults; the
//! embedder passes a value to `Heap::new`, nothing is read from the
//! environment.

use crate::util::constants::*;

/// The default size of one new-space semispace.
pub const DEFAULT_SEMISPACE_SIZE: usize = 1 << 20;
/// The default reservation for old space.
pub const DEFAULT_OLD_SPACE_CAPACITY: usize = 64 << 20;
/// Objects at least this big skip new space's copying treadmill.
pub const DEFAULT_LARGE_OBJECT_SIZE: usize = 64 << 10;
/// The most root slots external code may register at once.
pub const DEFAULT_ROOT_CEILING: usize = 1024;

#[derive(Debug, Clone)]
pub struct HeapOptions {
    /// Size in bytes of each new-space semispace.
    pub semispace_size: usize,
    /// Total address space reserved for old space; committed page by page.
    pub old_space_capacity: usize,
    /// Objects of at least this aligned size are allocated in (or promoted
    /// straight to) old space.
    pub large_object_size: usize,
    /// Fixed ceiling on registered root slots; exceeding it is
    /// `HeapError::RootOverflow`.
    pub root_ceiling: usize,
    /// Promote any object that survives one scavenge, instead of requiring
    /// it to have been allocated before the previous scavenge.
    pub tenure_on_first_survival: bool,
}

impl Default for HeapOptions {
    fn default() -> Self {
        HeapOptions {
            semispace_size: DEFAULT_SEMISPACE_SIZE,
            old_space_capacity: DEFAULT_OLD_SPACE_CAPACITY,
            large_object_size: DEFAULT_LARGE_OBJECT_SIZE,
            root_ceiling: DEFAULT_ROOT_CEILING,
            tenure_on_first_survival: false,
        }
    }
}

impl HeapOptions {
    /// Validate the relationships the heap depends on. Called by
    /// `Heap::new`.
    pub fn validate(&self) -> bool {
        self.semispace_size >= BYTES_IN_PAGE
            && self.semispace_size % BYTES_IN_PAGE == 0
            && self.old_space_capacity >= self.semispace_size
            && self.large_object_size >= OBJECT_ALIGNMENT
            && self.large_object_size <= self.semispace_size
            // New-space scanning and the weak-list protocol require every
            // new-space object's size tag to be valid.
            && self.large_object_size <= SIZE_TAG_MAX
            && self.root_ceiling > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(HeapOptions::default().validate());
    }

    #[test]
    fn rejects_unaligned_semispace() {
        let opts = HeapOptions {
            semispace_size: BYTES_IN_PAGE + 1,
            ..Default::default()
        };
        assert!(!opts.validate());
    }
}
