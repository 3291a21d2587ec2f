use crate::util::constants::*;
use crate::util::Address;

/// Align up an integer to the given alignment. `align` must be a power of two.
pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/master/src/libcore/alloc.rs#L192
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

/// Align down an integer to the given alignment. `align` must be a power of two.
pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !align.wrapping_sub(1)
}

/// Is the integer aligned to the given alignment? `align` must be a power of two.
pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}

/// Round a requested object size up to the object alignment.
pub const fn allocation_size(bytes: usize) -> usize {
    raw_align_up(bytes, OBJECT_ALIGNMENT)
}

pub fn page_align_up(addr: Address) -> Address {
    addr.align_up(BYTES_IN_PAGE)
}

pub fn is_page_aligned(addr: Address) -> bool {
    addr.is_aligned_to(BYTES_IN_PAGE)
}

pub const fn bytes_to_pages_up(bytes: usize) -> usize {
    raw_align_up(bytes, BYTES_IN_PAGE) >> LOG_BYTES_IN_PAGE
}

pub const fn pages_to_bytes(pages: usize) -> usize {
    pages << LOG_BYTES_IN_PAGE
}

/// Number of whole words covering `bytes`.
pub const fn bytes_to_words_up(bytes: usize) -> usize {
    raw_align_up(bytes, BYTES_IN_WORD) >> LOG_BYTES_IN_WORD
}

pub const fn words_to_bytes(words: usize) -> usize {
    words << LOG_BYTES_IN_WORD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align() {
        assert_eq!(raw_align_up(0, 16), 0);
        assert_eq!(raw_align_up(1, 16), 16);
        assert_eq!(raw_align_up(16, 16), 16);
        assert_eq!(raw_align_up(17, 16), 32);
        assert_eq!(raw_align_down(31, 16), 16);
        assert!(raw_is_aligned(64, 16));
        assert!(!raw_is_aligned(72, 16));
    }

    #[test]
    fn allocation_sizes() {
        assert_eq!(allocation_size(1), OBJECT_ALIGNMENT);
        assert_eq!(allocation_size(OBJECT_ALIGNMENT), OBJECT_ALIGNMENT);
        assert_eq!(
            allocation_size(OBJECT_ALIGNMENT + 1),
            2 * OBJECT_ALIGNMENT
        );
    }

    #[test]
    fn pages() {
        assert_eq!(bytes_to_pages_up(1), 1);
        assert_eq!(bytes_to_pages_up(BYTES_IN_PAGE), 1);
        assert_eq!(bytes_to_pages_up(BYTES_IN_PAGE + 1), 2);
        assert_eq!(pages_to_bytes(2), 2 * BYTES_IN_PAGE);
    }
}
