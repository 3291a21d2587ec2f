//! Virtual-memory regions and raw memory helpers, POSIX only. Regions are
//! reserved with `PROT_NONE` and committed by changing their protection, so
//! address space can be claimed up front and paged in as the heap grows.

use std::io::{Error, Result};

use crate::util::conversions;
use crate::util::Address;

/// Set a range of memory to 0.
pub fn zero(start: Address, len: usize) {
    set(start, 0, len);
}

/// Set a range of memory to the given value. Similar to memset.
pub fn set(start: Address, val: u8, len: usize) {
    unsafe {
        std::ptr::write_bytes::<u8>(start.to_mut_ptr(), val, len);
    }
}

/// The protection of a committed region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protection {
    /// Do not allow any access
    NoAccess,
    /// Allow read
    ReadOnly,
    /// Allow read + write
    ReadWrite,
    /// Allow read + code execution
    ReadExecute,
}

impl Protection {
    fn native_flags(self) -> libc::c_int {
        use libc::{PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE};
        match self {
            Protection::NoAccess => PROT_NONE,
            Protection::ReadOnly => PROT_READ,
            Protection::ReadWrite => PROT_READ | PROT_WRITE,
            Protection::ReadExecute => PROT_READ | PROT_EXEC,
        }
    }
}

/// A reserved, page-aligned region of address space. The mapping is
/// released when the region is dropped.
#[derive(Debug)]
pub struct VirtualMemory {
    base: Address,
    size: usize,
}

impl VirtualMemory {
    /// Reserve `size` bytes of address space without committing it. The
    /// returned region is page-aligned and inaccessible until a `commit`.
    pub fn reserve(size: usize) -> Result<VirtualMemory> {
        let size = conversions::raw_align_up(size, crate::util::constants::BYTES_IN_PAGE);
        let ptr = wrap_libc_call(
            &|| unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            },
            libc::MAP_FAILED,
        )?;
        let base = Address::from_mut_ptr(ptr);
        debug_assert!(conversions::is_page_aligned(base));
        trace!("reserved {} bytes at {}", size, base);
        Ok(VirtualMemory { base, size })
    }

    /// Make a prefix of the region accessible with the given protection.
    pub fn commit(&self, bytes: usize, protection: Protection) -> Result<()> {
        debug_assert!(bytes <= self.size);
        let bytes = conversions::raw_align_up(bytes, crate::util::constants::BYTES_IN_PAGE);
        mprotect(self.base, bytes, protection)
    }

    /// Change the protection of an arbitrary page-aligned slice of the region.
    pub fn protect(&self, start: Address, bytes: usize, protection: Protection) -> Result<()> {
        debug_assert!(start >= self.base && start + bytes <= self.limit());
        mprotect(start, bytes, protection)
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn limit(&self) -> Address {
        self.base + self.size
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.limit()
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        if let Err(e) = munmap(self.base, self.size) {
            warn!("failed to unmap region at {}: {}", self.base, e);
        }
    }
}

fn mprotect(start: Address, size: usize, protection: Protection) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, protection.native_flags()) },
        -1,
    )
    .map(|_| ())
}

fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, -1).map(|_| ())
}

/// Invoke a libc call and turn its failure sentinel into an `io::Error`.
fn wrap_libc_call<T: PartialEq + Copy>(f: &dyn Fn() -> T, fail: T) -> Result<T> {
    let ret = f();
    if ret == fail {
        Err(Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;

    #[test]
    fn reserve_commit_rw() {
        let vm = VirtualMemory::reserve(4 * BYTES_IN_PAGE).unwrap();
        vm.commit(2 * BYTES_IN_PAGE, Protection::ReadWrite).unwrap();
        unsafe {
            vm.base().store::<usize>(0xdead_beef);
            assert_eq!(vm.base().load::<usize>(), 0xdead_beef);
        }
    }

    #[test]
    fn regions_do_not_overlap() {
        let a = VirtualMemory::reserve(BYTES_IN_PAGE).unwrap();
        let b = VirtualMemory::reserve(BYTES_IN_PAGE).unwrap();
        assert!(a.limit() <= b.base() || b.limit() <= a.base());
    }

    #[test]
    fn zero_and_set() {
        let vm = VirtualMemory::reserve(BYTES_IN_PAGE).unwrap();
        vm.commit(BYTES_IN_PAGE, Protection::ReadWrite).unwrap();
        set(vm.base(), 0xab, 64);
        unsafe {
            assert_eq!(vm.base().load::<u8>(), 0xab);
        }
        zero(vm.base(), 64);
        unsafe {
            assert_eq!((vm.base() + 63usize).load::<u8>(), 0);
        }
    }
}
