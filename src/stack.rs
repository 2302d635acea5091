//! Stack allocation for a coroutine's private execution stack.
//!
//! Allocates a page-aligned, optionally guard-paged region for an owned
//! coroutine stack, or wraps a caller-supplied buffer as-is. Reserves
//! pages with `rustix::mm::mmap_anonymous`/`VirtualAlloc` and protects
//! the extremities with `mprotect`/`VirtualProtect`.

use crate::error::StackUsage;
use std::ptr::NonNull;

#[cfg(feature = "stack_usage_diagnostics")]
const SENTINEL: u8 = 0xC0;

/// Where the bytes backing a coroutine's stack came from.
enum Storage {
    /// Allocated by [`Stack::allocate`]; the extent includes guard pages
    /// when the `guard_pages` feature is enabled. Released on drop.
    Owned { alloc_base: NonNull<u8>, alloc_len: usize },
    /// Supplied by the caller at `init` time. Never released; guard pages
    /// are never applied (the caller's buffer may not be page-aligned and
    /// the caller may lack permission to protect it).
    Borrowed,
}

/// A contiguous, 16-byte-aligned region of memory usable as a coroutine
/// stack, plus the bookkeeping needed to release it.
pub(crate) struct Stack {
    storage: Storage,
    /// Low address of the *usable* interior, rounded up to 16.
    low: NonNull<u8>,
    /// High address of the *usable* interior (one past the last usable
    /// byte), rounded down to 16. Stacks grow down from here.
    high: NonNull<u8>,
}

// Safety: a `Stack` is exclusively owned by the `Coroutine` handle that
// created it and is only ever touched from the thread that owns that
// handle, or by the switch routine running on the stack itself.
unsafe impl Send for Stack {}

impl Stack {
    /// Allocate a fresh, page-aligned stack of at least `requested_size`
    /// bytes, flanked by guard pages when the `guard_pages` feature is on.
    ///
    /// Aborts the process on allocation failure; there is no recoverable
    /// path out of a failed `mmap`/`VirtualAlloc` here.
    pub fn allocate(requested_size: usize) -> Stack {
        let page_size = page_size();
        let usable = round_up(requested_size.max(1), page_size);
        let guard_pages = cfg!(feature = "guard_pages");
        let extra = if guard_pages { 2 * page_size } else { 0 };
        let alloc_len = usable + extra;

        let alloc_base = platform::map(alloc_len);

        if guard_pages {
            // Safety: `alloc_base` and `alloc_base + alloc_len - page_size`
            // are both page-aligned pages within the mapping we just made.
            unsafe {
                platform::protect_none(alloc_base, page_size);
                platform::protect_none(
                    NonNull::new_unchecked(alloc_base.as_ptr().add(alloc_len - page_size)),
                    page_size,
                );
            }
        }

        let interior_low = if guard_pages {
            // Safety: within the mapping.
            unsafe { NonNull::new_unchecked(alloc_base.as_ptr().add(page_size)) }
        } else {
            alloc_base
        };
        let interior_high_addr = interior_low.as_ptr() as usize + usable;

        let low = round_up(interior_low.as_ptr() as usize, 16);
        let high = round_down(interior_high_addr, 16);
        debug_assert!(low + 16 <= high, "requested_stack_size too small after alignment");

        #[cfg(feature = "stack_usage_diagnostics")]
        // Safety: [low, high) is freshly mapped, writable, owned memory.
        unsafe {
            std::ptr::write_bytes(low as *mut u8, SENTINEL, high - low);
        }

        log::debug!(
            "allocated owned stack: usable={usable} guard_pages={guard_pages} low={low:#x} high={high:#x}"
        );

        Stack {
            storage: Storage::Owned { alloc_base, alloc_len },
            low: unsafe { NonNull::new_unchecked(low as *mut u8) },
            high: unsafe { NonNull::new_unchecked(high as *mut u8) },
        }
    }

    /// Wrap a caller-supplied buffer. Never released; never guard-paged.
    /// The usable region is the buffer clipped to 16-byte alignment at
    /// both ends.
    ///
    /// # Safety
    /// `buf` must be valid for reads and writes for its full length for as
    /// long as the returned `Stack` (and any `Coroutine` built on it) is
    /// alive.
    pub unsafe fn from_buffer(buf: NonNull<[u8]>) -> Stack {
        let base = buf.as_ptr() as *mut u8 as usize;
        let len = buf.len();
        let low = round_up(base, 16);
        let high = round_down(base + len, 16);
        debug_assert!(low + 16 <= high, "supplied stack buffer too small after alignment");

        #[cfg(feature = "stack_usage_diagnostics")]
        // Safety: [low, high) is within `buf`, which the caller guarantees
        // is valid for reads and writes per this function's own contract.
        unsafe {
            std::ptr::write_bytes(low as *mut u8, SENTINEL, high - low);
        }

        log::debug!("wrapped caller-supplied stack: low={low:#x} high={high:#x}");
        Stack {
            storage: Storage::Borrowed,
            low: unsafe { NonNull::new_unchecked(low as *mut u8) },
            high: unsafe { NonNull::new_unchecked(high as *mut u8) },
        }
    }

    /// High (initial) stack pointer for a fresh synthetic context: the top
    /// of the usable region, already 16-byte aligned.
    pub fn initial_sp(&self) -> *mut u8 {
        self.high.as_ptr()
    }

    pub fn low(&self) -> *mut u8 {
        self.low.as_ptr()
    }

    pub fn high(&self) -> *mut u8 {
        self.high.as_ptr()
    }

    pub fn usable_len(&self) -> usize {
        self.high.as_ptr() as usize - self.low.as_ptr() as usize
    }

    /// Scan from the low end of the usable stack for the high-water mark
    /// left by the sentinel fill in [`Stack::allocate`] or
    /// [`Stack::from_buffer`] — both fill the usable region the same way,
    /// so this is meaningful for owned and borrowed stacks alike.
    #[cfg(feature = "stack_usage_diagnostics")]
    pub fn check_usage(&self) -> StackUsage {
        let len = self.usable_len();
        // Safety: [low, high) is the stack's own usable region.
        let touched = unsafe {
            let base = self.low.as_ptr();
            let mut i = 0;
            while i < len && *base.add(i) == SENTINEL {
                i += 1;
            }
            len - i
        };
        StackUsage {
            overflow: touched == len,
            touched_bytes: touched,
            ratio: touched as f64 / len as f64,
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Storage::Owned { alloc_base, alloc_len } = self.storage {
            // Safety: `alloc_base`/`alloc_len` describe the mapping made in
            // `allocate` and have not been released before now.
            unsafe { platform::unmap(alloc_base, alloc_len) };
        }
    }
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

fn round_down(n: usize, align: usize) -> usize {
    n & !(align - 1)
}

#[cfg(unix)]
fn page_size() -> usize {
    rustix::param::page_size()
}

#[cfg(windows)]
fn page_size() -> usize {
    use std::mem::MaybeUninit;
    use windows_sys::Win32::System::SystemInformation::GetNativeSystemInfo;
    // Safety: GetNativeSystemInfo fills the whole struct unconditionally.
    unsafe {
        let mut info = MaybeUninit::zeroed().assume_init();
        GetNativeSystemInfo(&mut info);
        info.dwPageSize as usize
    }
}

#[cfg(unix)]
mod platform {
    use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};
    use std::ptr::NonNull;

    pub fn map(len: usize) -> NonNull<u8> {
        // Safety: anonymous, private mapping with no fixed address.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE | MapFlags::from_bits_retain(0x20000), // MAP_STACK
            )
        };
        match ptr {
            Ok(ptr) => NonNull::new(ptr as *mut u8).expect("mmap returned null on success"),
            Err(e) => panic!("stackful-coroutine: mmap failed allocating {len} bytes: {e}"),
        }
    }

    /// # Safety
    /// `ptr` must point to `len` bytes entirely within a mapping made by
    /// [`map`], on a page boundary.
    pub unsafe fn protect_none(ptr: NonNull<u8>, len: usize) {
        let result = unsafe { rustix::mm::mprotect(ptr.as_ptr().cast(), len, MprotectFlags::empty()) };
        if let Err(e) = result {
            panic!("stackful-coroutine: mprotect(PROT_NONE) failed: {e}");
        }
    }

    /// # Safety
    /// `ptr`/`len` must describe a mapping made by [`map`] that has not
    /// already been unmapped.
    pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
        let result = unsafe { rustix::mm::munmap(ptr.as_ptr().cast(), len) };
        if let Err(e) = result {
            panic!("stackful-coroutine: munmap failed: {e}");
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::ptr::NonNull;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_NOACCESS, PAGE_READWRITE,
    };

    pub fn map(len: usize) -> NonNull<u8> {
        // Safety: reserving and committing a fresh anonymous region.
        let ptr = unsafe {
            VirtualAlloc(std::ptr::null(), len, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
        };
        NonNull::new(ptr as *mut u8)
            .unwrap_or_else(|| panic!("stackful-coroutine: VirtualAlloc failed allocating {len} bytes"))
    }

    /// # Safety
    /// `ptr` must point to `len` bytes entirely within a mapping made by
    /// [`map`], on a page boundary.
    pub unsafe fn protect_none(ptr: NonNull<u8>, len: usize) {
        let mut old = 0u32;
        // Safety: delegated to caller per function contract.
        let ok = unsafe { VirtualProtect(ptr.as_ptr().cast(), len, PAGE_NOACCESS, &mut old) };
        if ok == 0 {
            panic!("stackful-coroutine: VirtualProtect(PAGE_NOACCESS) failed");
        }
    }

    /// # Safety
    /// `ptr` must be the base of a mapping made by [`map`] that has not
    /// already been released; `_len` is informational only (`MEM_RELEASE`
    /// always releases the whole reservation).
    pub unsafe fn unmap(ptr: NonNull<u8>, _len: usize) {
        // Safety: delegated to caller per function contract.
        let ok = unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) };
        if ok == 0 {
            panic!("stackful-coroutine: VirtualFree failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_stack_is_aligned_and_sized() {
        let stack = Stack::allocate(64 * 1024);
        assert_eq!(stack.low() as usize % 16, 0);
        assert_eq!(stack.high() as usize % 16, 0);
        assert!(stack.usable_len() >= 64 * 1024);
    }

    #[test]
    fn borrowed_stack_clips_to_alignment() {
        let mut buf = vec![0u8; 32 * 1024 + 3];
        let ptr = NonNull::new(buf.as_mut_slice() as *mut [u8]).unwrap();
        let stack = unsafe { Stack::from_buffer(ptr) };
        assert_eq!(stack.low() as usize % 16, 0);
        assert_eq!(stack.high() as usize % 16, 0);
        assert!(stack.low() as usize >= buf.as_ptr() as usize);
        assert!(stack.high() as usize <= buf.as_ptr() as usize + buf.len());
    }

    #[cfg(feature = "stack_usage_diagnostics")]
    #[test]
    fn fresh_stack_reports_zero_usage() {
        let stack = Stack::allocate(64 * 1024);
        let usage = stack.check_usage();
        assert!(!usage.overflow);
        assert_eq!(usage.touched_bytes, 0);
    }

    #[cfg(feature = "stack_usage_diagnostics")]
    #[test]
    fn fresh_borrowed_stack_reports_zero_usage() {
        let mut buf = vec![0u8; 64 * 1024];
        let ptr = NonNull::new(buf.as_mut_slice() as *mut [u8]).unwrap();
        let stack = unsafe { Stack::from_buffer(ptr) };
        let usage = stack.check_usage();
        assert!(!usage.overflow);
        assert_eq!(usage.touched_bytes, 0);
    }
}
