//! The per-coroutine execution environment.
//!
//! A per-coroutine scratch arena plus the bookkeeping needed to answer
//! "which coroutine (if any) is running on this thread right now" from
//! inside `yield_now`. Exists only while the body is active and lives on
//! the coroutine's own stack, installed by the entry shim.

use crate::coroutine::CoroutineInner;
use std::cell::Cell;
use std::ptr::NonNull;

/// Bytes reserved for the per-coroutine temporary scratch arena.
pub const TEMPORARY_STORAGE_SIZE: usize = 4 * 1024;

/// A bump arena backing short-lived allocations made from inside a
/// coroutine body, released in bulk on every return to the entry shim.
/// Since this crate never unwinds across the `run`/`yield_now`
/// boundary, a bulk reset on return is enough; there is no need to run
/// per-allocation destructors.
///
/// `bytes` is a fixed-size array embedded directly in [`ExecutionEnvironment`]
/// — which itself is a local of [`crate::entry::entry_shim`] — rather than a
/// heap box, so the arena's storage genuinely lives on the coroutine's own
/// stack per `spec.md` §4.3 step 1, not on the process heap.
pub struct Arena {
    bytes: [u8; TEMPORARY_STORAGE_SIZE],
    cursor: usize,
}

impl Arena {
    fn new() -> Arena {
        Arena { bytes: [0u8; TEMPORARY_STORAGE_SIZE], cursor: 0 }
    }

    /// Reset the arena to empty. Called by the entry shim before the body
    /// starts and again after the body returns, so no allocation outlives
    /// a single run of the body past its own bookkeeping.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Bump-allocate `size` bytes aligned to `align`. Returns `None` if the
    /// arena is exhausted; callers fall back to the heap or treat it as a
    /// contract violation, at their discretion — the arena itself never
    /// grows.
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let base = self.bytes.as_mut_ptr() as usize;
        let start = (base + self.cursor + align - 1) & !(align - 1);
        let end = start.checked_add(size)?;
        if end > base + self.bytes.len() {
            return None;
        }
        self.cursor = end - base;
        NonNull::new(start as *mut u8)
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn used(&self) -> usize {
        self.cursor
    }
}

/// Per-coroutine execution environment. Constructed by
/// [`crate::entry::entry_shim`] on the coroutine's own stack and
/// published into the handle's execution-environment pointer for the
/// lifetime of the body.
pub struct ExecutionEnvironment {
    pub arena: Arena,
    /// Back-reference to the coroutine this environment belongs to. Used
    /// by `yield_now` to locate the caller-context slot to switch back
    /// into.
    pub(crate) owner: NonNull<CoroutineInner>,
    /// Snapshot of the initializing thread's index, patched to the
    /// resuming thread's index on every `run`.
    pub thread_index: u32,
}

impl ExecutionEnvironment {
    pub(crate) fn new(owner: NonNull<CoroutineInner>, thread_index: u32) -> ExecutionEnvironment {
        ExecutionEnvironment { arena: Arena::new(), owner, thread_index }
    }
}

thread_local! {
    /// The execution environment of whichever coroutine is innermost-active
    /// on this thread, or `None` if control is on the thread's own stack.
    /// `run` pushes/pops this around each switch, so nested `run` calls
    /// (a coroutine resuming another coroutine on the same thread) restore
    /// the outer coroutine's identity correctly when the inner one yields
    /// back.
    pub(crate) static CURRENT_ENV: Cell<Option<NonNull<ExecutionEnvironment>>> = Cell::new(None);

    /// Monotonic per-thread counter handed out as `thread_index` to
    /// whichever coroutine is first `init`'d or `run` on this thread.
    static THREAD_INDEX: Cell<Option<u32>> = Cell::new(None);
}

/// A stable small integer identifying the current OS thread, lazily
/// assigned on first use.
pub(crate) fn current_thread_index() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(0);
    THREAD_INDEX.with(|slot| {
        if let Some(idx) = slot.get() {
            return idx;
        }
        let idx = NEXT.fetch_add(1, Ordering::Relaxed);
        slot.set(Some(idx));
        idx
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_bump_allocates_and_resets() {
        let mut arena = Arena::new();
        let a = arena.alloc(8, 8).unwrap();
        let b = arena.alloc(8, 8).unwrap();
        assert_ne!(a, b);
        assert!(arena.used() >= 16);
        arena.reset();
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn arena_exhaustion_returns_none() {
        let mut arena = Arena::new();
        assert!(arena.alloc(4, 1).is_some());
        assert!(arena.alloc(TEMPORARY_STORAGE_SIZE + 1, 1).is_none());
    }

    #[test]
    fn thread_index_is_stable_per_thread() {
        let a = current_thread_index();
        let b = current_thread_index();
        assert_eq!(a, b);
    }
}
