//! The coroutine handle and its public API.

use crate::arch;
use crate::context::{self, MachineContext};
use crate::env::{self, ExecutionEnvironment, CURRENT_ENV};
use crate::error::{Error, StackUsage};
use crate::stack::Stack;
use std::ptr::NonNull;
use std::thread::ThreadId;

/// Used when `CoroutineOptions::stack` is left at its default.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Where `init` should get the coroutine's stack from.
pub enum StackSource {
    /// Allocate and own a fresh stack of at least this many bytes,
    /// rounded up to a page multiple.
    Owned { size: usize },
    /// Use this caller-supplied buffer as-is. Never freed by `deinit`;
    /// never guard-paged. Required to be `'static` so a
    /// `Coroutine` built on it can outlive the scope that created the
    /// buffer without Rust's own borrow checker getting in the way of a
    /// relationship this crate itself is responsible for upholding.
    Borrowed(&'static mut [u8]),
}

impl Default for StackSource {
    fn default() -> StackSource {
        StackSource::Owned { size: DEFAULT_STACK_SIZE }
    }
}

#[derive(Default)]
pub struct CoroutineOptions {
    pub stack: StackSource,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Status {
    Uninitialized,
    Suspended,
    Running,
    Done,
}

/// The value-typed record bundling the user body with the initializing
/// thread's index. Heap-allocated so its address is a single thin
/// pointer that survives in a callee-saved register (`r14`) across the
/// first context switch; a Rust closure's capture environment already
/// is the N-ary argument record a hand-written coroutine would have to
/// pack by hand, so this is just `Box<dyn FnOnce()>` one level removed.
pub(crate) struct PackedArgs {
    pub(crate) body: Box<dyn FnOnce() + 'static>,
    pub(crate) thread_index: u32,
}

/// The two machine context slots, the stack, status, and
/// execution-environment pointer. Heap-allocated by
/// [`Coroutine`] so its address never changes across moves of the
/// `Coroutine` value itself — the coroutine's own stack frames, the
/// packed arguments, and the thread-local "current environment" all hold
/// raw pointers back into this struct.
pub(crate) struct CoroutineInner {
    pub(crate) caller_ctx: MachineContext,
    pub(crate) coroutine_ctx: MachineContext,
    stack: Option<Stack>,
    status: Status,
    pub(crate) env: Option<NonNull<ExecutionEnvironment>>,
    owner_thread: Option<ThreadId>,
}

/// A single asymmetric stackful coroutine.
///
/// `Coroutine` is not `Clone`; it is the single owner of its stack and
/// machine contexts. It is not `Sync`, and only usable from the thread
/// that calls [`Coroutine::init`] (and every `run` thereafter).
pub struct Coroutine {
    inner: Box<CoroutineInner>,
}

// Safety: a `Coroutine` may be built on one thread and handed to another
// before its first `run`, as long as `init` and every `run` happen on the
// same thread thereafter (enforced at runtime by the `owner_thread`
// check). It is deliberately not `Sync`.
unsafe impl Send for Coroutine {}

impl Coroutine {
    /// A fresh, uninitialized handle. Call [`Coroutine::init`] before
    /// `run`ning it.
    pub fn new() -> Coroutine {
        Coroutine {
            inner: Box::new(CoroutineInner {
                caller_ctx: MachineContext::zeroed(),
                coroutine_ctx: MachineContext::zeroed(),
                stack: None,
                status: Status::Uninitialized,
                env: None,
                owner_thread: None,
            }),
        }
    }

    /// Establish the stack and synthetic context, pack `body` for the
    /// entry shim, and drive the post-init handshake. Pins this
    /// coroutine to the calling thread from this point on.
    ///
    /// # Panics
    /// Panics in debug builds if called on a handle that is already
    /// initialized and not yet `deinit`'d.
    pub fn init<F>(&mut self, body: F, options: CoroutineOptions)
    where
        F: FnOnce() + 'static,
    {
        debug_assert!(
            self.inner.status == Status::Uninitialized,
            "Coroutine::init called on an already-initialized handle (AlreadyInitialized)"
        );

        let stack = match options.stack {
            StackSource::Owned { size } => Stack::allocate(size),
            // Safety: the caller upholds the buffer's validity for the
            // `'static` lifetime we required in `StackSource::Borrowed`.
            StackSource::Borrowed(buf) => unsafe {
                Stack::from_buffer(NonNull::new(buf as *mut [u8]).unwrap())
            },
        };

        let packed = Box::new(PackedArgs { body: Box::new(body), thread_index: env::current_thread_index() });
        let packed_ptr = Box::into_raw(packed) as *mut u8;
        let handle_ptr = self.inner.as_mut() as *mut CoroutineInner as *mut u8;

        self.inner.coroutine_ctx = MachineContext::synthetic(
            trampoline_fn(),
            stack.initial_sp(),
            handle_ptr,
            packed_ptr,
        );
        self.inner.stack = Some(stack);
        self.inner.status = Status::Suspended;
        self.inner.owner_thread = Some(std::thread::current().id());

        log::debug!("coroutine initialized, driving post-init handshake");

        // Safety: `coroutine_ctx` was just seeded above; the stack it
        // points into is alive for as long as `self.inner` is.
        unsafe {
            context::switch(&mut self.inner.caller_ctx, &self.inner.coroutine_ctx);
        }

        debug_assert!(self.inner.env.is_some(), "post-init handshake did not publish an environment");
    }

    /// Switch into the coroutine. Returns once it yields or completes.
    /// When it completes and `deinit_when_done` is true, `deinit`s the
    /// handle before returning.
    pub fn run(&mut self, deinit_when_done: bool) -> Result<(), Error> {
        match self.inner.status {
            Status::Uninitialized => return Err(Error::NotInitialized),
            Status::Done => return Err(Error::AlreadyDone),
            Status::Suspended => {}
            Status::Running => {
                unreachable!("a coroutine cannot be run() while it is already running on this thread")
            }
        }

        let current_thread = std::thread::current().id();
        match self.inner.owner_thread {
            Some(owner) if owner == current_thread => {}
            Some(_) => return Err(Error::WrongThread),
            None => self.inner.owner_thread = Some(current_thread),
        }

        let env_ptr = self.inner.env.expect("invariant: initialized && !done implies env is Some");
        // Safety: `env_ptr` is valid for as long as the coroutine is not
        // done, which we just confirmed above.
        unsafe {
            (*env_ptr.as_ptr()).thread_index = env::current_thread_index();
        }

        let previous_env = CURRENT_ENV.with(|c| c.replace(Some(env_ptr)));
        self.inner.status = Status::Running;
        log::trace!("run(): switching into coroutine");

        // Safety: `coroutine_ctx` holds either the synthetic context from
        // `init` or a context saved by a prior `yield_now`/return; either
        // way it is a valid resume target.
        unsafe {
            context::switch(&mut self.inner.caller_ctx, &self.inner.coroutine_ctx);
        }

        CURRENT_ENV.with(|c| c.set(previous_env));
        log::trace!("run(): switched back from coroutine");

        let done = self.inner.env.is_none();
        self.inner.status = if done { Status::Done } else { Status::Suspended };

        if done && deinit_when_done {
            self.deinit();
        }

        Ok(())
    }

    /// Idempotent. Releases the owned stack (if any); a borrowed stack is
    /// never released. With `stack_usage_diagnostics` enabled, asserts
    /// the usable stack was never fully overwritten.
    pub fn deinit(&mut self) {
        if self.inner.status == Status::Uninitialized {
            return;
        }

        #[cfg(feature = "stack_usage_diagnostics")]
        if let Some(usage) = self.check_stack_usage() {
            if usage.overflow {
                log::warn!("deinit: stack overflow suspected ({usage})");
            }
            debug_assert!(!usage.overflow, "stack overflow suspected at deinit ({usage})");
        }

        log::debug!("deinit: releasing coroutine");
        self.inner.stack = None;
        self.inner.env = None;
        self.inner.owner_thread = None;
        self.inner.status = Status::Uninitialized;
    }

    /// True iff `init` has been called and `deinit` has not undone it
    /// since.
    pub fn is_initialized(&self) -> bool {
        self.inner.status != Status::Uninitialized
    }

    /// True iff the body has returned. `false` if never initialized;
    /// pair with [`Coroutine::is_initialized`] to tell the two apart.
    pub fn is_done(&self) -> bool {
        self.inner.status == Status::Done
    }

    /// Scan the usable stack for the high-water mark left by the
    /// sentinel fill at `init` time. Only available when built with the
    /// `stack_usage_diagnostics` feature, and only meaningful for owned
    /// stacks.
    #[cfg(feature = "stack_usage_diagnostics")]
    pub fn check_stack_usage(&self) -> Option<StackUsage> {
        self.inner.stack.as_ref().map(Stack::check_usage)
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        self.deinit();
    }
}

impl Default for Coroutine {
    fn default() -> Coroutine {
        Coroutine::new()
    }
}

/// Suspend the currently-running coroutine on this thread, returning
/// control to whoever most recently `run` it. Resumes at the next `run`.
///
/// # Errors
/// Returns [`Error::NotInCoroutine`] if called while not running inside
/// any coroutine body.
pub fn yield_now() -> Result<(), Error> {
    let env_ptr = CURRENT_ENV.with(|c| c.get()).ok_or(Error::NotInCoroutine)?;

    log::trace!("yield_now(): switching back to caller");

    // Safety: `env_ptr` came from `CURRENT_ENV`, which `Coroutine::run`
    // only ever sets to a live environment for the duration of the
    // switch we are necessarily still inside (we are executing on the
    // coroutine's own stack right now).
    unsafe {
        let owner = (*env_ptr.as_ptr()).owner.as_ptr();
        context::switch(&mut (*owner).coroutine_ctx, &(*owner).caller_ctx);
    }

    Ok(())
}

/// Bump-allocate `size` bytes aligned to `align` from the currently-running
/// coroutine's per-coroutine temporary arena (spec.md §3 Execution
/// Environment; §8 scenario 5). The allocation is not freed individually —
/// the whole arena is reset in bulk the moment the body returns, so nothing
/// allocated here may be read back once the body itself has returned.
///
/// Returns `None` if called while not running inside any coroutine body, or
/// if the arena (sized [`TEMPORARY_STORAGE_SIZE`]) is exhausted.
pub fn alloc_temp(size: usize, align: usize) -> Option<NonNull<u8>> {
    let env_ptr = CURRENT_ENV.with(|c| c.get())?;

    // Safety: `env_ptr` came from `CURRENT_ENV`, which `Coroutine::run`
    // only ever sets to a live environment for the duration of the switch
    // we are necessarily still inside (we are executing on the
    // coroutine's own stack right now), same as `yield_now` above.
    unsafe { (*env_ptr.as_ptr()).arena.alloc(size, align) }
}

fn trampoline_fn() -> unsafe extern "C" fn() {
    arch::trampoline
}
