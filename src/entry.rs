//! The generic entry shim every coroutine's trampoline calls into.
//!
//! Runs on the coroutine's own stack, reached by `call` from the
//! architecture trampoline on the very first resume. Lives for the whole
//! life of the coroutine: it never returns until the body itself returns,
//! suspending instead via ordinary (to Rust) calls into
//! [`crate::context::switch`].

use crate::context;
use crate::coroutine::{CoroutineInner, PackedArgs};
use crate::env::ExecutionEnvironment;
use std::ptr::NonNull;

/// # Safety
/// `handle` and `packed_args` must be the exact pointers
/// [`crate::context::MachineContext::synthetic`] preloaded for this
/// coroutine: `handle` a live `*mut CoroutineInner`, `packed_args` a
/// `Box<PackedArgs>` pointer produced by `Coroutine::init`.
pub(crate) unsafe extern "C" fn entry_shim(
    handle: *mut CoroutineInner,
    packed_args: *mut PackedArgs,
) -> ! {
    // Safety: see function contract.
    unsafe {
        let handle = NonNull::new_unchecked(handle);
        let PackedArgs { body, thread_index } = *Box::from_raw(packed_args);

        let mut env = ExecutionEnvironment::new(handle, thread_index);

        // Publish the environment pointer: this is the sole signal that
        // the coroutine is initialized-and-not-done.
        (*handle.as_ptr()).env = NonNull::new(&mut env as *mut ExecutionEnvironment);

        log::trace!("entry_shim: post-init handshake, switching back to initializer");

        // Post-init handshake: hand control back to `Coroutine::init`
        // before the body runs, so `init` only returns once the
        // coroutine is fully constructed.
        context::switch(
            &mut (*handle.as_ptr()).coroutine_ctx,
            &(*handle.as_ptr()).caller_ctx,
        );

        // The first *user* `run()` call lands here.
        log::trace!("entry_shim: body starting");
        body();
        log::trace!("entry_shim: body returned, marking done");

        env.arena.reset();
        (*handle.as_ptr()).env = None;

        // Final switch: the body is done. Any subsequent `run()` on this
        // handle is a contract violation.
        context::switch(
            &mut (*handle.as_ptr()).coroutine_ctx,
            &(*handle.as_ptr()).caller_ctx,
        );

        unreachable!("a finished coroutine was resumed; this is a contract violation");
    }
}
