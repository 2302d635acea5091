//! Black-box scenario tests driving only the public API.
//!
//! Each `#[test]` below is named after the scenario or invariant it
//! exercises. Run with `RUST_LOG=stackful_coroutine=trace` to see the
//! per-switch logging.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use stackful_coroutine::{Coroutine, CoroutineOptions, Error, StackSource};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn two_step_lazy_body_runs_to_completion_in_two_resumes() {
    init_logging();
    let log = Arc::new(Mutex::new(Vec::new()));
    let body_log = log.clone();

    let mut co = Coroutine::new();
    co.init(
        move || {
            body_log.lock().unwrap().push("A");
            stackful_coroutine::yield_now().unwrap();
            body_log.lock().unwrap().push("B");
        },
        CoroutineOptions::default(),
    );

    assert!(co.is_initialized());
    assert!(!co.is_done());

    co.run(false).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["A"]);
    assert!(!co.is_done());

    // `false` here, not `true`: `run(true)` on the completing call would
    // also `deinit` the handle, which resets `is_done()` back to `false`
    // before we get a chance to observe it.
    co.run(false).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
    assert!(co.is_done());
}

#[test]
fn generator_via_captured_output_yields_one_value_per_resume() {
    init_logging();
    let produced = Arc::new(Mutex::new(None::<i32>));
    let sink = produced.clone();

    let mut co = Coroutine::new();
    co.init(
        move || {
            for i in 0..3 {
                *sink.lock().unwrap() = Some(i);
                stackful_coroutine::yield_now().unwrap();
            }
        },
        CoroutineOptions::default(),
    );

    let mut seen = Vec::new();
    while !co.is_done() {
        // `false`: a `run(true)` that completes the body also deinits it,
        // which resets `is_done()` back to `false` — polling on `is_done`
        // needs to see `Done` stick until the loop itself stops.
        co.run(false).unwrap();
        if let Some(v) = produced.lock().unwrap().take() {
            seen.push(v);
        }
    }
    assert_eq!(seen, vec![0, 1, 2]);
}

#[test]
fn custom_borrowed_stack_is_used_in_place() {
    init_logging();
    // `'static` is required by `StackSource::Borrowed`; leaking a boxed
    // buffer is the straightforward way to get one in a test.
    let buf: &'static mut [u8] = Box::leak(vec![0u8; 256 * 1024].into_boxed_slice());

    let mut co = Coroutine::new();
    co.init(
        || {
            stackful_coroutine::yield_now().unwrap();
        },
        CoroutineOptions { stack: StackSource::Borrowed(buf) },
    );
    co.run(false).unwrap();
    co.run(false).unwrap();
    assert!(co.is_done());
}

#[test]
fn multi_resume_loop_preserves_locals_across_many_yields() {
    init_logging();
    let total = Arc::new(AtomicUsize::new(0));
    let counter = total.clone();

    let mut co = Coroutine::new();
    co.init(
        move || {
            let mut acc = 0usize;
            for i in 1..=50 {
                acc += i;
                counter.store(acc, Ordering::SeqCst);
                stackful_coroutine::yield_now().unwrap();
            }
        },
        CoroutineOptions::default(),
    );

    for _ in 0..50 {
        co.run(false).unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), (1..=50).sum::<usize>());
    assert!(co.is_done());
}

#[test]
fn deinit_is_idempotent() {
    init_logging();
    let mut co = Coroutine::new();
    co.init(|| {}, CoroutineOptions::default());
    co.run(false).unwrap();
    assert!(co.is_done());
    co.deinit();
    co.deinit();
    assert!(!co.is_initialized());
}

#[test]
fn run_before_init_is_not_initialized() {
    init_logging();
    let mut co = Coroutine::new();
    assert_eq!(co.run(false).unwrap_err(), Error::NotInitialized);
}

#[test]
fn run_after_done_is_already_done() {
    init_logging();
    let mut co = Coroutine::new();
    co.init(|| {}, CoroutineOptions::default());
    co.run(false).unwrap();
    assert!(co.is_done());
    assert_eq!(co.run(false).unwrap_err(), Error::AlreadyDone);
}

#[test]
fn yield_outside_a_coroutine_is_not_in_coroutine() {
    init_logging();
    assert_eq!(stackful_coroutine::yield_now().unwrap_err(), Error::NotInCoroutine);
}

#[test]
fn run_from_a_different_thread_than_init_is_wrong_thread() {
    init_logging();
    let mut co = Coroutine::new();
    co.init(
        || {
            stackful_coroutine::yield_now().unwrap();
        },
        CoroutineOptions::default(),
    );

    let result = std::thread::scope(|scope| scope.spawn(|| co.run(false)).join().unwrap());
    assert_eq!(result.unwrap_err(), Error::WrongThread);
}

#[test]
fn floating_point_state_survives_a_round_trip_through_yield() {
    init_logging();
    // Exercises the MXCSR/x87 control word (and, on Windows, xmm6-xmm15)
    // save/restore half of the context switch: floating-point state
    // computed before a yield must still be correct after resuming.
    let result = Arc::new(Mutex::new(0.0f64));
    let sink = result.clone();

    let mut co = Coroutine::new();
    co.init(
        move || {
            let a = 2.0f64.sqrt();
            stackful_coroutine::yield_now().unwrap();
            let b = a * a;
            stackful_coroutine::yield_now().unwrap();
            *sink.lock().unwrap() = b;
        },
        CoroutineOptions::default(),
    );

    co.run(false).unwrap();
    co.run(false).unwrap();
    co.run(true).unwrap();

    assert!((*result.lock().unwrap() - 2.0).abs() < 1e-9);
}

#[test]
fn caller_rounding_mode_is_unaffected_by_a_coroutine_that_changes_its_own() {
    init_logging();
    // The context switch preserves each side's own MXCSR; a coroutine
    // that alters its rounding mode must not leak that change back to
    // its caller.
    #[cfg(target_arch = "x86_64")]
    unsafe {
        let caller_mxcsr_before = std::arch::x86_64::_mm_getcsr();

        let mut co = Coroutine::new();
        co.init(
            || {
                let mxcsr = std::arch::x86_64::_mm_getcsr();
                std::arch::x86_64::_mm_setcsr(mxcsr | 0x8000); // set FZ (flush-to-zero)
                stackful_coroutine::yield_now().unwrap();
            },
            CoroutineOptions::default(),
        );
        co.run(false).unwrap();

        assert_eq!(std::arch::x86_64::_mm_getcsr(), caller_mxcsr_before);
        co.run(true).unwrap();
    }
}

#[test]
fn temporary_storage_size_matches_the_published_constant() {
    assert_eq!(stackful_coroutine::TEMPORARY_STORAGE_SIZE, 4 * 1024);
}

#[test]
fn temporary_arena_allocation_survives_across_a_yield_then_resets() {
    init_logging();
    let observed = Arc::new(Mutex::new(0u8));
    let sink = observed.clone();

    let mut co = Coroutine::new();
    co.init(
        move || {
            let ptr = stackful_coroutine::alloc_temp(8, 8).expect("arena has room");
            // Safety: `ptr` is valid for 8 bytes for the rest of this body.
            unsafe { ptr.as_ptr().write(0x42) };
            stackful_coroutine::yield_now().unwrap();
            // Safety: same allocation, read back after resuming.
            let value = unsafe { ptr.as_ptr().read() };
            *sink.lock().unwrap() = value;
        },
        CoroutineOptions::default(),
    );

    co.run(false).unwrap();
    co.run(true).unwrap();
    assert_eq!(*observed.lock().unwrap(), 0x42);
}

#[test]
fn alloc_temp_outside_a_coroutine_is_none() {
    init_logging();
    assert!(stackful_coroutine::alloc_temp(8, 8).is_none());
}

#[cfg(feature = "stack_usage_diagnostics")]
#[test]
fn shallow_coroutine_reports_low_stack_usage() {
    init_logging();
    let mut co = Coroutine::new();
    co.init(
        || {
            let _local = [0u8; 64];
            stackful_coroutine::yield_now().unwrap();
        },
        CoroutineOptions { stack: StackSource::Owned { size: 1024 * 1024 } },
    );
    co.run(false).unwrap();
    let usage = co.check_stack_usage().expect("diagnostics enabled");
    assert!(!usage.overflow);
    assert!(usage.ratio < 0.1, "unexpectedly high stack usage: {usage}");
    co.run(true).unwrap();
}

#[cfg(feature = "stack_usage_diagnostics")]
#[test]
fn deep_recursion_raises_the_stack_usage_watermark() {
    init_logging();
    #[inline(never)]
    fn burn(depth: u32, acc: &mut [u8; 4096]) -> u8 {
        acc[depth as usize % acc.len()] = depth as u8;
        if depth == 0 {
            acc[0]
        } else {
            burn(depth - 1, acc) ^ acc[depth as usize % acc.len()]
        }
    }

    let mut co = Coroutine::new();
    co.init(
        || {
            let mut acc = [0u8; 4096];
            std::hint::black_box(burn(400, &mut acc));
            stackful_coroutine::yield_now().unwrap();
        },
        CoroutineOptions { stack: StackSource::Owned { size: 64 * 1024 } },
    );
    co.run(false).unwrap();
    let usage = co.check_stack_usage().expect("diagnostics enabled");
    assert!(usage.touched_bytes > 4096, "expected deep recursion to touch more than one frame's worth: {usage}");
    co.run(true).unwrap();
}
