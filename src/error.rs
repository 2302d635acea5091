//! Errors surfaced across the public API.
//!
//! Contract violations (calling `init` twice without an intervening
//! `deinit`, a body procedure with the wrong arity) stay as
//! `debug_assert!`s at the call site, and out-of-memory / mprotect
//! failures abort the process outright. Only conditions a well-behaved
//! caller can actually recover from at runtime are part of this enum.

use std::fmt;

/// Recoverable contract violations surfaced from `run` and `yield_now`.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// `run` was called on a handle that was never `init`ialized.
    #[error("coroutine has not been initialized")]
    NotInitialized,

    /// `run` was called on a handle whose body already returned.
    #[error("coroutine has already completed")]
    AlreadyDone,

    /// `run` was called from a thread other than the one that called
    /// `init`. A coroutine is pinned to its initializing thread for life.
    #[error("coroutine resumed from a different thread than the one that initialized it")]
    WrongThread,

    /// `yield_now` was called while not running inside any coroutine body.
    #[error("yield_now() called outside of a running coroutine")]
    NotInCoroutine,
}

/// A diagnostic finding from [`crate::Coroutine::check_stack_usage`].
/// Non-fatal in release builds; `deinit` panics on overflow instead of
/// returning this when debug assertions are enabled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StackUsage {
    /// True iff no sentinel byte remains unscribbled — a strong hint the
    /// stack was overrun at some point during the coroutine's life.
    pub overflow: bool,
    /// Bytes of the usable stack that were touched at least once.
    pub touched_bytes: usize,
    /// `touched_bytes` as a fraction of the usable stack size, in the
    /// `[0.0, 1.0]` range (can only read `1.0` when `overflow` is true).
    pub ratio: f64,
}

impl fmt::Display for StackUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes touched ({:.1}% of usable stack){}",
            self.touched_bytes,
            self.ratio * 100.0,
            if self.overflow { ", OVERFLOW SUSPECTED" } else { "" }
        )
    }
}
