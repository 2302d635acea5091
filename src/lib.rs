//! Asymmetric stackful coroutines for x86-64 user space (Windows, Linux,
//! macOS).
//!
//! A [`Coroutine`] is a callable body of code running on its own private
//! stack. When it voluntarily suspends with [`yield_now`], control
//! returns to whoever most recently [`Coroutine::run`] it; the next `run`
//! resumes the body at the instruction following that `yield_now`, with
//! all local state intact. Only one coroutine executes at a time per
//! owning thread — this is cooperative, not preemptive, multitasking.
//!
//! ```
//! use stackful_coroutine::{Coroutine, CoroutineOptions};
//!
//! let mut co = Coroutine::new();
//! co.init(
//!     || {
//!         println!("A");
//!         stackful_coroutine::yield_now().unwrap();
//!         println!("B");
//!     },
//!     CoroutineOptions::default(),
//! );
//! co.run(false).unwrap();
//! assert!(!co.is_done());
//! co.run(false).unwrap();
//! assert!(co.is_done());
//! ```
//!
//! # Non-goals
//! No preemption, no cross-thread resumption, no symmetric transfer
//! between peer coroutines, no exception/panic propagation across the
//! `run`/`yield_now` boundary, no automatic stack growth, x86-64 only.

mod arch;
mod context;
mod coroutine;
mod entry;
mod env;
mod error;
mod stack;

pub use coroutine::{alloc_temp, yield_now, Coroutine, CoroutineOptions, StackSource, DEFAULT_STACK_SIZE};
pub use env::TEMPORARY_STORAGE_SIZE;
pub use error::{Error, StackUsage};
