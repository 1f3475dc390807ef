// Every export takes raw handles from C callers and checks them for null;
// the remaining contract is documented once per function family.
#![allow(clippy::missing_safety_doc)]
//! # uthread-abi
//!
//! C boundary for `uthread-core`, exported as `p_uthread_*` symbols from a
//! `cdylib`.
//!
//! Errors are collapsed to the C conventions: handle-returning calls return
//! null, status-returning calls return `-1`, and `void` calls ignore the
//! failure. The cause has already been logged by the core.
//!
//! ```text
//! C caller -> p_uthread_* (this crate) -> uthread-core -> host
//! ```

pub mod uthread_abi;

pub use uthread_abi::*;
