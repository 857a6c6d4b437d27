//! Agent orchestration engine for automated review/fix loops.
//!
//! A reviewer agent inspects a working tree, a fixer agent applies what it
//! found, and the loop repeats until the reviewer is satisfied or the
//! iteration budget runs out. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (stream parsing, decision
//!   extraction and repair, retry timing, stop rules). No I/O.
//! - **[`io`]**: Side-effecting operations (agent subprocesses, git
//!   checkpoints, lock files, session logs). Isolated behind traits to enable
//!   fakes in tests.
//!
//! [`cycle`] ties the two together into the review → checkpoint → fix →
//! decide state machine.

pub mod core;
pub mod cycle;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
