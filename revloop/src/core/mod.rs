//! Deterministic, pure logic shared by the engine.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! (transcript text, decisions, counters) and return deterministic outputs
//! suitable for tests. Backoff jitter is the one source of randomness and can
//! be injected through [`retry::retry_delay_with`].

pub mod decision;
pub mod extract;
pub mod outcome;
pub mod repair;
pub mod retry;
pub mod stream;
pub mod types;
