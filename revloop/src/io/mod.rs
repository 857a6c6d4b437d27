//! Side-effecting collaborators of the cycle engine.
//!
//! Every seam the engine depends on ([`agent::AgentRunner`],
//! [`git::Checkpointer`], [`verify::Verifier`]) is a trait so tests can swap
//! in scripted fakes.

pub mod agent;
pub mod config;
pub mod git;
pub mod heartbeat;
pub mod lock;
pub mod process;
pub mod prompt;
pub mod session_log;
pub mod verify;
