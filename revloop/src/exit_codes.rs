//! Stable exit codes for revloop CLI commands.

/// Cycle completed with no actionable issues, or the command succeeded.
pub const OK: i32 = 0;
/// Cycle failed or ended with issues remaining, or the command errored.
pub const FAILED: i32 = 1;
/// Another live session holds the lock for this project and branch.
pub const BUSY: i32 = 2;
/// Cancelled by Ctrl-C; matches the shell convention for SIGINT.
pub const INTERRUPTED: i32 = 130;
