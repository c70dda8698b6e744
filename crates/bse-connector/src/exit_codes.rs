//! Process exit codes.

/// Clean shutdown.
pub const SUCCESS: i32 = 0;

/// Fatal runtime error.
pub const FATAL: i32 = 1;

/// Configuration rejected before the listener was bound.
pub const CONFIG_ERROR: i32 = 2;
