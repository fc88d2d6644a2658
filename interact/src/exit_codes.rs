//! Stable exit codes for the `grade` CLI.

/// The plan ran (whatever the scores) or validated cleanly.
pub const OK: i32 = 0;
/// Invalid plan, configuration or submission info, or another error.
pub const INVALID: i32 = 1;
/// The plan's tests depend on each other in a cycle.
pub const CYCLIC: i32 = 2;
