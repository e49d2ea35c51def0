//! Stable exit codes for scriptgen CLI commands.
//!
//! `scriptgen run` without `--print` exits with the generated script's own
//! status once the script has been verified; these codes apply before that.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config, unreadable input, or any other error.
pub const INVALID: i32 = 1;
/// Every attempt and fix was used without a passing test.
pub const EXHAUSTED: i32 = 2;
/// The generation backend failed on the last attempt.
pub const GENERATION: i32 = 3;
/// The overall deadline expired or the run was interrupted.
pub const BUDGET: i32 = 4;
