//! Process exit codes used by the child harness.
//!
//! Mirrors the `EX_OK`/`EX_GENERIC` constants the original source imports
//! from `salt.defaults.exitcodes`; daemonization failure paths and other
//! exit-code-producing collaborators are out of scope (spec section 1) and
//! are not reproduced here.

/// Successful exit.
pub const EX_OK: i32 = 0;

/// Generic failure exit, used when a daemonization-adjacent step fails
/// before more specific error reporting is available.
pub const EX_GENERIC: i32 = 1;
