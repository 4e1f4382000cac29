//! Stable exit codes for the `virt-ci` binary.

/// Run finished (individual test failures are reported, not signalled).
pub const OK: i32 = 0;
/// Run failed before or outside the test loop (settings, selection, repository
/// or environment preparation).
pub const FAILED: i32 = 1;
/// The test loop was aborted by an unexpected fault; reports hold the tests
/// completed before it.
pub const ABORTED: i32 = 2;
