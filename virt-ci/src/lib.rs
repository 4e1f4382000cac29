//! Continuous-integration controller for the libvirt virtualization test suite.
//!
//! One run selects tests from the harness, optionally merges pull-request
//! patches into the test repositories, prepares the hypervisor host, executes
//! every selected test with a hard timeout, checks the host for leftover state
//! after each test, and persists xunit and text reports as it goes.
//!
//! - **[`core`]**: Pure, deterministic logic (name decomposition, status
//!   classification, filters, reference extraction). No I/O.
//! - **[`io`]**: Side-effecting adapters (processes, git, HTTP, reports), each
//!   behind a trait so tests can script them.
//!
//! Orchestration modules ([`select`], [`deps`], [`patch`], [`execute`],
//! [`controller`]) combine the two.

pub mod controller;
pub mod core;
pub mod deps;
pub mod error;
pub mod execute;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod options;
pub mod patch;
pub mod select;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
