//! Deterministic, pure logic shared by the controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (harness output, id lists, issue text) and return deterministic
//! outputs suitable for tests.

pub mod classifier;
pub mod filter;
pub mod name;
pub mod reasons;
pub mod refs;
pub mod types;
