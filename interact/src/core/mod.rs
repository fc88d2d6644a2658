//! Deterministic logic shared by the harness.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! and return deterministic outputs suitable for tests.

pub mod outcome;
pub mod scheduler;
pub mod text;
