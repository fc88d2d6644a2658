//! Engine for grading harnesses.
//!
//! A harness is a set of named tests with dependencies between them. Each test
//! produces a scored [`core::outcome::Outcome`]; the
//! [`core::scheduler::Scheduler`] runs tests in dependency order and blocks
//! tests whose dependencies failed. The crate is split the same way throughout:
//!
//! - **[`core`]**: deterministic logic (outcomes, scheduling, text helpers) with no I/O.
//! - **[`io`]**: child processes, configuration, the build cache, the run sandbox and
//!   captured calls.
//!
//! [`execute`], [`standard_tests`], [`harness`] and [`report`] combine the two into
//! what a harness author uses.

pub mod core;
pub mod error;
pub mod execute;
pub mod exit_codes;
pub mod harness;
pub mod io;
pub mod logging;
pub mod report;
pub mod standard_tests;
#[cfg(all(unix, any(test, feature = "test-support")))]
pub mod test_support;
