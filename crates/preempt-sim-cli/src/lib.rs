//! Command-line driver for `preempt-sim`.
//!
//! Loads a simulation configuration and a VM trace, optionally resumes from
//! the latest checkpoint in a snapshot directory, runs the simulation to the
//! end and reports a summary.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod cli;
pub mod run;

pub use cli::{Cli, Format};
pub use run::{Summary, execute, load_trace, write_completed};
