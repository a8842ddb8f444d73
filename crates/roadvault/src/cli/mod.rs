//! CLI module for roadvault
//!
//! Running the binary without a subcommand performs one archive run, which is
//! how the device trigger invokes it.

pub mod config;
pub mod error;
pub mod run;
