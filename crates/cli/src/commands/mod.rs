//! Subcommand handlers
//!
//! Every handler returns the [`burner_lib::Outcome`] of the command; the
//! entry point maps it to the exit code.

pub mod cluster;
pub mod init;
pub mod measure;
pub mod metrics;
