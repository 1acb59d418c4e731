//! CLI module for hubcapture - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
