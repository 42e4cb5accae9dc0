//! CLI argument parsing for modscope

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Command sent to a remote control endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ControlCommand {
    /// Start tracing in the target
    Start,
    /// Stop tracing and flush the target's trace log
    Stop,
    /// Fetch the target's current trace log
    Trace,
    /// Terminate the target process
    Exit,
}

#[derive(Parser, Debug)]
#[command(name = "modscope")]
#[command(version)]
#[command(about = "Module-level call tracer: decode trace logs and control live targets", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decode a trace log into timeline JSON
    Decode {
        /// Trace log path or http(s) URL
        #[arg(value_name = "INPUT")]
        input: String,

        /// Write timeline JSON to FILE instead of stdout
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        output: Option<PathBuf>,

        /// TOML configuration file
        #[arg(long = "config", value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Drive a remote control endpoint
    Control {
        #[arg(value_enum)]
        command: ControlCommand,

        /// Base URL of the endpoint (default: built from the `[remote]` config section)
        #[arg(long = "url", value_name = "URL")]
        url: Option<String>,

        /// Where `trace` writes the fetched log (default: stdout)
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        output: Option<PathBuf>,

        /// TOML configuration file
        #[arg(long = "config", value_name = "FILE")]
        config: Option<PathBuf>,
    },
}
