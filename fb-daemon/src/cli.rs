//! Command Line Interface
//!
//! Subcommands for running the poller and for one-shot diagnostics.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "fluxbard")]
#[command(version)]
#[command(about = "FluxBar - SMC fan and temperature monitor")]
#[command(long_about = "FluxBar - SMC fan and temperature monitor

Reads fan speeds and die temperatures from the system management controller
and can force fans to manual or full speed.

EXAMPLES:
    fluxbard run                        Poll and log snapshots until interrupted
    fluxbard --simulate run --json      Same, against the built-in simulator
    fluxbard snapshot                   Read everything once and print it
    fluxbard preset \"Full Blast\"        Force every fan to its maximum
    fluxbard read-key TC0P              Raw read of one controller key
    fluxbard settings set-interval 0.5  Persist a faster refresh period

ENVIRONMENT VARIABLES:
    FLUXBAR_LOG=debug      Log filter (default: info)
    XDG_CONFIG_HOME        Base directory for the settings file

FILES:
    ~/.config/fluxbar/settings.json     Application settings")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub controller: ControllerArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
pub struct ControllerArgs {
    /// Use the in-memory simulated controller
    #[arg(long, global = true)]
    pub simulate: bool,

    /// I/O port device for the legacy controller interface
    #[arg(long, global = true, default_value = "/dev/port")]
    pub device: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the polling engine and log every snapshot
    Run {
        /// Print snapshots as JSON lines
        #[arg(long)]
        json: bool,

        /// Refresh period in seconds (0.5, 1, 2 or 5); defaults to the saved setting
        #[arg(long)]
        interval: Option<f64>,

        /// Preset to apply at startup; defaults to the saved setting
        #[arg(long)]
        preset: Option<String>,
    },

    /// Run a single poll pass and print the result
    Snapshot {
        #[arg(long)]
        json: bool,
    },

    /// Apply a preset (Automatic, Manual, Full Blast) once
    Preset { name: String },

    /// Read one controller key and decode it
    ReadKey { key: String },

    /// Show or change persisted settings
    #[command(subcommand)]
    Settings(SettingsCommands),
}

#[derive(Subcommand)]
pub enum SettingsCommands {
    /// Print all settings as JSON
    Show,

    /// Preset applied at startup
    SetPreset { name: String },

    /// Refresh period in seconds
    SetInterval { seconds: f64 },
}
