//! CLI argument definitions for Steward.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Steward -- operator tooling for the agent execution core.
#[derive(Parser)]
#[command(
    name = "steward",
    version,
    about = "Steward -- inspect sessions, explain routing, validate configuration",
    long_about = "Operator commands over the Steward session store and model router. \
                  Backend credentials are read from the environment (and `.env`)."
)]
pub struct Cli {
    /// Configuration file. Falls back to $STEWARD_CONFIG, then `steward.toml`.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding `[store].path`.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Print JSON instead of text, and log as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List sessions, most recently updated first.
    Sessions {
        /// Only sessions with this key.
        #[arg(long, short)]
        key: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: u32,

        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Show the messages of a session.
    History {
        session_id: String,

        /// Include compacted messages.
        #[arg(long)]
        all: bool,

        /// Newest live messages to show.
        #[arg(long, short)]
        limit: Option<u32>,
    },

    /// Flag every live message of a session compacted and clear its summary.
    Reset { session_id: String },

    /// Delete a session and its messages.
    Delete { session_id: String },

    /// List remembered facts, most important first.
    Facts {
        /// Only facts whose content contains this text.
        #[arg(long, short)]
        search: Option<String>,

        /// Only facts of this category (preference, knowledge, pattern, skill, task).
        #[arg(long)]
        category: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Delete a remembered fact by id.
    Forget { id: i64 },

    /// Classify a text and show which backend would handle it.
    Route { text: String },

    /// Resolve a model name or a "switch to X" request to a backend id.
    Resolve { text: String },

    /// Validate the configuration and report backend usability.
    Check,
}
