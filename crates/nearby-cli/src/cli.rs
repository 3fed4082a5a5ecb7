use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// nearby: neighborhood presence, "open to hang" status, and notifications.
#[derive(Parser, Debug)]
#[command(name = "nearby", version, about)]
pub struct Args {
    /// Config file path override.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level override (debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a live session and print presence, status, and feed changes until Ctrl-C.
    Watch {
        #[arg(long)]
        user: String,
    },
    /// Ephemeral status.
    #[command(subcommand)]
    Status(StatusCommand),
    /// Notification feed.
    #[command(subcommand)]
    Notifications(NotificationsCommand),
}

#[derive(Subcommand, Debug)]
pub enum StatusCommand {
    /// Mark a user open to hang.
    Set {
        #[arg(long)]
        user: String,
        /// Minutes until the status expires (default from config).
        #[arg(long)]
        ttl_mins: Option<u32>,
        /// Attach the configured position.
        #[arg(long)]
        here: bool,
    },
    /// Reset a user to normal.
    Clear {
        #[arg(long)]
        user: String,
    },
    Get {
        #[arg(long)]
        user: String,
    },
    /// Everyone currently open to hang.
    Nearby,
}

#[derive(Subcommand, Debug)]
pub enum NotificationsCommand {
    List {
        #[arg(long)]
        user: String,
    },
    /// Mark one notification read.
    Read {
        #[arg(long)]
        id: String,
    },
    ReadAll {
        #[arg(long)]
        user: String,
    },
}

pub fn parse() -> Args {
    Args::parse()
}
