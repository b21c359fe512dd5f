use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use notesync_engine::SyncMode;

/// Configuration for the notesync command line.
#[derive(Parser, Debug, Clone)]
#[command(name = "notesync")]
#[command(about = "Incremental sync of a markdown vault into a GitHub repository")]
#[command(version)]
pub struct Config {
    /// Directory for settings, caches and run history
    #[arg(long, env = "NOTESYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Root directory of the vault to sync
    #[arg(long, env = "NOTESYNC_VAULT")]
    pub vault: Option<PathBuf>,

    /// GitHub token, overrides the one in the stored settings
    #[arg(long, env = "NOTESYNC_GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run one sync, honoring the cross-device lock
    Run {
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
    /// Run one sync without taking the cross-device lock
    Force {
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
    /// Sync periodically until interrupted
    Daemon,
    /// Show recent runs and totals
    History {
        /// Number of runs to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Forget every fingerprint so the next run uploads everything
    ClearCache {
        /// Skip the first confirmation
        #[arg(long)]
        yes: bool,
        /// Skip the second confirmation
        #[arg(long, requires = "yes")]
        yes_really: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Full,
    Documents,
    DocumentsWithAttachments,
    Assets,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => SyncMode::Full,
            ModeArg::Documents => SyncMode::DocumentsOnly,
            ModeArg::DocumentsWithAttachments => SyncMode::DocumentsWithAttachments,
            ModeArg::Assets => SyncMode::AssetsOnly,
        }
    }
}

impl Config {
    /// Data directory, defaulting to the platform's local data dir.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("notesync")
        })
    }
}
