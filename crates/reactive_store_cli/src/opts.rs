use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use reactive_store::LockMode;

#[derive(Parser, Debug)]
#[command(name = "reactive_store")]
#[command(bin_name = "reactive_store")]
#[command(version, about, long_about = None)]
pub(crate) struct Opts {
    #[command(subcommand)]
    pub(crate) command: Command,

    /// Store configuration file (JSON)
    #[arg(long, value_name = "FILE")]
    pub(crate) config: Option<PathBuf>,

    /// Trace log file
    #[arg(long, num_args = 0..=1, default_missing_value = "trace.log")]
    pub(crate) trace: Option<PathBuf>,

    #[command(flatten)]
    pub(crate) verbose: Verbosity<InfoLevel>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Subscribe, update, then repeat the same update
    Scenario,

    /// Update a counter from several threads at once
    Stress {
        /// Number of writer threads
        #[arg(long, default_value_t = 4)]
        threads: usize,

        /// Updates per thread
        #[arg(long, default_value_t = 1_000)]
        iterations: usize,

        /// Lock mode, overrides the configuration file
        #[arg(long)]
        mode: Option<LockModeArg>,
    },

    /// Show which subscribers fire for scoped and rejected updates
    Scopes,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub(crate) enum LockModeArg {
    Exclusive,
    SharedRead,
}

impl From<LockModeArg> for LockMode {
    fn from(value: LockModeArg) -> Self {
        match value {
            LockModeArg::Exclusive => LockMode::Exclusive,
            LockModeArg::SharedRead => LockMode::SharedRead,
        }
    }
}
