/// Command-line arguments.
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Elrond: mount forensic images read-only and run analysis tools.
#[derive(Parser, Debug)]
#[command(name = "elrond")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// JSON configuration file (ELROND_* environment variables still apply)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Identify image types from their content signatures
    Identify {
        /// Image files to classify
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Report which catalog tools are installed
    Deps {
        /// Only check tools marked as required
        #[arg(long)]
        required_only: bool,

        /// Also run each tool's version command
        #[arg(long)]
        versions: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List the tool catalog for this platform
    Tools,

    /// Mount an image, wait for Enter or Ctrl-C, then unmount it
    Mount {
        /// Image to mount
        image: PathBuf,

        /// Specific pool slot to use (e.g. /mnt/elrond_mount03 or N:\)
        #[arg(short, long)]
        mount_point: Option<PathBuf>,

        /// Mount writable. Evidence is mounted read-only by default.
        #[arg(long)]
        read_write: bool,
    },

    /// Run a catalog tool with the given arguments
    Exec {
        /// Catalog id of the tool (see `elrond tools`)
        tool: String,

        /// Kill the tool after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Arguments passed to the tool verbatim
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

/// Log level for a `-v` count.
pub fn log_level(verbose: u8) -> tracing::Level {
    match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}
