use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "intact")]
#[command(about = "Bit-rot detection and block-level deduplication", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Report removed files and directories
    #[arg(short = 'm', long, global = true)]
    pub log_deleted: bool,

    /// Include dot files
    #[arg(short = 'd', long, global = true)]
    pub include_dot: bool,

    /// Do not follow symlinks
    #[arg(short = 'S', long, global = true)]
    pub skip_symlinks: bool,

    /// Limit the traversal depth (0 = unlimited)
    #[arg(long, global = true, default_value_t = 0)]
    pub max_depth: u32,

    /// Do not track subdirectories in the index
    #[arg(short = 'D', long, global = true)]
    pub no_dir_tracking: bool,

    /// In check mode, drop reports about files not yet in the index
    #[arg(long, global = true)]
    pub skip_new: bool,

    /// Hash algorithm: md5, sha512, blake3
    #[arg(long, global = true)]
    pub algo: Option<String>,

    /// Filename under which hashes are stored, must start with a dot
    #[arg(long, global = true)]
    pub index_name: Option<String>,

    /// Filename holding ignore patterns, must start with a dot
    #[arg(long, global = true)]
    pub ignore_name: Option<String>,

    /// Number of workers; 1 can be faster on spinning disks
    #[arg(short = 'w', long, global = true)]
    pub workers: Option<usize>,

    /// Show verified and ignored files
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Suppress progress and informational output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Append status lines to this file
    #[arg(short = 'l', long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Also write verified/ignored lines to the log file
    #[arg(long, global = true)]
    pub log_verbose: bool,

    /// Ignore the configuration file
    #[arg(long, global = true)]
    pub no_config: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Verify files in readonly mode
    Check {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Add and update indexes
    Update {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Only add new and modified files, do not check existing (quicker)
        #[arg(short = 'a', long)]
        skip_check: bool,
        /// Force update of damaged entries (advanced usage only)
        #[arg(long)]
        force: bool,
    },
    /// Initialize a new index store at the given path
    Init {
        /// One index per directory (split) or one index at the root (atom)
        mode: InitMode,
        path: PathBuf,
        /// Replace an existing store marker
        #[arg(long)]
        force: bool,
    },
    /// Collapse split and nested atom indexes into the atom store at PATH
    Fuse { path: PathBuf },
    /// Only show files that would be ignored
    ShowIgnored {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Block-level deduplication over an atom store
    Dedup {
        #[command(subcommand)]
        command: DedupCommands,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum InitMode {
    Split,
    Atom,
}

#[derive(Debug, Subcommand)]
pub enum DedupCommands {
    /// Group files by digest and classify already-shared extents
    Detect {
        path: PathBuf,
        /// Skip files smaller than this many bytes
        #[arg(long, default_value_t = 1)]
        min_size: u64,
    },
    /// Show the persisted duplicate groups
    Show {
        path: PathBuf,
        /// Emit the groups as JSON
        #[arg(long)]
        json: bool,
        /// List every group member
        #[arg(long)]
        details: bool,
    },
    /// Physically merge duplicate groups (all groups if no hashes given)
    Run {
        path: PathBuf,
        hashes: Vec<String>,
    },
}
