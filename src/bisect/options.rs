use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug,Parser)]
#[command(version, about)]
#[command(after_long_help="Logging is controlled with various -v options or via the RUST_LOG/RUST_LOG_STYLE\nas described in https://docs.rs/env_logger documentation.")]
pub struct Options {
    /// Configuration file (default: gcc-bisect.toml in the user configuration directory)
    #[arg(long, global=true, value_hint=clap::ValueHint::FilePath)]
    pub config : Option<PathBuf>,
    /// Generate verbose output.  Twice for additional verbosity.
    #[arg(short, long, global=true, action=clap::ArgAction::Count)]
    pub verbose : u8,
    /// Fetch the remote repository before looking at revisions
    #[arg(short, long, global=true)]
    pub pull : bool,
    #[command(subcommand)]
    pub subcommand : BisectCommand
}

#[derive(Debug,Subcommand)]
pub enum BisectCommand {
    /// Find the first revision where the behaviour of a command changes
    #[command(display_order=0)]
    Bisect(BisectOptions),
    /// Build and store every tracked revision that has no binaries yet
    #[command(display_order=1)]
    Build(BuildOptions),
    /// Remove stored binaries of revisions that are no longer tracked
    #[command(display_order=3)]
    Gc,
    /// List tracked revisions and whether binaries exist for them
    #[command(display_order=2)]
    Print,
    /// Extract the binaries of one revision into the staging directory
    #[command(display_order=4)]
    Unpack(UnpackOptions)
}

#[derive(Clone,Debug,Default,Args)]
pub struct BisectOptions {
    /// Shell command run against every candidate, with the candidate's
    /// binaries first in PATH
    pub command : String,
    /// Oldest revision of the bisection range (inclusive)
    #[arg(short='s', long)]
    pub bisect_start : Option<String>,
    /// Newest revision of the bisection range (inclusive)
    #[arg(short='e', long)]
    pub bisect_end : Option<String>,
    /// Test only the latest revisions (skip releases and branches)
    #[arg(short='l', long)]
    pub only_latest : bool,
    /// Treat a successful command as a failure and vice versa
    #[arg(short='x', long)]
    pub negate : bool,
    /// Success means the output contains an internal compiler error
    #[arg(short, long)]
    pub ice : bool,
    /// Kill the command after this many seconds
    #[arg(short, long, value_name="SECS")]
    pub timeout : Option<f64>,
    /// Count a successful command that took longer than this many seconds as a failure
    #[arg(long, value_name="SECS")]
    pub soft_timeout : Option<f64>,
    /// Do not echo the output of the command
    #[arg(long)]
    pub silent : bool,
    /// Ask whether a successful run really succeeded
    #[arg(short, long)]
    pub ask : bool,
    /// Test also releases older than the oldest active branch
    #[arg(short, long)]
    pub old : bool,
    /// Exit code that counts as success
    #[arg(long, default_value_t=0, allow_negative_numbers=true)]
    pub success_exit_code : i32
}

#[derive(Clone,Debug,Default,Args)]
pub struct BuildOptions {
    /// Leave the last installed tree staged after storing it
    #[arg(long)]
    pub preserve : bool,
    /// Stop after this many successful builds
    #[arg(long, value_name="N")]
    pub limit : Option<usize>
}

#[derive(Clone,Debug,Args)]
pub struct UnpackOptions {
    /// Revision to extract (hash prefix, branch label, N-base or rNN-NNNN-gHASH)
    pub revision : String
}
