//! `run` command

mod handler;

use std::path::PathBuf;

use clap::Args;

pub use handler::handle_run_command;

#[derive(Args, Debug)]
pub struct RunCommands {
    /// Mapping file describing the import
    #[arg(short, long)]
    pub mapping: PathBuf,

    /// Source file (.xlsx, .csv, .tsv); defaults to the configured input_path
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Look everything up but write nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Groups per batch (default: the mapping's, then the configured one)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// First group to process (0-based); ignores any checkpoint
    #[arg(long)]
    pub start_index: Option<usize>,

    /// Discard the checkpoint of an interrupted run and start over
    #[arg(long)]
    pub restart: bool,

    /// Directory for the run log, failed rows and checkpoint
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Skip the confirmation prompt before a live run
    #[arg(short, long)]
    pub yes: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}
