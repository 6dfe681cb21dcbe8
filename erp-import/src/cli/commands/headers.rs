//! `headers` command

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use colored::*;

use crate::transfer::excel::{SourceOptions, read_headers};

#[derive(Args, Debug)]
pub struct HeadersArgs {
    /// Source file (.xlsx, .csv, .tsv)
    pub file: PathBuf,

    /// Worksheet name (default: the first)
    #[arg(long)]
    pub sheet: Option<String>,

    /// Field delimiter for text files
    #[arg(long)]
    pub delimiter: Option<char>,
}

pub fn handle_headers_command(args: HeadersArgs) -> Result<()> {
    if !args.file.exists() {
        anyhow::bail!("File does not exist: {}", args.file.display());
    }
    let options = SourceOptions {
        sheet: args.sheet,
        delimiter: args.delimiter,
        forward_fill: Vec::new(),
    };
    let headers = read_headers(&args.file, &options)?;

    if headers.is_empty() {
        println!("{}", "No header row found".yellow());
        return Ok(());
    }
    for (i, name) in headers.iter().enumerate() {
        println!("{:>3}  {}", i + 1, name.cyan());
    }
    Ok(())
}
