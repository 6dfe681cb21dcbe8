//! Run log and failed-rows report
//!
//! Every outcome is appended to `run_<timestamp>.log` as it happens.
//! Failures are also appended to `failed_rows.partial.jsonl`, flushed with
//! each checkpoint so a crash loses at most the in-flight group, and turned
//! into `failed_rows_<timestamp>.xlsx` at the end of the run.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use log::warn;

use crate::transfer::excel::{FailedRow, write_failed_rows};
use crate::transfer::types::{Group, Outcome};

pub const PARTIAL_FILE: &str = "failed_rows.partial.jsonl";

/// Timestamp used in artifact names
pub fn file_stamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Files produced by a finished ledger
#[derive(Debug, Clone, PartialEq)]
pub struct Artifacts {
    pub log: PathBuf,
    /// Present only when something failed
    pub failed_rows: Option<PathBuf>,
    pub failed_count: usize,
}

/// Outcome recorder for one run
pub struct Ledger {
    log_path: PathBuf,
    log: BufWriter<File>,
    partial_path: PathBuf,
    partial: BufWriter<File>,
    failed_path: PathBuf,
    headers: Vec<String>,
    failures: Vec<FailedRow>,
}

impl Ledger {
    /// Open the ledger in `output_dir`. When resuming, failures recorded by
    /// the interrupted run are carried over. Dry runs write to separately
    /// prefixed files so they never disturb an interrupted live run.
    pub fn open(
        output_dir: &Path,
        stamp: &str,
        headers: Vec<String>,
        resume: bool,
        dry_run: bool,
    ) -> Result<Self> {
        fs::create_dir_all(output_dir).with_context(|| {
            format!("Failed to create output directory: {}", output_dir.display())
        })?;

        let prefix = if dry_run { "dry_run_" } else { "" };
        let log_path = output_dir.join(format!("{}run_{}.log", prefix, stamp));
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open run log: {}", log_path.display()))?;

        let partial_path = output_dir.join(format!("{}{}", prefix, PARTIAL_FILE));
        let failures = if resume {
            load_partial(&partial_path)?
        } else {
            Vec::new()
        };
        let partial = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resume)
            .truncate(!resume)
            .open(&partial_path)
            .with_context(|| format!("Failed to open {}", partial_path.display()))?;

        Ok(Self {
            log_path,
            log: BufWriter::new(log),
            partial_path,
            partial: BufWriter::new(partial),
            failed_path: output_dir.join(format!("{}failed_rows_{}.xlsx", prefix, stamp)),
            headers,
            failures,
        })
    }

    fn line(&mut self, text: &str) -> Result<()> {
        writeln!(
            self.log,
            "{} {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            text
        )
        .with_context(|| format!("Failed to write run log: {}", self.log_path.display()))
    }

    /// Free-form log entry
    pub fn note(&mut self, text: &str) -> Result<()> {
        self.line(text)
    }

    pub fn warn(&mut self, text: &str) -> Result<()> {
        self.line(&format!("WARNING {}", text))
    }

    /// Record the outcome of `group`
    pub fn record(&mut self, group: &Group, outcome: &Outcome) -> Result<()> {
        let lines = match (group.rows.first(), group.rows.last()) {
            (Some(first), Some(last)) if first.line != last.line => {
                format!("lines {}-{}", first.line, last.line)
            }
            _ => format!("line {}", group.first_line()),
        };

        match outcome {
            Outcome::Success { action, record_id } => {
                let id = record_id.map_or_else(|| "planned".to_string(), |id| format!("#{}", id));
                self.line(&format!(
                    "{} {} ({}) {}",
                    action.label().to_uppercase(),
                    group.label(),
                    lines,
                    id
                ))
            }
            Outcome::Failure { kind, message } => {
                let verb = if kind.is_skip() { "SKIPPED" } else { "FAILED" };
                self.line(&format!(
                    "{} {} ({}) {}: {}",
                    verb,
                    group.label(),
                    lines,
                    kind,
                    message
                ))?;

                for row in &group.rows {
                    let failed = FailedRow {
                        line: row.line,
                        raw: row.raw.clone(),
                        kind: *kind,
                        message: message.clone(),
                    };
                    let json =
                        serde_json::to_string(&failed).context("Failed to serialize failed row")?;
                    writeln!(self.partial, "{}", json).with_context(|| {
                        format!("Failed to write {}", self.partial_path.display())
                    })?;
                    self.failures.push(failed);
                }
                Ok(())
            }
        }
    }

    /// Push buffered entries to disk
    pub fn flush(&mut self) -> Result<()> {
        self.log.flush().context("Failed to flush run log")?;
        self.partial.flush().context("Failed to flush partial failures")?;
        Ok(())
    }

    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }

    /// Write the failed-rows workbook and close the files. The partial file
    /// is kept when `keep_partial` is set so that a resumed run finds it.
    pub fn finish(mut self, keep_partial: bool) -> Result<Artifacts> {
        self.flush()?;

        let failed_rows = if self.failures.is_empty() {
            None
        } else {
            let mut rows = self.failures.clone();
            rows.sort_by_key(|r| r.line);
            write_failed_rows(&self.failed_path, &self.headers, &rows)?;
            Some(self.failed_path.clone())
        };

        if !keep_partial {
            if let Err(e) = fs::remove_file(&self.partial_path) {
                warn!("Could not remove {}: {}", self.partial_path.display(), e);
            }
        }

        Ok(Artifacts {
            log: self.log_path,
            failed_rows,
            failed_count: self.failures.len(),
        })
    }
}

fn load_partial(path: &Path) -> Result<Vec<FailedRow>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut rows = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FailedRow>(&line) {
            Ok(row) => rows.push(row),
            // A crash mid-write leaves a truncated last line
            Err(e) => warn!("Ignoring damaged entry in {}: {}", path.display(), e),
        }
    }
    Ok(rows)
}
