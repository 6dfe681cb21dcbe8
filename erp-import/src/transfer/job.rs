//! One import run
//!
//! A job reads the source, groups its rows and feeds the groups to the
//! executor in batches. Every outcome goes to the ledger; after each group
//! the checkpoint advances so an interrupted run resumes where it stopped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use uuid::Uuid;

use crate::api::client::ErpApi;
use crate::api::error::RpcError;
use crate::api::resilience::ResilienceConfig;
use crate::api::session::Session;
use crate::transfer::excel::{SourceOptions, read_source};
use crate::transfer::executor::Executor;
use crate::transfer::group::group_rows;
use crate::transfer::ledger::{Ledger, file_stamp};
use crate::transfer::progress::{Checkpoint, ProgressStore, input_key};
use crate::transfer::resolve::Resolver;
use crate::transfer::types::{Counters, FailureKind, GroupOutcome, Mapping, ResolutionCache};

/// Run parameters that do not come from the mapping
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub dry_run: bool,
    pub batch_size: usize,
    /// First group to process; overrides any checkpoint
    pub start_index: Option<usize>,
    /// Discard the checkpoint instead of resuming
    pub restart: bool,
}

impl JobOptions {
    pub fn new(input: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output_dir: output_dir.into(),
            dry_run: false,
            batch_size: 100,
            start_index: None,
            restart: false,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    /// Every group was processed; row failures do not change this
    Success,
    /// The stop signal arrived; the checkpoint allows a resume
    Stopped,
    /// A fatal failure ended the run
    Aborted(FailureKind, String),
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Success)
    }
}

/// Everything a finished run reports
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: JobStatus,
    pub counters: Counters,
    /// Outcomes of the groups processed by this run, in source order
    pub outcomes: Vec<GroupOutcome>,
    pub warnings: Vec<String>,
    pub total_groups: usize,
    pub start_group: usize,
    pub calls: u64,
    pub retries: u64,
    /// Operations logged instead of executed (dry runs)
    pub planned: usize,
    /// Reference lookups sent to the server
    pub lookups: usize,
    /// Referenced records created from templates
    pub references_created: usize,
    pub elapsed: Duration,
    pub log_path: PathBuf,
    pub failed_rows_path: Option<PathBuf>,
}

/// Import job; single use
pub struct Job<A: ErpApi> {
    mapping: Mapping,
    options: JobOptions,
    session: Session<A>,
    resolver: Resolver,
    stop: Arc<AtomicBool>,
}

impl<A: ErpApi> Job<A> {
    pub fn new(
        mapping: Mapping,
        options: JobOptions,
        api: A,
        resilience: &ResilienceConfig,
        cache: Box<dyn ResolutionCache>,
    ) -> Self {
        let dry_run = options.dry_run;
        Self {
            mapping,
            options,
            session: Session::new(api, resilience),
            resolver: Resolver::new(cache, dry_run),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the job at the next group boundary
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run the job to completion, stop or abort.
    ///
    /// Unreadable input and local I/O failures are returned as errors;
    /// remote failures end up in the report.
    pub async fn run(self) -> Result<RunReport> {
        let Job {
            mapping,
            options,
            mut session,
            mut resolver,
            stop,
        } = self;
        let started = Instant::now();

        let source = read_source(
            &options.input,
            &SourceOptions {
                sheet: mapping.sheet.clone(),
                delimiter: mapping.delimiter,
                forward_fill: mapping.forward_fill.clone(),
            },
        )
        .with_context(|| format!("Failed to read input: {}", options.input.display()))?;
        let groups = group_rows(source.rows, &mapping.grouping_key);
        let total_groups = groups.len();
        let rows: usize = groups.iter().map(|g| g.rows.len()).sum();
        info!("{} rows form {} groups", rows, total_groups);

        std::fs::create_dir_all(&options.output_dir).with_context(|| {
            format!("Failed to create output directory: {}", options.output_dir.display())
        })?;
        let store = ProgressStore::new(&options.output_dir);
        let checkpoint = if options.dry_run {
            None
        } else if options.restart {
            store.clear()?;
            None
        } else {
            store.load(&options.input, &mapping.name)?
        };

        let resume_from = (options.start_index, checkpoint);
        let (start_group, mut counters, seen, run_id, resumed) = match resume_from {
            (Some(index), _) => {
                info!("Starting at group {} as requested", index);
                (index, Counters::default(), HashMap::new(), Uuid::new_v4(), false)
            }
            (None, Some(checkpoint)) => (
                checkpoint.next_group(),
                checkpoint.counters,
                checkpoint.seen,
                checkpoint.run_id,
                true,
            ),
            (None, None) => (0, Counters::default(), HashMap::new(), Uuid::new_v4(), false),
        };

        let mut ledger = Ledger::open(
            &options.output_dir,
            &file_stamp(),
            source.original_headers,
            resumed,
            options.dry_run,
        )?;
        ledger.note(&format!(
            "{} run {} of '{}' on {} ({} groups, starting at {})",
            if options.dry_run { "Dry" } else { "Live" },
            run_id,
            mapping.name,
            options.input.display(),
            total_groups,
            start_group
        ))?;

        let mut executor = Executor::new(&mapping, options.dry_run).with_seen(seen);
        let mut outcomes = Vec::new();
        let mut warnings = Vec::new();
        let pending = groups.get(start_group..).unwrap_or_default();
        let input_path = input_key(&options.input);

        let result: Result<JobStatus> = async {
            if pending.is_empty() {
                return Ok(JobStatus::Success);
            }
            if let Err(error) = session.authenticate().await {
                return aborted(&mut ledger, "authentication", &error);
            }

            for batch in pending.chunks(options.batch_size.max(1)) {
                if let Err(error) = executor.prefetch(&mut session, &mut resolver, batch).await {
                    return aborted(&mut ledger, "prefetch", &error);
                }

                for group in batch {
                    if stop.load(Ordering::SeqCst) {
                        ledger.note(&format!("STOPPED before {}", group.label()))?;
                        warn!("Stop requested; {} groups left", total_groups - group.index);
                        return Ok(JobStatus::Stopped);
                    }

                    let outcome = match executor.process(&mut session, &mut resolver, group).await {
                        Ok(outcome) => outcome,
                        Err(error) => return aborted(&mut ledger, &group.label(), &error),
                    };

                    let mut notes = resolver.take_warnings();
                    notes.extend(executor.take_warnings());
                    for warning in notes {
                        ledger.warn(&warning)?;
                        warnings.push(warning);
                    }
                    ledger.record(group, &outcome)?;
                    counters.record(&outcome);
                    outcomes.push(GroupOutcome {
                        group: group.index,
                        lines: group.rows.iter().map(|r| r.line).collect(),
                        label: group.label(),
                        outcome,
                    });

                    ledger.flush()?;
                    if !options.dry_run {
                        store.save(&Checkpoint {
                            run_id,
                            input_path: input_path.clone(),
                            mapping: mapping.name.clone(),
                            last_completed_group: group.index,
                            counters,
                            seen: executor.seen().clone(),
                            updated_at: Utc::now(),
                        })?;
                    }
                }

                info!(
                    "Processed {}/{} groups ({} failed)",
                    outcomes.len() + start_group.min(total_groups),
                    total_groups,
                    counters.failed
                );
            }
            Ok::<_, anyhow::Error>(JobStatus::Success)
        }
        .await;

        session.close().await;
        let status = result?;

        let complete = status.is_success();
        if complete && !options.dry_run {
            store.clear()?;
        }
        ledger.note(&format!(
            "Finished: {} created, {} updated, {} unchanged, {} skipped, {} failed",
            counters.created,
            counters.updated,
            counters.unchanged,
            counters.skipped,
            counters.failed
        ))?;
        let artifacts = ledger.finish(!complete && !options.dry_run)?;

        Ok(RunReport {
            status,
            counters,
            outcomes,
            warnings,
            total_groups,
            start_group,
            calls: session.calls(),
            retries: session.retries(),
            planned: executor.planned(),
            lookups: resolver.lookups(),
            references_created: resolver.created(),
            elapsed: started.elapsed(),
            log_path: artifacts.log,
            failed_rows_path: artifacts.failed_rows,
        })
    }
}

fn aborted(ledger: &mut Ledger, at: &str, error: &RpcError) -> Result<JobStatus> {
    let kind = match error {
        RpcError::AuthFailure(_) => FailureKind::AuthFailure,
        _ => FailureKind::Unreachable,
    };
    let message = error.summary();
    error!("Aborting at {}: {}", at, message);
    ledger.note(&format!("ABORTED at {}: {}: {}", at, kind, message))?;
    ledger.flush()?;
    Ok(JobStatus::Aborted(kind, message))
}
