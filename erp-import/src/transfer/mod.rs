//! Spreadsheet import engine
//!
//! Reads a source file, groups its rows into documents and upserts them
//! into the ERP according to a declarative mapping.

pub mod coerce;
pub mod diff;
pub mod excel;
pub mod executor;
pub mod group;
pub mod job;
pub mod ledger;
pub mod progress;
pub mod resolve;
pub mod types;

pub use job::{Job, JobOptions, JobStatus, RunReport};
pub use types::*;
