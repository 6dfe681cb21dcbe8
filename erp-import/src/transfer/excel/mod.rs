//! Spreadsheet input and the failed-rows report

pub mod failed;
pub mod source;

pub use failed::{FailedRow, write_failed_rows};
pub use source::{SourceOptions, canonical_header, read_headers, read_source};
