//! Write operations against the ERP
//!
//! An [`Operation`] is one planned remote write. The executor builds them,
//! logs them in dry runs and executes them otherwise.

pub mod operation;

pub use operation::{Command, Operation};
