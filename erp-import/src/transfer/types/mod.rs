//! Core types for imports

mod mapping;
mod outcome;
mod resolver;
mod row;
mod value;

pub use mapping::*;
pub use outcome::*;
pub use resolver::*;
pub use row::*;
pub use value::*;
