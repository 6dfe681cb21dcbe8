pub mod check;
pub mod headers;
pub mod mapping;
pub mod run;
