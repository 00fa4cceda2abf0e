//! Repository implementations for database operations

pub mod reports;

pub use reports::*;
