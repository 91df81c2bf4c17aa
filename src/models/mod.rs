//! Core data models for batchwise.

mod config;
mod error;
mod item;

pub use config::*;
pub use error::*;
pub use item::*;
