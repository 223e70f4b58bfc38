//! Core library for the desktop agent runner
//!
//! This crate contains the data model shared by the runner and the API server:
//! - Run configuration, records, and plan history
//! - Step records, run results, and trajectory rendering
//! - Handback snapshots
//! - The event taxonomy and its wire framing

pub mod error;
pub mod event;
pub mod run;
pub mod snapshot;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
