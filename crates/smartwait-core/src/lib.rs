#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared vocabulary for the smart-wait engine: job identifiers, target
//! parsing, job status, and the environment-driven engine configuration.
//!
//! This crate has no scheduling logic of its own — it is the set of types
//! both the engine and its embedders need to agree on.

mod config;
mod ids;
mod status;
mod target;

pub use config::EngineConfig;
pub use ids::JobId;
pub use status::JobStatus;
pub use target::{Target, TargetParseError};
