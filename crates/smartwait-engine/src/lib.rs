#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! The Smart-Wait Engine: a concurrent scheduler that owns a set of
//! in-flight *wait jobs*, drives a capture → diff-gate → vision → verdict
//! loop for each, multiplexes them across per-display capture locks and a
//! shared vision backend, enforces timeouts, and emits exactly-once
//! terminal notifications.
//!
//! The engine consumes its external collaborators — frame capture, the
//! vision model, the wake-out channel, and the task-memory sink — as the
//! capability-seam traits in [`adapters`]. It implements none of them
//! itself; embedders wire in their own.

pub mod adapters;

/// Public API for the engine crate.
pub mod api;

mod arbiter;
mod diffgate;
mod engine;
mod error;
mod job;
mod store;
mod verdict;

pub use adapters::{Capture, CaptureError, TaskSink, VisionAdapter, VisionError, WakeNotifier};
pub use api::{start_engine, EngineEvent, EngineHandle, JobSnapshot, RegisterRequest, UpdateRequest};
pub use arbiter::CaptureArbiter;
pub use diffgate::{DiffGate, Frame};
pub use error::EngineError;
pub use store::{ActiveRecord, JsonFileStore, Store, StoreError, TerminalRecord};
pub use verdict::{parse_verdict, Verdict, VerdictStatus};

pub use smartwait_core::{EngineConfig, JobId, JobStatus, Target, TargetParseError};
