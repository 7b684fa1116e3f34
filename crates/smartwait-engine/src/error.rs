use smartwait_core::JobId;

/// Caller-visible errors from `register`/`update`/`cancel` (§7).
///
/// These are synchronous answers to the caller; they never describe an
/// evaluation failure (capture/vision errors live in a job's `last_detail`
/// and eventually in its terminal record, never here).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A `register`/`update` argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    /// `update`/`cancel` referenced a job id the engine has never seen.
    #[error("job {0} not found")]
    NotFound(JobId),
    /// `update`/`cancel` referenced a job that has already reached a
    /// terminal state.
    #[error("job {0} is already terminal")]
    AlreadyTerminal(JobId),
    /// The engine's scheduler task is no longer running.
    #[error("engine is shut down")]
    ShutDown,
}
