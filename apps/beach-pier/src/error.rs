use thiserror::Error;

#[derive(Debug, Error)]
pub enum PierError {
    /// The engine task has exited; nothing can be admitted or routed.
    #[error("relay engine is not running")]
    EngineStopped,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
