use thiserror::Error;

/// Recoverable failures. Contract violations (misaligned arguments,
/// double init, freeing a free interval, destroying a root while a
/// transaction is open) are panics, not errors, and rollback is
/// infallible by design.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The allocator could not satisfy the requested minimum.
    #[error("arena out of space")]
    OutOfSpace,

    /// The allocation or object log has no room for another entry.
    /// The commit path reacts by squeezing the allocation log; if
    /// that is still insufficient the transaction fails over to
    /// `OutOfSpace`.
    #[error("transaction log full")]
    LogFull,

    /// Replay of the persisted logs referenced a state that cannot be
    /// reconstructed.
    #[error("inconsistent replay: {0}")]
    InconsistentReplay(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
