pub type Result<T> = std::result::Result<T, ClockError>;

/// Errors raised by the virtual clock and its scheduling operations.
///
/// All of these surface synchronously at the call site; nothing is retried
/// internally and clock state is left untouched by a failed call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    /// A second virtual clock was constructed while one is installed.
    #[error("a virtual clock is already installed")]
    AlreadyInstalled,
    /// A scheduling or time-advance operation ran against a restored clock.
    #[error("no virtual clock is installed")]
    NotInstalled,
    /// `restore` was called a second time.
    #[error("the virtual clock was already restored")]
    AlreadyRestored,
    /// The requested time is earlier than the current virtual time.
    #[error("time may not move backward (now {now}ms, requested {requested}ms)")]
    TimeMovedBack { now: u64, requested: u64 },
    /// The configured start is not representable as a Unix-epoch timestamp.
    #[error("start time is before the Unix epoch")]
    InvalidStart,
    /// The auto-advance configuration is unusable.
    #[error("invalid clock options: {0}")]
    InvalidOptions(&'static str),
}

/// Error for the real-time [`delay`](crate::delay) wait.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DelayError {
    /// The supplied cancellation token fired before or during the wait.
    #[error("delay was cancelled")]
    Cancelled,
}
