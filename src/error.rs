use thiserror::Error;

/// Error kinds surfaced by the scheduling core.
///
/// Misses and collisions are deliberately *not* represented here: both are
/// logged and counted while the schedule keeps running, so they never surface
/// as `Err` to a caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TtError {
    /// A frame could not be grown at the head, usually because its headroom
    ///  is exhausted.
    #[error("insufficient headroom to push the TT header")]
    OutOfMemory,

    /// A frame is too short to be rewritten in place.
    #[error("frame buffer cannot be rewritten in place")]
    NotWritable,

    /// The send table holds no entries, so there is no schedule to build.
    #[error("send table holds no entries to schedule")]
    NothingToSchedule,

    /// An entry or commit arrived without an open table-assembly session.
    #[error("no table-assembly session is open")]
    NoSession,

    /// The table-assembly session has already been committed.
    #[error("table-assembly session is not mutable")]
    WrongState,

    /// Commit was requested before all announced entries arrived.
    #[error("received {received} of {expected} announced entries")]
    Incomplete { expected: u32, received: u32 },

    /// A committed record can never fire: its period is zero, or its offset
    ///  lies at or past the period.
    #[error("flow entry has a zero period or an offset past its period")]
    InvalidEntry,

    /// The announced flow count exceeds the per-table maximum, or a flow id
    ///  does not fit the dataplane's 16 bit width.
    #[error("flow count or flow id exceeds the configured maximum")]
    TooMany,
}
