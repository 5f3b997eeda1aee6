use thiserror::Error;

/// Errors returned by every broker operation.
///
/// Crash-induced inconsistency in shared structures is never reported
/// here; the heartbeat monitor repairs it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("station {0:?} already exists with a different definition")]
    DuplicateName(String),
    #[error("too many {0}")]
    TooMany(&'static str),
    #[error("handle is closed")]
    Closed,
    #[error("system is dead")]
    Dead,
    #[error("wait interrupted by wakeup")]
    Wakeup,
    #[error("wait timed out")]
    Timeout,
    #[error("list is busy")]
    Busy,
    #[error("list is empty")]
    Empty,
    #[error("event is not owned by this attachment")]
    NotOwner,
    #[error("length {len} exceeds event capacity {capacity}")]
    LengthTooLarge { len: usize, capacity: usize },
    #[error("remote read failed: {0}")]
    ReadError(String),
    #[error("remote write failed: {0}")]
    WriteError(String),
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::Dead
    }
}
