use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum MmError {
    #[error("pool exhausted: no free RAM sectors and migration made no progress")]
    PoolExhausted,

    #[error("invalid sector {0}")]
    InvalidSector(u32),

    #[error("sensor {sensor} on {src:?} is not configured or not active")]
    InvalidSensor { src: crate::upload::UploadSource, sensor: u32 },

    #[error("no data available")]
    NoData,

    #[error("corrupt chain: hop limit ({limit}) exceeded while walking sensor {sensor}")]
    CorruptChain { sensor: u32, limit: u32 },

    #[error("disk quota exceeded: {0}")]
    DiskQuota(String),

    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("corrupt file {path}: {reason}")]
    CorruptFile { path: String, reason: String },

    #[error("shutdown in progress, writes are rejected")]
    ShutdownInProgress,

    #[error("operation timed out")]
    Timeout,

    #[error("unsupported record: {0}")]
    UnsupportedRecord(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("record index {index} out of range (sector holds {count})")]
    IndexOutOfRange { index: u8, count: u8 },

    #[error("sector is empty, no records to decode")]
    EmptySector,

    #[error("sensor {sensor} on {src:?} already has a batch awaiting ACK/NACK")]
    BatchOutstanding { src: crate::upload::UploadSource, sensor: u32 },
}

pub type Result<T> = std::result::Result<T, MmError>;

/// Retry a fallible filesystem operation once before surfacing its error.
/// Transient failures (a concurrent reader, a momentarily busy mount) are
/// common enough on embedded flash that a single retry clears most of them;
/// a second failure is surfaced as-is.
pub fn retry_io<T>(mut op: impl FnMut() -> std::io::Result<T>) -> std::io::Result<T> {
    match op() {
        Ok(v) => Ok(v),
        Err(e) => {
            warn!(error = %e, "disk I/O failed, retrying once");
            op()
        }
    }
}
