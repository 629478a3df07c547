use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Failed to open process: {0}")]
    ProcessOpenFailed(String),

    #[error("Failed to read process memory at address {address:#x}: {message}")]
    MemoryReadFailed { address: u64, message: String },

    #[error("Failed to write process memory at address {address:#x}: {message}")]
    MemoryWriteFailed { address: u64, message: String },

    #[error("Invalid address: {0:#x}")]
    InvalidAddress(u64),

    #[error("Remote count {count} exceeds maximum of {max}")]
    CountOutOfRange { count: u32, max: u32 },

    #[error("Scatter transaction failed: {0}")]
    ScatterFailed(String),

    /// A non-transactional scatter write failed after some writes landed
    #[error("Scatter write failed after {landed} of {total} writes: {source}")]
    PartialWrite {
        landed: usize,
        total: usize,
        source: Box<Error>,
    },

    #[error("Failed to install hook: {0}")]
    HookInstallFailed(String),

    #[error("No code cave of {size} bytes found")]
    CaveNotFound { size: usize },

    #[error("Call bridge is not initialized")]
    BridgeNotInitialized,

    #[error("Native calls take at most 4 register arguments, got {0}")]
    TooManyArguments(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Transport failures are recoverable: the caller may retry on the next tick.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::MemoryReadFailed { .. }
                | Error::MemoryWriteFailed { .. }
                | Error::InvalidAddress(_)
                | Error::ScatterFailed(_)
                | Error::PartialWrite { .. }
        )
    }

    pub(crate) fn read_failed(address: u64, message: impl Into<String>) -> Self {
        Error::MemoryReadFailed {
            address,
            message: message.into(),
        }
    }

    pub(crate) fn write_failed(address: u64, message: impl Into<String>) -> Self {
        Error::MemoryWriteFailed {
            address,
            message: message.into(),
        }
    }
}
