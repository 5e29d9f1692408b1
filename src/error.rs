use thiserror::Error;

#[derive(Error, Debug)]
pub enum VidmemError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of video memory")]
    NoVideoMemory,

    #[error("Surface manager is suspended")]
    Suspended,

    #[error("Out of shared memory")]
    OutOfSharedMemory,

    #[error("Out of system memory")]
    OutOfMemory,

    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Lock Error: {0}")]
    Lock(#[from] std::io::Error),

    #[error("BUG: {0}")]
    Bug(String),
}

impl VidmemError {
    /// Builds a [`VidmemError::Bug`], logging it at error level.
    ///
    /// Programmer errors are never silent, so every construction goes through here.
    pub(crate) fn bug(message: impl Into<String>) -> Self {
        let message = message.into();
        log::error!("{message}");
        Self::Bug(message)
    }
}

// A convenient alias
pub type VidmemResult<T> = Result<T, VidmemError>;
