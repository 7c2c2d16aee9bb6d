use thiserror::Error;

/// Errors raised outside the data path: configuration, startup, and the
/// wire front-end.
#[derive(Error, Debug)]
pub enum BlockwrightError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("no plugin configured")]
    NoPlugin,

    #[error("invalid backend name: {0}")]
    InvalidName(String),
}

pub type Result<T> = std::result::Result<T, BlockwrightError>;

/// The errno allow-list a backend may report across the dispatcher
/// boundary (spec §7). Anything else collapses to [`Errno::Io`] at the
/// wire front-end.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    #[error("EPERM")]
    Perm,
    #[error("EIO")]
    Io,
    #[error("ENOMEM")]
    NoMem,
    #[error("EINVAL")]
    Inval,
    #[error("ENOSPC")]
    NoSpc,
    #[error("EOVERFLOW")]
    Overflow,
    #[error("ESHUTDOWN")]
    Shutdown,
    #[error("ENOTSUP")]
    NotSup,
    #[error("EROFS")]
    Rofs,
    #[error("EFBIG")]
    FBig,
}

impl Errno {
    /// Maps an arbitrary `io::ErrorKind` onto the allow-list, the way the
    /// wire front-end maps any plugin-reported value. Unknown kinds
    /// collapse to `EIO`, matching the "unknown errno collapses to EIO"
    /// rule for the wire side of this mapping.
    pub fn from_io_kind(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind::*;
        match kind {
            PermissionDenied => Errno::Perm,
            InvalidInput | InvalidData => Errno::Inval,
            OutOfMemory => Errno::NoMem,
            StorageFull => Errno::NoSpc,
            Unsupported => Errno::NotSup,
            _ => Errno::Io,
        }
    }
}

impl From<std::io::Error> for Errno {
    fn from(e: std::io::Error) -> Self {
        Errno::from_io_kind(e.kind())
    }
}
