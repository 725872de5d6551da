/// Failure kinds surfaced by the product queue.
///
/// End of queue is not an error; iteration reports it as [`crate::Step::End`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("product-queue is corrupt: {0}")]
    Corrupt(&'static str),
    #[error("not a product queue")]
    NotAQueue,
    #[error("unsupported product-queue version: {0}")]
    UnsupportedVersion(u64),
    #[error("data-product already in queue")]
    Duplicate,
    #[error("product of {size} bytes exceeds data segment of {capacity} bytes")]
    TooBig { size: u64, capacity: u64 },
    #[error("out of space: {0}")]
    NoSpace(&'static str),
    #[error("no products left to delete")]
    Exhausted,
    #[error("data-product locked by another process")]
    Locked,
    #[error("region already reserved by this process")]
    AlreadyReserved,
    #[error("desired data-product not found")]
    NotFound,
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("product-queue is open read-only")]
    ReadOnly,
    #[error("too many writers on product-queue")]
    TooManyWriters,
    #[error("product-queue mutex poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Legacy status numbers. Queue conditions are negative, system failures
/// carry a positive errno.
pub mod status {
    pub const END: i32 = -1;
    pub const DUP: i32 = -2;
    pub const BIG: i32 = -3;
    pub const SYSTEM: i32 = -4;
    pub const LOCKED: i32 = -5;
    pub const CORRUPT: i32 = -6;
    pub const NOTFOUND: i32 = -7;
    pub const INVAL: i32 = -8;
}

impl Error {
    pub fn status(&self) -> i32 {
        match self {
            Error::Io(err) => err.raw_os_error().unwrap_or(status::SYSTEM),
            Error::Corrupt(_) | Error::NotAQueue | Error::UnsupportedVersion(_) => status::CORRUPT,
            Error::Duplicate => status::DUP,
            Error::TooBig { .. } => status::BIG,
            Error::NoSpace(_) => libc::ENOSPC,
            Error::Exhausted => libc::ENOMEM,
            Error::Locked | Error::AlreadyReserved => status::LOCKED,
            Error::NotFound => status::NOTFOUND,
            Error::Invalid(_) => status::INVAL,
            Error::ReadOnly => libc::EACCES,
            Error::TooManyWriters => libc::EUSERS,
            Error::Poisoned => status::SYSTEM,
        }
    }

    /// Process exit code used by the command-line front end.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotAQueue | Error::UnsupportedVersion(_) => 2,
            Error::TooManyWriters => 3,
            Error::Corrupt(_) => 4,
            Error::Locked | Error::AlreadyReserved => 5,
            Error::NotFound => 6,
            _ => 1,
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corrupt(_) | Error::NotAQueue | Error::UnsupportedVersion(_)
        )
    }

    /// Contention is expected under load and drives caller backoff.
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::Locked | Error::AlreadyReserved)
    }
}
