//! Errors returned to 9P clients.
//!
//! Every variant renders to the protocol error string carried by `RError` and
//! maps to the errno sent alongside it on 9P2000.u connections.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// Errno values re-exported for backend implementations.
pub mod errno {
    pub use nix::errno::Errno::*;
}

/// Protocol error strings produced by the request validation gate.
pub mod string {
    pub const EMSIZE: &str = "msize too small";
    pub const EUNKNOWNFID: &str = "unknown fid";
    pub const EINUSE: &str = "fid already in use";
    pub const ENOUSER: &str = "unknown user";
    pub const ENOAUTH: &str = "no authentication required";
    pub const ENOTIMPL: &str = "not implemented";
    pub const ENOTDIR: &str = "not a directory";
    pub const EBADUSE: &str = "bad use of fid";
    pub const EOPEN: &str = "fid already opened";
    pub const EPERM: &str = "permission denied";
    pub const ETOOLARGE: &str = "i/o count too large";
    pub const EDIRCHANGE: &str = "cannot convert between files and directories";
}

#[derive(Debug, Error)]
pub enum Error {
    /// Negotiated message size below the I/O header overhead.
    #[error("{}", string::EMSIZE)]
    MsizeTooSmall,
    /// A fid named by the request is not live, or is the `NOFID` placeholder.
    #[error("{}", string::EUNKNOWNFID)]
    UnknownFid,
    /// The fid the request wants to allocate is already live.
    #[error("{}", string::EINUSE)]
    FidInUse,
    #[error("{}", string::ENOUSER)]
    NoSuchUser,
    #[error("{}", string::ENOAUTH)]
    NoAuth,
    #[error("{}", string::ENOTIMPL)]
    NotImplemented,
    #[error("{}", string::ENOTDIR)]
    NotDir,
    #[error("{}", string::EBADUSE)]
    BadUse,
    #[error("{}", string::EOPEN)]
    AlreadyOpen,
    #[error("{}", string::EPERM)]
    PermissionDenied,
    #[error("{}", string::ETOOLARGE)]
    TooLarge,
    #[error("{}", string::EDIRCHANGE)]
    DirChange,
    /// Error reported by a backend as a bare errno.
    #[error("{}", .0.desc())]
    No(#[from] Errno),
    /// I/O error, from a backend or from the transport.
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The errno sent to 9P2000.u clients.
    pub fn errno(&self) -> Errno {
        match *self {
            Error::NotDir => Errno::ENOTDIR,
            Error::PermissionDenied => Errno::EPERM,
            Error::No(e) => e,
            Error::Io(ref e) => e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
            _ => Errno::EINVAL,
        }
    }
}
