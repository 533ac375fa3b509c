use {
    super::{Fid, Req},
    crate::{
        error::{self, errno::*},
        fcall::*,
        Result,
    },
    async_trait::async_trait,
};

/// The backend's request operations.
///
/// Each method receives a request that already passed validation and resolves
/// to exactly one response: the matching R-message, or an `Err` which is sent
/// to the client unchanged as `RError`. Requested arguments are in
/// [`Req::tc`]; the fids involved are [`Req::fid`], [`Req::newfid`] and
/// [`Req::afid`].
///
/// A request may be flushed by the client while the backend works on it. The
/// backend is then told through [`FlushOp`] (if provided) and through
/// [`Req::cancelled`]; honouring either is optional.
///
/// # Example
/// ```no_run
/// use p9srv::{srv::{Filesystem, Req}, FCall, Qid, QidType, Result};
/// use async_trait::async_trait;
///
/// struct MyFs;
///
/// #[async_trait]
/// impl Filesystem for MyFs {
///     type FId = ();
///
///     async fn rattach(&self, _req: &Req<Self::FId>) -> Result<FCall> {
///         Ok(FCall::RAttach {
///             qid: Qid { typ: QidType::DIR, version: 0, path: 0 },
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait Filesystem: Send + Sync + 'static {
    /// User defined fid type to be associated with a client's fid.
    type FId: Send + Sync + Default + 'static;

    /// Attach `req.fid()` to the root of the tree named by `aname`.
    async fn rattach(&self, _req: &Req<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Walk from `req.fid()` to `req.newfid()`.
    ///
    /// Return `RWalk` with one qid per element walked. Stopping early after the
    /// first element is a partial walk and leaves the new fid uncommitted.
    async fn rwalk(&self, _req: &Req<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn ropen(&self, _req: &Req<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Create a file in the directory `req.fid()`, which then refers to it.
    async fn rcreate(&self, _req: &Req<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rread(&self, _req: &Req<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rwrite(&self, _req: &Req<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rclunk(&self, _req: &Req<Self::FId>) -> Result<FCall> {
        Ok(FCall::RClunk)
    }

    async fn rremove(&self, _req: &Req<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rstat(&self, _req: &Req<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rwstat(&self, _req: &Req<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Authentication support, if the backend has any.
    fn auth(&self) -> Option<&dyn AuthOps<Self::FId>> {
        None
    }

    /// Flush notification support, if the backend has any.
    fn flusher(&self) -> Option<&dyn FlushOp<Self::FId>> {
        None
    }

    /// Called once when the last reference to a fid is dropped.
    fn fid_destroy(&self, _fid: &Fid<Self::FId>) {}
}

/// Authentication capability.
#[async_trait]
pub trait AuthOps<T: Send + Sync + 'static>: Send + Sync {
    /// Start an authentication exchange on `afid`. The returned qid gets the
    /// auth type bit whatever the backend sets.
    async fn auth_init(&self, afid: &Fid<T>, aname: &str) -> Result<Qid>;

    /// Decide whether `fid` may attach to `aname`, given the auth fid the
    /// client presented, if any.
    async fn auth_check(&self, fid: &Fid<T>, afid: Option<&Fid<T>>, aname: &str) -> Result<()>;

    /// Read from the exchange into `buf`, returning the number of bytes filled.
    async fn auth_read(&self, afid: &Fid<T>, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write to the exchange, returning the number of bytes accepted.
    async fn auth_write(&self, afid: &Fid<T>, offset: u64, data: &[u8]) -> Result<usize>;

    /// The auth fid was clunked.
    async fn auth_destroy(&self, afid: &Fid<T>);
}

/// Flush capability: a best-effort request to abandon `req`.
pub trait FlushOp<T>: Send + Sync {
    fn flush(&self, req: &Req<T>);
}
