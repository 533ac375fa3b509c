//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000 and 9P2000.u
//!
//! A [`Srv`] validates every request against the per-connection fid and tag
//! tables before handing it to the [`Filesystem`], and updates those tables
//! from the backend's response before the response is sent.

use {
    crate::{error::Error, fcall::*, users::Users},
    log::{debug, info},
    std::sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
    tokio::sync::mpsc::UnboundedSender,
};

mod conn;
mod fid;
mod filesystem;
mod handlers;
mod req;
mod transport;

#[cfg(test)]
mod tests;

pub use conn::Conn;
pub use fid::{Fid, FidState};
pub use filesystem::{AuthOps, Filesystem, FlushOp};
pub use req::{Req, ReqStatus};
pub use transport::{serve, srv_async, srv_async_tcp, srv_async_unix};

/// Locks are only held for short table or field updates, so a poisoned lock
/// still guards consistent data.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Server configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SrvConfig {
    /// Largest message size offered to clients; each connection starts here
    /// and `TVersion` can only lower it.
    pub msize: u32,
    /// Accept 9P2000.u when a client asks for it.
    pub dotu: bool,
    /// Refuse `TWStat` requests that touch type, dev, qid version or qid path,
    /// or that flip a fid between file and directory. When off, the backend
    /// decides.
    pub strict_wstat: bool,
}

impl Default for SrvConfig {
    fn default() -> Self {
        SrvConfig {
            msize: 8192 + IOHDRSZ,
            dotu: true,
            strict_wstat: false,
        }
    }
}

/// Optional backend capabilities, queried once when the server is built.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub auth: bool,
    pub flush: bool,
}

/// A 9P server: a backend, an identity resolver and the request state machine
/// shared by all of its connections.
pub struct Srv<Fs: Filesystem> {
    fs: Fs,
    users: Arc<dyn Users>,
    config: SrvConfig,
    caps: Capabilities,
    versioned: AtomicU32,
}

impl<Fs: Filesystem> Srv<Fs> {
    pub fn new(fs: Fs, users: Arc<dyn Users>, config: SrvConfig) -> Srv<Fs> {
        let caps = Capabilities {
            auth: fs.auth().is_some(),
            flush: fs.flusher().is_some(),
        };
        info!("backend capabilities: {:?}", caps);

        Srv {
            fs,
            users,
            config,
            caps,
            versioned: AtomicU32::new(0),
        }
    }

    pub fn filesystem(&self) -> &Fs {
        &self.fs
    }

    pub fn config(&self) -> &SrvConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Number of successful version negotiations so far, on all connections.
    pub fn versioned(&self) -> u32 {
        self.versioned.load(Ordering::Relaxed)
    }

    /// Create the state of a new connection. Responses are delivered to `tx`.
    pub fn new_conn(&self, tx: UnboundedSender<Msg>) -> Arc<Conn<Fs::FId>> {
        Arc::new(Conn::new(self.config.msize, tx))
    }

    /// Register a received message as an outstanding request.
    ///
    /// Returns `None` if its tag is still owned by another live request; the
    /// message is then dropped.
    pub fn recv(&self, conn: &Arc<Conn<Fs::FId>>, msg: Msg) -> Option<Arc<Req<Fs::FId>>> {
        let tag = msg.tag;
        let req = conn.register(msg);
        if req.is_none() {
            log::warn!("tag {} already in use, message dropped", tag);
        }
        req
    }

    /// Run a registered request to completion.
    ///
    /// A request flushed before it starts completes without reaching its
    /// handler.
    pub async fn process(&self, req: Arc<Req<Fs::FId>>) {
        if !req.begin() {
            debug!("tag {} flushed before start", req.tag());
            self.respond(&req, None);
            return;
        }

        let rc = match self.dispatch(&req).await {
            Ok(Some(rc)) => rc,
            // answered when its target completes
            Ok(None) => return,
            Err(e) => {
                debug!("{:?}: Error: \"{}\"", MsgType::from(req.tc()), e);
                FCall::RError {
                    ename: e.to_string(),
                    errno: e.errno() as u32,
                }
            }
        };

        self.respond(&req, Some(rc));
    }

    /// Complete a request: post-process, release its fids, leave the tag table,
    /// send `rc` unless the request was flushed, then answer the flushes
    /// waiting on it.
    pub(crate) fn respond(&self, req: &Arc<Req<Fs::FId>>, rc: Option<FCall>) {
        if !req.start_respond() {
            return;
        }

        self.post(req, rc.as_ref());

        let conn = req.conn();
        for fid in req.held_fids() {
            self.release(conn, fid);
        }
        conn.unregister(req);

        let flushreqs = req.finish(|| {
            if let Some(body) = rc {
                conn.send(Msg {
                    tag: req.tag(),
                    body,
                });
            }
        });

        for flushreq in flushreqs {
            self.respond(&flushreq, Some(FCall::RFlush));
        }
    }

    /// Drop a reference, telling the backend if it was the last one.
    pub(crate) fn release(&self, conn: &Conn<Fs::FId>, fid: &Arc<Fid<Fs::FId>>) {
        if conn.fid_release(fid) {
            debug!("fid {} destroyed", fid.fid());
            self.fs.fid_destroy(fid);
        }
    }

    /// Tear down a closed connection: every remaining fid is destroyed.
    pub fn disconnect(&self, conn: &Conn<Fs::FId>) {
        for fid in conn.drain_fids() {
            self.fs.fid_destroy(&fid);
        }
    }

    async fn dispatch(&self, req: &Arc<Req<Fs::FId>>) -> Result<Option<FCall>, Error> {
        use crate::FCall::*;

        if let Some(fid) = req.tc().fid() {
            let f = req.conn().fid_get(fid).ok_or(Error::UnknownFid)?;
            req.set_fid(f);
        }

        let rc = match *req.tc() {
            TVersion { msize, ref version } => self.version(req, msize, version)?,
            TAuth { afid, ref uname, ref aname, n_uname } => {
                self.auth(req, afid, uname, aname, n_uname).await?
            }
            TAttach { fid, afid, ref uname, ref aname, n_uname } => {
                self.attach(req, fid, afid, uname, aname, n_uname).await?
            }
            TFlush { oldtag } => return self.flush(req, oldtag),
            TWalk { newfid, ref wnames, .. } => self.walk(req, newfid, wnames).await?,
            TOpen { mode, .. } => self.open(req, mode).await?,
            TCreate { perm, mode, .. } => self.create(req, perm, mode).await?,
            TRead { offset, count, .. } => self.read(req, offset, count).await?,
            TWrite { offset, ref data, .. } => self.write(req, offset, data).await?,
            TClunk { .. } => self.clunk(req).await?,
            TRemove { .. } => self.delegate(req, self.fs.rremove(req)).await?,
            TStat { .. } => self.delegate(req, self.fs.rstat(req)).await?,
            TWStat { ref stat, .. } => self.wstat(req, stat).await?,
            _ => return Err(Error::No(nix::errno::Errno::EOPNOTSUPP)),
        };

        Ok(Some(rc))
    }

    /// Hand the request to the backend and wait for its completion.
    async fn delegate<R, F>(&self, req: &Req<Fs::FId>, fut: F) -> Result<R, Error>
    where
        F: std::future::Future<Output = Result<R, Error>>,
    {
        req.mark_saved();
        fut.await
    }
}
