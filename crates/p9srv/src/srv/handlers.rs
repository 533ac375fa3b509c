//! Per-message validation before backend dispatch, and the post-processing
//! of the backend's response.

use {
    super::{Filesystem, Req, Srv, req::FlushJoin},
    crate::{error::Error, fcall::*, users::User},
    log::{info, warn},
    std::sync::{Arc, atomic::Ordering},
};

type Result<T> = ::std::result::Result<T, Error>;

impl<Fs: Filesystem> Srv<Fs> {
    pub(super) fn version(&self, req: &Req<Fs::FId>, msize: u32, version: &str) -> Result<FCall> {
        if msize < IOHDRSZ {
            return Err(Error::MsizeTooSmall);
        }

        let conn = req.conn();
        let msize = conn.shrink_msize(msize);

        let dotu = version == P92000U && self.config.dotu;
        conn.set_dotu(dotu);
        let version = if dotu { P92000U } else { P92000 };

        // responses of everything in flight must be ignored from now on
        conn.flush_outstanding(req.tag());

        self.versioned.fetch_add(1, Ordering::Relaxed);
        info!("negotiated {} msize {}", version, msize);

        Ok(FCall::RVersion {
            msize,
            version: version.to_owned(),
        })
    }

    fn resolve_user(&self, req: &Req<Fs::FId>, uname: &str, n_uname: u32) -> Result<Arc<dyn User>> {
        let user = if n_uname != NOUID || req.conn().dotu() {
            self.users.uid2user(n_uname)
        } else if !uname.is_empty() {
            self.users.uname2user(uname)
        } else {
            None
        };

        user.ok_or(Error::NoSuchUser)
    }

    pub(super) async fn auth(
        &self,
        req: &Req<Fs::FId>,
        afid: u32,
        uname: &str,
        aname: &str,
        n_uname: u32,
    ) -> Result<FCall> {
        if afid == NOFID {
            return Err(Error::UnknownFid);
        }

        let fid = req.conn().fid_new(afid).ok_or_else(|| {
            warn!("auth: fid {} in use?", afid);
            Error::FidInUse
        })?;
        req.set_afid(fid.clone());

        fid.set_user(self.resolve_user(req, uname, n_uname)?);
        fid.set_typ(QidType::AUTH);

        let auth = self.fs.auth().ok_or(Error::NoAuth)?;
        let mut aqid = self.delegate(req, auth.auth_init(&fid, aname)).await?;
        aqid.typ.insert(QidType::AUTH);

        Ok(FCall::RAuth { aqid })
    }

    pub(super) async fn attach(
        &self,
        req: &Req<Fs::FId>,
        fid: u32,
        afid: u32,
        uname: &str,
        aname: &str,
        n_uname: u32,
    ) -> Result<FCall> {
        if fid == NOFID {
            return Err(Error::UnknownFid);
        }

        let conn = req.conn();
        let f = conn.fid_new(fid).ok_or_else(|| {
            warn!("attach: fid {} in use?", fid);
            Error::FidInUse
        })?;
        req.set_fid(f.clone());

        if afid != NOFID {
            let a = conn.fid_get(afid).ok_or(Error::UnknownFid)?;
            req.set_afid(a);
        }

        f.set_user(self.resolve_user(req, uname, n_uname)?);

        if let Some(auth) = self.fs.auth() {
            let afid = req.afid().map(|a| a.as_ref());
            self.delegate(req, auth.auth_check(&f, afid, aname)).await?;
        }

        self.delegate(req, self.fs.rattach(req)).await
    }

    pub(super) fn flush(&self, req: &Arc<Req<Fs::FId>>, oldtag: u16) -> Result<Option<FCall>> {
        let target = match req.conn().req(oldtag) {
            Some(target) if !Arc::ptr_eq(&target, req) => target,
            // there are no requests with that tag
            _ => return Ok(Some(FCall::RFlush)),
        };

        match target.join_flush(req.clone()) {
            FlushJoin::Responded => Ok(Some(FCall::RFlush)),
            FlushJoin::NotStarted => {
                self.respond(&target, None);
                Ok(None)
            }
            FlushJoin::InProgress => {
                target.cancel();
                if let Some(op) = self.fs.flusher() {
                    op.flush(&target);
                }
                Ok(None)
            }
        }
    }

    pub(super) async fn walk(&self, req: &Req<Fs::FId>, newfid: u32, wnames: &[String]) -> Result<FCall> {
        let fid = req.fid().ok_or(Error::UnknownFid)?;

        // only directories can be walked, anything can be cloned
        if !wnames.is_empty() && !fid.is_dir() {
            return Err(Error::NotDir);
        }

        if fid.opened() {
            return Err(Error::BadUse);
        }

        let nf = if newfid != fid.fid() {
            let nf = req.conn().fid_new(newfid).ok_or_else(|| {
                warn!("walk: fid {} in use?", newfid);
                Error::FidInUse
            })?;
            if let Some(user) = fid.user() {
                nf.set_user(user.clone());
            }
            nf.set_typ(fid.typ());
            nf
        } else {
            fid.inc_ref();
            fid.clone()
        };
        req.set_newfid(nf);

        self.delegate(req, self.fs.rwalk(req)).await
    }

    pub(super) async fn open(&self, req: &Req<Fs::FId>, mode: u8) -> Result<FCall> {
        let fid = req.fid().ok_or(Error::UnknownFid)?;
        {
            let mut state = fid.lock();
            if state.opened {
                return Err(Error::AlreadyOpen);
            }

            if state.typ.contains(QidType::DIR) && mode != om::READ {
                return Err(Error::PermissionDenied);
            }

            state.omode = mode;
        }

        self.delegate(req, self.fs.ropen(req)).await
    }

    pub(super) async fn create(&self, req: &Req<Fs::FId>, perm: u32, mode: u8) -> Result<FCall> {
        let fid = req.fid().ok_or(Error::UnknownFid)?;
        {
            let mut state = fid.lock();
            if state.opened {
                return Err(Error::AlreadyOpen);
            }

            if !state.typ.contains(QidType::DIR) {
                return Err(Error::NotDir);
            }

            // directories can only be opened for reading
            if perm & dm::DIR != 0 && mode != om::READ {
                return Err(Error::PermissionDenied);
            }

            if perm & dm::SPECIAL != 0 && !req.conn().dotu() {
                return Err(Error::PermissionDenied);
            }

            state.omode = mode;
        }

        self.delegate(req, self.fs.rcreate(req)).await
    }

    fn check_io_size(&self, req: &Req<Fs::FId>, count: u32) -> Result<()> {
        if count as u64 + IOHDRSZ as u64 > req.conn().msize() as u64 {
            return Err(Error::TooLarge);
        }
        Ok(())
    }

    pub(super) async fn read(&self, req: &Req<Fs::FId>, offset: u64, count: u32) -> Result<FCall> {
        let fid = req.fid().ok_or(Error::UnknownFid)?;
        self.check_io_size(req, count)?;

        if fid.is_auth() {
            let auth = self.fs.auth().ok_or(Error::NotImplemented)?;
            let mut buf = vec![0; count as usize];
            let n = self
                .delegate(req, auth.auth_read(fid, offset, &mut buf))
                .await?;
            buf.truncate(n);
            return Ok(FCall::RRead { data: Data(buf) });
        }

        {
            let mut state = fid.lock();
            if !state.opened || state.omode & 3 == om::WRITE {
                return Err(Error::BadUse);
            }

            if state.typ.contains(QidType::DIR) {
                // arbitrary offsets are for the backend to accept or refuse
                state.diroffset = offset;
            }
        }

        self.delegate(req, self.fs.rread(req)).await
    }

    pub(super) async fn write(&self, req: &Req<Fs::FId>, offset: u64, data: &Data) -> Result<FCall> {
        let fid = req.fid().ok_or(Error::UnknownFid)?;
        self.check_io_size(req, data.0.len() as u32)?;

        if fid.is_auth() {
            let auth = self.fs.auth().ok_or(Error::NotImplemented)?;
            let n = self
                .delegate(req, auth.auth_write(fid, offset, &data.0))
                .await?;
            return Ok(FCall::RWrite { count: n as u32 });
        }

        {
            let state = fid.lock();
            if !state.opened || state.typ.contains(QidType::DIR) || state.omode & 3 == om::READ {
                return Err(Error::BadUse);
            }
        }

        self.delegate(req, self.fs.rwrite(req)).await
    }

    pub(super) async fn clunk(&self, req: &Req<Fs::FId>) -> Result<FCall> {
        let fid = req.fid().ok_or(Error::UnknownFid)?;

        if fid.is_auth() {
            let auth = self.fs.auth().ok_or(Error::NotImplemented)?;
            self.delegate(req, async {
                auth.auth_destroy(fid).await;
                Ok(())
            })
            .await?;
            return Ok(FCall::RClunk);
        }

        self.delegate(req, self.fs.rclunk(req)).await
    }

    pub(super) async fn wstat(&self, req: &Req<Fs::FId>, stat: &Stat) -> Result<FCall> {
        let fid = req.fid().ok_or(Error::UnknownFid)?;

        if self.config.strict_wstat {
            if stat.typ != !0 || stat.dev != !0 || stat.qid.version != !0 || stat.qid.path != !0 {
                return Err(Error::PermissionDenied);
            }

            if stat.mode != !0 && fid.is_dir() != (stat.mode & dm::DIR != 0) {
                return Err(Error::DirChange);
            }
        }

        self.delegate(req, self.fs.rwstat(req)).await
    }

    /// Update fid state from the response. `rc` is `None` for a request that
    /// completed as flushed.
    pub(super) fn post(&self, req: &Req<Fs::FId>, rc: Option<&FCall>) {
        use crate::FCall::*;

        let conn = req.conn();
        match (req.tc(), rc) {
            (TAuth { .. }, Some(RAuth { .. })) => {
                if let Some(afid) = req.afid() {
                    afid.inc_ref();
                }
            }
            (TAttach { .. }, Some(RAttach { qid })) => {
                if let Some(fid) = req.fid() {
                    fid.set_typ(qid.typ);
                    fid.inc_ref();
                }
            }
            (TWalk { wnames, .. }, Some(RWalk { wqids })) => {
                let (Some(fid), Some(newfid)) = (req.fid(), req.newfid()) else {
                    return;
                };

                // a partial walk commits nothing
                if wqids.len() != wnames.len() {
                    return;
                }

                let typ = wqids.last().map_or_else(|| fid.typ(), |q| q.typ);
                newfid.set_typ(typ);
                if !Arc::ptr_eq(fid, newfid) {
                    newfid.inc_ref();
                }
            }
            (TOpen { .. }, Some(ROpen { .. })) => {
                if let Some(fid) = req.fid() {
                    fid.lock().opened = true;
                }
            }
            (TCreate { .. }, Some(RCreate { qid, .. })) => {
                if let Some(fid) = req.fid() {
                    let mut state = fid.lock();
                    state.typ = qid.typ;
                    state.opened = true;
                }
            }
            (TRead { .. }, Some(RRead { data })) => {
                if let Some(fid) = req.fid() {
                    let mut state = fid.lock();
                    if state.typ.contains(QidType::DIR) {
                        state.diroffset += data.0.len() as u64;
                    }
                }
            }
            // the client's hold is gone once the attempt was answered
            (TClunk { .. }, Some(_)) | (TRemove { .. }, Some(_)) => {
                if let Some(fid) = req.fid() {
                    self.release(conn, fid);
                }
            }
            _ => {}
        }
    }
}
