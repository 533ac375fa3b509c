use {
    super::{Conn, Fid, lock},
    crate::fcall::*,
    bitflags::bitflags,
    std::{
        fmt,
        sync::{Arc, Mutex, OnceLock},
    },
    tokio_util::sync::{CancellationToken, WaitForCancellationFuture},
};

bitflags! {
    /// Lifecycle flags of a request.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ReqStatus: u8 {
        #[doc = "A handler is working on the request"]
        const WORK      = 0x01;
        #[doc = "Handed to the backend, completion pending"]
        const SAVED     = 0x02;
        #[doc = "The response must not be sent"]
        const FLUSH     = 0x04;
        #[doc = "Completion has begun; post-processing runs once"]
        const POSTED    = 0x08;
        #[doc = "The response was sent or suppressed"]
        const RESPONDED = 0x10;
    }
}

/// What a `TFlush` found when it joined its target's flush chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FlushJoin {
    /// Target already answered; the flush can be answered right away.
    Responded,
    /// Target had not started and is now marked flushed.
    NotStarted,
    /// Target is being worked on; the flush waits for it.
    InProgress,
}

struct ReqState<T> {
    status: ReqStatus,
    flushreqs: Vec<Arc<Req<T>>>,
}

/// One in-flight request.
///
/// Fids are resolved once, during validation, and stay attached to the
/// request until it completes.
pub struct Req<T> {
    tag: u16,
    tc: FCall,
    conn: Arc<Conn<T>>,
    fid: OnceLock<Arc<Fid<T>>>,
    newfid: OnceLock<Arc<Fid<T>>>,
    afid: OnceLock<Arc<Fid<T>>>,
    state: Mutex<ReqState<T>>,
    cancel: CancellationToken,
}

impl<T> Req<T> {
    pub(crate) fn new(msg: Msg, conn: Arc<Conn<T>>) -> Req<T> {
        Req {
            tag: msg.tag,
            tc: msg.body,
            conn,
            fid: OnceLock::new(),
            newfid: OnceLock::new(),
            afid: OnceLock::new(),
            state: Mutex::new(ReqState {
                status: ReqStatus::empty(),
                flushreqs: Vec::new(),
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// The decoded T-message.
    pub fn tc(&self) -> &FCall {
        &self.tc
    }

    pub fn conn(&self) -> &Arc<Conn<T>> {
        &self.conn
    }

    /// The fid the request operates on (the new fid for `TAttach`).
    pub fn fid(&self) -> Option<&Arc<Fid<T>>> {
        self.fid.get()
    }

    /// Destination of `TWalk`; may be the same fid as `fid`.
    pub fn newfid(&self) -> Option<&Arc<Fid<T>>> {
        self.newfid.get()
    }

    /// The auth fid of `TAuth` or `TAttach`.
    pub fn afid(&self) -> Option<&Arc<Fid<T>>> {
        self.afid.get()
    }

    pub fn status(&self) -> ReqStatus {
        lock(&self.state).status
    }

    /// Whether a flush asked the backend to abandon this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once a flush asks the backend to abandon this request.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn set_fid(&self, fid: Arc<Fid<T>>) {
        let _ = self.fid.set(fid);
    }

    pub(crate) fn set_newfid(&self, fid: Arc<Fid<T>>) {
        let _ = self.newfid.set(fid);
    }

    pub(crate) fn set_afid(&self, fid: Arc<Fid<T>>) {
        let _ = self.afid.set(fid);
    }

    /// Every fid the request holds, `fid`, `newfid` and `afid` in that order.
    pub(crate) fn held_fids(&self) -> impl Iterator<Item = &Arc<Fid<T>>> {
        [self.fid.get(), self.newfid.get(), self.afid.get()]
            .into_iter()
            .flatten()
    }

    /// Mark the request as being worked on. Fails if it was flushed first.
    pub(crate) fn begin(&self) -> bool {
        let mut state = lock(&self.state);
        if state.status.contains(ReqStatus::FLUSH) {
            return false;
        }
        state.status.insert(ReqStatus::WORK);
        true
    }

    pub(crate) fn mark_saved(&self) {
        lock(&self.state).status.insert(ReqStatus::SAVED);
    }

    pub(crate) fn set_flush(&self) {
        lock(&self.state).status.insert(ReqStatus::FLUSH);
    }

    /// Join the flush chain. The started-or-not decision and the append are
    /// one step under this request's lock.
    pub(crate) fn join_flush(&self, flushreq: Arc<Req<T>>) -> FlushJoin {
        let mut state = lock(&self.state);
        if state.status.contains(ReqStatus::RESPONDED) {
            return FlushJoin::Responded;
        }
        state.flushreqs.push(flushreq);
        if state
            .status
            .intersects(ReqStatus::WORK | ReqStatus::SAVED)
        {
            FlushJoin::InProgress
        } else {
            state.status.insert(ReqStatus::FLUSH);
            FlushJoin::NotStarted
        }
    }

    /// Claim the right to complete the request. Only the first caller wins.
    pub(crate) fn start_respond(&self) -> bool {
        let mut state = lock(&self.state);
        if state.status.contains(ReqStatus::POSTED) {
            return false;
        }
        state.status.insert(ReqStatus::POSTED);
        true
    }

    /// Deliver the response unless flushed, and hand back the flush chain.
    /// The flush check, the send and the chain take happen under one lock.
    pub(crate) fn finish<F: FnOnce()>(&self, send: F) -> Vec<Arc<Req<T>>> {
        let mut state = lock(&self.state);
        if !state.status.contains(ReqStatus::FLUSH) {
            send();
        }
        state.status.remove(ReqStatus::WORK);
        state.status.insert(ReqStatus::RESPONDED);
        std::mem::take(&mut state.flushreqs)
    }
}

impl<T> fmt::Debug for Req<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Req")
            .field("tag", &self.tag)
            .field("tc", &self.tc)
            .field("status", &self.status())
            .finish()
    }
}
