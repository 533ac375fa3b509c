use {
    super::{Fid, Req, lock},
    crate::fcall::*,
    log::warn,
    std::{
        collections::HashMap,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicU32, Ordering},
        },
    },
    tokio::sync::mpsc::UnboundedSender,
};

struct Tables<T> {
    fids: HashMap<u32, Arc<Fid<T>>>,
    reqs: HashMap<u16, Arc<Req<T>>>,
}

/// Per-connection state: negotiated parameters, the fid table and the table
/// of outstanding requests keyed by tag.
///
/// The table lock is only held for the duration of a table operation.
pub struct Conn<T> {
    msize: AtomicU32,
    dotu: AtomicBool,
    tables: Mutex<Tables<T>>,
    tx: UnboundedSender<Msg>,
}

impl<T> Conn<T> {
    pub(crate) fn new(msize: u32, tx: UnboundedSender<Msg>) -> Conn<T> {
        Conn {
            msize: AtomicU32::new(msize),
            dotu: AtomicBool::new(false),
            tables: Mutex::new(Tables {
                fids: HashMap::new(),
                reqs: HashMap::new(),
            }),
            tx,
        }
    }

    /// Maximum message size currently in effect.
    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::SeqCst)
    }

    /// Whether 9P2000.u was negotiated.
    pub fn dotu(&self) -> bool {
        self.dotu.load(Ordering::SeqCst)
    }

    /// Lowers msize to `offered` if that is smaller, returning the result.
    pub(crate) fn shrink_msize(&self, offered: u32) -> u32 {
        let prev = self.msize.fetch_min(offered, Ordering::SeqCst);
        prev.min(offered)
    }

    pub(crate) fn set_dotu(&self, dotu: bool) {
        self.dotu.store(dotu, Ordering::SeqCst);
    }

    /// Look up a live fid without taking a hold on it.
    pub fn fid(&self, fid: u32) -> Option<Arc<Fid<T>>> {
        lock(&self.tables).fids.get(&fid).cloned()
    }

    /// Number of live fids.
    pub fn fid_count(&self) -> usize {
        lock(&self.tables).fids.len()
    }

    /// Look up a live fid and take a hold on it for the calling request.
    pub(crate) fn fid_get(&self, fid: u32) -> Option<Arc<Fid<T>>> {
        let tables = lock(&self.tables);
        let f = tables.fids.get(&fid)?;
        f.inc_ref();
        Some(f.clone())
    }

    /// Drop one reference. Returns true if it was the last one and this call
    /// took the fid out of the table; that happens at most once per fid.
    pub(crate) fn fid_release(&self, fid: &Arc<Fid<T>>) -> bool {
        let mut tables = lock(&self.tables);
        {
            let mut state = fid.lock();
            if state.refs == 0 {
                return false;
            }
            state.refs -= 1;
            if state.refs > 0 {
                return false;
            }
        }

        match tables.fids.get(&fid.fid()) {
            Some(live) if Arc::ptr_eq(live, fid) => {
                tables.fids.remove(&fid.fid());
                true
            }
            // already drained by a disconnect
            _ => false,
        }
    }

    /// Remove every fid, for a connection going away.
    pub(crate) fn drain_fids(&self) -> Vec<Arc<Fid<T>>> {
        lock(&self.tables).fids.drain().map(|(_, f)| f).collect()
    }

    /// Look up the request currently owning `tag`.
    pub fn req(&self, tag: u16) -> Option<Arc<Req<T>>> {
        lock(&self.tables).reqs.get(&tag).cloned()
    }

    /// Number of outstanding requests.
    pub fn req_count(&self) -> usize {
        lock(&self.tables).reqs.len()
    }

    pub(crate) fn unregister(&self, req: &Arc<Req<T>>) {
        let mut tables = lock(&self.tables);
        if let Some(live) = tables.reqs.get(&req.tag()) {
            if Arc::ptr_eq(live, req) {
                tables.reqs.remove(&req.tag());
            }
        }
    }

    /// Flag every outstanding request except `NOTAG` and `current` so that
    /// its response is never sent.
    pub(crate) fn flush_outstanding(&self, current: u16) {
        let tables = lock(&self.tables);
        for (tag, req) in tables.reqs.iter() {
            if *tag == NOTAG || *tag == current {
                continue;
            }
            req.set_flush();
        }
    }

    pub(crate) fn send(&self, msg: Msg) {
        if let Err(e) = self.tx.send(msg) {
            warn!("response for tag {} dropped: connection closed", e.0.tag);
        }
    }
}

impl<T: Default> Conn<T> {
    /// Allocate `fid`, held once by the calling request. Returns `None` if the
    /// fid is already live.
    pub(crate) fn fid_new(&self, fid: u32) -> Option<Arc<Fid<T>>> {
        let mut tables = lock(&self.tables);
        if tables.fids.contains_key(&fid) {
            return None;
        }
        let f = Arc::new(Fid::new(fid));
        tables.fids.insert(fid, f.clone());
        Some(f)
    }

    /// Add a freshly received request to the tag table. A tag still owned by
    /// a live request is refused.
    pub(crate) fn register(self: &Arc<Self>, msg: Msg) -> Option<Arc<Req<T>>> {
        let mut tables = lock(&self.tables);
        if tables.reqs.contains_key(&msg.tag) {
            return None;
        }
        let req = Arc::new(Req::new(msg, self.clone()));
        tables.reqs.insert(req.tag(), req.clone());
        Some(req)
    }
}
