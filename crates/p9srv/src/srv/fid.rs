use {
    super::lock,
    crate::{fcall::*, users::User},
    std::{
        fmt,
        sync::{Arc, Mutex, MutexGuard, OnceLock},
    },
};

/// Mutable scalar state of a fid, guarded by the fid's own lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FidState {
    /// Type bits, from the qid the backend last reported for this fid.
    pub typ: QidType,
    /// Mode requested by `TOpen`/`TCreate`; meaningful once `opened` is set.
    pub omode: u8,
    pub opened: bool,
    /// Directory read cursor.
    pub diroffset: u64,
    /// Committed owners plus transient holds of in-flight requests.
    pub refs: u32,
}

/// Represents a fid of clients holding associated `Filesystem::FId`.
pub struct Fid<T> {
    /// Raw client side fid.
    fid: u32,
    user: OnceLock<Arc<dyn User>>,
    state: Mutex<FidState>,

    /// `Filesystem::FId` associated with this fid.
    pub aux: T,
}

impl<T: Default> Fid<T> {
    /// A fresh fid held once, by the request creating it.
    pub(crate) fn new(fid: u32) -> Fid<T> {
        Fid {
            fid,
            user: OnceLock::new(),
            state: Mutex::new(FidState {
                refs: 1,
                ..Default::default()
            }),
            aux: Default::default(),
        }
    }
}

impl<T> Fid<T> {
    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// The identity this fid was created for.
    pub fn user(&self) -> Option<&Arc<dyn User>> {
        self.user.get()
    }

    /// Sets the owner; a fid's owner never changes once set.
    pub(crate) fn set_user(&self, user: Arc<dyn User>) {
        let _ = self.user.set(user);
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> FidState {
        *self.lock()
    }

    pub fn typ(&self) -> QidType {
        self.lock().typ
    }

    pub fn is_dir(&self) -> bool {
        self.typ().contains(QidType::DIR)
    }

    pub fn is_auth(&self) -> bool {
        self.typ().contains(QidType::AUTH)
    }

    pub fn opened(&self) -> bool {
        self.lock().opened
    }

    pub fn omode(&self) -> u8 {
        self.lock().omode
    }

    pub fn diroffset(&self) -> u64 {
        self.lock().diroffset
    }

    pub fn refs(&self) -> u32 {
        self.lock().refs
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FidState> {
        lock(&self.state)
    }

    pub(crate) fn set_typ(&self, typ: QidType) {
        self.lock().typ = typ;
    }

    pub(crate) fn inc_ref(&self) {
        self.lock().refs += 1;
    }
}

impl<T> fmt::Debug for Fid<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fid")
            .field("fid", &self.fid)
            .field("user", &self.user.get().map(|u| u.name()))
            .field("state", &self.state())
            .finish()
    }
}
