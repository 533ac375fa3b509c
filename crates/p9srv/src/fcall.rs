//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000 and 9P2000.u

use std::mem::size_of;

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// 9P2000.u version string
pub const P92000U: &str = "9P2000.u";

/*
 * 9P magic numbers
 */
/// Special tag which `TVersion`/`RVersion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `TAttach` with no auth must use as `afid`
///
/// If the client does not wish to authenticate the connection, or knows that authentication is
/// not required, the afid field in the attach message should be set to `NOFID`
pub const NOFID: u32 = !0;

/// Special uid which `TAuth`/`TAttach` use as `n_uname` to indicate no uid is specified
pub const NOUID: u32 = !0;

/// Ample room for `TWrite`/`RRead` header
///
/// size[4] TRead/TWrite[2] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// v9fs default port
pub const V9FS_PORT: u16 = 564;

/// Open modes of `TOpen`/`TCreate`
///
/// The low two bits select the I/O direction, the rest are or'ed in.
pub mod om {
    /// Open for read
    pub const READ: u8 = 0;
    /// Write
    pub const WRITE: u8 = 1;
    /// Read and write
    pub const RDWR: u8 = 2;
    /// Execute, == read but check execute permission
    pub const EXEC: u8 = 3;
    /// Or'ed in (except for exec), truncate file first
    pub const TRUNC: u8 = 16;
    /// Or'ed in, close on exec
    pub const CEXEC: u8 = 32;
    /// Or'ed in, remove on close
    pub const RCLOSE: u8 = 64;
}

/// Bits in `Stat.mode` and `TCreate.perm`
pub mod dm {
    /// Mode bit for directories
    pub const DIR: u32 = 0x80000000;
    /// Mode bit for append only files
    pub const APPEND: u32 = 0x40000000;
    /// Mode bit for exclusive use files
    pub const EXCL: u32 = 0x20000000;
    /// Mode bit for mounted channel
    pub const MOUNT: u32 = 0x10000000;
    /// Mode bit for authentication file
    pub const AUTH: u32 = 0x08000000;
    /// Mode bit for non-backed-up files
    pub const TMP: u32 = 0x04000000;
    /// Mode bit for symbolic links (9P2000.u)
    pub const SYMLINK: u32 = 0x02000000;
    /// Mode bit for hard links (9P2000.u)
    pub const LINK: u32 = 0x01000000;
    /// Mode bit for device files (9P2000.u)
    pub const DEVICE: u32 = 0x00800000;
    /// Mode bit for named pipes (9P2000.u)
    pub const NAMEDPIPE: u32 = 0x00200000;
    /// Mode bit for sockets (9P2000.u)
    pub const SOCKET: u32 = 0x00100000;
    /// Mode bit for setuid (9P2000.u)
    pub const SETUID: u32 = 0x00080000;
    /// Mode bit for setgid (9P2000.u)
    pub const SETGID: u32 = 0x00040000;
    /// Mode bit for read permission
    pub const READ: u32 = 0x4;
    /// Mode bit for write permission
    pub const WRITE: u32 = 0x2;
    /// Mode bit for execute permission
    pub const EXEC: u32 = 0x1;

    /// Special file bits which only 9P2000.u connections may create
    pub const SPECIAL: u32 = NAMEDPIPE | SYMLINK | LINK | DEVICE | SOCKET;
}

bitflags! {
    /// Bits in Qid.typ
    ///
    /// # Protocol
    /// 9P2000/9P2000.u
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct QidType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Type bits for symbolic links (9P2000.u)"]
        const SYMLINK   = 0x02;
        #[doc = "Type bits for hard-link (9P2000.u)"]
        const LINK      = 0x01;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

impl QidType {
    /// The qid type matching the type bits of a `Stat.mode`.
    pub fn from_mode(mode: u32) -> QidType {
        QidType::from_bits_truncate((mode >> 24) as u8)
    }
}

/// Server side data type for path tracking
///
/// The server's unique identification for the file being accessed
///
/// # Protocol
/// 9P2000/9P2000.u
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Qid {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QidType,
    /// Version number for a file; typically, it is incremented every time the file is modified
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy
    pub path: u64,
}

impl Qid {
    pub const SIZE: usize = size_of::<u8>() + size_of::<u32>() + size_of::<u64>();
}

/// Plan 9 namespace metadata, somewhat like a unix fstat
///
/// The trailing fields are only on the wire for 9P2000.u connections.
/// A `TWStat` leaves a field untouched by setting it to all ones (numbers)
/// or the empty string.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: Qid,
    /// Permissions
    pub mode: u32,
    /// Last read time
    pub atime: u32,
    /// Last write time
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
    /// Special file description (9P2000.u)
    pub extension: String,
    /// Numeric owner id (9P2000.u)
    pub n_uid: u32,
    /// Numeric group id (9P2000.u)
    pub n_gid: u32,
    /// Numeric last modifier id (9P2000.u)
    pub n_muid: u32,
}

impl Stat {
    /// A stat whose every field means "don't touch" in `TWStat`.
    pub fn untouched() -> Stat {
        Stat {
            typ: !0,
            dev: !0,
            qid: Qid {
                typ: QidType::from_bits_retain(!0),
                version: !0,
                path: !0,
            },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            n_uid: !0,
            n_gid: !0,
            n_muid: !0,
            ..Default::default()
        }
    }

    /// Size of the encoded stat, excluding its own leading size field
    pub fn size(&self, dotu: bool) -> u16 {
        let mut size = size_of::<u16>()
            + size_of::<u32>()
            + Qid::SIZE
            + size_of::<u32>() * 3
            + size_of::<u64>()
            + (size_of::<u16>() * 4)
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len();
        if dotu {
            size += size_of::<u16>() + self.extension.len() + size_of::<u32>() * 3;
        }
        size as u16
    }
}

/// Data type used in `RRead` and `TWrite`
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum MsgType {
        TVersion        = 100,
        RVersion,
        TAuth           = 102,
        RAuth,
        TAttach         = 104,
        RAttach,
        TError          = 106,  // Illegal, never used
        RError,
        TFlush          = 108,
        RFlush,
        TWalk           = 110,
        RWalk,
        TOpen           = 112,
        ROpen,
        TCreate         = 114,
        RCreate,
        TRead           = 116,
        RRead,
        TWrite          = 118,
        RWrite,
        TClunk          = 120,
        RClunk,
        TRemove         = 122,
        RRemove,
        TStat           = 124,
        RStat,
        TWStat          = 126,
        RWStat,
    }
}

impl MsgType {
    /// If the message type is T-message
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// If the message type is R-message
    pub fn is_r(&self) -> bool {
        (*self as u8) % 2 == 1
    }
}

impl<'a> From<&'a FCall> for MsgType {
    fn from(fcall: &'a FCall) -> MsgType {
        match *fcall {
            FCall::TVersion { .. } => MsgType::TVersion,
            FCall::RVersion { .. } => MsgType::RVersion,
            FCall::TAuth { .. } => MsgType::TAuth,
            FCall::RAuth { .. } => MsgType::RAuth,
            FCall::TAttach { .. } => MsgType::TAttach,
            FCall::RAttach { .. } => MsgType::RAttach,
            FCall::RError { .. } => MsgType::RError,
            FCall::TFlush { .. } => MsgType::TFlush,
            FCall::RFlush => MsgType::RFlush,
            FCall::TWalk { .. } => MsgType::TWalk,
            FCall::RWalk { .. } => MsgType::RWalk,
            FCall::TOpen { .. } => MsgType::TOpen,
            FCall::ROpen { .. } => MsgType::ROpen,
            FCall::TCreate { .. } => MsgType::TCreate,
            FCall::RCreate { .. } => MsgType::RCreate,
            FCall::TRead { .. } => MsgType::TRead,
            FCall::RRead { .. } => MsgType::RRead,
            FCall::TWrite { .. } => MsgType::TWrite,
            FCall::RWrite { .. } => MsgType::RWrite,
            FCall::TClunk { .. } => MsgType::TClunk,
            FCall::RClunk => MsgType::RClunk,
            FCall::TRemove { .. } => MsgType::TRemove,
            FCall::RRemove => MsgType::RRemove,
            FCall::TStat { .. } => MsgType::TStat,
            FCall::RStat { .. } => MsgType::RStat,
            FCall::TWStat { .. } => MsgType::TWStat,
            FCall::RWStat => MsgType::RWStat,
        }
    }
}

/// A data type encapsulating the various 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    TVersion {
        msize: u32,
        version: String,
    },
    RVersion {
        msize: u32,
        version: String,
    },
    TAuth {
        afid: u32,
        uname: String,
        aname: String,
        n_uname: u32,
    },
    RAuth {
        aqid: Qid,
    },
    TAttach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
        n_uname: u32,
    },
    RAttach {
        qid: Qid,
    },
    RError {
        ename: String,
        errno: u32,
    },
    TFlush {
        oldtag: u16,
    },
    RFlush,
    TWalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    RWalk {
        wqids: Vec<Qid>,
    },
    TOpen {
        fid: u32,
        mode: u8,
    },
    ROpen {
        qid: Qid,
        iounit: u32,
    },
    TCreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
        extension: String,
    },
    RCreate {
        qid: Qid,
        iounit: u32,
    },
    TRead {
        fid: u32,
        offset: u64,
        count: u32,
    },
    RRead {
        data: Data,
    },
    TWrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    RWrite {
        count: u32,
    },
    TClunk {
        fid: u32,
    },
    RClunk,
    TRemove {
        fid: u32,
    },
    RRemove,
    TStat {
        fid: u32,
    },
    RStat {
        stat: Stat,
    },
    TWStat {
        fid: u32,
        stat: Stat,
    },
    RWStat,
}

impl FCall {
    /// Get the existing fid the request operates on
    ///
    /// Attach and auth name fids to allocate and are not included.
    pub fn fid(&self) -> Option<u32> {
        match *self {
            FCall::TWalk { fid, .. }
            | FCall::TOpen { fid, .. }
            | FCall::TCreate { fid, .. }
            | FCall::TRead { fid, .. }
            | FCall::TWrite { fid, .. }
            | FCall::TClunk { fid }
            | FCall::TRemove { fid }
            | FCall::TStat { fid }
            | FCall::TWStat { fid, .. } => Some(fid),
            _ => None,
        }
    }

    /// Get the qids which self contains
    pub fn qids(&self) -> Vec<Qid> {
        match *self {
            FCall::RAuth { aqid } => vec![aqid],
            FCall::RAttach { qid } => vec![qid],
            FCall::ROpen { qid, .. } => vec![qid],
            FCall::RCreate { qid, .. } => vec![qid],
            FCall::RStat { ref stat } => vec![stat.qid],
            FCall::RWalk { ref wqids } => wqids.clone(),
            _ => Vec::new(),
        }
    }
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: FCall,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r_messages_are_odd() {
        assert!(MsgType::from(&FCall::RFlush).is_r());
        assert!(MsgType::from(&FCall::TClunk { fid: 1 }).is_t());
        assert!(MsgType::RError.is_r());
    }

    #[test]
    fn qid_type_from_mode() {
        assert_eq!(QidType::from_mode(dm::DIR | 0o755), QidType::DIR);
        assert_eq!(QidType::from_mode(dm::AUTH), QidType::AUTH);
        assert_eq!(QidType::from_mode(0o644), QidType::FILE);
    }

    #[test]
    fn stat_size_grows_with_extension() {
        let stat = Stat {
            name: "a".to_owned(),
            extension: "bc".to_owned(),
            ..Default::default()
        };
        assert_eq!(stat.size(false), 47 + 1);
        assert_eq!(stat.size(true), 47 + 1 + 2 + 2 + 12);
    }
}
