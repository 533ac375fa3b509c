use {
    async_trait::async_trait,
    clap::Parser,
    log::warn,
    p9srv::{
        srv::{Fid, Filesystem, Req, Srv, SrvConfig, srv_async},
        users::User,
        *,
    },
    std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    tokio::sync::RwLock,
};

mod tree;
mod utils;
use crate::{
    tree::{ROOT, Tree},
    utils::*,
};

#[derive(Default)]
struct RamfsFId {
    node: RwLock<u64>,
    /// Remove the file when the fid is clunked.
    rclose: AtomicBool,
}

struct Ramfs {
    tree: RwLock<Tree>,
}

impl Ramfs {
    fn new(owner: &dyn User, gid: &str, n_gid: u32) -> Ramfs {
        Ramfs {
            tree: RwLock::new(Tree::new(owner, gid, n_gid)),
        }
    }
}

async fn node(fid: &Fid<RamfsFId>) -> u64 {
    *fid.aux.node.read().await
}

fn user(fid: &Fid<RamfsFId>) -> Option<&dyn User> {
    fid.user().map(|u| u.as_ref())
}

/// Permission bits an open mode needs.
fn access(mode: u8) -> u32 {
    let rw = match mode & 3 {
        om::READ => dm::READ,
        om::WRITE => dm::WRITE,
        om::RDWR => dm::READ | dm::WRITE,
        _ => dm::EXEC,
    };
    if mode & om::TRUNC != 0 { rw | dm::WRITE } else { rw }
}

#[async_trait]
impl Filesystem for Ramfs {
    type FId = RamfsFId;

    async fn rattach(&self, req: &Req<Self::FId>) -> Result<FCall> {
        let fid = req.fid().ok_or(Error::UnknownFid)?;
        *fid.aux.node.write().await = ROOT;

        let tree = self.tree.read().await;
        Ok(FCall::RAttach {
            qid: tree.get(ROOT)?.qid,
        })
    }

    async fn rwalk(&self, req: &Req<Self::FId>) -> Result<FCall> {
        let FCall::TWalk { ref wnames, .. } = *req.tc() else {
            return Err(Error::No(errno::EINVAL));
        };
        let fid = req.fid().ok_or(Error::UnknownFid)?;
        let newfid = req.newfid().ok_or(Error::UnknownFid)?;

        let tree = self.tree.read().await;
        let mut path = node(fid).await;
        let mut wqids = Vec::new();

        for (i, name) in wnames.iter().enumerate() {
            match tree.lookup(path, name) {
                Ok(next) => {
                    path = next;
                    wqids.push(tree.get(path)?.qid);
                }
                Err(e) if i == 0 => return Err(e),
                Err(_) => break,
            }
        }

        if wqids.len() == wnames.len() {
            *newfid.aux.node.write().await = path;
        }

        Ok(FCall::RWalk { wqids })
    }

    async fn ropen(&self, req: &Req<Self::FId>) -> Result<FCall> {
        let FCall::TOpen { mode, .. } = *req.tc() else {
            return Err(Error::No(errno::EINVAL));
        };
        let fid = req.fid().ok_or(Error::UnknownFid)?;

        let mut tree = self.tree.write().await;
        let path = node(fid).await;
        let node = tree.get_mut(path)?;
        if !node.permits(user(fid), access(mode)) {
            return Err(Error::No(errno::EACCES));
        }

        if mode & om::TRUNC != 0 && !node.is_dir() {
            node.data.clear();
            node.touch(user(fid));
        }
        if mode & om::RCLOSE != 0 {
            fid.aux.rclose.store(true, Ordering::SeqCst);
        }

        Ok(FCall::ROpen {
            qid: node.qid,
            iounit: 0,
        })
    }

    async fn rcreate(&self, req: &Req<Self::FId>) -> Result<FCall> {
        let FCall::TCreate {
            ref name,
            perm,
            mode,
            ref extension,
            ..
        } = *req.tc()
        else {
            return Err(Error::No(errno::EINVAL));
        };
        let fid = req.fid().ok_or(Error::UnknownFid)?;
        let owner = user(fid).ok_or(Error::NoSuchUser)?;

        let mut tree = self.tree.write().await;
        let dir = node(fid).await;
        if !tree.get(dir)?.permits(Some(owner), dm::WRITE) {
            return Err(Error::No(errno::EACCES));
        }

        let path = tree.create(dir, name, perm, extension, owner)?;
        *fid.aux.node.write().await = path;
        if mode & om::RCLOSE != 0 {
            fid.aux.rclose.store(true, Ordering::SeqCst);
        }

        Ok(FCall::RCreate {
            qid: tree.get(path)?.qid,
            iounit: 0,
        })
    }

    async fn rread(&self, req: &Req<Self::FId>) -> Result<FCall> {
        let FCall::TRead { offset, count, .. } = *req.tc() else {
            return Err(Error::No(errno::EINVAL));
        };
        let fid = req.fid().ok_or(Error::UnknownFid)?;

        let tree = self.tree.read().await;
        let path = node(fid).await;
        let data = if tree.get(path)?.is_dir() {
            tree.read_dir(path, offset, count, req.conn().dotu())?
        } else {
            tree.read(path, offset, count)?
        };

        Ok(FCall::RRead { data })
    }

    async fn rwrite(&self, req: &Req<Self::FId>) -> Result<FCall> {
        let FCall::TWrite {
            offset, ref data, ..
        } = *req.tc()
        else {
            return Err(Error::No(errno::EINVAL));
        };
        let fid = req.fid().ok_or(Error::UnknownFid)?;

        let mut tree = self.tree.write().await;
        let path = node(fid).await;
        let count = tree.write(path, offset, &data.0, user(fid))?;

        Ok(FCall::RWrite { count })
    }

    async fn rclunk(&self, req: &Req<Self::FId>) -> Result<FCall> {
        let fid = req.fid().ok_or(Error::UnknownFid)?;

        if fid.aux.rclose.load(Ordering::SeqCst) {
            let mut tree = self.tree.write().await;
            let path = node(fid).await;
            if let Err(e) = tree.remove(path) {
                warn!("remove on close of fid {}: {}", fid.fid(), e);
            }
        }

        Ok(FCall::RClunk)
    }

    async fn rremove(&self, req: &Req<Self::FId>) -> Result<FCall> {
        let fid = req.fid().ok_or(Error::UnknownFid)?;

        let mut tree = self.tree.write().await;
        let path = node(fid).await;
        let parent = tree.get(path)?.parent;
        if !tree.get(parent)?.permits(user(fid), dm::WRITE) {
            return Err(Error::No(errno::EACCES));
        }
        tree.remove(path)?;

        Ok(FCall::RRemove)
    }

    async fn rstat(&self, req: &Req<Self::FId>) -> Result<FCall> {
        let fid = req.fid().ok_or(Error::UnknownFid)?;

        let tree = self.tree.read().await;
        let path = node(fid).await;
        Ok(FCall::RStat {
            stat: tree.get(path)?.stat(),
        })
    }

    async fn rwstat(&self, req: &Req<Self::FId>) -> Result<FCall> {
        let FCall::TWStat { ref stat, .. } = *req.tc() else {
            return Err(Error::No(errno::EINVAL));
        };
        let fid = req.fid().ok_or(Error::UnknownFid)?;

        let mut tree = self.tree.write().await;
        let path = node(fid).await;
        {
            let node = tree.get(path)?;
            if stat.mode != !0 && node.is_dir() != (stat.mode & dm::DIR != 0) {
                return Err(Error::DirChange);
            }
            if !stat.uid.is_empty() && stat.uid != node.uid {
                return Err(Error::No(errno::EPERM));
            }
        }

        if stat.length != !0 {
            tree.truncate(path, stat.length)?;
        }
        if !stat.name.is_empty() {
            tree.rename(path, &stat.name)?;
        }

        let node = tree.get_mut(path)?;
        if stat.mode != !0 {
            node.mode = stat.mode;
            node.qid.typ = QidType::from_mode(stat.mode);
        }
        if stat.atime != !0 {
            node.atime = stat.atime;
        }
        if stat.mtime != !0 {
            node.mtime = stat.mtime;
        }
        if !stat.gid.is_empty() {
            node.gid = stat.gid.clone();
            if stat.n_gid != !0 {
                node.n_gid = stat.n_gid;
            }
        }
        node.qid.version = node.qid.version.wrapping_add(1);

        Ok(FCall::RWStat)
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    #[arg(default_value = "tcp!0.0.0.0!564")]
    address: String,

    /// Largest message size offered to clients
    #[arg(long, default_value_t = 8192 + IOHDRSZ)]
    msize: u32,

    /// Only speak 9P2000, even to clients asking for 9P2000.u
    #[arg(long)]
    no_dotu: bool,

    /// Refuse wstat of type, dev, qid version and path, and of the directory bit
    #[arg(long)]
    strict_wstat: bool,
}

async fn ramfs_main(
    Cli {
        address,
        msize,
        no_dotu,
        strict_wstat,
    }: Cli,
) -> p9srv::Result<i32> {
    if msize < IOHDRSZ {
        return res!(io_err!(InvalidInput, "msize too small"));
    }

    let (owner, group, gid) = process_owner();
    let config = SrvConfig {
        msize,
        dotu: !no_dotu,
        strict_wstat,
    };
    let srv = Srv::new(Ramfs::new(owner.as_ref(), &group, gid), Arc::new(UnixUsers), config);

    println!("[*] Root owned by {}:{}", owner.name(), group);
    println!("[*] Ready to accept clients: {}", address);
    srv_async(Arc::new(srv), &address).await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = ramfs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
