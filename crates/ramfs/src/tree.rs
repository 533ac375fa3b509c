//! The in-memory file tree.

use {
    crate::utils::now,
    p9srv::{Data, Error, Qid, QidType, Result, Stat, dm, errno::*, serialize, users::User},
    std::collections::{BTreeMap, HashMap},
};

/// Qid path of the root directory.
pub const ROOT: u64 = 0;

/// Largest file the tree will hold.
pub const MAX_FILE_SIZE: u64 = 1 << 30;

fn file_size(size: u64) -> Result<usize> {
    if size > MAX_FILE_SIZE {
        return Err(Error::No(EFBIG));
    }
    Ok(size as usize)
}

#[derive(Clone, Debug, Default)]
pub struct Node {
    pub qid: Qid,
    pub parent: u64,
    pub name: String,
    pub mode: u32,
    pub uid: String,
    pub gid: String,
    pub muid: String,
    pub n_uid: u32,
    pub n_gid: u32,
    pub n_muid: u32,
    pub atime: u32,
    pub mtime: u32,
    /// Symlink target or device description of 9P2000.u special files.
    pub extension: String,
    pub data: Vec<u8>,
    pub children: BTreeMap<String, u64>,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        self.mode & dm::DIR != 0
    }

    pub fn stat(&self) -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid: self.qid,
            mode: self.mode,
            atime: self.atime,
            mtime: self.mtime,
            length: if self.is_dir() { 0 } else { self.data.len() as u64 },
            name: self.name.clone(),
            uid: self.uid.clone(),
            gid: self.gid.clone(),
            muid: self.muid.clone(),
            extension: self.extension.clone(),
            n_uid: self.n_uid,
            n_gid: self.n_gid,
            n_muid: self.n_muid,
        }
    }

    /// Whether `user` has all of the `want` permission bits, as owner or
    /// as anybody else.
    pub fn permits(&self, user: Option<&dyn User>, want: u32) -> bool {
        let perm = match user {
            Some(user) if user.name() == self.uid => (self.mode >> 6) & 7,
            _ => self.mode & 7,
        };
        perm & want == want
    }

    /// Record a modification by `user`.
    pub fn touch(&mut self, user: Option<&dyn User>) {
        self.mtime = now();
        self.atime = self.mtime;
        self.qid.version = self.qid.version.wrapping_add(1);
        if let Some(user) = user {
            self.muid = user.name().to_owned();
            self.n_muid = user.id();
        }
    }
}

pub struct Tree {
    nodes: HashMap<u64, Node>,
    next_path: u64,
}

impl Tree {
    /// A tree holding only the root directory, owned by `owner`.
    pub fn new(owner: &dyn User, gid: &str, n_gid: u32) -> Tree {
        let time = now();
        let root = Node {
            qid: Qid {
                typ: QidType::DIR,
                version: 0,
                path: ROOT,
            },
            parent: ROOT,
            name: "/".to_owned(),
            mode: dm::DIR | 0o775,
            uid: owner.name().to_owned(),
            gid: gid.to_owned(),
            muid: owner.name().to_owned(),
            n_uid: owner.id(),
            n_gid,
            n_muid: owner.id(),
            atime: time,
            mtime: time,
            ..Default::default()
        };

        Tree {
            nodes: HashMap::from([(ROOT, root)]),
            next_path: ROOT + 1,
        }
    }

    pub fn get(&self, path: u64) -> Result<&Node> {
        self.nodes.get(&path).ok_or(Error::No(ENOENT))
    }

    pub fn get_mut(&mut self, path: u64) -> Result<&mut Node> {
        self.nodes.get_mut(&path).ok_or(Error::No(ENOENT))
    }

    /// Find `name` in the directory `dir`; `..` is the parent, the root being
    /// its own parent.
    pub fn lookup(&self, dir: u64, name: &str) -> Result<u64> {
        let node = self.get(dir)?;
        if !node.is_dir() {
            return Err(Error::No(ENOTDIR));
        }

        match name {
            ".." => Ok(node.parent),
            _ => node.children.get(name).copied().ok_or(Error::No(ENOENT)),
        }
    }

    /// Create `name` in `dir`. Permission bits are masked with the
    /// directory's the way Plan 9 does.
    pub fn create(&mut self, dir: u64, name: &str, perm: u32, extension: &str, owner: &dyn User) -> Result<u64> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(Error::No(EINVAL));
        }

        let parent = self.get(dir)?;
        if !parent.is_dir() {
            return Err(Error::No(ENOTDIR));
        }
        if parent.children.contains_key(name) {
            return Err(Error::No(EEXIST));
        }

        let mode = if perm & dm::DIR != 0 {
            perm & (!0o777 | (parent.mode & 0o777))
        } else {
            perm & (!0o666 | (parent.mode & 0o666))
        };
        let (gid, n_gid) = (parent.gid.clone(), parent.n_gid);

        let path = self.next_path;
        self.next_path += 1;

        let time = now();
        let node = Node {
            qid: Qid {
                typ: QidType::from_mode(mode),
                version: 0,
                path,
            },
            parent: dir,
            name: name.to_owned(),
            mode,
            uid: owner.name().to_owned(),
            gid,
            muid: owner.name().to_owned(),
            n_uid: owner.id(),
            n_gid,
            n_muid: owner.id(),
            atime: time,
            mtime: time,
            extension: extension.to_owned(),
            ..Default::default()
        };
        self.nodes.insert(path, node);

        let parent = self.get_mut(dir)?;
        parent.children.insert(name.to_owned(), path);
        parent.touch(Some(owner));

        Ok(path)
    }

    pub fn remove(&mut self, path: u64) -> Result<()> {
        if path == ROOT {
            return Err(Error::No(EPERM));
        }

        let node = self.get(path)?;
        if !node.children.is_empty() {
            return Err(Error::No(ENOTEMPTY));
        }
        let (parent, name) = (node.parent, node.name.clone());

        self.nodes.remove(&path);
        if let Ok(parent) = self.get_mut(parent) {
            parent.children.remove(&name);
            parent.touch(None);
        }
        Ok(())
    }

    /// Rename within the same directory.
    pub fn rename(&mut self, path: u64, name: &str) -> Result<()> {
        if path == ROOT || name == "." || name == ".." || name.contains('/') {
            return Err(Error::No(EINVAL));
        }

        let node = self.get(path)?;
        if node.name == name {
            return Ok(());
        }
        let (parent, old) = (node.parent, node.name.clone());

        let dir = self.get_mut(parent)?;
        if dir.children.contains_key(name) {
            return Err(Error::No(EEXIST));
        }
        dir.children.remove(&old);
        dir.children.insert(name.to_owned(), path);

        self.get_mut(path)?.name = name.to_owned();
        Ok(())
    }

    /// Read a file's contents.
    pub fn read(&self, path: u64, offset: u64, count: u32) -> Result<Data> {
        let node = self.get(path)?;
        let len = node.data.len() as u64;
        let start = offset.min(len) as usize;
        let end = offset.saturating_add(count as u64).min(len) as usize;
        Ok(Data(node.data[start..end].to_vec()))
    }

    /// Serialise the stats of a directory's children, starting with the entry
    /// at byte `offset` and stopping before the first one that does not fit.
    pub fn read_dir(&self, dir: u64, offset: u64, count: u32, dotu: bool) -> Result<Data> {
        let node = self.get(dir)?;

        let mut pos = 0u64;
        let mut buf = Vec::new();
        for path in node.children.values() {
            let stat = self.get(*path)?.stat();
            let size = stat.size(dotu) as u64 + 2;

            if pos < offset {
                pos += size;
                continue;
            }
            // a client may only continue where a previous read ended
            if pos > offset && buf.is_empty() {
                return Err(Error::No(EINVAL));
            }
            if buf.len() as u64 + size > count as u64 {
                break;
            }

            serialize::encode_stat(&mut buf, &stat, dotu)?;
            pos += size;
        }

        Ok(Data(buf))
    }

    /// Write into a file, growing it as needed. Append-only files ignore the
    /// offset.
    pub fn write(&mut self, path: u64, offset: u64, data: &[u8], user: Option<&dyn User>) -> Result<u32> {
        let node = self.get_mut(path)?;
        if node.is_dir() {
            return Err(Error::No(EISDIR));
        }

        let offset = if node.mode & dm::APPEND != 0 {
            node.data.len()
        } else {
            file_size(offset)?
        };
        let end = file_size(offset as u64 + data.len() as u64)?;
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset..end].copy_from_slice(data);
        node.touch(user);

        Ok(data.len() as u32)
    }

    pub fn truncate(&mut self, path: u64, length: u64) -> Result<()> {
        let length = file_size(length)?;
        let node = self.get_mut(path)?;
        if node.is_dir() {
            return Err(Error::No(EISDIR));
        }
        node.data.resize(length, 0);
        Ok(())
    }
}
