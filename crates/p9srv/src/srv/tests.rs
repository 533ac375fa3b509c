use {
    super::*,
    crate::{error::string::*, serialize, users::UserTable, Result},
    async_trait::async_trait,
    nix::errno::Errno,
    std::sync::atomic::AtomicUsize,
    tokio::sync::{
        Notify,
        mpsc::{self, UnboundedReceiver},
    },
};

const BOB: u32 = 1000;

#[derive(Default)]
struct Flushes(AtomicUsize);

impl FlushOp<()> for Flushes {
    fn flush(&self, _req: &Req<()>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct TestAuth {
    destroyed: AtomicUsize,
}

#[async_trait]
impl AuthOps<()> for TestAuth {
    async fn auth_init(&self, _afid: &Fid<()>, _aname: &str) -> Result<Qid> {
        Ok(Qid {
            typ: QidType::FILE,
            version: 0,
            path: 99,
        })
    }

    async fn auth_check(&self, _fid: &Fid<()>, _afid: Option<&Fid<()>>, aname: &str) -> Result<()> {
        match aname {
            "deny" => Err(Error::PermissionDenied),
            _ => Ok(()),
        }
    }

    async fn auth_read(&self, _afid: &Fid<()>, _offset: u64, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(2);
        buf[..n].copy_from_slice(&b"ok"[..n]);
        Ok(n)
    }

    async fn auth_write(&self, _afid: &Fid<()>, _offset: u64, data: &[u8]) -> Result<usize> {
        Ok(data.len())
    }

    async fn auth_destroy(&self, _afid: &Fid<()>) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Walking a name starting with `d` yields a directory, `missing` stops the
/// walk, a read at offset 42 blocks until released or flushed.
#[derive(Default)]
struct TestFs {
    auth: Option<TestAuth>,
    flusher: Option<Flushes>,
    destroyed: Mutex<Vec<u32>>,
    stats: AtomicUsize,
    reached: Notify,
    gate: Notify,
}

#[async_trait]
impl Filesystem for TestFs {
    type FId = ();

    async fn rattach(&self, _req: &Req<()>) -> Result<FCall> {
        Ok(FCall::RAttach {
            qid: Qid {
                typ: QidType::DIR,
                version: 0,
                path: 0,
            },
        })
    }

    async fn rwalk(&self, req: &Req<()>) -> Result<FCall> {
        let FCall::TWalk { ref wnames, .. } = *req.tc() else {
            return Err(Error::No(Errno::EINVAL));
        };

        let mut wqids = Vec::new();
        for (i, name) in wnames.iter().enumerate() {
            if name == "missing" {
                if i == 0 {
                    return Err(Error::No(Errno::ENOENT));
                }
                break;
            }
            let typ = if name.starts_with('d') {
                QidType::DIR
            } else {
                QidType::FILE
            };
            wqids.push(Qid {
                typ,
                version: 0,
                path: i as u64 + 1,
            });
        }

        Ok(FCall::RWalk { wqids })
    }

    async fn ropen(&self, req: &Req<()>) -> Result<FCall> {
        let fid = req.fid().ok_or(Error::UnknownFid)?;
        Ok(FCall::ROpen {
            qid: Qid {
                typ: fid.typ(),
                version: 0,
                path: fid.fid() as u64,
            },
            iounit: 0,
        })
    }

    async fn rcreate(&self, req: &Req<()>) -> Result<FCall> {
        let FCall::TCreate { perm, .. } = *req.tc() else {
            return Err(Error::No(Errno::EINVAL));
        };
        Ok(FCall::RCreate {
            qid: Qid {
                typ: QidType::from_mode(perm),
                version: 0,
                path: 7,
            },
            iounit: 0,
        })
    }

    async fn rread(&self, req: &Req<()>) -> Result<FCall> {
        let FCall::TRead { offset, count, .. } = *req.tc() else {
            return Err(Error::No(Errno::EINVAL));
        };

        if offset == 42 {
            self.reached.notify_one();
            tokio::select! {
                _ = self.gate.notified() => {}
                _ = req.cancelled() => {}
            }
        }

        let fid = req.fid().ok_or(Error::UnknownFid)?;
        let n = if fid.is_dir() { 10 } else { count.min(4) };
        Ok(FCall::RRead {
            data: Data(vec![0; n as usize]),
        })
    }

    async fn rwrite(&self, req: &Req<()>) -> Result<FCall> {
        let FCall::TWrite { ref data, .. } = *req.tc() else {
            return Err(Error::No(Errno::EINVAL));
        };
        Ok(FCall::RWrite {
            count: data.0.len() as u32,
        })
    }

    async fn rremove(&self, _req: &Req<()>) -> Result<FCall> {
        Err(Error::No(Errno::EPERM))
    }

    async fn rstat(&self, _req: &Req<()>) -> Result<FCall> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        Ok(FCall::RStat {
            stat: Stat::default(),
        })
    }

    async fn rwstat(&self, _req: &Req<()>) -> Result<FCall> {
        Ok(FCall::RWStat)
    }

    fn auth(&self) -> Option<&dyn AuthOps<()>> {
        self.auth.as_ref().map(|a| a as &dyn AuthOps<()>)
    }

    fn flusher(&self) -> Option<&dyn FlushOp<()>> {
        self.flusher.as_ref().map(|f| f as &dyn FlushOp<()>)
    }

    fn fid_destroy(&self, fid: &Fid<()>) {
        lock(&self.destroyed).push(fid.fid());
    }
}

struct Harness {
    srv: Arc<Srv<TestFs>>,
    conn: Arc<Conn<()>>,
    rx: UnboundedReceiver<Msg>,
}

impl Harness {
    fn new(fs: TestFs) -> Harness {
        Harness::with_config(fs, SrvConfig::default())
    }

    fn with_config(fs: TestFs, config: SrvConfig) -> Harness {
        let users = Arc::new(UserTable::new().with("bob", BOB));
        let srv = Arc::new(Srv::new(fs, users, config));
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = srv.new_conn(tx);
        Harness { srv, conn, rx }
    }

    fn fs(&self) -> &TestFs {
        self.srv.filesystem()
    }

    fn destroyed(&self) -> Vec<u32> {
        lock(&self.fs().destroyed).clone()
    }

    fn recv(&self, tag: u16, body: FCall) -> Arc<Req<()>> {
        self.srv.recv(&self.conn, Msg { tag, body }).unwrap()
    }

    /// Process one request and return its response.
    async fn call(&mut self, tag: u16, body: FCall) -> FCall {
        let req = self.recv(tag, body);
        self.srv.process(req).await;
        let msg = self.rx.try_recv().unwrap();
        assert_eq!(msg.tag, tag);
        msg.body
    }

    async fn attach(&mut self, fid: u32) -> FCall {
        self.call(
            1,
            FCall::TAttach {
                fid,
                afid: NOFID,
                uname: "bob".to_owned(),
                aname: String::new(),
                n_uname: NOUID,
            },
        )
        .await
    }

    async fn walk(&mut self, fid: u32, newfid: u32, wnames: &[&str]) -> FCall {
        let wnames = wnames.iter().map(|s| s.to_string()).collect();
        self.call(2, FCall::TWalk { fid, newfid, wnames }).await
    }

    async fn open(&mut self, fid: u32, mode: u8) -> FCall {
        self.call(3, FCall::TOpen { fid, mode }).await
    }

    async fn read(&mut self, fid: u32, offset: u64, count: u32) -> FCall {
        self.call(4, FCall::TRead { fid, offset, count }).await
    }

    fn state(&self, fid: u32) -> FidState {
        self.conn.fid(fid).unwrap().state()
    }
}

fn ename(rc: FCall) -> String {
    match rc {
        FCall::RError { ename, .. } => ename,
        rc => panic!("expected RError, got {:?}", rc),
    }
}

fn version(msize: u32, version: &str) -> FCall {
    FCall::TVersion {
        msize,
        version: version.to_owned(),
    }
}

#[tokio::test]
async fn version_takes_minimum_msize() {
    let mut h = Harness::new(TestFs::default());

    let rc = h.call(NOTAG, version(4096, P92000U)).await;
    assert_eq!(
        rc,
        FCall::RVersion {
            msize: 4096,
            version: P92000U.to_owned()
        }
    );
    assert!(h.conn.dotu());

    let rc = h.call(NOTAG, version(9000, P92000)).await;
    assert_eq!(
        rc,
        FCall::RVersion {
            msize: 4096,
            version: P92000.to_owned()
        }
    );
    assert!(!h.conn.dotu());

    assert_eq!(ename(h.call(NOTAG, version(IOHDRSZ - 1, P92000)).await), EMSIZE);
    assert_eq!(h.conn.msize(), 4096);
    assert_eq!(h.srv.versioned(), 2);
}

#[tokio::test]
async fn version_without_dotu_support() {
    let config = SrvConfig {
        dotu: false,
        ..Default::default()
    };
    let mut h = Harness::with_config(TestFs::default(), config);

    let rc = h.call(NOTAG, version(8192, P92000U)).await;
    assert_eq!(
        rc,
        FCall::RVersion {
            msize: 8192,
            version: P92000.to_owned()
        }
    );
    assert!(!h.conn.dotu());
}

#[tokio::test]
async fn version_suppresses_outstanding_requests() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;
    h.walk(1, 2, &["file"]).await;
    h.open(2, om::READ).await;

    let queued = h.recv(7, FCall::TStat { fid: 1 });
    let running = h.recv(5, FCall::TRead { fid: 2, offset: 42, count: 8 });
    let srv = h.srv.clone();
    let handle = tokio::spawn(async move { srv.process(running).await });
    h.fs().reached.notified().await;

    assert!(matches!(h.call(NOTAG, version(8192, P92000)).await, FCall::RVersion { .. }));

    h.fs().gate.notify_one();
    handle.await.unwrap();
    h.srv.process(queued).await;

    assert!(h.rx.try_recv().is_err());
    assert_eq!(h.fs().stats.load(Ordering::SeqCst), 0);
    assert_eq!(h.conn.req_count(), 0);
}

#[tokio::test]
async fn attach_sets_type_and_reference() {
    let mut h = Harness::new(TestFs::default());

    let rc = h.attach(1).await;
    assert!(matches!(rc, FCall::RAttach { .. }));

    let fid = h.conn.fid(1).unwrap();
    assert!(fid.is_dir());
    assert_eq!(fid.refs(), 1);
    assert_eq!(fid.user().unwrap().name(), "bob");
}

#[tokio::test]
async fn attach_failures_leave_no_fid() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;

    assert_eq!(ename(h.attach(1).await), EINUSE);
    assert_eq!(h.state(1).refs, 1);

    let rc = h
        .call(
            1,
            FCall::TAttach {
                fid: 2,
                afid: NOFID,
                uname: "alice".to_owned(),
                aname: String::new(),
                n_uname: NOUID,
            },
        )
        .await;
    assert_eq!(ename(rc), ENOUSER);
    assert!(h.conn.fid(2).is_none());

    assert_eq!(ename(h.attach(NOFID).await), EUNKNOWNFID);

    let rc = h
        .call(
            1,
            FCall::TAttach {
                fid: 3,
                afid: 9,
                uname: "bob".to_owned(),
                aname: String::new(),
                n_uname: NOUID,
            },
        )
        .await;
    assert_eq!(ename(rc), EUNKNOWNFID);
    assert_eq!(h.conn.fid_count(), 1);
}

#[tokio::test]
async fn dotu_resolves_numeric_ids() {
    let mut h = Harness::new(TestFs::default());
    h.call(NOTAG, version(8192, P92000U)).await;

    let attach = |fid, n_uname| FCall::TAttach {
        fid,
        afid: NOFID,
        uname: "bob".to_owned(),
        aname: String::new(),
        n_uname,
    };

    assert!(matches!(h.call(1, attach(1, BOB)).await, FCall::RAttach { .. }));
    // the name is not consulted once the numeric id fails
    assert_eq!(ename(h.call(1, attach(2, NOUID)).await), ENOUSER);
}

#[tokio::test]
async fn partial_walk_commits_nothing() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;

    match h.walk(1, 2, &["dir", "missing"]).await {
        FCall::RWalk { wqids } => assert_eq!(wqids.len(), 1),
        rc => panic!("unexpected {:?}", rc),
    }

    assert!(h.conn.fid(2).is_none());
    assert_eq!(ename(h.call(9, FCall::TStat { fid: 2 }).await), EUNKNOWNFID);
    assert_eq!(h.destroyed(), vec![2]);
    assert_eq!(h.state(1).refs, 1);
}

#[tokio::test]
async fn walk_sets_type_of_last_element() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;

    h.walk(1, 2, &["dir", "file"]).await;
    assert_eq!(h.state(2).typ, QidType::FILE);
    assert_eq!(h.state(2).refs, 1);

    h.walk(1, 3, &[]).await;
    assert_eq!(h.state(3).typ, QidType::DIR);

    assert_eq!(ename(h.walk(2, 4, &["x"]).await), ENOTDIR);
    assert_eq!(ename(h.walk(1, 2, &["dir"]).await), EINUSE);
    assert_eq!(h.state(2).typ, QidType::FILE);
    assert_eq!(h.conn.fid_count(), 3);
}

#[tokio::test]
async fn walk_to_same_fid_clones_in_place() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;
    let before = h.conn.fid(1).unwrap();

    h.walk(1, 1, &["dir", "file"]).await;

    let after = h.conn.fid(1).unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.typ(), QidType::FILE);
    assert_eq!(after.refs(), 1);
    assert_eq!(h.conn.fid_count(), 1);
}

#[tokio::test]
async fn walk_from_opened_fid_is_bad_use() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;
    h.open(1, om::READ).await;

    assert_eq!(ename(h.walk(1, 2, &[]).await), EBADUSE);
    assert!(h.conn.fid(2).is_none());
}

#[tokio::test]
async fn open_twice() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;

    assert!(matches!(h.open(1, om::READ).await, FCall::ROpen { .. }));
    assert!(h.state(1).opened);

    assert_eq!(ename(h.open(1, om::READ).await), EOPEN);
    assert!(h.state(1).opened);
    assert_eq!(ename(h.walk(1, 2, &[]).await), EBADUSE);
}

#[tokio::test]
async fn open_directory_for_writing() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;

    assert_eq!(ename(h.open(1, om::RDWR).await), EPERM);
    assert!(!h.state(1).opened);
}

#[tokio::test]
async fn create_special_file_needs_dotu() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;
    let before = h.state(1);

    let create = |perm| FCall::TCreate {
        fid: 1,
        name: "sock".to_owned(),
        perm,
        mode: om::READ,
        extension: String::new(),
    };

    assert_eq!(ename(h.call(5, create(dm::SOCKET | 0o777)).await), EPERM);
    assert_eq!(h.state(1), before);

    assert!(matches!(h.call(5, create(0o644)).await, FCall::RCreate { .. }));
    let after = h.state(1);
    assert_eq!(after.typ, QidType::FILE);
    assert!(after.opened);

    assert_eq!(ename(h.call(5, create(0o644)).await), EOPEN);
}

#[tokio::test]
async fn create_in_file_and_directory_modes() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;
    h.walk(1, 2, &["file"]).await;

    let create = |fid, perm, mode| FCall::TCreate {
        fid,
        name: "new".to_owned(),
        perm,
        mode,
        extension: String::new(),
    };

    assert_eq!(ename(h.call(5, create(2, 0o644, om::READ)).await), ENOTDIR);
    assert_eq!(ename(h.call(5, create(1, dm::DIR | 0o755, om::WRITE)).await), EPERM);
    assert!(!h.state(1).opened);
}

#[tokio::test]
async fn read_write_gates() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;
    h.walk(1, 2, &["file"]).await;

    assert_eq!(ename(h.read(2, 0, 8).await), EBADUSE);

    h.open(2, om::WRITE).await;
    assert_eq!(ename(h.read(2, 0, 8).await), EBADUSE);

    let write = |data: Vec<u8>| FCall::TWrite {
        fid: 2,
        offset: 0,
        data: Data(data),
    };
    assert_eq!(h.call(6, write(vec![1, 2, 3])).await, FCall::RWrite { count: 3 });

    let too_large = vec![0; (h.conn.msize() - IOHDRSZ + 1) as usize];
    assert_eq!(ename(h.call(6, write(too_large)).await), ETOOLARGE);

    h.walk(1, 3, &["file"]).await;
    h.open(3, om::READ).await;
    assert_eq!(ename(h.read(3, 0, h.conn.msize()).await), ETOOLARGE);
    assert_eq!(ename(h.call(6, FCall::TWrite { fid: 3, offset: 0, data: Data(vec![1]) }).await), EBADUSE);

    h.open(1, om::READ).await;
    assert_eq!(ename(h.call(6, FCall::TWrite { fid: 1, offset: 0, data: Data(vec![1]) }).await), EBADUSE);
}

#[tokio::test]
async fn directory_read_cursor() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;
    h.open(1, om::READ).await;

    match h.read(1, 0, 100).await {
        FCall::RRead { data } => assert_eq!(data.0.len(), 10),
        rc => panic!("unexpected {:?}", rc),
    }
    assert_eq!(h.state(1).diroffset, 10);

    h.read(1, 500, 100).await;
    assert_eq!(h.state(1).diroffset, 510);

    h.read(1, 0, 100).await;
    assert_eq!(h.state(1).diroffset, 10);
}

#[tokio::test]
async fn auth_fid_lifecycle() {
    let fs = TestFs {
        auth: Some(TestAuth::default()),
        ..Default::default()
    };
    let mut h = Harness::new(fs);
    assert!(h.srv.capabilities().auth);

    let rc = h
        .call(
            1,
            FCall::TAuth {
                afid: 9,
                uname: "bob".to_owned(),
                aname: String::new(),
                n_uname: NOUID,
            },
        )
        .await;
    match rc {
        FCall::RAuth { aqid } => assert!(aqid.typ.contains(QidType::AUTH)),
        rc => panic!("unexpected {:?}", rc),
    }
    let afid = h.conn.fid(9).unwrap();
    assert!(afid.is_auth());
    assert_eq!(afid.refs(), 1);

    // never opened, still readable
    assert_eq!(
        h.read(9, 0, 16).await,
        FCall::RRead {
            data: Data(b"ok".to_vec())
        }
    );
    let rc = h
        .call(
            6,
            FCall::TWrite {
                fid: 9,
                offset: 0,
                data: Data(vec![0; 5]),
            },
        )
        .await;
    assert_eq!(rc, FCall::RWrite { count: 5 });

    let attach = |aname: &str| FCall::TAttach {
        fid: 1,
        afid: 9,
        uname: "bob".to_owned(),
        aname: aname.to_owned(),
        n_uname: NOUID,
    };
    assert_eq!(ename(h.call(1, attach("deny")).await), EPERM);
    assert!(h.conn.fid(1).is_none());
    assert!(matches!(h.call(1, attach("")).await, FCall::RAttach { .. }));
    assert_eq!(afid.refs(), 1);

    assert_eq!(h.call(7, FCall::TClunk { fid: 9 }).await, FCall::RClunk);
    assert_eq!(h.fs().auth.as_ref().unwrap().destroyed.load(Ordering::SeqCst), 1);
    assert!(h.conn.fid(9).is_none());
}

#[tokio::test]
async fn auth_without_capability() {
    let mut h = Harness::new(TestFs::default());
    assert!(!h.srv.capabilities().auth);

    let rc = h
        .call(
            1,
            FCall::TAuth {
                afid: 9,
                uname: "bob".to_owned(),
                aname: String::new(),
                n_uname: NOUID,
            },
        )
        .await;
    assert_eq!(ename(rc), ENOAUTH);
    assert!(h.conn.fid(9).is_none());
}

#[tokio::test]
async fn auth_on_live_fid() {
    let fs = TestFs {
        auth: Some(TestAuth::default()),
        ..Default::default()
    };
    let mut h = Harness::new(fs);
    h.attach(1).await;
    let before = h.state(1);

    let rc = h
        .call(
            1,
            FCall::TAuth {
                afid: 1,
                uname: "bob".to_owned(),
                aname: String::new(),
                n_uname: NOUID,
            },
        )
        .await;
    assert_eq!(ename(rc), EINUSE);
    assert_eq!(h.state(1), before);
    assert!(!h.conn.fid(1).unwrap().is_auth());
    assert!(h.destroyed().is_empty());
}

#[tokio::test]
async fn flush_of_unknown_tag() {
    let mut h = Harness::new(TestFs::default());
    assert_eq!(h.call(6, FCall::TFlush { oldtag: 77 }).await, FCall::RFlush);
    assert_eq!(h.call(6, FCall::TFlush { oldtag: 6 }).await, FCall::RFlush);
}

#[tokio::test]
async fn flush_before_start() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;

    let target = h.recv(5, FCall::TStat { fid: 1 });
    assert_eq!(h.call(6, FCall::TFlush { oldtag: 5 }).await, FCall::RFlush);
    assert!(target.status().contains(ReqStatus::FLUSH));

    h.srv.process(target).await;
    assert!(h.rx.try_recv().is_err());
    assert_eq!(h.fs().stats.load(Ordering::SeqCst), 0);
    assert_eq!(h.conn.req_count(), 0);
    assert_eq!(h.state(1).refs, 1);
}

#[tokio::test]
async fn flush_in_progress() {
    let fs = TestFs {
        flusher: Some(Flushes::default()),
        ..Default::default()
    };
    let mut h = Harness::new(fs);
    h.attach(1).await;
    h.walk(1, 2, &["file"]).await;
    h.open(2, om::READ).await;

    let target = h.recv(5, FCall::TRead { fid: 2, offset: 42, count: 8 });
    let srv = h.srv.clone();
    let handle = {
        let target = target.clone();
        tokio::spawn(async move { srv.process(target).await })
    };
    h.fs().reached.notified().await;

    let flush = h.recv(6, FCall::TFlush { oldtag: 5 });
    h.srv.process(flush).await;
    // answered only after its target
    assert!(h.rx.try_recv().is_err());
    assert!(target.is_cancelled());
    assert_eq!(h.fs().flusher.as_ref().unwrap().0.load(Ordering::SeqCst), 1);

    handle.await.unwrap();

    let first = h.rx.try_recv().unwrap();
    assert_eq!(first.tag, 5);
    assert!(matches!(first.body, FCall::RRead { .. }));
    let second = h.rx.try_recv().unwrap();
    assert_eq!(second, Msg { tag: 6, body: FCall::RFlush });
    assert_eq!(h.conn.req_count(), 0);
}

#[tokio::test]
async fn duplicate_tag_is_dropped() {
    let h = Harness::new(TestFs::default());
    let _first = h.recv(5, FCall::TStat { fid: 1 });
    assert!(h.srv.recv(&h.conn, Msg { tag: 5, body: FCall::TStat { fid: 1 } }).is_none());
}

#[tokio::test]
async fn clunk_and_remove_release_fids() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;
    h.walk(1, 2, &["file"]).await;

    match h.call(7, FCall::TRemove { fid: 2 }).await {
        FCall::RError { errno, .. } => assert_eq!(errno, Errno::EPERM as u32),
        rc => panic!("unexpected {:?}", rc),
    }
    assert!(h.conn.fid(2).is_none());
    assert_eq!(h.destroyed(), vec![2]);

    assert_eq!(h.call(7, FCall::TClunk { fid: 1 }).await, FCall::RClunk);
    assert_eq!(h.conn.fid_count(), 0);
    assert_eq!(h.destroyed(), vec![2, 1]);

    assert_eq!(ename(h.call(7, FCall::TClunk { fid: 1 }).await), EUNKNOWNFID);
}

#[tokio::test]
async fn clunk_twice_during_read_destroys_once() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;
    h.walk(1, 2, &["file"]).await;
    h.open(2, om::READ).await;

    let read = h.recv(5, FCall::TRead { fid: 2, offset: 42, count: 8 });
    let srv = h.srv.clone();
    let handle = tokio::spawn(async move { srv.process(read).await });
    h.fs().reached.notified().await;

    assert_eq!(h.call(7, FCall::TClunk { fid: 2 }).await, FCall::RClunk);
    assert!(h.destroyed().is_empty());
    assert_eq!(h.call(8, FCall::TClunk { fid: 2 }).await, FCall::RClunk);
    assert_eq!(h.destroyed(), vec![2]);
    assert!(h.conn.fid(2).is_none());

    h.fs().gate.notify_one();
    handle.await.unwrap();

    assert_eq!(h.rx.try_recv().unwrap().tag, 5);
    assert_eq!(h.destroyed(), vec![2]);
}

#[tokio::test]
async fn disconnect_destroys_remaining_fids() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;
    h.walk(1, 2, &["dir"]).await;

    h.srv.disconnect(&h.conn);

    let mut destroyed = h.destroyed();
    destroyed.sort();
    assert_eq!(destroyed, vec![1, 2]);
    assert_eq!(h.conn.fid_count(), 0);
}

#[tokio::test]
async fn strict_wstat() {
    let config = SrvConfig {
        strict_wstat: true,
        ..Default::default()
    };
    let mut h = Harness::with_config(TestFs::default(), config);
    h.attach(1).await;
    h.walk(1, 2, &["file"]).await;

    let wstat = |stat| FCall::TWStat { fid: 2, stat };

    let mut stat = Stat::untouched();
    stat.length = 0;
    assert_eq!(h.call(8, wstat(stat)).await, FCall::RWStat);

    let mut stat = Stat::untouched();
    stat.qid.path = 5;
    assert_eq!(ename(h.call(8, wstat(stat)).await), EPERM);

    let mut stat = Stat::untouched();
    stat.mode = dm::DIR | 0o755;
    assert_eq!(ename(h.call(8, wstat(stat)).await), EDIRCHANGE);
}

#[tokio::test]
async fn lenient_wstat_delegates() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;

    let stat = Stat {
        mode: 0o644,
        ..Default::default()
    };
    assert_eq!(h.call(8, FCall::TWStat { fid: 1, stat }).await, FCall::RWStat);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_walk_clones() {
    let mut h = Harness::new(TestFs::default());
    h.attach(1).await;

    let handles: Vec<_> = (0..32u16)
        .map(|i| {
            let body = FCall::TWalk {
                fid: 1,
                newfid: 100 + i as u32,
                wnames: Vec::new(),
            };
            let req = h.recv(100 + i, body);
            let srv = h.srv.clone();
            tokio::spawn(async move { srv.process(req).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    for _ in 0..32 {
        let msg = h.rx.try_recv().unwrap();
        assert_eq!(msg.body, FCall::RWalk { wqids: Vec::new() });
    }
    assert_eq!(h.conn.fid_count(), 33);
    assert_eq!(h.state(1).refs, 1);
}

#[tokio::test]
async fn serve_over_a_stream() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let users = Arc::new(UserTable::new().with("bob", BOB));
    let srv = Arc::new(Srv::new(TestFs::default(), users, SrvConfig::default()));

    let (client, server) = tokio::io::duplex(4096);
    let (sr, sw) = tokio::io::split(server);
    tokio::spawn(serve(srv, sr, sw));
    let (mut cr, mut cw) = tokio::io::split(client);

    let msg = Msg {
        tag: NOTAG,
        body: version(4096, P92000U),
    };
    let mut body = Vec::new();
    serialize::write_msg(&mut body, &msg, false).unwrap();
    let mut frame = ((body.len() + 4) as u32).to_le_bytes().to_vec();
    frame.extend(body);
    cw.write_all(&frame).await.unwrap();

    let mut size = [0u8; 4];
    cr.read_exact(&mut size).await.unwrap();
    let mut buf = vec![0; u32::from_le_bytes(size) as usize - 4];
    cr.read_exact(&mut buf).await.unwrap();

    let rc = serialize::read_msg(&mut &buf[..], false).unwrap();
    assert_eq!(
        rc,
        Msg {
            tag: NOTAG,
            body: FCall::RVersion {
                msize: 4096,
                version: P92000U.to_owned()
            }
        }
    );
}

fn frame(msg: &Msg, dotu: bool) -> Vec<u8> {
    let mut body = Vec::new();
    serialize::write_msg(&mut body, msg, dotu).unwrap();
    let mut frame = ((body.len() + 4) as u32).to_le_bytes().to_vec();
    frame.extend(body);
    frame
}

async fn read_frame<R: tokio::io::AsyncRead + Unpin>(r: &mut R, dotu: bool) -> Msg {
    use tokio::io::AsyncReadExt;

    let mut size = [0u8; 4];
    r.read_exact(&mut size).await.unwrap();
    let mut buf = vec![0; u32::from_le_bytes(size) as usize - 4];
    r.read_exact(&mut buf).await.unwrap();
    serialize::read_msg(&mut &buf[..], dotu).unwrap()
}

#[tokio::test]
async fn message_pipelined_after_version_uses_new_dialect() {
    use tokio::io::AsyncWriteExt;

    let users = Arc::new(UserTable::new().with("bob", BOB));
    let srv = Arc::new(Srv::new(TestFs::default(), users, SrvConfig::default()));

    let (client, server) = tokio::io::duplex(4096);
    let (sr, sw) = tokio::io::split(server);
    tokio::spawn(serve(srv, sr, sw));
    let (mut cr, mut cw) = tokio::io::split(client);

    let tversion = Msg {
        tag: NOTAG,
        body: version(4096, P92000U),
    };
    // only the numeric id names the user
    let attach = Msg {
        tag: 1,
        body: FCall::TAttach {
            fid: 1,
            afid: NOFID,
            uname: String::new(),
            aname: String::new(),
            n_uname: BOB,
        },
    };
    let mut bytes = frame(&tversion, false);
    bytes.extend(frame(&attach, true));
    cw.write_all(&bytes).await.unwrap();

    let rc = read_frame(&mut cr, true).await;
    assert!(matches!(rc.body, FCall::RVersion { .. }));
    let rc = read_frame(&mut cr, true).await;
    assert_eq!(rc.tag, 1);
    assert!(matches!(rc.body, FCall::RAttach { .. }), "unexpected {:?}", rc);
}
