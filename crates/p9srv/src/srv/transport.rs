use {
    super::{Filesystem, Srv},
    crate::{fcall::*, io_err, serialize, utils, Result},
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::{debug, error, info},
    std::{
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::mpsc,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::length_delimited::LengthDelimitedCodec,
};

fn codec() -> tokio_util::codec::length_delimited::Builder {
    let mut builder = LengthDelimitedCodec::builder();
    builder
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian();
    builder
}

/// Serve one connection until the client hangs up.
///
/// Every message is registered and processed on its own task, except
/// `TVersion`, which completes before the next frame is read. Responses are
/// written in completion order by a single writer task.
pub async fn serve<Fs, Reader, Writer>(srv: Arc<Srv<Fs>>, reader: Reader, writer: Writer) -> Result<()>
where
    Fs: Filesystem,
    Reader: 'static + AsyncRead + Send + std::marker::Unpin,
    Writer: 'static + AsyncWrite + Send + std::marker::Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
    let conn = srv.new_conn(tx);

    let mut framedread = codec().new_read(reader);
    let mut framedwrite = codec().new_write(writer);

    let writer_conn = Arc::downgrade(&conn);
    tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let dotu = writer_conn.upgrade().is_some_and(|c| c.dotu());

            let mut writer = bytes::BytesMut::with_capacity(4096).writer();
            if let Err(e) = serialize::write_msg(&mut writer, &response, dotu) {
                error!("Failed to serialize response for tag {}: {:?}", response.tag, e);
                continue;
            }

            let frozen = writer.into_inner().freeze();
            if let Err(e) = framedwrite.send(frozen).await {
                error!("Failed to send response for tag {}: {:?}", response.tag, e);
                return;
            }
            debug!("\t→ {:?}", response);
        }
    });

    while let Some(bytes) = framedread.next().await {
        let bytes = bytes?;

        let msg = serialize::read_msg(&mut bytes.reader(), conn.dotu())?;
        debug!("\t← {:?}", msg);

        // the next frame must be decoded in the dialect TVersion settles on
        let inline = matches!(msg.body, FCall::TVersion { .. });

        if let Some(req) = srv.recv(&conn, msg) {
            if inline {
                srv.process(req).await;
            } else {
                let srv = srv.clone();
                tokio::spawn(async move { srv.process(req).await });
            }
        }
    }

    srv.disconnect(&conn);
    Ok(())
}

pub async fn srv_async_tcp<Fs: Filesystem>(srv: Arc<Srv<Fs>>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let srv = srv.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            if let Err(e) = serve(srv, readhalf, writehalf).await {
                error!("Error: {}: {:?}", e, e);
            }
            info!("closed: {:?}", peer);
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

pub async fn srv_async_unix<Fs: Filesystem>(srv: Arc<Srv<Fs>>, addr: impl AsRef<Path>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = result?;
                info!("accepted: {:?}", peer);

                let srv = srv.clone();
                tokio::spawn(async move {
                    let (readhalf, writehalf) = tokio::io::split(stream);
                    if let Err(e) = serve(srv, readhalf, writehalf).await {
                        error!("Error: {:?}", e);
                    }
                });
            }
            // wake up to look at the running flag
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Listen on `addr`, given as `tcp!host!port` or `unix!path!suffix`, and
/// serve every connection with `srv`.
pub async fn srv_async<Fs: Filesystem>(srv: Arc<Srv<Fs>>, addr: &str) -> Result<()> {
    let (proto, host, port) =
        utils::parse_proto(addr).ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    match proto {
        "tcp" => srv_async_tcp(srv, &format!("{}:{}", host, port)).await,
        "unix" => srv_async_unix(srv, format!("{}:{}", host, port)).await,
        _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
    }
}
