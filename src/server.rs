//! TCP file server (sender side)
//!
//! Hosts one file on a listening socket and speaks a two-command protocol:
//! METADATA returns the file name and size, `CHUNK|start|end` streams the
//! requested byte range. One command per connection. Handlers run
//! concurrently up to a fixed limit; past that, connections wait in the
//! accept backlog rather than inside the process.

use crate::protocol::{
    parse_chunk_command, read_string, write_metadata, FileMetadata, CHUNK_PREFIX, METADATA_COMMAND,
};
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Concurrent connection handlers before new connections queue at the
/// accept backlog.
const MAX_CONCURRENT_HANDLERS: usize = 10;

/// Send-buffer size requested for bulk transfer connections (best effort).
const SEND_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Upper bound of one serve sub-transfer, so progress can be sampled
/// between sub-transfers without throttling throughput.
const SERVE_SUB_CHUNK: u64 = 64 * 1024 * 1024;

/// Progress callback: `(bytes_done, bytes_total)`. May be invoked from
/// several tasks concurrently; consumers serialize on their own side.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Creates the progress callback for one chunk-transfer connection.
/// Called exactly once per CHUNK connection, never for METADATA.
pub type ProgressFactory = Arc<dyn Fn(SocketAddr) -> ProgressFn + Send + Sync>;

/// File-serving errors
#[derive(thiserror::Error, Debug)]
pub enum ServeError {
    /// The listening socket could not be opened (port occupied).
    #[error("failed to bind file server port: {0}")]
    Bind(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Serves one file to any peer speaking the chunk protocol.
pub struct FileServer {
    path: PathBuf,
    port: u16,
    progress_factory: Option<ProgressFactory>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl FileServer {
    /// `port` 0 binds an ephemeral port; the well-known default is
    /// [`crate::protocol::TRANSFER_PORT`].
    pub fn new(path: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            path: path.into(),
            port,
            progress_factory: None,
            local_addr: None,
            shutdown_tx: None,
        }
    }

    /// Attach a factory producing a per-connection progress callback for
    /// chunk transfers.
    pub fn with_progress_factory(mut self, factory: ProgressFactory) -> Self {
        self.progress_factory = Some(factory);
        self
    }

    /// Bind the listener and start accepting. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, ServeError> {
        let listener = TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, self.port))
            .await
            .map_err(ServeError::Bind)?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        info!("hosting {} on {}", self.path.display(), local_addr);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let path = self.path.clone();
        let factory = self.progress_factory.clone();

        tokio::spawn(async move {
            let limit = Arc::new(Semaphore::new(MAX_CONCURRENT_HANDLERS));
            let mut handlers = JoinSet::new();

            loop {
                // Reap finished handlers so the set stays small.
                while handlers.try_join_next().is_some() {}

                // Taking the permit before accept() keeps the overflow in
                // the kernel backlog instead of in-process queues. A full
                // pool parks us here, so shutdown must be watched too.
                let permit = tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("file server shutting down");
                        break;
                    }

                    acquired = limit.clone().acquire_owned() => match acquired {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("file server shutting down");
                        break;
                    }

                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!("connection from {}", addr);
                                let path = path.clone();
                                let factory = factory.clone();
                                handlers.spawn(async move {
                                    handle_client(stream, addr, path, factory).await;
                                    drop(permit);
                                });
                            }
                            Err(e) => {
                                error!("failed to accept connection: {}", e);
                            }
                        }
                    }
                }
            }

            handlers.abort_all();
        });

        Ok(local_addr)
    }

    /// Address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Close the listening socket and abort outstanding handlers.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run one connection to completion; connection-level failures are logged
/// and contained here, never escalated past the handler.
async fn handle_client(
    mut stream: TcpStream,
    addr: SocketAddr,
    path: PathBuf,
    factory: Option<ProgressFactory>,
) {
    if let Err(e) = serve_connection(&mut stream, addr, &path, factory).await {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => {
                info!("transfer to {} stopped (client disconnected)", addr);
            }
            _ => warn!("IO error serving {}: {}", addr, e),
        }
    }
}

async fn serve_connection(
    stream: &mut TcpStream,
    addr: SocketAddr,
    path: &Path,
    factory: Option<ProgressFactory>,
) -> io::Result<()> {
    let command = read_string(stream).await?;

    if command == METADATA_COMMAND {
        let meta = metadata_of(path).await?;
        write_metadata(stream, &meta).await?;
        stream.flush().await?;
        debug!("sent metadata for {} to {}", meta.name, addr);
        return Ok(());
    }

    if command.starts_with(CHUNK_PREFIX) {
        let Some((start, end)) = parse_chunk_command(&command) else {
            warn!("malformed chunk command from {}: {:?}", addr, command);
            return Ok(());
        };
        return serve_chunk(stream, addr, path, start, end, factory).await;
    }

    debug!("unknown command from {}: {:?}", addr, command);
    Ok(())
}

/// Stream `[start, end)` of the hosted file in bounded sub-transfers,
/// invoking the per-connection progress callback after each one.
async fn serve_chunk(
    stream: &mut TcpStream,
    addr: SocketAddr,
    path: &Path,
    start: u64,
    end: u64,
    factory: Option<ProgressFactory>,
) -> io::Result<()> {
    tune_for_bulk(stream);

    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;

    // The factory fires only now: a METADATA probe must not announce a
    // transfer that never happens.
    let progress = factory.map(|f| f(addr));

    let expected = end - start;
    let mut sent = 0u64;

    while sent < expected {
        let budget = (expected - sent).min(SERVE_SUB_CHUNK);
        let mut slice = (&mut file).take(budget);
        let written = tokio::io::copy(&mut slice, stream).await?;

        if written == 0 {
            // Transient; the transport can report zero under load.
            tokio::task::yield_now().await;
            continue;
        }
        sent += written;

        if let Some(progress) = &progress {
            progress(sent, expected);
        }
    }

    stream.flush().await?;
    info!("sent {} MiB to {}", sent / (1024 * 1024), addr);
    Ok(())
}

/// Best-effort socket tuning for throughput; a platform refusing is fine.
fn tune_for_bulk(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("socket tuning not permitted: {}", e);
    }
    if let Err(e) = SockRef::from(stream).set_send_buffer_size(SEND_BUFFER_BYTES) {
        debug!("could not enlarge send buffer: {}", e);
    }
}

async fn metadata_of(path: &Path) -> io::Result<FileMetadata> {
    let size = tokio::fs::metadata(path).await?.len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    Ok(FileMetadata { name, size })
}
