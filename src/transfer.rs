//! Parallel transfer coordination (receiver side)
//!
//! One `download_file` call runs the whole receive pipeline: fetch
//! metadata over a short-lived connection, preallocate the destination,
//! partition the file into ranges, run one downloader per range, and fold
//! their per-range running totals into a single monotonic progress stream.

use crate::download::download_range;
use crate::protocol::{
    partition_ranges, read_metadata, write_string, FileMetadata, METADATA_COMMAND, TRANSFER_PORT,
};
use crate::server::ProgressFn;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Transfer errors
#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    /// Metadata could not be fetched; nothing to partition, the whole
    /// transfer aborts before any work is committed.
    #[error("failed to fetch metadata: {0}")]
    Metadata(#[source] io::Error),

    /// A range's connection could not be opened.
    #[error("failed to connect to peer: {0}")]
    Connect(#[source] io::Error),

    #[error("IO error during transfer: {0}")]
    Io(#[from] io::Error),

    /// Some ranges failed; the destination file is left partially written.
    #[error("{failed} of {total} ranges failed")]
    RangesFailed { failed: usize, total: usize },
}

/// Per-transfer progress accounting shared by all range tasks.
///
/// Ranges report running totals, not increments, so each report is turned
/// into a delta against that range's previously reported value before it
/// touches the global counter. Duplicate reports therefore add zero and
/// the global counter stays monotonic under any interleaving.
struct ProgressState {
    total: u64,
    completed: AtomicU64,
    last_reported: Vec<AtomicU64>,
}

impl ProgressState {
    fn new(total: u64, parts: usize) -> Self {
        Self {
            total,
            completed: AtomicU64::new(0),
            last_reported: (0..parts).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Fold one range's running total into the global counter. Returns
    /// the new global value when the report advanced it.
    fn record(&self, range_index: usize, current: u64) -> Option<u64> {
        let previous = self.last_reported[range_index].swap(current, Ordering::AcqRel);
        let delta = current.checked_sub(previous).filter(|d| *d > 0)?;
        Some(self.completed.fetch_add(delta, Ordering::AcqRel) + delta)
    }
}

/// Ranges to run concurrently: `min(8, 2 × available parallelism)`.
fn range_parallelism() -> usize {
    let cores = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    (cores * 2).clamp(1, 8)
}

/// Fetch the served file's name and size over one short-lived connection.
pub async fn fetch_metadata(peer: IpAddr, port: u16) -> Result<FileMetadata, TransferError> {
    let inner = async {
        let mut stream = TcpStream::connect((peer, port)).await?;
        write_string(&mut stream, METADATA_COMMAND).await?;
        stream.flush().await?;
        read_metadata(&mut stream).await
    };
    inner.await.map_err(TransferError::Metadata)
}

/// Drives parallel downloads against a serving peer.
pub struct TransferManager {
    port: u16,
    parallelism: usize,
}

impl Default for TransferManager {
    fn default() -> Self {
        Self::new(TRANSFER_PORT)
    }
}

impl TransferManager {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            parallelism: range_parallelism(),
        }
    }

    /// Override the range count (clamped to at least 1). Mostly for tests
    /// and slow disks; the default tracks the host's parallelism.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Download the file hosted by `peer` into `dest_dir`.
    ///
    /// Progress arrives as `(bytes_done, file_size)` pairs, possibly from
    /// several range tasks concurrently, ending with a guaranteed
    /// `(file_size, file_size)` on success. On failure the destination is
    /// left partially written, siblings of a failed range are allowed to
    /// finish, and the error covers the transfer as a whole.
    pub async fn download_file(
        &self,
        peer: IpAddr,
        dest_dir: &Path,
        progress: ProgressFn,
    ) -> Result<PathBuf, TransferError> {
        let meta = fetch_metadata(peer, self.port).await?;
        info!(
            "downloading {} ({} bytes) from {}",
            meta.name, meta.size, peer
        );

        // Only the final path component, so a served name can never
        // escape the destination directory.
        let file_name = Path::new(&meta.name)
            .file_name()
            .map(|n| n.to_owned())
            .unwrap_or_else(|| "download".into());
        let dest = dest_dir.join(file_name);

        // Full-size preallocation: concurrent positional writes must
        // never race on extending the file.
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&dest)
                .await?;
            file.set_len(meta.size).await?;
        }

        let ranges = partition_ranges(meta.size, self.parallelism);
        let parts = ranges.len();
        let state = Arc::new(ProgressState::new(meta.size, parts));

        let mut tasks = JoinSet::new();
        for range in ranges {
            let state = state.clone();
            let progress = progress.clone();
            let dest = dest.clone();
            let port = self.port;

            let per_range: ProgressFn = Arc::new(move |current, _range_len| {
                if let Some(done) = state.record(range.index, current) {
                    progress(done, state.total);
                }
            });

            tasks.spawn(async move {
                download_range(peer, port, &dest, range, per_range).await
            });
        }

        // A failed range does not cancel its siblings; wait for everyone
        // before judging the transfer.
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("range download failed: {}", e);
                    failed += 1;
                }
                Err(e) => {
                    warn!("range task aborted: {}", e);
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(TransferError::RangesFailed {
                failed,
                total: parts,
            });
        }

        // Delta accounting can leave the caller a hair short of 100%;
        // make completion unambiguous.
        progress(meta.size, meta.size);
        info!("download complete: {}", dest.display());
        Ok(dest)
    }
}
