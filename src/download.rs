//! Single-range downloader (receiver side)
//!
//! One connection, one byte range: sends `CHUNK|start|end` and streams the
//! response into the destination file at the range's own offset. Each
//! range task opens its own file handle, so concurrent ranges never share
//! a seek cursor.

use crate::protocol::{chunk_command, write_string, ChunkRange};
use crate::server::ProgressFn;
use crate::transfer::TransferError;
use socket2::SockRef;
use std::net::IpAddr;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Receive-buffer size requested for the transfer connection (best effort).
const RECV_BUFFER_BYTES: usize = 2 * 1024 * 1024;

/// Upper bound of one receive sub-read, so progress can be sampled.
const RECV_SUB_CHUNK: u64 = 16 * 1024 * 1024;

/// Download one range into `dest`, reporting `(bytes_read, range_len)`
/// after every sub-read that makes progress. Any I/O failure is this
/// range's failure alone; the coordinator decides what it means for the
/// transfer.
pub(crate) async fn download_range(
    server: IpAddr,
    port: u16,
    dest: &Path,
    range: ChunkRange,
    progress: ProgressFn,
) -> Result<(), TransferError> {
    let mut stream = TcpStream::connect((server, port))
        .await
        .map_err(TransferError::Connect)?;
    tune_for_bulk(&stream);

    write_string(&mut stream, &chunk_command(&range)).await?;
    stream.flush().await?;

    let mut file = OpenOptions::new().write(true).open(dest).await?;
    file.seek(SeekFrom::Start(range.start)).await?;

    let expected = range.len();
    let mut received = 0u64;

    while received < expected {
        let budget = (expected - received).min(RECV_SUB_CHUNK);
        let mut slice = (&mut stream).take(budget);
        let read = tokio::io::copy(&mut slice, &mut file).await?;

        if read == 0 {
            // Transient; retry unless the task has been cancelled, which
            // aborts us between sub-reads anyway.
            tokio::task::yield_now().await;
            continue;
        }
        received += read;

        trace!(
            "range {}: {}/{} bytes from {}",
            range.index,
            received,
            expected,
            server
        );
        progress(received, expected);
    }

    file.flush().await?;
    debug!("range {} complete ({} bytes)", range.index, received);
    Ok(())
}

/// Best-effort socket tuning for throughput; a platform refusing is fine.
fn tune_for_bulk(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("socket tuning not permitted: {}", e);
    }
    if let Err(e) = SockRef::from(stream).set_recv_buffer_size(RECV_BUFFER_BYTES) {
        debug!("could not enlarge receive buffer: {}", e);
    }
}
