//! Wire protocol constants and framing
//!
//! Two small protocols share this module: the UDP presence datagram used
//! for discovery, and the TCP command protocol used for serving files.
//! Strings on the TCP side travel as a 2-byte big-endian length prefix
//! followed by UTF-8 bytes; file sizes are 8-byte big-endian integers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

/// Multicast group presence datagrams are sent to.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

/// UDP port for presence datagrams.
pub const DISCOVERY_PORT: u16 = 8888;

/// Well-known TCP port for the file protocol.
pub const TRANSFER_PORT: u16 = 5000;

/// Maximum size of a presence datagram payload.
pub const MAX_PRESENCE_LEN: usize = 1024;

/// How often a participant should announce itself. Scheduling is the
/// caller's job; [`crate::DiscoveryService::broadcast_once`] is one-shot.
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(3);

/// Tag opening every presence datagram.
pub const HELLO_TAG: &str = "HELLO";

/// Command requesting file name and size.
pub const METADATA_COMMAND: &str = "METADATA";

/// Prefix of the ranged transfer command (`CHUNK|start|end`).
pub const CHUNK_PREFIX: &str = "CHUNK";

/// A parsed presence datagram from a foreign host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    /// Random per-process id of the sender, used for loop-back suppression.
    pub sender_id: String,

    /// Optional human-friendly display name.
    pub name: Option<String>,
}

/// Encode a presence payload for this host.
///
/// The display name rides as base64url without padding so it can carry
/// arbitrary UTF-8 through the pipe-delimited ASCII payload. An empty or
/// whitespace-only name is sent as a two-token payload, never as an empty
/// third token. A name too long for the [`MAX_PRESENCE_LEN`] budget is
/// truncated at a character boundary; receivers drop oversized datagrams.
pub fn encode_presence(sender_id: &Uuid, name: Option<&str>) -> String {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => {
            let header = format!("{HELLO_TAG}|{sender_id}|");
            // Raw bytes whose unpadded base64 token still fits the budget.
            let allowed = (MAX_PRESENCE_LEN - header.len()) / 4 * 3;
            let name = truncate_at_char_boundary(name, allowed);
            format!("{header}{}", URL_SAFE_NO_PAD.encode(name.as_bytes()))
        }
        None => format!("{HELLO_TAG}|{sender_id}"),
    }
}

fn truncate_at_char_boundary(name: &str, max_bytes: usize) -> &str {
    if name.len() <= max_bytes {
        return name;
    }
    debug!("display name truncated to fit the presence datagram");
    let mut cut = max_bytes;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    &name[..cut]
}

/// Parse a presence payload.
///
/// Returns `None` for anything that is not a well-formed HELLO; the
/// multicast group carries unrelated traffic and foreign datagrams must be
/// tolerated silently. A third token that fails to decode is treated as an
/// absent name, not as a malformed datagram.
pub fn parse_presence(payload: &[u8]) -> Option<Presence> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut parts = text.splitn(3, '|');

    if parts.next()? != HELLO_TAG {
        return None;
    }
    let sender_id = parts.next()?;
    if sender_id.is_empty() {
        return None;
    }

    let name = parts
        .next()
        .filter(|token| !token.is_empty())
        .and_then(|token| match URL_SAFE_NO_PAD.decode(token) {
            Ok(bytes) => String::from_utf8(bytes).ok(),
            Err(e) => {
                debug!("malformed name token in presence datagram: {}", e);
                None
            }
        })
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());

    Some(Presence {
        sender_id: sender_id.to_string(),
        name,
    })
}

/// One contiguous half-open byte interval `[start, end)` of a file,
/// downloaded over one dedicated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// Position of this range within the partition.
    pub index: usize,
    pub start: u64,
    /// Exclusive.
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Partition `[0, file_size)` into at most `parts` contiguous ranges.
///
/// Ranges are gapless and non-overlapping; the last range absorbs the
/// remainder of the integer division. Effective parallelism shrinks when
/// the file is smaller than the requested part count so no range ends up
/// zero-length, except for the single `[0, 0)` range of an empty file.
pub fn partition_ranges(file_size: u64, parts: usize) -> Vec<ChunkRange> {
    let parts = (parts.max(1) as u64).min(file_size.max(1));
    let base = file_size / parts;

    (0..parts)
        .map(|i| {
            let start = i * base;
            let end = if i == parts - 1 { file_size } else { start + base };
            ChunkRange {
                index: i as usize,
                start,
                end,
            }
        })
        .collect()
}

/// Build the `CHUNK|start|end` command for one range.
pub fn chunk_command(range: &ChunkRange) -> String {
    format!("{CHUNK_PREFIX}|{}|{}", range.start, range.end)
}

/// Parse a `CHUNK|start|end` command into its half-open bounds.
pub fn parse_chunk_command(command: &str) -> Option<(u64, u64)> {
    let mut parts = command.split('|');
    if parts.next()? != CHUNK_PREFIX {
        return None;
    }
    let start: u64 = parts.next()?.parse().ok()?;
    let end: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || end < start {
        return None;
    }
    Some((start, end))
}

/// Name and size of a served file, as returned by the METADATA command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
}

/// Write a length-prefixed UTF-8 string.
pub async fn write_string<W>(writer: &mut W, value: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = value.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "string too long for a 2-byte length prefix",
        ));
    }
    writer.write_u16(bytes.len() as u16).await?;
    writer.write_all(bytes).await
}

/// Read a length-prefixed UTF-8 string.
pub async fn read_string<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "command is not valid UTF-8"))
}

/// Write the METADATA response.
pub async fn write_metadata<W>(writer: &mut W, meta: &FileMetadata) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_string(writer, &meta.name).await?;
    writer.write_u64(meta.size).await
}

/// Read the METADATA response.
pub async fn read_metadata<R>(reader: &mut R) -> io::Result<FileMetadata>
where
    R: AsyncRead + Unpin,
{
    let name = read_string(reader).await?;
    let size = reader.read_u64().await?;
    Ok(FileMetadata { name, size })
}
