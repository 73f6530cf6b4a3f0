//! lancast - serverless file casting for the local network
//!
//! Devices find each other over UDP multicast and move files directly
//! over TCP, no central server involved. Three pieces cooperate:
//!
//! - [`DiscoveryService`]: joins the multicast group, announces this host
//!   with periodic HELLO datagrams, and reports foreign peers into a
//!   [`PeerDirectory`] and an event channel.
//! - [`FileServer`]: hosts one file on a TCP port and answers METADATA
//!   and `CHUNK|start|end` commands, one command per connection.
//! - [`TransferManager`]: downloads a hosted file by splitting it into
//!   byte ranges and streaming them over parallel connections, with one
//!   aggregated progress stream for the caller.
//!
//! The graphical shell, persisted preferences, and network-interface
//! selection live outside this crate; the surface here is the event
//! channel, the progress callbacks, and the start/stop calls.

mod discovery;
mod download;
mod peer;
pub mod protocol;
mod server;
mod transfer;

pub use discovery::{DiscoveryConfig, DiscoveryError, DiscoveryEvent, DiscoveryService};
pub use peer::{PeerDirectory, PeerInfo};
pub use protocol::{ChunkRange, FileMetadata};
pub use server::{FileServer, ProgressFactory, ProgressFn, ServeError};
pub use transfer::{fetch_metadata, TransferError, TransferManager};
