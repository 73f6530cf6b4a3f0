//! End-to-end transfer scenarios over loopback sockets.

use lancast::protocol::{self, partition_ranges};
use lancast::{fetch_metadata, FileServer, ProgressFactory, ProgressFn, ServeError, TransferManager};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Deterministic, position-dependent payload so overlap and gap bugs
/// change the bytes instead of cancelling out.
fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

fn host_file(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Progress recorder shared with the callbacks.
fn recorder() -> (ProgressFn, Arc<Mutex<Vec<(u64, u64)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: ProgressFn = Arc::new(move |done, total| {
        sink.lock().unwrap().push((done, total));
    });
    (callback, seen)
}

#[tokio::test]
async fn metadata_then_full_chunk_matches_source() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let source = payload(10 * 1024 * 1024);
    let path = host_file(&dir, "payload.bin", &source);

    let mut server = FileServer::new(&path, 0);
    let addr = server.start().await.unwrap();

    let meta = fetch_metadata(LOCALHOST, addr.port()).await.unwrap();
    assert_eq!(meta.name, "payload.bin");
    assert_eq!(meta.size, 10 * 1024 * 1024);

    // The chunk goes over a fresh connection; connections are single-use.
    let mut stream = TcpStream::connect((LOCALHOST, addr.port())).await.unwrap();
    protocol::write_string(&mut stream, "CHUNK|0|10485760")
        .await
        .unwrap();
    stream.flush().await.unwrap();

    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    assert_eq!(received.len(), 10 * 1024 * 1024);
    assert_eq!(received, source);

    server.stop();
}

#[tokio::test]
async fn partial_chunk_request_returns_exact_range() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let source = payload(256 * 1024);
    let path = host_file(&dir, "window.bin", &source);

    let mut server = FileServer::new(&path, 0);
    let addr = server.start().await.unwrap();

    let mut stream = TcpStream::connect((LOCALHOST, addr.port())).await.unwrap();
    protocol::write_string(&mut stream, "CHUNK|1000|65536")
        .await
        .unwrap();
    stream.flush().await.unwrap();

    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, &source[1000..65536]);

    server.stop();
}

#[tokio::test]
async fn parallel_download_reassembles_byte_for_byte() {
    init_tracing();
    let host_dir = TempDir::new().unwrap();
    let save_dir = TempDir::new().unwrap();
    // Deliberately not a multiple of 4 so the last range absorbs a tail.
    let size = 3 * 1024 * 1024 + 17;
    let source = payload(size);
    let path = host_file(&host_dir, "movie.mkv", &source);

    let mut server = FileServer::new(&path, 0);
    let addr = server.start().await.unwrap();

    let (progress, seen) = recorder();
    let manager = TransferManager::new(addr.port()).with_parallelism(4);
    let dest = manager
        .download_file(LOCALHOST, save_dir.path(), progress)
        .await
        .unwrap();

    assert_eq!(dest, save_dir.path().join("movie.mkv"));
    let received = std::fs::read(&dest).unwrap();
    assert_eq!(received.len(), size);

    // Check each region of the partition separately to catch a range
    // writing into a sibling's territory.
    for range in partition_ranges(size as u64, 4) {
        let (lo, hi) = (range.start as usize, range.end as usize);
        assert_eq!(received[lo..hi], source[lo..hi], "region {}", range.index);
    }

    // Callbacks arrive in arrival order from concurrent range tasks, so
    // only the bounds and the guaranteed final 100% are deterministic.
    let seen = seen.lock().unwrap();
    assert_eq!(*seen.last().unwrap(), (size as u64, size as u64));
    for &(done, total) in seen.iter() {
        assert_eq!(total, size as u64);
        assert!(done <= size as u64);
    }

    server.stop();
}

#[tokio::test]
async fn zero_byte_file_downloads_cleanly() {
    init_tracing();
    let host_dir = TempDir::new().unwrap();
    let save_dir = TempDir::new().unwrap();
    let path = host_file(&host_dir, "empty.dat", &[]);

    let mut server = FileServer::new(&path, 0);
    let addr = server.start().await.unwrap();

    let (progress, seen) = recorder();
    let manager = TransferManager::new(addr.port()).with_parallelism(4);
    let dest = manager
        .download_file(LOCALHOST, save_dir.path(), progress)
        .await
        .unwrap();

    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
    assert_eq!(*seen.lock().unwrap().last().unwrap(), (0, 0));

    server.stop();
}

#[tokio::test]
async fn unknown_command_gets_no_reply_and_server_survives() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = host_file(&dir, "still-here.bin", &payload(64));

    let mut server = FileServer::new(&path, 0);
    let addr = server.start().await.unwrap();

    let mut stream = TcpStream::connect((LOCALHOST, addr.port())).await.unwrap();
    protocol::write_string(&mut stream, "NONSENSE").await.unwrap();
    stream.flush().await.unwrap();

    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    assert!(received.is_empty());

    // The handler dropped that connection without taking the server down.
    let meta = fetch_metadata(LOCALHOST, addr.port()).await.unwrap();
    assert_eq!(meta.size, 64);

    server.stop();
}

#[tokio::test]
async fn progress_factory_fires_once_per_chunk_connection_only() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let source = payload(128 * 1024);
    let path = host_file(&dir, "metered.bin", &source);

    let created = Arc::new(AtomicUsize::new(0));
    let last_seen = Arc::new(Mutex::new((0u64, 0u64)));
    let factory: ProgressFactory = {
        let created = created.clone();
        let last_seen = last_seen.clone();
        Arc::new(move |_addr| {
            created.fetch_add(1, Ordering::SeqCst);
            let last_seen = last_seen.clone();
            let progress: ProgressFn = Arc::new(move |done, total| {
                *last_seen.lock().unwrap() = (done, total);
            });
            progress
        })
    };

    let mut server = FileServer::new(&path, 0).with_progress_factory(factory);
    let addr = server.start().await.unwrap();

    // Metadata-only connections never create a progress listener.
    fetch_metadata(LOCALHOST, addr.port()).await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 0);

    let mut stream = TcpStream::connect((LOCALHOST, addr.port())).await.unwrap();
    protocol::write_string(&mut stream, "CHUNK|0|131072")
        .await
        .unwrap();
    stream.flush().await.unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    assert_eq!(received.len(), 128 * 1024);

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(*last_seen.lock().unwrap(), (128 * 1024, 128 * 1024));

    server.stop();
}

#[tokio::test]
async fn stop_aborts_handlers_even_with_a_full_pool() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = host_file(&dir, "busy.bin", &payload(16));

    let mut server = FileServer::new(&path, 0);
    let addr = server.start().await.unwrap();

    // Occupy every handler slot with connections that never send a
    // command, parking the accept loop on the handler limit.
    let mut idle = Vec::new();
    for _ in 0..10 {
        idle.push(TcpStream::connect((LOCALHOST, addr.port())).await.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.stop();

    // Aborted handlers drop their sockets; each idle connection must see
    // EOF (or a reset) instead of hanging.
    for mut stream in idle {
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("handler still alive after stop()");
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}

#[tokio::test]
async fn occupied_port_is_a_bind_error() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = host_file(&dir, "one.bin", &payload(16));

    let mut first = FileServer::new(&path, 0);
    let addr = first.start().await.unwrap();

    let mut second = FileServer::new(&path, addr.port());
    match second.start().await {
        Err(ServeError::Bind(_)) => {}
        other => panic!("expected bind error, got {:?}", other.map(|_| ())),
    }

    first.stop();
}

#[tokio::test]
async fn metadata_fetch_failure_aborts_before_any_work() {
    init_tracing();
    let save_dir = TempDir::new().unwrap();

    // Nobody listening on this freshly released port.
    let port = {
        let probe = tokio::net::TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        probe.local_addr().unwrap().port()
    };

    let (progress, seen) = recorder();
    let manager = TransferManager::new(port).with_parallelism(2);
    let result = manager
        .download_file(LOCALHOST, save_dir.path(), progress)
        .await;

    assert!(matches!(result, Err(lancast::TransferError::Metadata(_))));
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(std::fs::read_dir(save_dir.path()).unwrap().count(), 0);
}
