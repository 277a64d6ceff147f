//! Integration tests for peer-to-peer file transfer through a running
//! peer listener.
//!
//! Verification command: `cargo test --test file_transfer`

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use parking_lot::Mutex;
use peerchat::client::ServerClient;
use peerchat::transfer::{FileSender, TransferError, TransferProgress};
use peerchat::transport::{PeerEvent, PeerListener};
use peerchat_proto::crypto::{AesGcmCipher, Cipher};
use peerchat_relay::config::RelayConfig;
use peerchat_relay::relay::RelayServer;
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

const TIMEOUT: Duration = Duration::from_secs(10);

/// A receiving peer with its own download directory.
struct ReceivingPeer {
    listener: PeerListener,
    events: Receiver<PeerEvent>,
    downloads: TempDir,
}

fn receiver(cipher: Option<Arc<dyn Cipher>>) -> ReceivingPeer {
    let downloads = tempfile::tempdir().unwrap();
    let (tx, events) = mpsc::channel();
    let listener = PeerListener::bind("127.0.0.1:0", "bob", cipher, downloads.path(), tx)
        .expect("failed to bind peer listener");
    ReceivingPeer {
        listener,
        events,
        downloads,
    }
}

/// Writes `len` bytes of a repeating pattern to `dir/name`.
fn source_file(dir: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let path = dir.join(name);
    fs::write(&path, &data).unwrap();
    (path, data)
}

fn default_cipher() -> Arc<dyn Cipher> {
    Arc::new(AesGcmCipher::with_default_key())
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn file_found_through_relay_lookup() {
    let config = RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        workers: 2,
        encryption: false,
        ..RelayConfig::default()
    };
    let server = RelayServer::start(&config).expect("failed to start test relay");
    let bob = receiver(None);

    let relay = server.local_addr().to_string();
    let bob_client = ServerClient::connect(&relay, None, TIMEOUT).unwrap();
    bob_client.request("REGISTER bob pw").unwrap();
    bob_client
        .request(&format!("LOGIN bob pw {}", bob.listener.port()))
        .unwrap();
    let alice_client = ServerClient::connect(&relay, None, TIMEOUT).unwrap();
    alice_client.request("REGISTER alice pw").unwrap();
    alice_client.request("LOGIN alice pw 9001").unwrap();

    let src = tempfile::tempdir().unwrap();
    let (path, data) = source_file(src.path(), "notes.txt", 4096);
    let addr = alice_client.user_endpoint("bob").unwrap();
    let sent = FileSender::new(None)
        .send_file(addr, &path, "alice", false)
        .unwrap();
    assert_eq!(sent, 4096);

    let PeerEvent::FileReceived { from, path, size } = bob.events.recv_timeout(TIMEOUT).unwrap()
    else {
        panic!("expected a received file");
    };
    assert_eq!(from, "alice");
    assert_eq!(size, 4096);
    assert_eq!(path, bob.downloads.path().join("notes.txt"));
    assert_eq!(fs::read(path).unwrap(), data);
}

#[test]
fn empty_file() {
    let bob = receiver(None);
    let src = tempfile::tempdir().unwrap();
    let (path, _) = source_file(src.path(), "empty.bin", 0);

    let sent = FileSender::new(None)
        .send_file(bob.listener.local_addr(), &path, "alice", false)
        .unwrap();
    assert_eq!(sent, 0);
    assert!(matches!(
        bob.events.recv_timeout(TIMEOUT).unwrap(),
        PeerEvent::FileReceived { size: 0, .. }
    ));
    assert_eq!(fs::read(bob.downloads.path().join("empty.bin")).unwrap(), b"");
}

#[test]
fn many_encrypted_chunks_with_progress() {
    let cipher = default_cipher();
    let bob = receiver(Some(Arc::clone(&cipher)));
    let src = tempfile::tempdir().unwrap();
    let (path, data) = source_file(src.path(), "big.bin", 300_001);

    let seen = Arc::new(Mutex::new(Vec::<TransferProgress>::new()));
    let sink = Arc::clone(&seen);
    FileSender::new(Some(cipher))
        .with_chunk_size(4096)
        .with_progress(Arc::new(move |p| sink.lock().push(p)))
        .send_file(bob.listener.local_addr(), &path, "alice", true)
        .unwrap();

    let PeerEvent::FileReceived { path: saved, .. } = bob.events.recv_timeout(TIMEOUT).unwrap()
    else {
        panic!("expected a received file");
    };
    assert_eq!(fs::read(&saved).unwrap(), data);
    assert!(!bob.downloads.path().join("big.bin.part").exists());

    let seen = seen.lock();
    assert_eq!(seen.len(), 300_001_usize.div_ceil(4096));
    assert!(seen.windows(2).all(|w| w[0].transferred < w[1].transferred));
    let last = seen.last().unwrap();
    assert_eq!(last.transferred, 300_001);
    assert!((last.percent() - 100.0).abs() < f64::EPSILON);
}

#[test]
fn receiver_reports_incoming_progress() {
    let downloads = tempfile::tempdir().unwrap();
    let (tx, events) = mpsc::channel();
    let seen = Arc::new(Mutex::new(Vec::<TransferProgress>::new()));
    let sink = Arc::clone(&seen);
    let listener = PeerListener::bind_with_progress(
        "127.0.0.1:0",
        "bob",
        None,
        downloads.path(),
        tx,
        Some(Arc::new(move |p| sink.lock().push(p))),
    )
    .expect("failed to bind peer listener");

    let src = tempfile::tempdir().unwrap();
    let (path, data) = source_file(src.path(), "report.pdf", 10_000);
    FileSender::new(None)
        .with_chunk_size(4096)
        .send_file(listener.local_addr(), &path, "alice", false)
        .unwrap();

    let PeerEvent::FileReceived { path: saved, .. } = events.recv_timeout(TIMEOUT).unwrap() else {
        panic!("expected a received file");
    };
    assert_eq!(fs::read(saved).unwrap(), data);

    let transferred: Vec<u64> = seen.lock().iter().map(|p| p.transferred).collect();
    assert_eq!(transferred, vec![4096, 8192, 10_000]);
    assert!(seen.lock().iter().all(|p| p.total == 10_000));
}

#[test]
fn encrypted_offer_to_plaintext_receiver_is_rejected() {
    let bob = receiver(None);
    let src = tempfile::tempdir().unwrap();
    let (path, _) = source_file(src.path(), "secret.bin", 100);

    let err = FileSender::new(Some(default_cipher()))
        .send_file(bob.listener.local_addr(), &path, "alice", true)
        .unwrap_err();
    assert!(matches!(err, TransferError::Rejected(reason) if reason == "Encryption not supported"));

    assert!(matches!(
        bob.events.recv_timeout(TIMEOUT).unwrap(),
        PeerEvent::FileFailed { filename, .. } if filename == "secret.bin"
    ));
    assert!(!bob.downloads.path().join("secret.bin").exists());
}

#[test]
fn unreachable_receiver() {
    let bob = receiver(None);
    let addr: SocketAddr = bob.listener.local_addr();
    drop(bob);

    let src = tempfile::tempdir().unwrap();
    let (path, _) = source_file(src.path(), "a.txt", 10);
    assert!(matches!(
        FileSender::new(None)
            .with_timeout(Duration::from_secs(2))
            .send_file(addr, &path, "alice", false),
        Err(TransferError::Io(_))
    ));
}

#[test]
fn missing_source_file() {
    let bob = receiver(None);
    let err = FileSender::new(None)
        .send_file(
            bob.listener.local_addr(),
            Path::new("/definitely/not/here.txt"),
            "alice",
            false,
        )
        .unwrap_err();
    assert!(matches!(err, TransferError::Io(_)));
}
