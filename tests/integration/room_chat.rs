//! Integration tests for chat rooms: membership, broadcasts and history
//! over real relay connections.
//!
//! Verification command: `cargo test --test room_chat`

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use peerchat::client::ServerClient;
use peerchat_proto::crypto::{AesGcmCipher, Cipher};
use peerchat_relay::config::RelayConfig;
use peerchat_relay::relay::RelayServer;

// =============================================================================
// Helpers
// =============================================================================

const TIMEOUT: Duration = Duration::from_secs(5);

fn start_relay(encryption: bool) -> RelayServer {
    let config = RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        workers: 4,
        encryption,
        ..RelayConfig::default()
    };
    RelayServer::start(&config).expect("failed to start test relay")
}

/// A logged-in client together with its push stream.
struct Member {
    client: ServerClient,
    pushes: Receiver<String>,
}

impl Member {
    fn login(server: &RelayServer, name: &str, port: u16, cipher: Option<Arc<dyn Cipher>>) -> Self {
        let mut client = ServerClient::connect(&server.local_addr().to_string(), cipher, TIMEOUT)
            .expect("failed to connect to relay");
        let pushes = client.take_pushes().expect("push receiver already taken");
        assert_eq!(client.request(&format!("REGISTER {name} pw")).unwrap(), "REGISTER_SUCCESS");
        assert_eq!(
            client.request(&format!("LOGIN {name} pw {port}")).unwrap(),
            "LOGIN_SUCCESS"
        );
        Self { client, pushes }
    }

    fn request(&self, line: &str) -> String {
        self.client.request(line).expect("request failed")
    }

    fn next_push(&self) -> String {
        self.pushes.recv_timeout(TIMEOUT).expect("no push arrived")
    }

    /// Asserts no push arrives within a short window.
    fn assert_quiet(&self) {
        assert!(
            self.pushes.recv_timeout(Duration::from_millis(200)).is_err(),
            "unexpected push"
        );
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// Connects over a bare socket and runs `lines`, reading one reply each.
/// Afterwards the caller decides whether anything is read at all.
fn raw_session(server: &RelayServer, lines: &[&str]) -> (TcpStream, BufReader<TcpStream>) {
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    for line in lines {
        writeln!(stream, "{line}").unwrap();
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        assert!(!reply.starts_with("ERROR"), "{line}: {reply}");
    }
    (stream, reader)
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn create_join_message_leave() {
    let server = start_relay(false);
    let alice = Member::login(&server, "alice", 9001, None);
    let bob = Member::login(&server, "bob", 9002, None);

    assert_eq!(alice.request("CREATE_ROOM lobby"), "ROOM_CREATED:lobby");
    assert_eq!(bob.request("CREATE_ROOM lobby"), "ERROR: Room already exists");
    assert_eq!(bob.request("LIST_ROOMS"), "ROOMS: lobby(1 members)");

    assert_eq!(bob.request("JOIN_ROOM lobby"), "ROOM_JOINED:lobby");
    assert_eq!(alice.next_push(), "ROOM_NOTIFICATION:lobby:bob joined the room");
    bob.assert_quiet();
    assert_eq!(bob.request("ROOM_MEMBERS lobby"), "ROOM_MEMBERS:lobby: alice bob");

    assert_eq!(alice.request("ROOM_MSG lobby hello there"), "ROOM_MSG_SENT");
    assert_eq!(alice.next_push(), "ROOM_MSG:lobby:alice:hello there");
    assert_eq!(bob.next_push(), "ROOM_MSG:lobby:alice:hello there");

    assert_eq!(bob.request("LEAVE_ROOM lobby"), "ROOM_LEFT:lobby");
    assert_eq!(alice.next_push(), "ROOM_NOTIFICATION:lobby:bob left the room");
    assert_eq!(bob.request("ROOM_MSG lobby hi"), "ERROR: Not in room");
}

#[test]
fn room_errors() {
    let server = start_relay(false);
    let alice = Member::login(&server, "alice", 9001, None);

    assert_eq!(alice.request("CREATE_ROOM"), "ERROR: Room name cannot be empty");
    assert_eq!(alice.request("JOIN_ROOM nowhere"), "ERROR: Room not found");
    assert_eq!(alice.request("CREATE_ROOM lobby"), "ROOM_CREATED:lobby");
    assert_eq!(alice.request("JOIN_ROOM lobby"), "ERROR: Already in room");
    assert_eq!(alice.request("ROOM_MSG lobby"), "ERROR: Message cannot be empty");
    assert_eq!(alice.request("ROOM_HISTORY lobby"), "ROOM_HISTORY:lobby:No messages");
}

#[test]
fn history_keeps_the_last_twenty() {
    let server = start_relay(false);
    let alice = Member::login(&server, "alice", 9001, None);
    alice.request("CREATE_ROOM lobby");

    for i in 1..=25 {
        assert_eq!(alice.request(&format!("ROOM_MSG lobby message {i}")), "ROOM_MSG_SENT");
    }

    let history = alice.request("ROOM_HISTORY lobby");
    let mut lines = history.lines();
    assert_eq!(lines.next(), Some("ROOM_HISTORY:lobby:"));
    let entries: Vec<&str> = lines.collect();
    assert_eq!(entries.len(), 20);
    assert_eq!(entries[0], "  [alice]: message 6");
    assert_eq!(entries[19], "  [alice]: message 25");
}

#[test]
fn encrypted_members_receive_sealed_pushes() {
    let server = start_relay(true);
    let cipher: Arc<dyn Cipher> = Arc::new(AesGcmCipher::with_default_key());
    let alice = Member::login(&server, "alice", 9001, Some(Arc::clone(&cipher)));
    let bob = Member::login(&server, "bob", 9002, Some(cipher));

    alice.request("CREATE_ROOM secret");
    bob.request("JOIN_ROOM secret");
    assert_eq!(alice.next_push(), "ROOM_NOTIFICATION:secret:bob joined the room");

    bob.request("ROOM_MSG secret psst");
    assert_eq!(alice.next_push(), "ROOM_MSG:secret:bob:psst");
    assert_eq!(bob.next_push(), "ROOM_MSG:secret:bob:psst");

    let history = alice.request("ROOM_HISTORY secret");
    assert_eq!(history, "ROOM_HISTORY:secret:\n  [bob]: psst");
}

#[test]
fn disconnect_leaves_rooms_silently() {
    let server = start_relay(false);
    let alice = Member::login(&server, "alice", 9001, None);
    let mut bob = Member::login(&server, "bob", 9002, None);

    alice.request("CREATE_ROOM lobby");
    bob.request("JOIN_ROOM lobby");
    alice.next_push();

    bob.client.close();
    assert!(wait_until(|| !server.state().sessions.is_online("bob")));
    alice.assert_quiet();
    assert_eq!(alice.request("ROOM_MEMBERS lobby"), "ROOM_MEMBERS:lobby: alice");
}

#[test]
fn member_that_stops_reading_does_not_block_the_relay() {
    const FLOOD: usize = 400;
    let server = start_relay(false);

    // Alice creates the room and then never reads again.
    let (_alice, _alice_reader) = raw_session(
        &server,
        &["REGISTER alice pw", "LOGIN alice pw 9001", "CREATE_ROOM lobby"],
    );
    let (mut bob, mut bob_reader) = raw_session(
        &server,
        &["REGISTER bob pw", "LOGIN bob pw 9002", "JOIN_ROOM lobby"],
    );
    bob.set_read_timeout(None).unwrap();

    let acked = Arc::new(AtomicUsize::new(0));
    {
        let acked = Arc::clone(&acked);
        thread::spawn(move || {
            let mut line = String::new();
            loop {
                line.clear();
                match bob_reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) if line.trim_end() == "ROOM_MSG_SENT" => {
                        acked.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                }
            }
        });
    }
    let flood = thread::spawn(move || {
        let text = "x".repeat(60_000);
        for _ in 0..FLOOD {
            if writeln!(bob, "ROOM_MSG lobby {text}").is_err() {
                break;
            }
        }
    });

    // Run until acknowledgements stop advancing: Alice's socket is full.
    let mut last = usize::MAX;
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        thread::sleep(Duration::from_millis(300));
        let now = acked.load(Ordering::SeqCst);
        if now == last || now == FLOOD {
            break;
        }
        last = now;
    }

    // Account commands never wait on room pushes.
    let carol = Member::login(&server, "carol", 9003, None);
    assert!(carol.request("LIST").starts_with("ONLINE_USERS: alice("));

    // The stalled push times out and the rest of the flood goes through.
    let deadline = Instant::now() + Duration::from_secs(30);
    while acked.load(Ordering::SeqCst) < FLOOD && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(acked.load(Ordering::SeqCst), FLOOD);
    flood.join().unwrap();

    assert_eq!(carol.request("JOIN_ROOM lobby"), "ROOM_JOINED:lobby");
    assert_eq!(
        carol.request("ROOM_MEMBERS lobby"),
        "ROOM_MEMBERS:lobby: alice bob carol"
    );
}
