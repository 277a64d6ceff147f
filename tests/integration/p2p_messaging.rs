//! Integration tests for direct peer messages: discovery through the relay,
//! delivery to the recipient's listener, and acknowledgements.
//!
//! Verification command: `cargo test --test p2p_messaging`

use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use peerchat::client::ServerClient;
use peerchat::transport::{Delivery, PeerEvent, PeerListener, PeerTransport};
use peerchat_proto::codec;
use peerchat_proto::crypto::{AesGcmCipher, Cipher};
use peerchat_relay::config::RelayConfig;
use peerchat_relay::relay::RelayServer;

// =============================================================================
// Helpers
// =============================================================================

const TIMEOUT: Duration = Duration::from_secs(5);

fn start_relay() -> RelayServer {
    let config = RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        workers: 4,
        ..RelayConfig::default()
    };
    RelayServer::start(&config).expect("failed to start test relay")
}

/// A client that is logged in and listening for peers.
struct Peer {
    name: String,
    client: ServerClient,
    listener: PeerListener,
    events: Receiver<PeerEvent>,
    cipher: Option<Arc<dyn Cipher>>,
}

impl Peer {
    fn online(server: &RelayServer, name: &str, cipher: Option<Arc<dyn Cipher>>) -> Self {
        let (tx, events) = mpsc::channel();
        let listener =
            PeerListener::bind("127.0.0.1:0", name, cipher.clone(), std::env::temp_dir(), tx)
                .expect("failed to bind peer listener");
        let client =
            ServerClient::connect(&server.local_addr().to_string(), cipher.clone(), TIMEOUT)
                .expect("failed to connect to relay");
        assert_eq!(client.request(&format!("REGISTER {name} pw")).unwrap(), "REGISTER_SUCCESS");
        assert_eq!(
            client
                .request(&format!("LOGIN {name} pw {}", listener.port()))
                .unwrap(),
            "LOGIN_SUCCESS"
        );
        Self {
            name: name.to_string(),
            client,
            listener,
            events,
            cipher,
        }
    }

    fn send_to(&self, target: &str, text: &str) -> Delivery {
        let addr = self.client.user_endpoint(target).expect("lookup failed");
        PeerTransport::new(&self.name, self.cipher.clone())
            .with_timeouts(TIMEOUT, TIMEOUT)
            .send(addr, text, self.cipher.is_some())
            .expect("send failed")
    }

    fn next_event(&self) -> PeerEvent {
        self.events.recv_timeout(TIMEOUT).expect("no peer event")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn alice_messages_bob_through_discovery() {
    let server = start_relay();
    let alice = Peer::online(&server, "alice", None);
    let bob = Peer::online(&server, "bob", None);

    let delivery = alice.send_to("bob", "hi bob");
    assert_eq!(delivery, Delivery::Acknowledged { by: "bob".into() });
    assert_eq!(
        bob.next_event(),
        PeerEvent::Message {
            from: "alice".into(),
            text: "hi bob".into(),
            encrypted: false,
        }
    );

    let reply = bob.send_to("alice", "hi alice");
    assert!(reply.is_acknowledged());
    assert!(matches!(
        alice.next_event(),
        PeerEvent::Message { from, text, .. } if from == "bob" && text == "hi alice"
    ));
}

#[test]
fn encrypted_direct_message() {
    let server = start_relay();
    let cipher: Arc<dyn Cipher> = Arc::new(AesGcmCipher::with_default_key());
    let alice = Peer::online(&server, "alice", Some(Arc::clone(&cipher)));
    let bob = Peer::online(&server, "bob", Some(cipher));

    assert!(alice.send_to("bob", "for your eyes only").is_acknowledged());
    assert_eq!(
        bob.next_event(),
        PeerEvent::Message {
            from: "alice".into(),
            text: "for your eyes only".into(),
            encrypted: true,
        }
    );
}

#[test]
fn offline_peer_cannot_be_looked_up() {
    let server = start_relay();
    let alice = Peer::online(&server, "alice", None);
    alice.client.request("REGISTER carol pw").unwrap();
    assert!(alice.client.user_endpoint("carol").is_err());
}

#[test]
fn stopped_listener_is_unreachable() {
    let server = start_relay();
    let alice = Peer::online(&server, "alice", None);
    let mut bob = Peer::online(&server, "bob", None);
    let addr = alice.client.user_endpoint("bob").unwrap();
    bob.listener.stop();

    let result = PeerTransport::new("alice", None)
        .with_timeouts(TIMEOUT, TIMEOUT)
        .send(addr, "anyone there?", false);
    assert!(result.is_err());
}

#[test]
fn legacy_unframed_message_is_delivered() {
    let server = start_relay();
    let bob = Peer::online(&server, "bob", None);

    let mut stream = TcpStream::connect(bob.listener.local_addr()).unwrap();
    stream.write_all(b"P2P_MSG:carol:old school").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();

    assert_eq!(
        bob.next_event(),
        PeerEvent::Message {
            from: "carol".into(),
            text: "old school".into(),
            encrypted: false,
        }
    );
}

#[test]
fn corrupted_envelope_gets_no_ack() {
    let server = start_relay();
    let cipher: Arc<dyn Cipher> = Arc::new(AesGcmCipher::with_default_key());
    let bob = Peer::online(&server, "bob", Some(Arc::clone(&cipher)));

    let mut envelope = cipher.seal(b"tampered").unwrap();
    envelope.truncate(envelope.len() - 4);
    envelope.push_str("AAAA");

    let mut stream = TcpStream::connect(bob.listener.local_addr()).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    codec::write_frame(&mut stream, format!("PEER_MSG:alice:{envelope}").as_bytes()).unwrap();

    assert!(codec::read_frame(&mut stream).is_err());
    assert!(bob.events.recv_timeout(Duration::from_millis(200)).is_err());
}
