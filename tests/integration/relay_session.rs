//! Integration tests for account and presence commands against a live
//! relay server.
//!
//! Verification command: `cargo test --test relay_session`

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use peerchat::client::{ClientError, ServerClient};
use peerchat_proto::crypto::{AesGcmCipher, Cipher};
use peerchat_relay::config::RelayConfig;
use peerchat_relay::relay::{MAX_LINE_LEN, RelayServer};

// =============================================================================
// Helpers
// =============================================================================

const TIMEOUT: Duration = Duration::from_secs(5);

/// Starts a relay server on a random loopback port.
fn start_relay(encryption: bool) -> RelayServer {
    let config = RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        workers: 4,
        encryption,
        ..RelayConfig::default()
    };
    RelayServer::start(&config).expect("failed to start test relay")
}

fn connect(server: &RelayServer, cipher: Option<Arc<dyn Cipher>>) -> ServerClient {
    ServerClient::connect(&server.local_addr().to_string(), cipher, TIMEOUT)
        .expect("failed to connect to relay")
}

fn default_cipher() -> Arc<dyn Cipher> {
    Arc::new(AesGcmCipher::with_default_key())
}

/// Polls `condition` until it holds or the timeout elapses.
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

// =============================================================================
// Accounts and presence
// =============================================================================

#[test]
fn register_login_list_logout() {
    let server = start_relay(false);
    let alice = connect(&server, None);

    assert_eq!(alice.request("REGISTER alice pw1").unwrap(), "REGISTER_SUCCESS");
    assert_eq!(
        alice.request("REGISTER alice other").unwrap(),
        "ERROR: Username already exists"
    );
    assert_eq!(alice.request("LIST").unwrap(), "No users online");
    assert_eq!(alice.request("LOGIN alice pw1 9001").unwrap(), "LOGIN_SUCCESS");
    assert_eq!(
        alice.request("LIST").unwrap(),
        "ONLINE_USERS: alice(127.0.0.1:9001)"
    );
    assert_eq!(alice.request("LOGOUT").unwrap(), "LOGOUT_SUCCESS");
    assert!(!server.state().sessions.is_online("alice"));
}

#[test]
fn login_failures() {
    let server = start_relay(false);
    let alice = connect(&server, None);
    let bob = connect(&server, None);

    alice.request("REGISTER alice pw").unwrap();
    bob.request("REGISTER bob pw").unwrap();

    assert_eq!(alice.request("LOGIN carol pw 9001").unwrap(), "ERROR: User not found");
    assert_eq!(alice.request("LOGIN alice nope 9001").unwrap(), "ERROR: Wrong password");
    assert_eq!(
        alice.request("LOGIN alice pw 80").unwrap(),
        "ERROR: Port must be between 1025 and 65535"
    );
    assert_eq!(
        alice.request("LOGIN alice pw").unwrap(),
        "ERROR: Invalid login format"
    );
    assert_eq!(alice.request("LOGIN alice pw 9001").unwrap(), "LOGIN_SUCCESS");

    assert_eq!(bob.request("LOGIN alice pw 9002").unwrap(), "ERROR: User already logged in");
    assert_eq!(bob.request("LOGIN bob pw 9001").unwrap(), "ERROR: Port already in use");
    assert_eq!(bob.request("LOGIN bob pw 9002").unwrap(), "LOGIN_SUCCESS");
}

#[test]
fn commands_that_need_a_login() {
    let server = start_relay(false);
    let anon = connect(&server, None);

    for command in [
        "LOGOUT",
        "MESSAGE hi",
        "GET_USER_INFO bob",
        "CREATE_ROOM lobby",
        "JOIN_ROOM lobby",
        "ROOM_MSG lobby hi",
    ] {
        assert_eq!(anon.request(command).unwrap(), "ERROR: Not logged in", "{command}");
    }
    assert_eq!(anon.request("LIST_ROOMS").unwrap(), "No rooms available");
    assert_eq!(anon.request("FLY away").unwrap(), "ERROR: Unknown command: FLY");
}

#[test]
fn get_user_info_returns_peer_endpoint() {
    let server = start_relay(false);
    let alice = connect(&server, None);
    let bob = connect(&server, None);

    alice.request("REGISTER alice pw").unwrap();
    alice.request("REGISTER bob pw").unwrap();
    alice.request("LOGIN alice pw 9001").unwrap();

    assert!(matches!(
        alice.user_endpoint("bob"),
        Err(ClientError::Server(reason)) if reason == "User not online"
    ));
    assert!(matches!(
        alice.user_endpoint("nobody"),
        Err(ClientError::Server(reason)) if reason == "User not found"
    ));

    bob.request("LOGIN bob pw 9002").unwrap();
    let addr = alice.user_endpoint("bob").unwrap();
    assert_eq!(addr, "127.0.0.1:9002".parse().unwrap());
}

#[test]
fn disconnect_cleans_up_presence() {
    let server = start_relay(false);
    let mut alice = connect(&server, None);
    let bob = connect(&server, None);

    alice.request("REGISTER alice pw").unwrap();
    alice.request("LOGIN alice pw 9001").unwrap();
    assert!(server.state().sessions.is_online("alice"));

    alice.close();
    assert!(wait_until(|| !server.state().sessions.is_online("alice")));
    assert_eq!(bob.request("LIST").unwrap(), "No users online");

    // The port is free again and the account can log back in.
    let again = connect(&server, None);
    assert_eq!(again.request("LOGIN alice pw 9001").unwrap(), "LOGIN_SUCCESS");
}

#[test]
fn logout_closes_the_connection() {
    let server = start_relay(false);
    let alice = connect(&server, None);
    alice.request("REGISTER alice pw").unwrap();
    alice.request("LOGIN alice pw 9001").unwrap();
    assert_eq!(alice.request("LOGOUT").unwrap(), "LOGOUT_SUCCESS");

    assert!(matches!(
        alice.request("LIST"),
        Err(ClientError::Disconnected | ClientError::Io(_))
    ));
}

// =============================================================================
// Encryption
// =============================================================================

#[test]
fn sealed_requests_get_sealed_responses() {
    let server = start_relay(true);
    let cipher = default_cipher();

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());

    let request = cipher.seal(b"REGISTER alice pw").unwrap();
    writeln!(stream, "{request}").unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert!(line.starts_with("ENC:"));
    assert_eq!(cipher.open(line.trim_end()).unwrap(), b"REGISTER_SUCCESS");

    // Plaintext requests stay plaintext on the same connection.
    writeln!(stream, "LIST").unwrap();
    line.clear();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line.trim_end(), "No users online");
}

#[test]
fn encrypted_client_round_trip() {
    let server = start_relay(true);
    let alice = connect(&server, Some(default_cipher()));

    assert_eq!(alice.request("REGISTER alice pw").unwrap(), "REGISTER_SUCCESS");
    assert_eq!(alice.request("LOGIN alice pw 9001").unwrap(), "LOGIN_SUCCESS");
    assert_eq!(
        alice.request("ENCRYPTION_STATUS").unwrap(),
        "ENCRYPTION_STATUS:ENABLED:AES-256-GCM"
    );
}

#[test]
fn sealed_request_to_plaintext_server() {
    let server = start_relay(false);
    let alice = connect(&server, Some(default_cipher()));
    // The server cannot open the envelope and answers in plaintext.
    assert_eq!(alice.request("LIST").unwrap(), "ERROR: Decryption failed");

    let plain = connect(&server, None);
    assert_eq!(
        plain.request("ENCRYPTION_STATUS").unwrap(),
        "ENCRYPTION_STATUS:DISABLED"
    );
}

#[test]
fn corrupted_envelope_is_rejected() {
    let server = start_relay(true);
    let cipher = default_cipher();

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());

    let mut envelope = cipher.seal(b"LIST").unwrap();
    envelope.truncate(envelope.len() - 4);
    envelope.push_str("AAAA");
    writeln!(stream, "{envelope}").unwrap();

    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line.trim_end(), "ERROR: Decryption failed");
}

// =============================================================================
// Malformed input
// =============================================================================

#[test]
fn invalid_utf8_request_keeps_the_connection() {
    let server = start_relay(false);
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());

    stream.write_all(b"HELLO\xff\n").unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line.trim_end(), "ERROR: Unknown command: HELLO\u{fffd}");

    writeln!(stream, "LIST").unwrap();
    line.clear();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line.trim_end(), "No users online");
}

#[test]
fn overlong_request_is_refused_and_closed() {
    let server = start_relay(false);
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());

    stream.write_all(&vec![b'A'; MAX_LINE_LEN + 1]).unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line.trim_end(), "ERROR: Request too long");
    line.clear();
    assert!(matches!(reader.read_line(&mut line), Ok(0) | Err(_)));

    // Other clients are unaffected.
    let other = connect(&server, None);
    assert_eq!(other.request("LIST").unwrap(), "No users online");
}

#[test]
fn longest_allowed_request_is_served() {
    let server = start_relay(false);
    let alice = connect(&server, None);
    alice.request("REGISTER alice pw").unwrap();
    alice.request("LOGIN alice pw 9001").unwrap();

    let prefix = "MESSAGE ";
    let text = "y".repeat(MAX_LINE_LEN - prefix.len());
    assert_eq!(
        alice.request(&format!("{prefix}{text}")).unwrap(),
        "MESSAGE_RECEIVED"
    );
}
