//! `PeerChat` line-oriented chat client.
//!
//! Relay commands are typed as-is (`REGISTER alice pw`, `JOIN_ROOM lobby`,
//! ...). `LOGIN` without a port announces the local peer listener. Direct
//! messages and files go peer-to-peer via `/p2p` and `/file`.
//!
//! ```bash
//! cargo run --bin peerchat -- --server 127.0.0.1:8080 --p2p-port 9001
//! ```

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use peerchat::client::{ClientError, ServerClient};
use peerchat::config::{CliArgs, ClientConfig};
use peerchat::transfer::{FileSender, TransferProgress};
use peerchat::transport::{PeerEvent, PeerListener, PeerTransport};
use peerchat_proto::crypto::{self, AesGcmCipher, Cipher};

const HELP: &str = "\
Relay commands:
  REGISTER <user> <password>      LOGIN <user> <password> [port]
  LOGOUT  LIST  ENCRYPTION_STATUS  GET_USER_INFO <user>
  CREATE_ROOM <room>  JOIN_ROOM <room>  LEAVE_ROOM <room>
  LIST_ROOMS  ROOM_MEMBERS <room>  ROOM_MSG <room> <text>  ROOM_HISTORY <room>
Peer commands:
  /p2p <user> <message>           send a direct message
  /file <user> <path>             send a file
  /help                           show this help
  /quit                           log out and exit";

fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("peerchat starting");

    match run(&config) {
        Ok(()) => {
            tracing::info!("peerchat exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            tracing::error!(error = %e, "peerchat failed");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Logs go to a file so they never interleave with the prompt. Returns a
/// [`WorkerGuard`] that must be held until shutdown to flush buffered
/// entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("peerchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Builds the shared cipher, falling back to plaintext if it is broken.
fn client_cipher(config: &ClientConfig) -> Option<Arc<dyn Cipher>> {
    if !config.encryption {
        return None;
    }
    let cipher: Arc<dyn Cipher> = Arc::new(AesGcmCipher::with_default_key());
    if crypto::self_test(cipher.as_ref()) {
        Some(cipher)
    } else {
        tracing::warn!("cipher self-test failed, continuing without encryption");
        println!("Warning: encryption unavailable, sending plaintext");
        None
    }
}

fn run(config: &ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let cipher = client_cipher(config);

    let (event_tx, event_rx) = mpsc::channel();
    let mut listener = PeerListener::bind_with_progress(
        ("0.0.0.0", config.p2p_port),
        "",
        cipher.clone(),
        config.download_dir.clone(),
        event_tx,
        Some(Arc::new(|progress: TransferProgress| {
            print!("\rReceiving: {progress}");
            let _ = io::stdout().flush();
        })),
    )?;
    println!("Listening for peers on port {}", listener.port());

    let mut server = ServerClient::connect(&config.server, cipher.clone(), config.request_timeout)?;
    println!("Connected to {} (type /help for commands)", config.server);

    if let Some(pushes) = server.take_pushes() {
        spawn_printer("peerchat-pushes", pushes, |line| line);
    }
    spawn_printer("peerchat-events", event_rx, describe_event);

    let mut session = Session {
        config,
        cipher,
        server: &server,
        listener: &listener,
        user: None,
    };
    let result = session.repl();

    if session.user.is_some() {
        let _ = server.request("LOGOUT");
    }
    server.close();
    listener.stop();
    result
}

/// Prints everything arriving on `rx` until the channel closes.
fn spawn_printer<T: Send + 'static>(
    name: &str,
    rx: Receiver<T>,
    render: impl Fn(T) -> String + Send + 'static,
) {
    let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
        for item in rx {
            println!("{}", render(item));
        }
    });
    if let Err(e) = spawned {
        tracing::error!(thread = name, error = %e, "failed to spawn printer thread");
    }
}

fn describe_event(event: PeerEvent) -> String {
    match event {
        PeerEvent::Message {
            from,
            text,
            encrypted,
        } => {
            let lock = if encrypted { " [encrypted]" } else { "" };
            format!("[P2P from {from}]{lock}: {text}")
        }
        PeerEvent::FileReceived { from, path, size } => {
            format!("Received file from {from}: {} ({size} bytes)", path.display())
        }
        PeerEvent::FileFailed {
            from,
            filename,
            reason,
        } => format!("File {filename} from {from} failed: {reason}"),
    }
}

/// Interactive state for one run of the client.
struct Session<'a> {
    config: &'a ClientConfig,
    cipher: Option<Arc<dyn Cipher>>,
    server: &'a ServerClient,
    listener: &'a PeerListener,
    user: Option<String>,
}

impl Session<'_> {
    fn repl(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            print!("> ");
            io::stdout().flush()?;
            line.clear();
            if stdin.lock().read_line(&mut line)? == 0 {
                return Ok(());
            }
            let input = line.trim();
            if input.is_empty() {
                continue;
            }

            let keep_going = match input.split_once(' ').map_or((input, ""), |(c, r)| (c, r.trim())) {
                ("/quit", _) => false,
                ("/help", _) => {
                    println!("{HELP}");
                    true
                }
                ("/p2p", rest) => {
                    self.direct_message(rest);
                    true
                }
                ("/file", rest) => {
                    self.send_file(rest);
                    true
                }
                _ => self.relay_command(input)?,
            };
            if !keep_going {
                return Ok(());
            }
        }
    }

    /// Sends one relay command. Returns `false` once the session is over.
    fn relay_command(&mut self, input: &str) -> Result<bool, ClientError> {
        let request = self.with_listener_port(input);
        let response = match self.server.request(&request) {
            Ok(response) => response,
            Err(ClientError::Timeout) => {
                println!("No response from server");
                return Ok(true);
            }
            Err(e) => return Err(e),
        };
        println!("{response}");

        match response.as_str() {
            "LOGIN_SUCCESS" => {
                let username = request.split_whitespace().nth(1).unwrap_or_default();
                self.listener.set_local_user(username);
                self.user = Some(username.to_string());
                Ok(true)
            }
            "LOGOUT_SUCCESS" => {
                self.user = None;
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    /// Appends the peer listener port to a `LOGIN` that lacks one.
    fn with_listener_port(&self, input: &str) -> String {
        let mut tokens = input.split_whitespace();
        let is_login = tokens
            .next()
            .is_some_and(|verb| verb.eq_ignore_ascii_case("LOGIN"));
        if is_login && tokens.count() == 2 {
            format!("{input} {}", self.listener.port())
        } else {
            input.to_string()
        }
    }

    fn logged_in_user(&self) -> Option<&str> {
        let user = self.user.as_deref();
        if user.is_none() {
            println!("Log in first");
        }
        user
    }

    fn direct_message(&self, args: &str) {
        let Some((target, text)) = args.split_once(' ') else {
            println!("Usage: /p2p <user> <message>");
            return;
        };
        let Some(user) = self.logged_in_user() else {
            return;
        };
        let addr = match self.server.user_endpoint(target) {
            Ok(addr) => addr,
            Err(e) => {
                println!("Cannot reach {target}: {e}");
                return;
            }
        };

        let transport = PeerTransport::new(user, self.cipher.clone())
            .with_timeouts(self.config.connect_timeout, self.config.request_timeout);
        match transport.send(addr, text.trim(), self.cipher.is_some()) {
            Ok(delivery) if delivery.is_acknowledged() => println!("Delivered to {target}"),
            Ok(_) => println!("Sent to {target} (no acknowledgement)"),
            Err(e) => println!("Failed to send to {target}: {e}"),
        }
    }

    fn send_file(&self, args: &str) {
        let Some((target, path)) = args.split_once(' ') else {
            println!("Usage: /file <user> <path>");
            return;
        };
        let Some(user) = self.logged_in_user() else {
            return;
        };
        let addr = match self.server.user_endpoint(target) {
            Ok(addr) => addr,
            Err(e) => {
                println!("Cannot reach {target}: {e}");
                return;
            }
        };

        let sender = FileSender::new(self.cipher.clone())
            .with_chunk_size(self.config.chunk_size)
            .with_progress(Arc::new(|progress: TransferProgress| {
                print!("\rSending: {progress}");
                let _ = io::stdout().flush();
            }));
        match sender.send_file(addr, Path::new(path.trim()), user, self.cipher.is_some()) {
            Ok(bytes) => println!("\nSent {} to {target} ({bytes} bytes)", path.trim()),
            Err(e) => println!("\nFile transfer to {target} failed: {e}"),
        }
    }
}
