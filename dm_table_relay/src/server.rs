// TCP server and main event loop for the dm-table relay.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and hands each to a short-lived sniff thread, which answers
//   HTTP probes directly or forwards `InternalEvent::NewConnection` to the
//   main thread.
// - **Reader threads** (one per connection): call `framing::read_frame()` in
//   a loop, deserialize `ClientMessage`, and send `InternalEvent::MessageFrom`
//   to the main thread. Malformed frames are dropped where they land — the
//   connection stays open. On read error/EOF they send
//   `InternalEvent::Disconnected`.
// - **Main thread**: owns the `Registry` and `SessionStore`, receives events
//   from the channel, and dispatches them to completion one at a time. Uses
//   `recv_timeout` against the next sweep deadline, so idle-session eviction
//   interleaves between events and never runs inside a handler.
//
// The main thread is the only writer to client TCP streams (via
// `Registry::send_to`/`broadcast`). Reader threads only read. This avoids
// concurrent read/write on the same `TcpStream`, which is safe on most
// platforms but fragile.
//
// New connections are sniffed for an HTTP request line before entering the
// framed protocol: a browser or health checker probing the port gets a
// plain-text identification response and is closed without ever touching
// the registry. The sniff runs on its own thread per connection, so one
// that opens a socket and stays silent stalls nobody else.
//
// Shutdown: the main thread checks a `keep_running` flag (set to false by
// `RelayHandle::stop`) and breaks out of the event loop.

use std::io::{self, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use dm_table_protocol::framing::read_frame;
use dm_table_protocol::message::{ClientMessage, ServerMessage};

use crate::registry::{ConnectionId, Registry};
use crate::session::{ClaimOutcome, SessionStore};

/// Identification line served to HTTP probes on the relay port.
const PROBE_RESPONSE_BODY: &str = "dm-table relay\n";

/// How long a fresh connection may sit silent before we give up sniffing it
/// for HTTP and hand it to the main loop as a framed client. Each sniff
/// runs on its own thread; this only bounds how long that thread lives.
const PROBE_SNIFF_TIMEOUT: Duration = Duration::from_millis(500);

/// Events sent from listener/reader threads to the main thread.
enum InternalEvent {
    NewConnection {
        stream: TcpStream,
    },
    MessageFrom {
        conn: ConnectionId,
        message: ClientMessage,
    },
    Disconnected {
        conn: ConnectionId,
    },
}

/// Errors starting a relay instance.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read bound address: {0}")]
    LocalAddr(#[source] io::Error),
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }
}

/// Configuration for starting a relay server.
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    /// Sessions idle longer than this are evicted.
    pub session_ttl: Duration,
    /// How often the eviction sweep runs.
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            session_ttl: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Everything the main thread owns: connection bindings and table sessions,
/// scoped to one relay instance so tests can run several side by side.
struct Relay {
    registry: Registry,
    sessions: SessionStore,
    config: RelayConfig,
}

/// Start the relay server on a background thread. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used to
/// let the OS pick a free port).
pub fn start_relay(config: RelayConfig) -> Result<(RelayHandle, SocketAddr), RelayError> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).map_err(|source| RelayError::Bind {
        addr: addr.clone(),
        source,
    })?;
    let local = listener.local_addr().map_err(RelayError::LocalAddr)?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_clone = keep_running.clone();

    let thread = thread::spawn(move || {
        run_relay(listener, config, keep_running_clone);
    });

    tracing::info!(addr = %local, "relay listening");
    Ok((
        RelayHandle {
            keep_running,
            thread: Some(thread),
        },
        local,
    ))
}

/// Main relay loop. Runs until `keep_running` is set to false.
fn run_relay(listener: TcpListener, config: RelayConfig, keep_running: Arc<AtomicBool>) {
    let mut relay = Relay {
        registry: Registry::new(),
        sessions: SessionStore::new(),
        config,
    };

    let (tx, rx): (Sender<InternalEvent>, Receiver<InternalEvent>) = mpsc::channel();

    // Set the listener to non-blocking so the accept thread can check
    // keep_running periodically.
    listener.set_nonblocking(true).ok();

    // Listener thread: accepts new connections.
    let keep_running_listener = keep_running.clone();
    let tx_listener = tx.clone();
    thread::spawn(move || {
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false).ok();
                    let tx_sniff = tx_listener.clone();
                    thread::spawn(move || sniff_connection(stream, &tx_sniff));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(_) => break,
            }
        }
    });

    // Main event loop. The sweep runs against a fixed deadline so a busy
    // table cannot starve eviction, and an idle relay still sweeps on time.
    let mut next_sweep = Instant::now() + relay.config.sweep_interval;
    while keep_running.load(Ordering::SeqCst) {
        let timeout = next_sweep.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(event) => {
                handle_event(&mut relay, event, &tx, &keep_running);
                // Drain any additional events that arrived during handling.
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut relay, event, &tx, &keep_running);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if Instant::now() >= next_sweep {
            let evicted = relay
                .sessions
                .sweep(now_millis(), relay.config.session_ttl);
            if !evicted.is_empty() {
                tracing::info!(count = evicted.len(), tables = ?evicted, "idle sessions evicted");
            }
            next_sweep = Instant::now() + relay.config.sweep_interval;
        }
    }
}

/// Dispatch a single event.
fn handle_event(
    relay: &mut Relay,
    event: InternalEvent,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
) {
    match event {
        InternalEvent::NewConnection { stream } => {
            handle_new_connection(relay, stream, tx, keep_running);
        }
        InternalEvent::MessageFrom { conn, message } => {
            handle_message(relay, conn, message);
        }
        InternalEvent::Disconnected { conn } => {
            if let Some(binding) = relay.registry.unregister(conn) {
                tracing::info!(conn = conn.0, "connection closed");
                if let (Some(table), Some(client)) = (binding.table, binding.client) {
                    relay.sessions.release(&table, &client);
                }
            }
        }
    }
}

/// Decide whether a fresh connection is an HTTP probe or a framed client.
/// Peeks the first bytes without consuming them: a framed client starts
/// with a length prefix, a browser or health checker with an HTTP method.
/// Runs on a thread of its own; a connection that stays silent past the
/// sniff timeout is assumed to be a framed client that just hasn't spoken
/// yet and is handed to the main loop.
fn sniff_connection(stream: TcpStream, tx: &Sender<InternalEvent>) {
    stream.set_read_timeout(Some(PROBE_SNIFF_TIMEOUT)).ok();
    let mut first = [0u8; 4];
    if let Ok(4) = stream.peek(&mut first) {
        if looks_like_http(&first) {
            respond_to_probe(stream);
            return;
        }
    }
    stream.set_read_timeout(None).ok();
    let _ = tx.send(InternalEvent::NewConnection { stream });
}

/// Register a sniffed connection unbound and spawn its reader thread.
fn handle_new_connection(
    relay: &mut Relay,
    stream: TcpStream,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
) {
    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };

    let conn = relay.registry.register(stream);
    tracing::info!(conn = conn.0, "connection registered");

    let tx_reader = tx.clone();
    let keep_running_reader = keep_running.clone();
    thread::spawn(move || {
        reader_loop(BufReader::new(reader_stream), conn, tx_reader, keep_running_reader);
    });
}

/// First bytes of the HTTP request methods a probe might use.
fn looks_like_http(first: &[u8; 4]) -> bool {
    matches!(
        first,
        b"GET " | b"HEAD" | b"POST" | b"PUT " | b"DELE" | b"OPTI" | b"PATC"
    )
}

/// Serve the plain-text identification response and close. Errors don't
/// matter — the probe is gone either way.
fn respond_to_probe(mut stream: TcpStream) {
    tracing::debug!("http probe answered");
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        PROBE_RESPONSE_BODY.len(),
        PROBE_RESPONSE_BODY
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.shutdown(Shutdown::Both);
}

/// Reader loop for a single connection. Runs in its own thread.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    conn: ConnectionId,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match read_frame(&mut reader) {
            Ok(bytes) => match serde_json::from_slice::<ClientMessage>(&bytes) {
                Ok(message) => {
                    if tx.send(InternalEvent::MessageFrom { conn, message }).is_err() {
                        break; // Main thread is gone.
                    }
                }
                Err(e) => {
                    // Malformed body — drop it, keep the connection.
                    tracing::debug!(conn = conn.0, error = %e, "malformed message dropped");
                }
            },
            Err(_) => {
                // Read error or EOF — disconnect.
                let _ = tx.send(InternalEvent::Disconnected { conn });
                break;
            }
        }
    }
}

/// Route one decoded message. Every failure mode in here is a silent no-op
/// by design: the only rejection a client can observe is `leader{ok:false}`.
fn handle_message(relay: &mut Relay, conn: ConnectionId, message: ClientMessage) {
    let now = now_millis();
    match message {
        ClientMessage::Join { table_id, client_id } => {
            tracing::info!(conn = conn.0, table = ?table_id, client = ?client_id, "join");
            relay.registry.bind(conn, table_id.clone(), client_id);
            relay.registry.send_to(
                conn,
                &ServerMessage::Joined {
                    table_id: table_id.clone(),
                },
            );
            if let Some(table) = table_id {
                relay.sessions.get_or_create(&table, now);
                relay.sessions.touch(&table, now);
                // A late joiner catches up immediately on the stored state.
                if let Some((payload, author)) = relay.sessions.stored_state(&table) {
                    let reply = ServerMessage::State {
                        table_id: table.clone(),
                        payload: payload.clone(),
                        sender: author.cloned(),
                    };
                    relay.registry.send_to(conn, &reply);
                }
            }
        }
        ClientMessage::List => {
            let items: Vec<_> = relay
                .sessions
                .list(now, relay.config.session_ttl)
                .collect();
            relay.registry.send_to(conn, &ServerMessage::List { items });
        }
        ClientMessage::RequestState { table_id } => {
            relay.sessions.touch(&table_id, now);
            if let Some((payload, author)) = relay.sessions.stored_state(&table_id) {
                let reply = ServerMessage::State {
                    table_id: table_id.clone(),
                    payload: payload.clone(),
                    sender: author.cloned(),
                };
                relay.registry.send_to(conn, &reply);
            }
        }
        ClientMessage::Claim { table_id, client_id } => {
            let reply = match relay.sessions.claim(&table_id, &client_id, now) {
                ClaimOutcome::Granted => ServerMessage::Leader {
                    ok: true,
                    leader_id: client_id,
                },
                ClaimOutcome::Denied { leader } => ServerMessage::Leader {
                    ok: false,
                    leader_id: leader,
                },
            };
            relay.registry.send_to(conn, &reply);
        }
        ClientMessage::Broadcast { table_id, payload } => {
            let table = table_id.or_else(|| {
                relay
                    .registry
                    .lookup(conn)
                    .and_then(|binding| binding.table.clone())
            });
            let Some(table) = table else {
                tracing::debug!(conn = conn.0, "broadcast dropped: no table");
                return;
            };
            let msg = ServerMessage::Broadcast {
                table_id: table.clone(),
                payload,
            };
            relay.registry.broadcast(&table, &msg, Some(conn));
        }
        ClientMessage::State { table_id, payload } => {
            let (bound_table, sender) = match relay.registry.lookup(conn) {
                Some(binding) => (binding.table.clone(), binding.client.clone()),
                None => (None, None),
            };
            let Some(table) = table_id.or(bound_table) else {
                tracing::debug!(conn = conn.0, "state write dropped: no table");
                return;
            };
            if relay.sessions.apply_state(&table, payload, sender.as_ref(), now) {
                if let Some((payload, author)) = relay.sessions.stored_state(&table) {
                    let msg = ServerMessage::State {
                        table_id: table.clone(),
                        payload: payload.clone(),
                        sender: author.cloned(),
                    };
                    relay.registry.broadcast(&table, &msg, Some(conn));
                }
            }
        }
        ClientMessage::Unknown => {
            tracing::debug!(conn = conn.0, "unrecognized message dropped");
        }
    }
}

/// Current wall-clock time in epoch milliseconds. Session activity and
/// `lastUpdated` summaries use this resolution throughout.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
