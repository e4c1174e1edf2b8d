// Connection registry and broadcast fan-out.
//
// Tracks every live TCP connection together with its table/identity binding
// and owns the buffered write half of each stream. All mutation happens from
// the server's single-threaded main loop — no internal locking — and the
// main loop is the only writer to client streams.
//
// Sends are best-effort, fire-and-forget. A write error on one recipient is
// logged at debug and otherwise swallowed: it never aborts delivery to the
// remaining recipients and is never surfaced to the sender. The reader
// thread for a broken connection will notice the dead socket and raise a
// disconnect event, which removes the entry here synchronously.

use std::collections::BTreeMap;
use std::io::BufWriter;
use std::net::TcpStream;

use dm_table_protocol::framing::write_frame;
use dm_table_protocol::message::ServerMessage;
use dm_table_protocol::types::{ClientId, TableId};

/// Relay-assigned connection ID (compact u64, never sent on the wire).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Table/identity binding for one live connection. Both fields start out
/// null and are overwritten — possibly back to null — by each `join`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Binding {
    pub table: Option<TableId>,
    pub client: Option<ClientId>,
}

struct Connection {
    binding: Binding,
    writer: BufWriter<TcpStream>,
}

/// Registry of live connections. An entry exists exactly as long as the
/// underlying connection does: created on accept, removed on disconnect.
#[derive(Default)]
pub struct Registry {
    connections: BTreeMap<ConnectionId, Connection>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection with a null binding.
    /// Returns the ID that tags all subsequent events for this connection.
    pub fn register(&mut self, stream: TcpStream) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.connections.insert(
            id,
            Connection {
                binding: Binding::default(),
                writer: BufWriter::new(stream),
            },
        );
        id
    }

    /// Overwrite a connection's binding (the `join` path). Unknown IDs are
    /// ignored — the connection raced its own disconnect.
    pub fn bind(&mut self, id: ConnectionId, table: Option<TableId>, client: Option<ClientId>) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.binding = Binding { table, client };
        }
    }

    pub fn lookup(&self, id: ConnectionId) -> Option<&Binding> {
        self.connections.get(&id).map(|c| &c.binding)
    }

    /// Remove a connection, returning its last-known binding so the caller
    /// can release any leadership held under that identity.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<Binding> {
        self.connections.remove(&id).map(|c| c.binding)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Send a message to a single connection. Write errors are swallowed —
    /// the reader thread will detect the broken pipe.
    pub fn send_to(&mut self, id: ConnectionId, msg: &ServerMessage) {
        let Ok(json) = serde_json::to_vec(msg) else {
            return;
        };
        if let Some(conn) = self.connections.get_mut(&id) {
            if let Err(e) = write_frame(&mut conn.writer, &json) {
                tracing::debug!(conn = id.0, error = %e, "send failed");
            }
        }
    }

    /// Send a message to every connection bound to `table`, except
    /// `exclude`. The message is serialized once; a failed write to one
    /// recipient does not affect the others.
    pub fn broadcast(&mut self, table: &TableId, msg: &ServerMessage, exclude: Option<ConnectionId>) {
        // An empty table name is no table at all; nothing fans out to it
        // even if connections are bound to the empty string.
        if table.0.is_empty() {
            tracing::debug!("broadcast dropped: empty table name");
            return;
        }
        let Ok(json) = serde_json::to_vec(msg) else {
            return;
        };
        for (id, conn) in &mut self.connections {
            if Some(*id) == exclude {
                continue;
            }
            if conn.binding.table.as_ref() != Some(table) {
                continue;
            }
            if let Err(e) = write_frame(&mut conn.writer, &json) {
                tracing::debug!(conn = id.0, error = %e, "broadcast send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;
    use std::net::TcpListener;

    use dm_table_protocol::framing::read_frame;

    use super::*;

    /// Create a TCP pair: (client_stream, server_stream) on localhost.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn recv_msg(reader: &mut BufReader<TcpStream>) -> ServerMessage {
        let bytes = read_frame(reader).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn table(name: &str) -> TableId {
        TableId(name.into())
    }

    #[test]
    fn register_starts_unbound() {
        let (_client, server) = tcp_pair();
        let mut registry = Registry::new();

        let id = registry.register(server);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(id), Some(&Binding::default()));
    }

    #[test]
    fn bind_overwrites_including_back_to_null() {
        let (_client, server) = tcp_pair();
        let mut registry = Registry::new();
        let id = registry.register(server);

        registry.bind(id, Some(table("t1")), Some(ClientId("alice".into())));
        let binding = registry.lookup(id).unwrap();
        assert_eq!(binding.table, Some(table("t1")));
        assert_eq!(binding.client, Some(ClientId("alice".into())));

        registry.bind(id, None, None);
        assert_eq!(registry.lookup(id), Some(&Binding::default()));
    }

    #[test]
    fn unregister_returns_last_binding() {
        let (_client, server) = tcp_pair();
        let mut registry = Registry::new();
        let id = registry.register(server);
        registry.bind(id, Some(table("t1")), Some(ClientId("alice".into())));

        let binding = registry.unregister(id).unwrap();
        assert_eq!(binding.table, Some(table("t1")));
        assert_eq!(binding.client, Some(ClientId("alice".into())));
        assert!(registry.is_empty());
        assert_eq!(registry.lookup(id), None);
    }

    #[test]
    fn connection_ids_are_never_reused() {
        let (_c1, s1) = tcp_pair();
        let (_c2, s2) = tcp_pair();
        let mut registry = Registry::new();

        let first = registry.register(s1);
        registry.unregister(first);
        let second = registry.register(s2);
        assert_ne!(first, second);
    }

    #[test]
    fn send_to_delivers_one_frame() {
        let (client, server) = tcp_pair();
        let mut registry = Registry::new();
        let id = registry.register(server);

        registry.send_to(id, &ServerMessage::Joined { table_id: None });

        let mut reader = BufReader::new(client);
        let msg = recv_msg(&mut reader);
        assert_eq!(msg, ServerMessage::Joined { table_id: None });
    }

    #[test]
    fn broadcast_reaches_table_members_only() {
        let (member, s1) = tcp_pair();
        let (other_table, s2) = tcp_pair();
        let (unbound, s3) = tcp_pair();
        let mut registry = Registry::new();

        let m = registry.register(s1);
        let o = registry.register(s2);
        let _u = registry.register(s3);
        registry.bind(m, Some(table("t1")), None);
        registry.bind(o, Some(table("t2")), None);

        let msg = ServerMessage::Broadcast {
            table_id: table("t1"),
            payload: None,
        };
        registry.broadcast(&table("t1"), &msg, None);

        let mut reader = BufReader::new(member);
        assert_eq!(recv_msg(&mut reader), msg);

        // The other-table and unbound connections see nothing: their sockets
        // have no pending data.
        other_table.set_nonblocking(true).unwrap();
        let mut probe = [0u8; 1];
        assert!(other_table.peek(&mut probe).is_err());
        unbound.set_nonblocking(true).unwrap();
        assert!(unbound.peek(&mut probe).is_err());
    }

    #[test]
    fn broadcast_excludes_sender() {
        let (sender, s1) = tcp_pair();
        let (peer, s2) = tcp_pair();
        let mut registry = Registry::new();

        let sender_id = registry.register(s1);
        let peer_id = registry.register(s2);
        registry.bind(sender_id, Some(table("t1")), None);
        registry.bind(peer_id, Some(table("t1")), None);

        let msg = ServerMessage::Broadcast {
            table_id: table("t1"),
            payload: None,
        };
        registry.broadcast(&table("t1"), &msg, Some(sender_id));

        let mut reader = BufReader::new(peer);
        assert_eq!(recv_msg(&mut reader), msg);

        sender.set_nonblocking(true).unwrap();
        let mut probe = [0u8; 1];
        assert!(sender.peek(&mut probe).is_err());
    }

    #[test]
    fn broadcast_to_an_empty_table_name_goes_nowhere() {
        let (member, server) = tcp_pair();
        let mut registry = Registry::new();
        let id = registry.register(server);
        registry.bind(id, Some(table("")), None);

        let msg = ServerMessage::Broadcast {
            table_id: table(""),
            payload: None,
        };
        registry.broadcast(&table(""), &msg, None);

        // Even a connection bound to "" receives nothing.
        member.set_nonblocking(true).unwrap();
        let mut probe = [0u8; 1];
        assert!(member.peek(&mut probe).is_err());
    }

    #[test]
    fn broadcast_survives_a_dead_recipient() {
        let (dead_peer, s1) = tcp_pair();
        let (live_peer, s2) = tcp_pair();
        let mut registry = Registry::new();

        let dead = registry.register(s1);
        let live = registry.register(s2);
        registry.bind(dead, Some(table("t1")), None);
        registry.bind(live, Some(table("t1")), None);

        // Close the first peer, then broadcast enough to defeat socket
        // buffering on the dead entry. The live peer must still get every
        // message.
        drop(dead_peer);
        let msg = ServerMessage::Broadcast {
            table_id: table("t1"),
            payload: Some(serde_json::json!({"blob": "x".repeat(4096)})),
        };
        for _ in 0..64 {
            registry.broadcast(&table("t1"), &msg, None);
        }

        let mut reader = BufReader::new(live_peer);
        for _ in 0..64 {
            assert_eq!(recv_msg(&mut reader), msg);
        }
    }
}
