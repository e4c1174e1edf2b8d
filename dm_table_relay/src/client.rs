// TCP client for talking to a dm-table relay.
//
// Provides a non-blocking interface for an application's main thread:
// - `connect()` opens the TCP stream and spawns a background reader thread.
// - The reader thread calls `read_frame()` in a loop, deserializes
//   `ServerMessage`, and pushes into an `mpsc` channel.
// - The caller holds a `BufWriter<TcpStream>` for sending and drains the
//   inbox with `poll()`, which never blocks.
//
// There is no handshake: a connection is usable immediately, and `join` is
// just another message. The relay never acknowledges sends (beyond the
// protocol-level replies like `joined` and `leader`), so every send method
// returns as soon as the frame is flushed.
//
// This module lives in the relay crate so integration tests and embedders
// get a real client without a separate crate — it is purely std TCP +
// protocol framing + mpsc.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};

use serde_json::Value;
use thiserror::Error;

use dm_table_protocol::framing::{read_frame, write_frame};
use dm_table_protocol::message::{ClientMessage, ServerMessage};
use dm_table_protocol::types::{ClientId, TableId};

/// Errors raised by `NetClient` operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Blocking-write, polled-read relay client.
pub struct NetClient {
    writer: BufWriter<TcpStream>,
    inbox: Receiver<ServerMessage>,
    _reader_thread: Option<JoinHandle<()>>,
}

impl NetClient {
    /// Connect to a relay and spawn the reader thread.
    pub fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        let reader_stream = stream.try_clone()?;
        let writer = BufWriter::new(stream);

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || {
            reader_loop(BufReader::new(reader_stream), &tx);
        });

        Ok(Self {
            writer,
            inbox: rx,
            _reader_thread: Some(reader_thread),
        })
    }

    /// Bind this connection to a table under a self-declared identity.
    pub fn join(&mut self, table: Option<&str>, client: Option<&str>) -> Result<(), ClientError> {
        self.send(&ClientMessage::Join {
            table_id: table.map(|t| TableId(t.into())),
            client_id: client.map(|c| ClientId(c.into())),
        })
    }

    /// Ask for summaries of the relay's live tables.
    pub fn list(&mut self) -> Result<(), ClientError> {
        self.send(&ClientMessage::List)
    }

    /// Ask for a table's stored state. No reply arrives if it has none.
    pub fn request_state(&mut self, table: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::RequestState {
            table_id: TableId(table.into()),
        })
    }

    /// Attempt to take write leadership of a table.
    pub fn claim(&mut self, table: &str, client: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::Claim {
            table_id: TableId(table.into()),
            client_id: ClientId(client.into()),
        })
    }

    /// Relay an opaque payload to everyone else at the table.
    pub fn send_broadcast(
        &mut self,
        table: Option<&str>,
        payload: Option<Value>,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::Broadcast {
            table_id: table.map(|t| TableId(t.into())),
            payload,
        })
    }

    /// Propose a new table state. Whether it landed is only observable
    /// through the resulting fan-out (on other connections) or a later
    /// `request_state`.
    pub fn send_state(&mut self, table: Option<&str>, payload: Value) -> Result<(), ClientError> {
        self.send(&ClientMessage::State {
            table_id: table.map(|t| TableId(t.into())),
            payload: Some(payload),
        })
    }

    /// Send a raw, pre-built message. Useful for exercising edge cases
    /// (null payloads, unknown types) that the typed helpers rule out.
    pub fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
        let json = serde_json::to_vec(msg)?;
        write_frame(&mut self.writer, &json)?;
        Ok(())
    }

    /// Drain all queued server messages (non-blocking).
    pub fn poll(&self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = self.inbox.try_recv() {
            messages.push(msg);
        }
        messages
    }

    /// Close the connection. The relay sees EOF and unregisters us.
    pub fn disconnect(&mut self) {
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

/// Reader thread: read framed messages in a loop, push to channel.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: &mpsc::Sender<ServerMessage>) {
    while let Ok(bytes) = read_frame(&mut reader) {
        match serde_json::from_slice::<ServerMessage>(&bytes) {
            Ok(msg) => {
                if tx.send(msg).is_err() {
                    break; // Client dropped the receiver.
                }
            }
            Err(_) => break, // Malformed server message — bail out.
        }
    }
}
