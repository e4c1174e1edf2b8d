// Test-only client harness for relay integration tests.
//
// Wraps the real `NetClient` (from `dm_table_relay::client`) with a
// synchronous, assertion-friendly API: `next_message()` blocks until the
// relay's next reply arrives (preserving per-connection delivery order) and
// `expect_silence()` asserts that nothing arrives inside a window — the
// relay rejects by staying quiet, so tests need both directions.
//
// All networking uses the same code paths as a real client; the only
// test-specific code is the blocking poll loops.
//
// See `tests/relay_pipeline.rs` for the scenarios.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use dm_table_protocol::message::{ClientMessage, ServerMessage};
use dm_table_relay::client::NetClient;

/// Default timeout for blocking poll operations.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A test client wrapping a real `NetClient`.
pub struct TestClient {
    client: NetClient,
    inbox: VecDeque<ServerMessage>,
}

impl TestClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let client = NetClient::connect(&addr.to_string()).expect("TestClient::connect failed");
        Self {
            client,
            inbox: VecDeque::new(),
        }
    }

    pub fn join(&mut self, table: Option<&str>, client: Option<&str>) {
        self.client.join(table, client).expect("join failed");
    }

    pub fn list(&mut self) {
        self.client.list().expect("list failed");
    }

    pub fn request_state(&mut self, table: &str) {
        self.client.request_state(table).expect("request_state failed");
    }

    pub fn claim(&mut self, table: &str, client: &str) {
        self.client.claim(table, client).expect("claim failed");
    }

    pub fn send_broadcast(&mut self, table: Option<&str>, payload: Option<Value>) {
        self.client
            .send_broadcast(table, payload)
            .expect("send_broadcast failed");
    }

    pub fn send_state(&mut self, table: Option<&str>, payload: Value) {
        self.client.send_state(table, payload).expect("send_state failed");
    }

    pub fn send_raw(&mut self, msg: &ClientMessage) {
        self.client.send(msg).expect("send_raw failed");
    }

    /// Block until the relay's next message for this connection arrives.
    /// Messages are returned in delivery order.
    pub fn next_message(&mut self) -> ServerMessage {
        let start = Instant::now();
        loop {
            if let Some(msg) = self.inbox.pop_front() {
                return msg;
            }
            self.inbox.extend(self.client.poll());
            if self.inbox.is_empty() {
                assert!(
                    start.elapsed() < POLL_TIMEOUT,
                    "timed out waiting for a server message"
                );
                thread::sleep(POLL_INTERVAL);
            }
        }
    }

    /// Assert that nothing arrives for this connection within `window`.
    /// Rejected writes and excluded broadcasts are only observable as
    /// silence, so the window errs on the generous side.
    pub fn expect_silence(&mut self, window: Duration) {
        thread::sleep(window);
        self.inbox.extend(self.client.poll());
        assert!(
            self.inbox.is_empty(),
            "expected silence, got {:?}",
            self.inbox
        );
    }

    /// Close the connection; the relay unregisters us on EOF.
    pub fn disconnect(&mut self) {
        self.client.disconnect();
    }
}
