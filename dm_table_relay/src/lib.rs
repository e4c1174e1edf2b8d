// dm_table_relay — session relay for shared table state.
//
// The relay is a thin coordination broker: clients bind to named tables,
// exactly one client per table may hold write leadership at a time, state
// updates are gated on a monotonic revision embedded in the payload, and
// accepted updates plus ordinary broadcasts fan out to everyone else at the
// table. Idle tables are evicted on a timer. The relay never interprets
// table contents — what a "table" holds is entirely a client concern.
//
// Module overview:
// - `registry.rs`: Live-connection table: per-connection table/identity
//                  bindings, write halves of the streams, and the broadcast
//                  fan-out. Driven only from the server's main thread.
// - `session.rs`:  Table sessions — stored state, revision gating, leader
//                  election/release, activity tracking, TTL sweep. The core
//                  data structure that `server.rs` drives.
// - `server.rs`:   TCP listener, reader threads (one per connection), HTTP
//                  probe sniffing, and the main event loop. Uses `std::net`
//                  with a thread-per-reader architecture and an `mpsc`
//                  channel to funnel events into the single-threaded core.
// - `client.rs`:   Blocking-write, polled-read TCP client used by the
//                  integration tests and by embedders.
//
// Dependencies: `dm_table_protocol` (shared message types and framing),
// `tracing` for diagnostics, `thiserror` for the startup error type.
//
// The relay can run as a standalone binary (`main.rs`) or be embedded in a
// host process via the library API (`start_relay`).

pub mod client;
pub mod registry;
pub mod server;
pub mod session;

pub use server::{RelayConfig, RelayError, start_relay};
