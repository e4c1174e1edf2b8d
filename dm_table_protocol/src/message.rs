// Protocol messages for client-relay communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by clients to the relay.
// - `ServerMessage`: sent by the relay to clients.
//
// Both are internally tagged JSON objects: a `type` discriminant in
// snake_case, remaining fields in camelCase. `ClientMessage` carries a
// catch-all `Unknown` variant so a message with an unrecognized `type` still
// decodes — the relay drops it without closing the connection.
//
// State and broadcast payloads are opaque `serde_json::Value`s. The relay
// never interprets them beyond digging out the embedded revision number; the
// actual table contents are a client-side concern.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ClientId, TableId};

/// Messages sent by a client to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Bind this connection to a table under a self-declared identity.
    /// Both fields may be omitted; the binding is overwritten either way.
    Join {
        #[serde(default)]
        table_id: Option<TableId>,
        #[serde(default)]
        client_id: Option<ClientId>,
    },
    /// Ask for summaries of all live tables.
    List,
    /// Ask for a table's stored state, if any.
    RequestState { table_id: TableId },
    /// Attempt to take (or re-take) write leadership of a table.
    Claim {
        table_id: TableId,
        client_id: ClientId,
    },
    /// Relay an opaque payload to everyone else at the table. Defaults to
    /// the sender's bound table when `tableId` is omitted.
    Broadcast {
        #[serde(default)]
        table_id: Option<TableId>,
        #[serde(default)]
        payload: Option<Value>,
    },
    /// Propose a new table state. The payload must embed a revision strictly
    /// greater than the table's current one, or the write is dropped.
    State {
        #[serde(default)]
        table_id: Option<TableId>,
        #[serde(default)]
        payload: Option<Value>,
    },
    /// Any unrecognized `type`. Dropped silently by the relay.
    #[serde(other)]
    Unknown,
}

/// Messages sent by the relay to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Acknowledges a `join`, echoing the (possibly null) table binding.
    Joined { table_id: Option<TableId> },
    /// Summaries of live tables, most recently active first.
    List { items: Vec<TableSummary> },
    /// Result of a `claim`: `ok` plus whoever holds leadership now.
    Leader { ok: bool, leader_id: ClientId },
    /// An opaque payload relayed from another connection at the table.
    Broadcast {
        table_id: TableId,
        payload: Option<Value>,
    },
    /// A table state: either an accepted update fanned out to the table, or
    /// a direct reply to `join`/`request_state`. `sender` is the identity
    /// that authored the payload, null if it predates any declared identity.
    State {
        table_id: TableId,
        payload: Value,
        sender: Option<ClientId>,
    },
}

/// One row of a `list` reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSummary {
    pub id: TableId,
    /// Last-activity timestamp, milliseconds since the Unix epoch.
    pub last_updated: u64,
    pub has_state: bool,
}
