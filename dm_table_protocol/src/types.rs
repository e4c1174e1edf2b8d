// Core identifier types for the dm-table protocol.
//
// Lightweight newtypes shared by `message.rs` (wire messages) and the relay's
// connection/session tracking (`dm_table_relay`). Table and client IDs are
// caller-supplied strings that serialize transparently, so the wire format
// stays plain JSON strings.

use serde::{Deserialize, Serialize};

/// Caller-supplied table (session) name. Tables are created lazily on first
/// reference and evicted once idle past the TTL.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub String);

/// Self-declared client identity. The relay never verifies this value —
/// leadership rests entirely on what the connection claims to be.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub String);

/// Monotonic state revision. A table only stores a payload whose embedded
/// revision is strictly greater than the one it already holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Revision(pub u64);
