// Table session state: the store, leadership, and revision reconciliation.
//
// `SessionStore` is the central data structure that `server.rs` drives. It
// owns every live table session and is only ever touched from the server's
// single-threaded main loop — no internal locking. Time enters as an
// explicit epoch-milliseconds argument so eviction and ordering logic can be
// tested without sleeping.
//
// Key rules, all enforced here:
// - Sessions are created lazily on first reference and start zeroed:
//   no state, revision 0, no leader.
// - A table has at most one leader. Claims are granted when the table is
//   leaderless or re-claimed by the current leader; otherwise denied,
//   reporting who holds it. Release only clears leadership if it still
//   belongs to the releasing identity.
// - A state write is accepted only if a payload is present, the sender
//   matches the leader (when one exists), and the payload's embedded
//   revision is strictly greater than the stored one. Every rejection is
//   silent — the sender gets no signal and stored state is untouched.
// - The sweeper deletes any session idle past the TTL, unconditionally.
//   Connections still bound to an evicted table are not told; their next
//   reference simply recreates it from scratch.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use dm_table_protocol::message::TableSummary;
use dm_table_protocol::types::{ClientId, Revision, TableId};

/// One table's shared session state.
struct TableSession {
    state: Option<Value>,
    revision: Revision,
    leader: Option<ClientId>,
    /// Identity that authored the stored state, echoed as `sender` in
    /// direct state replies. Null when no write has carried an identity.
    last_writer: Option<ClientId>,
    /// Epoch milliseconds of the last reference (join, claim, read, write).
    last_activity: u64,
}

impl TableSession {
    fn new(now: u64) -> Self {
        Self {
            state: None,
            revision: Revision(0),
            leader: None,
            last_writer: None,
            last_activity: now,
        }
    }

    fn idle(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_activity)
    }
}

/// Result of a leadership claim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Granted,
    /// Someone else holds the table; here is who.
    Denied { leader: ClientId },
}

/// All live table sessions, keyed by table ID.
#[derive(Default)]
pub struct SessionStore {
    tables: BTreeMap<TableId, TableSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Ensure a session exists for `id`, creating it zeroed with `now` as
    /// its first activity. Existing sessions are left untouched.
    pub fn get_or_create(&mut self, id: &TableId, now: u64) {
        let _ = self.session_mut(id, now);
    }

    fn session_mut(&mut self, id: &TableId, now: u64) -> &mut TableSession {
        self.tables.entry(id.clone()).or_insert_with(|| {
            tracing::info!(table = %id.0, "session created");
            TableSession::new(now)
        })
    }

    /// Refresh a session's last-activity timestamp. Joins and reads go
    /// through here so a table kept alive only by viewers still counts as
    /// active. No-op for unknown tables.
    pub fn touch(&mut self, id: &TableId, now: u64) {
        if let Some(session) = self.tables.get_mut(id) {
            session.last_activity = now;
        }
    }

    /// The stored state and its author, if any state has been accepted.
    pub fn stored_state(&self, id: &TableId) -> Option<(&Value, Option<&ClientId>)> {
        let session = self.tables.get(id)?;
        session
            .state
            .as_ref()
            .map(|state| (state, session.last_writer.as_ref()))
    }

    /// Current revision of a table, `Revision(0)` if the table is unknown.
    pub fn revision(&self, id: &TableId) -> Revision {
        self.tables.get(id).map_or(Revision(0), |s| s.revision)
    }

    /// Current leader of a table, if any.
    pub fn leader(&self, id: &TableId) -> Option<&ClientId> {
        self.tables.get(id).and_then(|s| s.leader.as_ref())
    }

    /// Attempt to take write leadership of a table. Counts as a reference:
    /// creates the session if needed and refreshes its activity.
    pub fn claim(&mut self, id: &TableId, client: &ClientId, now: u64) -> ClaimOutcome {
        let session = self.session_mut(id, now);
        session.last_activity = now;
        match &session.leader {
            Some(leader) if leader != client => {
                tracing::debug!(table = %id.0, client = %client.0, leader = %leader.0, "claim denied");
                ClaimOutcome::Denied {
                    leader: leader.clone(),
                }
            }
            _ => {
                // Leaderless, or an idempotent re-claim by the holder.
                session.leader = Some(client.clone());
                tracing::info!(table = %id.0, client = %client.0, "leadership granted");
                ClaimOutcome::Granted
            }
        }
    }

    /// Release leadership on disconnect. Only clears the leader if it still
    /// equals `client`, so a leadership that already moved to someone else
    /// between disconnect detection and cleanup is not clobbered.
    pub fn release(&mut self, id: &TableId, client: &ClientId) {
        if let Some(session) = self.tables.get_mut(id) {
            if session.leader.as_ref() == Some(client) {
                session.leader = None;
                tracing::info!(table = %id.0, client = %client.0, "leadership released");
            }
        }
    }

    /// Apply an incoming state write. Returns true if the payload was
    /// accepted and stored; the caller then fans it out. Returns false for
    /// every rejection: absent payload, non-leader sender, or a revision
    /// that is not strictly greater than the stored one. Rejections leave
    /// the stored state and revision untouched.
    pub fn apply_state(
        &mut self,
        id: &TableId,
        payload: Option<Value>,
        sender: Option<&ClientId>,
        now: u64,
    ) -> bool {
        let session = self.session_mut(id, now);

        let Some(payload) = payload else {
            tracing::debug!(table = %id.0, "state write dropped: no payload");
            return false;
        };

        if let Some(leader) = &session.leader {
            if sender != Some(leader) {
                tracing::debug!(table = %id.0, leader = %leader.0, "state write dropped: not leader");
                return false;
            }
        }

        let revision = embedded_revision(&payload);
        if revision <= session.revision {
            tracing::debug!(
                table = %id.0,
                offered = revision.0,
                stored = session.revision.0,
                "state write dropped: stale revision"
            );
            return false;
        }

        session.revision = revision;
        session.state = Some(payload);
        session.last_writer = sender.cloned();
        session.last_activity = now;
        true
    }

    /// Summaries of every session idle for at most `ttl`, most recently
    /// active first. Each call produces a fresh iterator over a snapshot.
    pub fn list(&self, now: u64, ttl: Duration) -> impl Iterator<Item = TableSummary> {
        let ttl_ms = millis(ttl);
        let mut items: Vec<TableSummary> = self
            .tables
            .iter()
            .filter(|(_, session)| session.idle(now) <= ttl_ms)
            .map(|(id, session)| TableSummary {
                id: id.clone(),
                last_updated: session.last_activity,
                has_state: session.state.is_some(),
            })
            .collect();
        items.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        items.into_iter()
    }

    /// Delete every session idle longer than `ttl`. Returns the evicted
    /// table IDs for logging.
    pub fn sweep(&mut self, now: u64, ttl: Duration) -> Vec<TableId> {
        let ttl_ms = millis(ttl);
        let expired: Vec<TableId> = self
            .tables
            .iter()
            .filter(|(_, session)| session.idle(now) > ttl_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.tables.remove(id);
        }
        expired
    }
}

/// Extract the revision embedded in a state payload. The documented payload
/// shape keeps it at `payload.table.rev`; a top-level `payload.rev` is
/// accepted as a fallback. Anything missing or non-numeric counts as 0,
/// which can never beat a stored revision.
fn embedded_revision(payload: &Value) -> Revision {
    let rev = payload
        .get("table")
        .and_then(|table| table.get("rev"))
        .or_else(|| payload.get("rev"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Revision(rev)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
