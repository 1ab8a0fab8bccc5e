//! `ClusterSession` (spec.md §3, §4.4): the per-client session state machine
//! and its response channel.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::LogPosition;
use crate::NodeId;
use crate::TimestampMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Init,
    Connecting,
    Connected,
    Challenged,
    Authenticated,
    Rejected,
    Open,
    Closing,
    Closed,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionAction {
    Client,
    Backup,
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    ClientAction,
    Timeout,
    ServiceAction,
    AuthenticationRejected,
    AuthorizationRejected,
    StandbySnapshot,
    InvalidVersion,
    SessionLimit,
}

/// A client or control-channel peer, tracked identically on every member
/// once its open event is committed (spec.md §3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSession {
    pub id: i64,
    pub correlation_id: i64,
    pub opened_log_position: Option<LogPosition>,
    pub closed_log_position: Option<LogPosition>,
    pub time_of_last_activity_ns: u64,
    pub state: SessionState,
    pub action: SessionAction,
    pub response_channel: String,
    pub response_stream_id: i32,
    pub close_reason: Option<CloseReason>,
}

impl ClusterSession {
    pub fn new(id: i64, correlation_id: i64, action: SessionAction, response_channel: String, response_stream_id: i32) -> Self {
        Self {
            id,
            correlation_id,
            opened_log_position: None,
            closed_log_position: None,
            time_of_last_activity_ns: 0,
            state: SessionState::Init,
            action,
            response_channel,
            response_stream_id,
            close_reason: None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Open)
    }

    pub fn begin_close(&mut self, log_position: LogPosition, reason: CloseReason) {
        self.state = SessionState::Closing;
        self.closed_log_position = Some(log_position);
        self.close_reason = Some(reason);
    }

    /// Ingress from a session that is not OPEN is dropped (spec.md §4.4).
    pub fn accepts_ingress(&self) -> bool {
        matches!(self.state, SessionState::Open)
    }

    /// Substitutes the endpoint from `client_channel` into `template`, or
    /// returns the client-supplied channel verbatim if no template is
    /// configured (spec.md §4.4). IPC ingress bypasses this entirely and
    /// should not call through this helper.
    pub fn derive_response_channel(template: Option<&str>, client_channel: &str) -> String {
        match template {
            None => client_channel.to_string(),
            Some(tpl) => {
                let endpoint = client_channel
                    .split('|')
                    .find_map(|term| term.strip_prefix("endpoint="))
                    .unwrap_or(client_channel);
                if tpl.contains("{endpoint}") {
                    tpl.replace("{endpoint}", endpoint)
                } else {
                    tpl.to_string()
                }
            }
        }
    }
}

/// The session map, kept insertion-sorted by id for deterministic
/// snapshotting (spec.md §3: "Sessions are insertion-sorted by `id`").
#[derive(Debug, Clone, Default)]
pub struct SessionTable {
    sessions: BTreeMap<i64, ClusterSession>,
    next_session_id: i64,
    timed_out_client_count: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next monotonic session id. Only the leader calls this
    /// (spec.md §3: "Ids are monotonic, assigned only by the leader").
    pub fn next_session_id(&mut self) -> i64 {
        let id = self.next_session_id;
        self.next_session_id += 1;
        id
    }

    pub fn restore_next_session_id(&mut self, next: i64) {
        self.next_session_id = std::cmp::max(self.next_session_id, next);
    }

    pub fn insert(&mut self, session: ClusterSession) {
        self.next_session_id = std::cmp::max(self.next_session_id, session.id + 1);
        self.sessions.insert(session.id, session);
    }

    pub fn get(&self, id: i64) -> Option<&ClusterSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut ClusterSession> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: i64) -> Option<ClusterSession> {
        self.sessions.remove(&id)
    }

    /// Sessions in insertion (id) order, for snapshotting.
    pub fn in_order(&self) -> impl Iterator<Item = &ClusterSession> {
        self.sessions.values()
    }

    pub fn open_and_closing(&self) -> impl Iterator<Item = &ClusterSession> {
        self.sessions
            .values()
            .filter(|s| matches!(s.state, SessionState::Open | SessionState::Closing))
    }

    pub fn open_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_open()).count()
    }

    pub fn timed_out_client_count(&self) -> u64 {
        self.timed_out_client_count
    }

    /// Sweep sessions whose close event has committed past `commit_position`
    /// out of the table entirely (spec.md §3, §4.4).
    pub fn sweep_closed(&mut self, commit_position: LogPosition) -> Vec<i64> {
        let mut removed = Vec::new();
        self.sessions.retain(|id, s| {
            let gone = matches!(s.state, SessionState::Closing) && s.closed_log_position.map(|p| p <= commit_position).unwrap_or(false);
            if gone {
                removed.push(*id);
            }
            !gone
        });
        removed
    }

    /// Finds sessions that have been idle longer than `timeout_ns` and are
    /// not still `Init`, closing them with `CloseReason::Timeout` and
    /// incrementing the counter by exactly one per session (spec.md §8, S10).
    pub fn expire_idle(&mut self, now_ns: u64, timeout_ns: u64, log_position: LogPosition) -> Vec<i64> {
        let mut expired = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            if matches!(session.state, SessionState::Init | SessionState::Closing | SessionState::Closed) {
                continue;
            }
            if now_ns.saturating_sub(session.time_of_last_activity_ns) > timeout_ns {
                session.begin_close(log_position, CloseReason::Timeout);
                self.timed_out_client_count += 1;
                expired.push(*id);
            }
        }
        expired
    }
}

/// Outcome of the recovered-app-version check applied to a persisted
/// snapshot/timestamp, used from `snapshot.rs` (spec.md §4.7).
pub fn time_is_plausible(ts: TimestampMs) -> bool {
    ts >= 0
}

/// Authentication/authorization rejection details surfaced to the client as
/// `EventCode.ERROR` (spec.md §7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRejection {
    InvalidVersion,
    SessionLimit,
    AuthenticationFailed(String),
    AuthorizationFailed(String),
}

impl SessionRejection {
    pub fn message(&self) -> String {
        match self {
            SessionRejection::InvalidVersion => "SESSION_INVALID_VERSION_MSG".to_string(),
            SessionRejection::SessionLimit => "SESSION_LIMIT_MSG".to_string(),
            SessionRejection::AuthenticationFailed(detail) => format!("authentication failed: {detail}"),
            SessionRejection::AuthorizationFailed(detail) => format!("authorization failed: {detail}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: i64) -> ClusterSession {
        ClusterSession::new(id, id, SessionAction::Client, "aeron:udp?endpoint=localhost:9000".into(), 10)
    }

    #[test]
    fn session_ids_insertion_sorted() {
        let mut table = SessionTable::new();
        table.insert(session(5));
        table.insert(session(1));
        table.insert(session(3));
        let ids: Vec<i64> = table.in_order().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[test]
    fn idle_session_is_closed_with_timeout_reason_once() {
        let mut table = SessionTable::new();
        let mut s = session(1);
        s.state = SessionState::Open;
        s.time_of_last_activity_ns = 0;
        table.insert(s);

        let expired = table.expire_idle(1_000_000_000, 500_000_000, 42);
        assert_eq!(expired, vec![1]);
        assert_eq!(table.timed_out_client_count(), 1);
        assert_eq!(table.get(1).unwrap().close_reason, Some(CloseReason::Timeout));

        // Second poll must not double count: session is now Closing and skipped.
        let expired_again = table.expire_idle(2_000_000_000, 500_000_000, 42);
        assert!(expired_again.is_empty());
        assert_eq!(table.timed_out_client_count(), 1);
    }

    #[test]
    fn non_open_session_ingress_is_dropped() {
        let s = session(1);
        assert!(!s.accepts_ingress());
    }

    #[test]
    fn response_channel_substitution() {
        let client = "aeron:udp?endpoint=10.0.0.5:9001";
        let derived = ClusterSession::derive_response_channel(Some("aeron:udp?endpoint={endpoint}|term-length=64k"), client);
        assert_eq!(derived, "aeron:udp?endpoint=10.0.0.5:9001|term-length=64k");

        let verbatim = ClusterSession::derive_response_channel(None, client);
        assert_eq!(verbatim, client);
    }
}
