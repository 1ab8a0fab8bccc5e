//! Error taxonomy (spec.md §7).
//!
//! `ClusterEvent` is a non-fatal anomaly: it is logged, may force an
//! election, but the node keeps running. `ClusterException` carries a
//! violated invariant and is always fatal. `ClusterTerminationException` in
//! the source is replaced here, per spec.md §9's redesign note, with an
//! explicit [`LoopControl`] value returned from
//! [`crate::agent::ConsensusModuleAgent::do_work`] instead of being thrown.

use thiserror::Error;

use crate::LeadershipTermId;
use crate::NodeId;
use crate::RecordingId;

/// Non-fatal anomalies. Logged via `tracing`, may transition the node into
/// an election, never terminate the process on their own.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    #[error("catchup replay stopped for member {member_id} at position {position}")]
    CatchupReplayStopped { member_id: NodeId, position: u64 },

    #[error("inactive follower quorum: only {active} of {required} required active followers responded recently")]
    InactiveFollowerQuorum { active: usize, required: usize },

    #[error("log disconnected from leader: last update {elapsed_ns}ns ago exceeds timeout {timeout_ns}ns")]
    LogDisconnectedFromLeader { elapsed_ns: u64, timeout_ns: u64 },

    #[error("unexpected vote request from member {candidate} at term {candidate_term}")]
    UnexpectedVoteRequest { candidate: NodeId, candidate_term: LeadershipTermId },

    #[error("archive replay stopped unexpectedly for recording {recording_id}")]
    UnknownReplayStopped { recording_id: RecordingId },
}

/// Fatal conditions: an invariant was violated, or a bounded synchronous
/// handshake with the archive timed out. After logging these and writing the
/// mark file / termination position, the node must terminate (§7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterException {
    #[error("incompatible app version in {what}: running {running}, found {found}")]
    IncompatibleAppVersion { what: &'static str, running: i32, found: i32 },

    #[error("incompatible time unit in {what}: running {running:?}, found {found:?}")]
    IncompatibleTimeUnit {
        what: &'static str,
        running: crate::config::TimeUnit,
        found: crate::config::TimeUnit,
    },

    #[error("duplicate TERM entry for leadershipTermId {term_id}: existing recordingId {existing}, new {new}")]
    DuplicateTerm {
        term_id: LeadershipTermId,
        existing: RecordingId,
        new: RecordingId,
    },

    #[error("archive out of storage space")]
    ArchiveStorageSpace,

    #[error("synchronous archive handshake timed out after {elapsed_ns}ns (limit {limit_ns}ns)")]
    ArchiveHandshakeTimeout { elapsed_ns: u64, limit_ns: u64 },

    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Carries a boxed external error (archive client, I/O) across an interface
/// boundary without losing its message, the way `openraft::AnyError` wraps
/// storage-backend errors in its in-memory reference store.
pub type AnyError = anyerror::AnyError;

/// Top-level error returned by fallible operations in this crate that are
/// not already scoped to a narrower error type (`RecordingLogError`,
/// `SnapshotError`, `SessionError`, `ElectionError`).
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Event(#[from] ClusterEvent),

    #[error(transparent)]
    Fatal(#[from] ClusterException),

    #[error(transparent)]
    RecordingLog(#[from] crate::recording_log::RecordingLogError),

    #[error(transparent)]
    Snapshot(#[from] crate::snapshot::SnapshotError),

    #[error("archive error: {0}")]
    Archive(AnyError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The result of one `do_work()` tick: either the loop continues, or it must
/// stop, with `expected` distinguishing a requested shutdown from an
/// executor failure (spec.md §9, replacing `ClusterTerminationException` and
/// `AgentTerminationException`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Terminate { expected: bool },
}

impl LoopControl {
    pub fn is_terminate(&self) -> bool {
        matches!(self, LoopControl::Terminate { .. })
    }
}
