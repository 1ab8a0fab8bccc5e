//! The messaging transport and archive contracts this module consumes but
//! does not implement (spec.md §1 Scope, §6 External Interfaces). Modeled as
//! traits so the agent, election, and adapters can be driven in tests
//! without a real transport or archive, the way `RaftNetwork`
//! and `RaftStorage` traits let `async-raft::core` run against an in-memory store.

use async_trait::async_trait;

use crate::error::AnyError;
use crate::RecordingId;

/// A negative `offer` result from the underlying transport (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferError {
    NotConnected,
    BackPressured,
    AdminAction,
    MaxPositionExceeded,
    Closed,
}

pub type OfferResult = Result<i64, OfferError>;

/// What a fragment handler instructs the poller to do next (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentAction {
    Continue,
    Abort,
    Break,
    Commit,
}

/// A reliable, position-addressed, byte-oriented publication (spec.md §6).
/// Implementations are non-blocking: `offer` always returns immediately.
pub trait Publication: Send {
    fn offer(&mut self, buffer: &[u8]) -> OfferResult;
    fn position(&self) -> u64;
    fn is_connected(&self) -> bool;
}

/// A reliable, position-addressed, byte-oriented subscription image
/// (spec.md §6). `position()` is monotonic; `join_position()` and
/// `end_position()` bound the image.
pub trait Image: Send {
    fn position(&self) -> u64;
    fn join_position(&self) -> u64;
    fn end_position(&self) -> u64;
    fn is_closed(&self) -> bool;

    /// Polls up to `fragment_limit` fragments, invoking `handler` with each
    /// frame's bytes and the image's position immediately after that frame;
    /// returns the number of fragments actually polled. A handler returning
    /// `FragmentAction::Abort` or `Break` stops the poll early without losing
    /// the frame that triggered it. The position is passed alongside the
    /// bytes (rather than queried back through `position()`) so callers can
    /// act on it from within the handler without re-borrowing the image.
    fn poll(&mut self, fragment_limit: usize, handler: &mut dyn FnMut(&[u8], u64) -> FragmentAction) -> usize;
}

/// Storage location hint passed to `start_recording` (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLocation {
    Local,
    Remote,
}

/// Recording lifecycle signals delivered asynchronously by the archive
/// (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingSignal {
    Start,
    Stop,
    Merge,
    Replicate,
    Extend,
    Delete,
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingSignalEvent {
    pub recording_id: RecordingId,
    pub subscription_id: i64,
    pub position: u64,
    pub signal: RecordingSignal,
}

/// Records a stream to stable storage and replays it from any position
/// (spec.md §1, §6). Out of scope to implement; consumed as an interface.
/// Every call is a bounded synchronous handshake per spec.md §5 and must
/// complete within `messageTimeout`/`connectTimeout` or the caller treats it
/// as a `TimeoutException` (spec.md §7).
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    async fn start_recording(&self, channel: &str, stream_id: i32, source: SourceLocation) -> Result<i64, AnyError>;
    async fn extend_recording(&self, recording_id: RecordingId, channel: &str, stream_id: i32, source: SourceLocation) -> Result<i64, AnyError>;
    async fn stop_recording(&self, subscription_id: i64) -> Result<(), AnyError>;
    async fn truncate_recording(&self, recording_id: RecordingId, position: u64) -> Result<(), AnyError>;
    async fn start_replay(&self, recording_id: RecordingId, start_position: u64, length: i64, channel: &str, stream_id: i32) -> Result<i64, AnyError>;
    async fn stop_replay(&self, replay_session_id: i64) -> Result<(), AnyError>;
    async fn get_stop_position(&self, recording_id: RecordingId) -> Result<u64, AnyError>;
    async fn purge_segments(&self, recording_id: RecordingId, new_start_position: u64) -> Result<(), AnyError>;
    async fn detach_segments(&self, recording_id: RecordingId, new_start_position: u64) -> Result<(), AnyError>;
    async fn attach_segments(&self, recording_id: RecordingId) -> Result<(), AnyError>;
    async fn delete_detached_segments(&self, recording_id: RecordingId) -> Result<(), AnyError>;
    async fn migrate_segments(&self, src_recording_id: RecordingId, dst_recording_id: RecordingId) -> Result<(), AnyError>;
    async fn list_recording(&self, recording_id: RecordingId) -> Result<Option<RecordingDescriptor>, AnyError>;

    /// Drains any recording-signal events received since the last poll
    /// (non-blocking, part of the agent's "slow tick", spec.md §4.1).
    fn poll_signals(&self) -> Vec<RecordingSignalEvent>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingDescriptor {
    pub recording_id: RecordingId,
    pub start_position: u64,
    pub stop_position: Option<u64>,
    pub source_identity: String,
}
