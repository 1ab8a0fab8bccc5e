//! `LogPublisher` / `LogAdapter` (spec.md §2): serializes cluster events into
//! the log stream on the leader; deserializes them for replay or follow on
//! every member. This is the framing layer for the events the service
//! container ultimately observes in order (spec.md §5 "Ordering
//! guarantees").

use serde::Deserialize;
use serde::Serialize;
use tracing::trace;

use crate::transport::FragmentAction;
use crate::transport::Image;
use crate::transport::OfferError;
use crate::transport::Publication;
use crate::LeadershipTermId;
use crate::LogPosition;
use crate::NodeId;
use crate::TimestampMs;

/// Every kind of event the leader appends to the log stream and every
/// member replays in position order (spec.md §3 Lifecycle, §4 passim).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogFrame {
    SessionOpen {
        cluster_session_id: i64,
        correlation_id: i64,
        timestamp_ms: TimestampMs,
        response_stream_id: i32,
        response_channel: String,
    },
    SessionClose {
        cluster_session_id: i64,
        timestamp_ms: TimestampMs,
        close_reason: crate::session::CloseReason,
    },
    SessionKeepAlive {
        cluster_session_id: i64,
    },
    ServiceMessage {
        cluster_session_id: i64,
        timestamp_ms: TimestampMs,
        body: Vec<u8>,
    },
    ClientRequest {
        cluster_session_id: i64,
        correlation_id: i64,
        timestamp_ms: TimestampMs,
        body: Vec<u8>,
    },
    TimerEvent {
        correlation_id: i64,
    },
    NewLeadershipTermEvent {
        leadership_term_id: LeadershipTermId,
        term_base_log_position: LogPosition,
        log_position: LogPosition,
        timestamp_ms: TimestampMs,
        app_version: i32,
        is_startup: bool,
    },
    ClusterAction {
        leadership_term_id: LeadershipTermId,
        action: ClusterActionKind,
    },
    MembershipChange {
        member_id: NodeId,
        change: MembershipChangeKind,
        removal_position: Option<LogPosition>,
    },
    TerminationPosition {
        leadership_term_id: LeadershipTermId,
        log_position: LogPosition,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterActionKind {
    Suspend,
    Resume,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChangeKind {
    Join,
    Quit,
}

impl LogFrame {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("LogFrame serializes")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// The synthetic service-session id a frame carries, if it has one
    /// (spec.md §4.5, used by `PendingServiceMessageTracker::observe_replayed`).
    pub fn cluster_session_id(&self) -> Option<i64> {
        match self {
            LogFrame::SessionOpen { cluster_session_id, .. }
            | LogFrame::SessionClose { cluster_session_id, .. }
            | LogFrame::SessionKeepAlive { cluster_session_id }
            | LogFrame::ServiceMessage { cluster_session_id, .. }
            | LogFrame::ClientRequest { cluster_session_id, .. } => Some(*cluster_session_id),
            _ => None,
        }
    }
}

/// Serializes outbound frames onto the leader's log publication in strict
/// order (spec.md §5).
pub struct LogPublisher<P: Publication> {
    publication: P,
}

impl<P: Publication> LogPublisher<P> {
    pub fn new(publication: P) -> Self {
        Self { publication }
    }

    #[tracing::instrument(level = "trace", skip(self, frame))]
    pub fn append(&mut self, frame: &LogFrame) -> Result<i64, OfferError> {
        let bytes = frame.encode();
        trace!(len = bytes.len(), "append log frame");
        self.publication.offer(&bytes)
    }

    pub fn position(&self) -> u64 {
        self.publication.position()
    }
}

/// Deserializes the log image for replay (recovery) or live follow, for a
/// single service's view of the stream (spec.md §4.5 "On follower replay").
pub struct LogAdapter<I: Image> {
    image: I,
}

impl<I: Image> LogAdapter<I> {
    pub fn new(image: I) -> Self {
        Self { image }
    }

    /// Polls frames up to `limit_position` (inclusive), handing each to
    /// `handler` in position order; returns how many frames were delivered
    /// (spec.md §4.1 "poll the log adapter up to
    /// `min(notifiedCommit, localAppend)`").
    #[tracing::instrument(level = "trace", skip(self, handler))]
    pub fn poll_up_to(&mut self, limit_position: u64, fragment_limit: usize, handler: &mut dyn FnMut(LogFrame, u64)) -> usize {
        if self.image.position() >= limit_position {
            return 0;
        }
        self.image.poll(fragment_limit, &mut |bytes, position| {
            if position > limit_position {
                return FragmentAction::Abort;
            }
            match LogFrame::decode(bytes) {
                Ok(frame) => {
                    handler(frame, position);
                    FragmentAction::Continue
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode log frame, skipping fragment");
                    FragmentAction::Continue
                }
            }
        })
    }

    pub fn position(&self) -> u64 {
        self.image.position()
    }

    pub fn join_position(&self) -> u64 {
        self.image.join_position()
    }

    pub fn end_position(&self) -> u64 {
        self.image.end_position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let frame = LogFrame::TimerEvent { correlation_id: 42 };
        let bytes = frame.encode();
        assert_eq!(LogFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn cluster_session_id_extracted_where_present() {
        let frame = LogFrame::ServiceMessage {
            cluster_session_id: 7,
            timestamp_ms: 0,
            body: vec![],
        };
        assert_eq!(frame.cluster_session_id(), Some(7));
        assert_eq!(LogFrame::TimerEvent { correlation_id: 1 }.cluster_session_id(), None);
    }
}
