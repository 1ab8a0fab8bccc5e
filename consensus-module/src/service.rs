//! The co-located service container boundary (spec.md §1, §4.1, §9).
//!
//! The source dispatches to services through a handful of virtual-dispatch
//! callback interfaces (`Listener`/`SnapshotListener` style). spec.md §9
//! flags this for re-architecture: "enumerate the service interactions ...
//! in a single tagged message type over the service channel; avoid virtual
//! dispatch on the hot path." [`ServiceMessage`] is that tagged message;
//! [`ServiceContainer`] is the narrow, fixed-method capability a real
//! service implements to receive it, mirroring how `memstore` implements
//! `RaftStorage` as a closed trait rather than the source's open class
//! hierarchy.

use async_trait::async_trait;

use crate::LogPosition;
use crate::NodeId;
use crate::ServiceId;

/// One service-originated message, fanned out to the service container once
/// its append commits (spec.md §4.1, §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceMessage {
    JoinLog {
        leadership_term_id: u64,
        term_base_log_position: LogPosition,
        log_position: LogPosition,
        timestamp_ms: i64,
        is_startup: bool,
    },
    SnapshotRequest,
    TerminationPosition {
        log_position: LogPosition,
    },
    ClusterMembersResponse {
        correlation_id: i64,
        members: Vec<NodeId>,
    },
    ClusterMembersExtendedResponse {
        correlation_id: i64,
        encoded_members: String,
    },
}

/// The fixed set of calls the consensus module makes into a co-located
/// service (spec.md §9 "Dynamic dispatch over services"). Implementations
/// must not block; every method here corresponds to one row of
/// [`ServiceMessage`].
#[async_trait]
pub trait ServiceContainer: Send + Sync {
    async fn on_join_log(&self, leadership_term_id: u64, term_base_log_position: LogPosition, log_position: LogPosition, timestamp_ms: i64, is_startup: bool);
    async fn on_snapshot_request(&self, service_id: ServiceId);
    async fn on_termination_position(&self, log_position: LogPosition);
    async fn on_cluster_members_response(&self, correlation_id: i64, members: Vec<NodeId>);
    async fn on_cluster_members_extended_response(&self, correlation_id: i64, encoded_members: String);
}

/// Well-known `ack_id` values naming what a [`ServiceAck`] acknowledges
/// (spec.md §4.1): joining the log at recovery, taking a snapshot, or
/// having processed the cluster's termination position.
pub const ACK_ID_JOIN: i64 = 0;
pub const ACK_ID_SNAPSHOT: i64 = 1;
pub const ACK_ID_TERMINATION: i64 = 2;

/// One service's acknowledgement that it processed the log up to
/// `log_position` for the action named by `ack_id` (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceAck {
    pub ack_id: i64,
    pub log_position: LogPosition,
    pub relevant_id: i64,
}

/// One FIFO queue of acks per service; the agent keeps `S` of these.
#[derive(Debug, Clone, Default)]
pub struct ServiceAckQueue {
    acks: std::collections::VecDeque<ServiceAck>,
}

impl ServiceAckQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ack: ServiceAck) {
        self.acks.push_back(ack);
    }

    pub fn pop_front(&mut self) -> Option<ServiceAck> {
        self.acks.pop_front()
    }

    pub fn front(&self) -> Option<&ServiceAck> {
        self.acks.front()
    }
}

/// `ServiceAck.hasReached(logPosition, expectedAckId, queues)`: true iff
/// every queue's head matches `(expected_ack_id, expected_log_position)`
/// (spec.md §4.1). Gates snapshot completion, recovery completion, and
/// termination.
pub fn has_reached(expected_log_position: LogPosition, expected_ack_id: i64, queues: &[ServiceAckQueue]) -> bool {
    queues.iter().all(|q| match q.front() {
        Some(ack) => ack.ack_id == expected_ack_id && ack.log_position == expected_log_position,
        None => false,
    })
}

/// Consumes the matching head ack from every queue once `has_reached` is
/// true, so the next `hasReached` check looks at the next expected action.
pub fn consume_reached(queues: &mut [ServiceAckQueue]) {
    for q in queues.iter_mut() {
        q.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_reached_requires_every_queue_to_match() {
        let mut q0 = ServiceAckQueue::new();
        let mut q1 = ServiceAckQueue::new();
        q0.push(ServiceAck { ack_id: 1, log_position: 100, relevant_id: 0 });
        q1.push(ServiceAck { ack_id: 1, log_position: 100, relevant_id: 0 });
        let queues = [q0.clone(), q1.clone()];
        assert!(has_reached(100, 1, &queues));
        assert!(!has_reached(100, 2, &queues));
        assert!(!has_reached(99, 1, &queues));

        let mut partial = [q0, ServiceAckQueue::new()];
        assert!(!has_reached(100, 1, &partial));
        partial[1].push(ServiceAck { ack_id: 1, log_position: 100, relevant_id: 0 });
        assert!(has_reached(100, 1, &partial));
    }

    #[test]
    fn consume_reached_pops_every_queue_head() {
        let mut q0 = ServiceAckQueue::new();
        q0.push(ServiceAck { ack_id: 1, log_position: 100, relevant_id: 0 });
        q0.push(ServiceAck { ack_id: 2, log_position: 200, relevant_id: 0 });
        let mut queues = [q0];
        consume_reached(&mut queues);
        assert_eq!(queues[0].front().unwrap().ack_id, 2);
    }
}
