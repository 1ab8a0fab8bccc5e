//! `PendingServiceMessageTracker`, one per service (spec.md §4.5).
//!
//! Holds service-originated messages the co-located service emitted
//! speculatively before they were logged. Each gets a synthetic
//! `clusterSessionId = encodeService(serviceId, nextServiceSessionId)`.

use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

use crate::LogPosition;
use crate::ServiceId;

/// High bit marks a session id as service-originated rather than
/// client-originated, leaving the low 32 bits for the per-service sequence
/// and the next 32 for the service id.
const SERVICE_SESSION_TAG: i64 = 1 << 62;

pub fn encode_service_session_id(service_id: ServiceId, sequence: u32) -> i64 {
    SERVICE_SESSION_TAG | ((service_id as i64) << 32) | sequence as i64
}

pub fn decode_service_session_id(id: i64) -> Option<(ServiceId, u32)> {
    if id & SERVICE_SESSION_TAG == 0 {
        return None;
    }
    let payload = id & !SERVICE_SESSION_TAG;
    let service_id = (payload >> 32) as ServiceId;
    let sequence = payload as u32;
    Some((service_id, sequence))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingServiceMessage {
    pub cluster_session_id: i64,
    pub body: Vec<u8>,
    /// Set once the message has been appended to the log; `None` while it is
    /// still only held speculatively in the tracker.
    pub append_position: Option<LogPosition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingServiceMessageTracker {
    pub service_id: ServiceId,
    pending: VecDeque<PendingServiceMessage>,

    /// Next sequence number to assign to a newly-enqueued message.
    next_service_session_id: u32,

    /// Furthest sequence number observed replayed from the log with this
    /// service's tag (spec.md §4.5 invariant:
    /// `logServiceSessionId < nextServiceSessionId`).
    log_service_session_id: u32,
}

impl PendingServiceMessageTracker {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            service_id,
            pending: VecDeque::new(),
            next_service_session_id: 0,
            log_service_session_id: 0,
        }
    }

    /// The service emitted a message speculatively; assign it a synthetic
    /// session id and hold it until it is appended.
    pub fn enqueue(&mut self, body: Vec<u8>) -> i64 {
        let sequence = self.next_service_session_id;
        self.next_service_session_id += 1;
        let cluster_session_id = encode_service_session_id(self.service_id, sequence);
        self.pending.push_back(PendingServiceMessage {
            cluster_session_id,
            body,
            append_position: None,
        });
        cluster_session_id
    }

    pub fn mark_appended(&mut self, cluster_session_id: i64, append_position: LogPosition) {
        if let Some(m) = self.pending.iter_mut().find(|m| m.cluster_session_id == cluster_session_id) {
            m.append_position = Some(append_position);
        }
    }

    /// Sweep entries whose append position is `<= commit_position`
    /// (spec.md §4.1, §4.5).
    pub fn sweep_committed(&mut self, commit_position: LogPosition) -> usize {
        let before = self.pending.len();
        self.pending.retain(|m| match m.append_position {
            Some(p) => p > commit_position,
            None => true,
        });
        before - self.pending.len()
    }

    /// On a role change to follower, uncommitted entries must be restored
    /// (re-enqueued) because the new leader may resend them: clear their
    /// append position so they are considered unsent again (spec.md §4.5).
    pub fn restore_uncommitted_on_role_change(&mut self) {
        for m in self.pending.iter_mut() {
            m.append_position = None;
        }
    }

    /// On follower replay, a message observed in the log whose
    /// `clusterSessionId` decodes to this tracker's service id advances
    /// `logServiceSessionId` (spec.md §4.5).
    pub fn observe_replayed(&mut self, cluster_session_id: i64) {
        if let Some((service_id, sequence)) = decode_service_session_id(cluster_session_id) {
            if service_id == self.service_id {
                self.log_service_session_id = self.log_service_session_id.max(sequence + 1);
                self.next_service_session_id = self.next_service_session_id.max(sequence + 1);
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_count(&self) -> u32 {
        self.next_service_session_id.saturating_sub(self.log_service_session_id)
    }

    pub fn log_service_session_id(&self) -> u32 {
        self.log_service_session_id
    }

    pub fn next_service_session_id(&self) -> u32 {
        self.next_service_session_id
    }

    /// `logServiceSessionId < nextServiceSessionId`, and the difference
    /// equals the number of in-flight entries (spec.md §4.5 invariant).
    /// Run after a snapshot load.
    pub fn verify(&self) -> Result<(), String> {
        if self.log_service_session_id as i64 > self.next_service_session_id as i64 {
            return Err(format!(
                "service {}: logServiceSessionId {} exceeds nextServiceSessionId {}",
                self.service_id, self.log_service_session_id, self.next_service_session_id
            ));
        }
        let expected_in_flight = (self.next_service_session_id - self.log_service_session_id) as usize;
        if self.pending.len() != expected_in_flight {
            return Err(format!(
                "service {}: {} pending entries but logServiceSessionId/nextServiceSessionId imply {}",
                self.service_id,
                self.pending.len(),
                expected_in_flight
            ));
        }
        Ok(())
    }

    pub fn pending_messages(&self) -> impl Iterator<Item = &PendingServiceMessage> {
        self.pending.iter()
    }

    pub fn restore_from_snapshot(
        service_id: ServiceId,
        pending: VecDeque<PendingServiceMessage>,
        next_service_session_id: u32,
        log_service_session_id: u32,
    ) -> Self {
        Self {
            service_id,
            pending,
            next_service_session_id,
            log_service_session_id,
        }
    }
}
