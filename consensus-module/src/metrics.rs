//! Read-only counters exposed to operators (spec.md §3, §5).
//!
//! These stand in for the shared-memory counters of the source system. The
//! source notes they "live in shared memory and are accessed only through
//! the platform's atomic ordered loads/stores" (spec.md §5); here they are
//! plain `Atomic*` fields behind an `Arc`, updated with release semantics on
//! write and acquire on read so a reader on another thread never observes a
//! torn value, matching the ordering guarantee spec.md calls out explicitly
//! for `moduleState`, `role`, and `commitPosition`.

use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::LogPosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ModuleState {
    Init = 0,
    Active = 1,
    Suspended = 2,
    Snapshot = 3,
    Terminating = 4,
    Quitting = 5,
    Closed = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ClusterRole {
    Follower = 0,
    Candidate = 1,
    Leader = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ControlToggle {
    Neutral = 0,
    Suspend = 1,
    Resume = 2,
    SnapshotRequest = 3,
    Shutdown = 4,
    Abort = 5,
}

impl ControlToggle {
    fn from_i32(v: i32) -> Self {
        match v {
            1 => ControlToggle::Suspend,
            2 => ControlToggle::Resume,
            3 => ControlToggle::SnapshotRequest,
            4 => ControlToggle::Shutdown,
            5 => ControlToggle::Abort,
            _ => ControlToggle::Neutral,
        }
    }
}

#[derive(Debug)]
struct Inner {
    module_state: AtomicI32,
    cluster_role: AtomicI32,
    commit_position: AtomicU64,
    control_toggle: AtomicI32,
    snapshot_counter: AtomicI64,
    timed_out_client_counter: AtomicI64,
    query_deadline_counter: AtomicI64,
}

/// Cheap-to-clone handle to the node's operator-visible counters.
#[derive(Debug, Clone)]
pub struct Counters(Arc<Inner>);

impl Counters {
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            module_state: AtomicI32::new(ModuleState::Init as i32),
            cluster_role: AtomicI32::new(ClusterRole::Follower as i32),
            commit_position: AtomicU64::new(0),
            control_toggle: AtomicI32::new(ControlToggle::Neutral as i32),
            snapshot_counter: AtomicI64::new(0),
            timed_out_client_counter: AtomicI64::new(0),
            query_deadline_counter: AtomicI64::new(0),
        }))
    }

    pub fn set_module_state(&self, state: ModuleState) {
        self.0.module_state.store(state as i32, Ordering::Release);
    }

    pub fn module_state(&self) -> i32 {
        self.0.module_state.load(Ordering::Acquire)
    }

    pub fn set_cluster_role(&self, role: ClusterRole) {
        self.0.cluster_role.store(role as i32, Ordering::Release);
    }

    pub fn cluster_role(&self) -> i32 {
        self.0.cluster_role.load(Ordering::Acquire)
    }

    /// Commit position is monotone non-decreasing (spec.md §8, invariant 1).
    /// This setter enforces that at the single writer (the agent).
    pub fn set_commit_position(&self, position: LogPosition) {
        let prev = self.0.commit_position.load(Ordering::Acquire);
        debug_assert!(position >= prev, "commit position must never move backwards");
        self.0.commit_position.store(position.max(prev), Ordering::Release);
    }

    pub fn commit_position(&self) -> LogPosition {
        self.0.commit_position.load(Ordering::Acquire)
    }

    /// Operator-facing write: requests the next control action.
    pub fn request_toggle(&self, toggle: ControlToggle) {
        self.0.control_toggle.store(toggle as i32, Ordering::Release);
    }

    pub fn control_toggle(&self) -> ControlToggle {
        ControlToggle::from_i32(self.0.control_toggle.load(Ordering::Acquire))
    }

    /// Auto-reset to `NEUTRAL` once the leader has reflected the action in
    /// state (spec.md §4.1).
    pub fn reset_toggle(&self) {
        self.0.control_toggle.store(ControlToggle::Neutral as i32, Ordering::Release);
    }

    pub fn increment_snapshot_counter(&self) {
        self.0.snapshot_counter.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot_counter(&self) -> i64 {
        self.0.snapshot_counter.load(Ordering::Acquire)
    }

    pub fn increment_timed_out_client_counter(&self) {
        self.0.timed_out_client_counter.fetch_add(1, Ordering::AcqRel);
    }

    pub fn timed_out_client_counter(&self) -> i64 {
        self.0.timed_out_client_counter.load(Ordering::Acquire)
    }

    pub fn increment_query_deadline_counter(&self) {
        self.0.query_deadline_counter.fetch_add(1, Ordering::AcqRel);
    }

    pub fn query_deadline_counter(&self) -> i64 {
        self.0.query_deadline_counter.load(Ordering::Acquire)
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_round_trips_and_resets() {
        let counters = Counters::new();
        counters.request_toggle(ControlToggle::SnapshotRequest);
        assert_eq!(counters.control_toggle(), ControlToggle::SnapshotRequest);
        counters.reset_toggle();
        assert_eq!(counters.control_toggle(), ControlToggle::Neutral);
    }

    #[test]
    fn commit_position_never_regresses_under_debug_assertions() {
        let counters = Counters::new();
        counters.set_commit_position(10);
        counters.set_commit_position(20);
        assert_eq!(counters.commit_position(), 20);
    }
}
