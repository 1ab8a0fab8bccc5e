//! The shape of the configuration the agent consumes. Loading it from a CLI
//! or environment is explicitly out of scope (spec.md §1); this module only
//! defines the struct and its defaults, analogous to `async-raft::config`
//! which `async-raft::core::replication` reaches into as `self.core.config`.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// The unit persisted alongside timestamps in snapshots and the recording
/// log, checked for compatibility on load (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Nanos,
    Millis,
}

/// Fsync policy for the recording-log file (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FileSyncLevel {
    /// No explicit sync after a mutation; rely on the OS page cache.
    #[default]
    None = 0,
    /// `fsync` the data only.
    Data = 1,
    /// `fsync` data and metadata.
    DataAndMetadata = 2,
}

/// How many logs since the last snapshot trigger another one, mirroring
/// `async-raft::config::SnapshotPolicy::LogsSinceLast`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    LogsSinceLast(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusModuleConfig {
    /// How long a leader waits without hearing `AppendPosition` from a
    /// quorum of active followers before it enters an election, and how long
    /// a follower waits without seeing its log advance before it does the
    /// same (spec.md §4.1).
    pub leader_heartbeat_timeout: Duration,

    /// Cadence at which a follower sends `AppendPosition` back to the
    /// leader, absent faster sends triggered by position advancement.
    pub leader_heartbeat_interval: Duration,

    /// Cadence of the "slow tick" (archive event poll, session sweep, mark
    /// file refresh).
    pub slow_tick_interval: Duration,

    /// Bound on how long `startupCanvassTimeout` waits for peer responses
    /// during the `CANVASS` election phase.
    pub startup_canvass_timeout: Duration,

    /// Bound on synchronous archive handshakes performed during `on_start`
    /// and catch-up/snapshot (spec.md §5).
    pub archive_connect_timeout: Duration,
    pub archive_message_timeout: Duration,

    /// Session inactivity timeout (spec.md §4.4).
    pub session_timeout: Duration,

    /// Maximum concurrently OPEN client sessions (spec.md §8, S9).
    pub max_concurrent_sessions: usize,

    /// `min(termBufferLength/4, liveAddMaxWindow)`, the near-live window a
    /// follower must close before joining the live log image during catch-up
    /// (spec.md §4.2).
    pub live_add_max_window: u64,
    pub term_buffer_length: u64,

    pub snapshot_policy: SnapshotPolicy,
    pub file_sync_level: FileSyncLevel,
    pub time_unit: TimeUnit,

    /// Version of the running application, checked against persisted
    /// snapshots and `NewLeadershipTerm` messages for compatibility.
    pub app_version: i32,

    pub service_count: u32,
}

impl Default for ConsensusModuleConfig {
    fn default() -> Self {
        Self {
            leader_heartbeat_timeout: Duration::from_secs(10),
            leader_heartbeat_interval: Duration::from_millis(200),
            slow_tick_interval: Duration::from_millis(10),
            startup_canvass_timeout: Duration::from_secs(60),
            archive_connect_timeout: Duration::from_secs(5),
            archive_message_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(10),
            max_concurrent_sessions: 10,
            live_add_max_window: 2 * 1024 * 1024,
            term_buffer_length: 64 * 1024 * 1024,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(10_000),
            file_sync_level: FileSyncLevel::None,
            time_unit: TimeUnit::Millis,
            app_version: 1,
            service_count: 1,
        }
    }
}

impl ConsensusModuleConfig {
    /// `min(termBufferLength/4, liveAddMaxWindow)` (spec.md §4.2).
    pub fn near_live_window(&self) -> u64 {
        std::cmp::min(self.term_buffer_length / 4, self.live_add_max_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn near_live_window_takes_the_smaller_bound() {
        let mut cfg = ConsensusModuleConfig {
            term_buffer_length: 1000,
            live_add_max_window: 100,
            ..Default::default()
        };
        assert_eq!(cfg.near_live_window(), 100);

        cfg.live_add_max_window = 10_000;
        assert_eq!(cfg.near_live_window(), 250);
    }
}
