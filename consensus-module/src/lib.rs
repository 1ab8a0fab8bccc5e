//! Consensus module for a replicated state-machine cluster.
//!
//! This crate implements the node-local machinery that turns a set of
//! members into a replicated log: leader election, log replication and
//! commit-index advancement, session and timer bookkeeping that survives
//! leadership changes, and snapshot/recovery orchestration. The messaging
//! transport, the archive that records and replays byte streams, and the
//! co-located service container are all external collaborators, represented
//! here only as the traits in [`transport`] and [`service`].
//!
//! See the [module overview](https://github.com/cluster-rs/consensus-module)
//! for how the pieces fit together:
//!
//! - [`agent`] — the single-threaded cooperative event loop.
//! - [`election`] — the leader-election state machine.
//! - [`recording_log`] — the durable index of leadership terms and snapshots.
//! - [`membership`], [`session`], [`timer`], [`pending`] — state that
//!   survives leadership changes.

pub mod agent;
pub mod clock;
pub mod config;
pub mod consensus_adapter;
pub mod election;
pub mod error;
pub mod log_adapter;
pub mod membership;
pub mod metrics;
pub mod pending;
pub mod quorum;
pub mod recording_log;
pub mod service;
pub mod session;
pub mod snapshot;
pub mod timer;
pub mod transport;
pub mod wire;

pub use agent::ConsensusModuleAgent;
pub use clock::Clock;
pub use clock::IdleStrategy;
pub use config::ConsensusModuleConfig;
pub use election::Election;
pub use error::ClusterError;
pub use error::ClusterEvent;
pub use error::LoopControl;
pub use recording_log::RecordingLog;
pub use recording_log::RecoveryPlan;

/// Identifies a member of the cluster. Stable for the lifetime of the member.
pub type NodeId = u64;

/// Identifies one of the `S` services hosted by the cluster.
pub type ServiceId = u32;

/// A leadership term identifier. Strictly increasing across elections.
pub type LeadershipTermId = u64;

/// A byte offset into the ordered log stream exposed by the transport.
pub type LogPosition = u64;

/// Epoch milliseconds, as supplied by the external clock source.
pub type TimestampMs = i64;

/// A recording identity as assigned by the archive. `-1` is reserved and
/// never a valid id (spec.md §3, RecordingLog.Entry invariants).
pub type RecordingId = i64;

/// Sentinel `recordingId` meaning "no recording", rejected by every
/// [`recording_log::RecordingLog`] append operation.
pub const NULL_RECORDING_ID: RecordingId = -1;

/// Sentinel value meaning "no position recorded yet".
pub const NULL_POSITION: LogPosition = u64::MAX;

/// Identity of the synthetic "consensus module" service used to key the
/// `SERVICE_ID` snapshot apart from per-application-service snapshots.
pub const CONSENSUS_MODULE_SERVICE_ID: ServiceId = u32::MAX;
