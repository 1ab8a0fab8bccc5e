//! `ConsensusModuleAgent` (spec.md §4.1): the single-threaded cooperative
//! event loop that ties every other module together for one node.
//!
//! Generic over its six collaborators the way `async-raft::core::RaftCore`
//! is generic over `<D, R, N: RaftNetwork<D>, S: RaftStorage<D, R>>`: the
//! network/archive/service-container boundaries are traits so this module
//! can be driven in tests without a real transport, archive, or co-located
//! service (see [`crate::transport`], [`crate::service`]).

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::clock::Clock;
use crate::config::ConsensusModuleConfig;
use crate::consensus_adapter::ConsensusAdapter;
use crate::consensus_adapter::ConsensusPublisher;
use crate::election::Election;
use crate::election::ElectionError;
use crate::election::ElectionOutcome;
use crate::election::ElectionState;
use crate::election::LogExtent;
use crate::error::ClusterError;
use crate::error::ClusterEvent;
use crate::log_adapter::LogAdapter;
use crate::log_adapter::LogFrame;
use crate::log_adapter::LogPublisher;
use crate::membership::ClusterMemberTable;
use crate::metrics::ClusterRole;
use crate::metrics::ControlToggle;
use crate::metrics::Counters;
use crate::metrics::ModuleState;
use crate::pending::PendingServiceMessageTracker;
use crate::quorum;
use crate::recording_log::RecordingLog;
use crate::service::has_reached;
use crate::service::ServiceAck;
use crate::service::ServiceAckQueue;
use crate::service::ServiceContainer;
use crate::session::SessionTable;
use crate::timer::TimerService;
use crate::transport::ArchiveClient;
use crate::transport::Image;
use crate::transport::Publication;
use crate::wire::AppendPosition;
use crate::wire::AppendPositionFlags;
use crate::wire::CanvassPosition;
use crate::wire::CommitPosition;
use crate::wire::ConsensusMessage;
use crate::wire::HeartbeatRequest;
use crate::wire::NewLeadershipTerm;
use crate::wire::RequestVote;
use crate::wire::TerminationAck;
use crate::wire::TerminationPosition;
use crate::wire::Vote;
use crate::wire::CURRENT_PROTOCOL_VERSION;
use crate::LeadershipTermId;
use crate::LogPosition;
use crate::LoopControl;
use crate::NodeId;
use crate::RecordingId;
use crate::CONSENSUS_MODULE_SERVICE_ID;

/// Bookkeeping the agent threads through every tick but that doesn't belong
/// on any single other module (spec.md §4.1).
struct LeaderBook {
    leadership_term_id: LeadershipTermId,
    term_base_log_position: LogPosition,
    last_heartbeat_sent_ns: u64,
    leader_recording_id: RecordingId,
}

/// Where this node is in the cooperative termination protocol (spec.md §4.1
/// "On termination", §5). Only the leader drives phases one and three; a
/// follower (and the leader itself, once it has broadcast the position)
/// only needs `AwaitingLocalAck`.
enum TerminationState {
    /// Leader only: waiting for every service to ack the snapshot requested
    /// on entering termination.
    LeaderAwaitingSnapshot { snapshot_log_position: LogPosition },
    /// Waiting for this node's own co-located service(s) to ack the
    /// termination position before this node's `TerminationAck` goes out.
    AwaitingLocalAck { log_position: LogPosition },
    /// Leader only: collecting `TerminationAck`s until a quorum (including
    /// itself) has acknowledged `log_position`.
    LeaderAwaitingQuorum { log_position: LogPosition, acked: std::collections::HashSet<NodeId> },
}

pub struct ConsensusModuleAgent<C, A, S, CP, CI, LP, LI>
where
    C: Clock,
    A: ArchiveClient,
    S: ServiceContainer,
    CP: Publication,
    CI: Image,
    LP: Publication,
    LI: Image,
{
    config: ConsensusModuleConfig,
    clock: C,
    archive: A,
    service: S,
    counters: Counters,

    local_member_id: NodeId,
    members: ClusterMemberTable,
    recording_log: RecordingLog,
    sessions: SessionTable,
    timers: TimerService,
    pending: Vec<PendingServiceMessageTracker>,
    service_ack_queues: Vec<ServiceAckQueue>,

    election: Option<Election>,
    leader_book: Option<LeaderBook>,
    leadership_term_id: LeadershipTermId,
    commit_position: LogPosition,
    local_append_position: LogPosition,
    catchup_replay_session_id: Option<i64>,
    termination: Option<TerminationState>,

    consensus_publisher: ConsensusPublisher<CP>,
    consensus_adapter: ConsensusAdapter<CI>,
    log_publisher: LogPublisher<LP>,
    log_adapter: LogAdapter<LI>,

    last_slow_tick_ns: u64,
    time_of_last_log_progress_ns: u64,
    last_canvass_broadcast_ns: u64,
}

impl<C, A, S, CP, CI, LP, LI> ConsensusModuleAgent<C, A, S, CP, CI, LP, LI>
where
    C: Clock,
    A: ArchiveClient,
    S: ServiceContainer,
    CP: Publication,
    CI: Image,
    LP: Publication,
    LI: Image,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConsensusModuleConfig,
        clock: C,
        archive: A,
        service: S,
        local_member_id: NodeId,
        members: ClusterMemberTable,
        recording_log: RecordingLog,
        consensus_publication: CP,
        consensus_image: CI,
        log_publication: LP,
        log_image: LI,
    ) -> Self {
        let service_count = config.service_count as usize;
        Self {
            config,
            clock,
            archive,
            service,
            counters: Counters::new(),
            local_member_id,
            members,
            recording_log,
            sessions: SessionTable::new(),
            timers: TimerService::new(),
            pending: (0..service_count as u32).map(PendingServiceMessageTracker::new).collect(),
            service_ack_queues: (0..service_count).map(|_| ServiceAckQueue::new()).collect(),
            election: None,
            leader_book: None,
            leadership_term_id: 0,
            commit_position: 0,
            local_append_position: 0,
            catchup_replay_session_id: None,
            termination: None,
            consensus_publisher: ConsensusPublisher::new(consensus_publication),
            consensus_adapter: ConsensusAdapter::new(consensus_image),
            log_publisher: LogPublisher::new(log_publication),
            log_adapter: LogAdapter::new(log_image),
            last_slow_tick_ns: 0,
            time_of_last_log_progress_ns: 0,
            last_canvass_broadcast_ns: 0,
        }
    }

    pub fn counters(&self) -> Counters {
        self.counters.clone()
    }

    /// Recovers state from the recording log and enters the election state
    /// machine (spec.md §4.1 "On start"). A fresh node with no TERM entries
    /// re-enters at `CANVASS` the same as a restarting one; the distinction
    /// only matters for whether `isStartup` is set on the eventual
    /// `NewLeadershipTerm` (spec.md §4.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn on_start(&mut self) -> Result<(), ClusterError> {
        self.recording_log.reload()?;
        self.counters.set_module_state(ModuleState::Init);

        if let Some(term) = self.recording_log.find_last_term() {
            self.leadership_term_id = term.leadership_term_id;
            self.local_append_position = term.log_position;
        }

        let log_recording_id = self.recording_log.find_last_term_recording_id().unwrap_or(crate::NULL_RECORDING_ID);
        let plan = self
            .recording_log
            .create_recovery_plan(&self.archive, self.config.service_count, log_recording_id)
            .await?;
        debug!(appended_log_position = plan.appended_log_position, "recovery plan computed");

        self.election = Some(Election::new(self.local_member_id, self.config.service_count as usize, true));
        self.counters.set_module_state(ModuleState::Active);
        self.time_of_last_log_progress_ns = self.clock.now_ns();
        Ok(())
    }

    /// Drains pending state and flips the module state so operators observe
    /// a clean shutdown rather than a node that simply stopped responding
    /// (spec.md §7 "Termination").
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn on_close(&mut self) {
        self.counters.set_module_state(ModuleState::Closed);
        info!("consensus module agent closed");
    }

    /// One tick of the cooperative loop. Never blocks except for the bounded
    /// archive handshakes gated by `LEADER_LOG_REPLICATION` /
    /// `FOLLOWER_LOG_REPLICATION`, which the source treats as synchronous by
    /// design (spec.md §5, §9).
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn do_work(&mut self) -> Result<LoopControl, ClusterError> {
        let mut work_count: u64 = 0;
        let now_ns = self.clock.now_ns();

        if let Some(control) = self.poll_control_toggle(now_ns) {
            return Ok(control);
        }

        work_count += self.poll_consensus_adapter(now_ns)?;
        work_count += self.drive_election(now_ns).await?;

        if let Some(control) = self.drive_termination() {
            return Ok(control);
        }

        if self.is_leader() {
            work_count += self.leader_work(now_ns)?;
        } else {
            work_count += self.follower_work(now_ns).await?;
        }

        if now_ns.saturating_sub(self.last_slow_tick_ns) >= self.config.slow_tick_interval.as_nanos() as u64 {
            work_count += self.slow_tick(now_ns);
            self.last_slow_tick_ns = now_ns;
        }

        if work_count > 0 {
            self.time_of_last_log_progress_ns = now_ns;
        }

        Ok(LoopControl::Continue)
    }

    pub fn is_leader(&self) -> bool {
        self.election.as_ref().map(|e| e.is_leader()).unwrap_or(false)
    }

    /// Handles an operator control toggle. `ABORT` terminates immediately
    /// (spec.md §7, no cooperative handshake); `SHUTDOWN` only begins the
    /// snapshot-then-terminate protocol driven by [`Self::drive_termination`]
    /// every following tick (spec.md §4.1 "On termination", §5).
    fn poll_control_toggle(&mut self, now_ns: u64) -> Option<LoopControl> {
        match self.counters.control_toggle() {
            ControlToggle::Shutdown => {
                if self.termination.is_none() {
                    info!("shutdown requested via control toggle, beginning cooperative termination");
                    if self.is_leader() {
                        let snapshot_log_position = self.request_snapshot();
                        self.termination = Some(TerminationState::LeaderAwaitingSnapshot { snapshot_log_position });
                    } else {
                        self.termination = Some(TerminationState::AwaitingLocalAck { log_position: self.local_append_position });
                    }
                }
                self.counters.reset_toggle();
            }
            ControlToggle::Abort => {
                warn!("abort requested via control toggle");
                self.counters.reset_toggle();
                return Some(LoopControl::Terminate { expected: false });
            }
            ControlToggle::Suspend => {
                self.counters.set_module_state(ModuleState::Suspended);
                self.counters.reset_toggle();
            }
            ControlToggle::Resume => {
                self.counters.set_module_state(ModuleState::Active);
                self.counters.reset_toggle();
            }
            ControlToggle::SnapshotRequest => {
                if self.is_leader() {
                    self.request_snapshot();
                }
                self.counters.reset_toggle();
            }
            ControlToggle::Neutral => {}
        }
        let _ = now_ns;
        None
    }

    /// Appends a `ClusterAction::Snapshot` frame so every member takes a
    /// snapshot once it is replayed, and returns the log position the
    /// resulting service acks must reach (spec.md §4.7 "Snapshot taking").
    fn request_snapshot(&mut self) -> LogPosition {
        self.counters.set_module_state(ModuleState::Snapshot);
        self.counters.increment_snapshot_counter();
        let frame = LogFrame::ClusterAction {
            leadership_term_id: self.leadership_term_id,
            action: crate::log_adapter::ClusterActionKind::Snapshot,
        };
        if let Ok(position) = self.log_publisher.append(&frame) {
            self.local_append_position = position as u64;
        }
        self.local_append_position
    }

    /// Drives the cooperative termination protocol once `poll_control_toggle`
    /// has started it (spec.md §4.1 "On termination", §5): the leader
    /// snapshots, broadcasts the termination position, waits for every
    /// member's `TerminationAck` to reach quorum, then every member closes.
    /// Returns `Some(Terminate)` only once this node itself may stop ticking.
    fn drive_termination(&mut self) -> Option<LoopControl> {
        match self.termination.take() {
            None => None,
            Some(TerminationState::LeaderAwaitingSnapshot { snapshot_log_position }) => {
                if has_reached(snapshot_log_position, crate::service::ACK_ID_SNAPSHOT, &self.service_ack_queues) {
                    crate::service::consume_reached(&mut self.service_ack_queues);
                    self.begin_termination(snapshot_log_position);
                } else {
                    self.termination = Some(TerminationState::LeaderAwaitingSnapshot { snapshot_log_position });
                }
                None
            }
            Some(TerminationState::AwaitingLocalAck { log_position }) => {
                if has_reached(log_position, crate::service::ACK_ID_TERMINATION, &self.service_ack_queues) {
                    crate::service::consume_reached(&mut self.service_ack_queues);
                    let _ = self.consensus_publisher.publish(&ConsensusMessage::TerminationAck(TerminationAck {
                        leadership_term_id: self.leadership_term_id,
                        log_position,
                        member_id: self.local_member_id,
                    }));
                    if self.is_leader() {
                        let mut acked = std::collections::HashSet::new();
                        acked.insert(self.local_member_id);
                        self.termination = Some(TerminationState::LeaderAwaitingQuorum { log_position, acked });
                    } else {
                        self.counters.set_module_state(ModuleState::Closed);
                        return Some(LoopControl::Terminate { expected: true });
                    }
                } else {
                    self.termination = Some(TerminationState::AwaitingLocalAck { log_position });
                }
                None
            }
            Some(TerminationState::LeaderAwaitingQuorum { log_position, acked }) => {
                if acked.len() >= self.members.quorum_threshold() {
                    if let Err(err) = self.recording_log.commit_log_position(self.leadership_term_id, log_position) {
                        warn!(%err, "could not commit termination position to recording log");
                    }
                    self.counters.set_module_state(ModuleState::Closed);
                    return Some(LoopControl::Terminate { expected: true });
                }
                self.termination = Some(TerminationState::LeaderAwaitingQuorum { log_position, acked });
                None
            }
        }
    }

    /// Leader-only: moves from "snapshot acked" to "awaiting this node's own
    /// termination ack", appending the `TerminationPosition` frame so every
    /// member (including the leader, on replay) is told where to stop
    /// (spec.md §4.1, §5).
    fn begin_termination(&mut self, log_position: LogPosition) {
        self.counters.set_module_state(ModuleState::Terminating);
        let frame = LogFrame::TerminationPosition {
            leadership_term_id: self.leadership_term_id,
            log_position,
        };
        if let Ok(position) = self.log_publisher.append(&frame) {
            self.local_append_position = position as u64;
        }
        let _ = self.consensus_publisher.publish(&ConsensusMessage::TerminationPosition(TerminationPosition {
            leadership_term_id: self.leadership_term_id,
            log_position,
        }));
        self.termination = Some(TerminationState::AwaitingLocalAck { log_position });
    }

    /// Follower-side: the leader has announced where the cluster is
    /// terminating; start waiting on this node's own service ack for that
    /// position (spec.md §4.1, §5). A duplicate or stale announcement (this
    /// node already past `log_position`, or already terminating) is ignored.
    fn on_termination_position(&mut self, msg: TerminationPosition) {
        if msg.leadership_term_id != self.leadership_term_id || self.termination.is_some() {
            return;
        }
        self.termination = Some(TerminationState::AwaitingLocalAck { log_position: msg.log_position });
    }

    /// Leader-side: records one member's `TerminationAck` toward the quorum
    /// gating the final close (spec.md §5).
    fn on_termination_ack(&mut self, msg: TerminationAck) {
        self.termination = match self.termination.take() {
            Some(TerminationState::LeaderAwaitingQuorum { log_position, mut acked }) => {
                if msg.leadership_term_id == self.leadership_term_id && msg.log_position == log_position {
                    acked.insert(msg.member_id);
                }
                Some(TerminationState::LeaderAwaitingQuorum { log_position, acked })
            }
            other => other,
        };
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn poll_consensus_adapter(&mut self, now_ns: u64) -> Result<u64, ClusterError> {
        let active_count = self.members.active_count();
        let mut messages = Vec::new();
        self.consensus_adapter.poll(64, &mut |msg| messages.push(msg));
        let count = messages.len() as u64;

        for message in messages {
            match message {
                ConsensusMessage::CanvassPosition(msg) => self.on_canvass_position(msg, active_count),
                ConsensusMessage::RequestVote(msg) => self.on_request_vote(msg, now_ns),
                ConsensusMessage::Vote(msg) => self.on_vote(msg, active_count),
                ConsensusMessage::NewLeadershipTerm(msg) => self.on_new_leadership_term(msg, now_ns),
                ConsensusMessage::AppendPosition(msg) => self.on_append_position(msg, now_ns),
                ConsensusMessage::CommitPosition(msg) => self.on_commit_position(msg),
                ConsensusMessage::HeartbeatRequest(msg) => self.on_heartbeat_request(msg, now_ns),
                ConsensusMessage::TerminationPosition(msg) => self.on_termination_position(msg),
                ConsensusMessage::TerminationAck(msg) => self.on_termination_ack(msg),
                other => debug!(?other, "consensus message not actionable by this node in its current role"),
            }
        }
        Ok(count)
    }

    fn on_canvass_position(&mut self, msg: CanvassPosition, active_count: usize) {
        if let Some(election) = self.election.as_mut() {
            election.on_canvass_position(&msg, active_count);
        }
    }

    fn on_request_vote(&mut self, msg: RequestVote, now_ns: u64) {
        let Some(election) = self.election.as_mut() else { return };
        election.on_higher_request_vote(&msg, now_ns);
        let local_extent = LogExtent {
            log_position: self.local_append_position,
            leadership_term_id: self.leadership_term_id,
        };
        let candidate_extent = LogExtent {
            log_position: msg.log_position,
            leadership_term_id: msg.log_leadership_term_id,
        };
        let granted = election.decide_vote(msg.candidate_term_id, candidate_extent, local_extent);
        let vote = Vote {
            candidate_term_id: msg.candidate_term_id,
            log_leadership_term_id: self.leadership_term_id,
            log_position: self.local_append_position,
            candidate_member_id: msg.candidate_id,
            follower_member_id: self.local_member_id,
            vote: granted,
        };
        let _ = self.consensus_publisher.publish(&ConsensusMessage::Vote(vote));
    }

    fn on_vote(&mut self, msg: Vote, active_count: usize) {
        if let Some(election) = self.election.as_mut() {
            election.on_vote(&msg, active_count);
        }
    }

    fn on_new_leadership_term(&mut self, msg: NewLeadershipTerm, now_ns: u64) {
        if let Some(election) = self.election.as_mut() {
            election.on_new_leadership_term(&msg, now_ns);
        }
        self.leadership_term_id = msg.next_leadership_term_id;
        self.leader_book = Some(LeaderBook {
            leadership_term_id: msg.next_leadership_term_id,
            term_base_log_position: msg.next_term_base_log_position,
            last_heartbeat_sent_ns: now_ns,
            leader_recording_id: msg.leader_recording_id,
        });
        self.catchup_replay_session_id = None;
        self.counters.set_cluster_role(if msg.leader_id == self.local_member_id { ClusterRole::Leader } else { ClusterRole::Follower });
    }

    /// Leader-side: records a follower's reported append position for
    /// failure detection and the commit-position quorum computation
    /// (spec.md §4.1).
    fn on_append_position(&mut self, msg: AppendPosition, now_ns: u64) {
        if let Some(member) = self.members.get_mut(msg.follower_member_id) {
            member.log_position = msg.log_position;
            member.time_of_last_append_position_ns = now_ns;
        }
    }

    /// Follower-side: the leader's advertised commit position bounds how far
    /// the log adapter may replay to this tick (spec.md §4.1).
    fn on_commit_position(&mut self, msg: CommitPosition) {
        if msg.leadership_term_id == self.leadership_term_id {
            self.commit_position = self.commit_position.max(msg.log_position);
            self.counters.set_commit_position(self.commit_position);
        }
    }

    fn on_heartbeat_request(&mut self, msg: HeartbeatRequest, now_ns: u64) {
        if let Some(election) = self.election.as_mut() {
            if msg.leadership_term_id < self.leadership_term_id {
                return;
            }
            let _ = election;
        }
        self.time_of_last_log_progress_ns = now_ns;
    }

    /// Advances the election state machine, feeding it this node's current
    /// log extent and the shared member table / recording log it needs to
    /// decide CANVASS/NOMINATE outcomes (spec.md §4.2, §9 "arena-per-tick").
    #[tracing::instrument(level = "trace", skip(self))]
    async fn drive_election(&mut self, now_ns: u64) -> Result<u64, ClusterError> {
        let Some(mut election) = self.election.take() else {
            return Ok(0);
        };

        let local_extent = LogExtent {
            log_position: self.local_append_position,
            leadership_term_id: self.leadership_term_id,
        };

        match election.state() {
            ElectionState::LeaderLogReplication => {
                if let Err(detail) = self.handshake_leader_log_replication().await {
                    let error = ElectionError::LogReplicationFailed {
                        recording_id: self.recording_log.find_last_term_recording_id().unwrap_or(crate::NULL_RECORDING_ID),
                        detail: detail.to_string(),
                    };
                    election.handle_error(now_ns, &error);
                }
                election.advance_leader_replay(now_ns);
            }
            ElectionState::FollowerLogReplication => match self.handshake_follower_log_replication().await {
                Ok(true) => election.advance_follower_replay(now_ns),
                Ok(false) => {}
                Err(detail) => {
                    let error = ElectionError::LogReplicationFailed {
                        recording_id: self.leader_book.as_ref().map(|b| b.leader_recording_id).unwrap_or(crate::NULL_RECORDING_ID),
                        detail: detail.to_string(),
                    };
                    election.handle_error(now_ns, &error);
                }
            },
            ElectionState::Canvass => {
                // Broadcast repeatedly at the heartbeat cadence, not once,
                // since peers may join CANVASS at different times (spec.md
                // §4.2 "collect peer positions until startupCanvassTimeout
                // elapses or a quorum responded").
                if now_ns.saturating_sub(self.last_canvass_broadcast_ns) >= self.config.leader_heartbeat_interval.as_nanos() as u64 {
                    let _ = self.consensus_publisher.publish(&ConsensusMessage::CanvassPosition(CanvassPosition {
                        log_leadership_term_id: local_extent.leadership_term_id,
                        log_position: local_extent.log_position,
                        leadership_term_id: self.leadership_term_id,
                        follower_member_id: self.local_member_id,
                        protocol_version: CURRENT_PROTOCOL_VERSION,
                    }));
                    self.last_canvass_broadcast_ns = now_ns;
                }
            }
            _ => {}
        }

        let prev_state = election.state();
        let outcome = election.do_work(
            now_ns,
            self.config.startup_canvass_timeout.as_nanos() as u64,
            self.config.near_live_window(),
            local_extent,
            &self.members,
            &self.recording_log,
        );

        // NOMINATE is transient: the candidate that just declared itself
        // issues RequestVote the same tick it enters CANDIDATE_BALLOT
        // (spec.md §4.2 Nominate).
        if prev_state != ElectionState::CandidateBallot && election.state() == ElectionState::CandidateBallot {
            if let Some(candidate_term_id) = election.candidate_term_id() {
                let _ = self.consensus_publisher.publish(&ConsensusMessage::RequestVote(RequestVote {
                    log_leadership_term_id: local_extent.leadership_term_id,
                    log_position: local_extent.log_position,
                    candidate_term_id,
                    candidate_id: self.local_member_id,
                    protocol_version: CURRENT_PROTOCOL_VERSION,
                }));
            }
        }

        // Winning the ballot is this node's own signal to become leader; it
        // must announce the new term itself since it never observes its own
        // broadcast (spec.md §4.2 Leader steps).
        if prev_state == ElectionState::CandidateBallot && election.state() == ElectionState::LeaderLogReplication {
            let leadership_term_id = election.leadership_term_id();
            let term_base_log_position = election.term_base_log_position();
            self.leadership_term_id = leadership_term_id;
            self.counters.set_cluster_role(ClusterRole::Leader);
            let leader_recording_id = self.recording_log.find_last_term_recording_id().unwrap_or(crate::NULL_RECORDING_ID);
            self.leader_book = Some(LeaderBook {
                leadership_term_id,
                term_base_log_position,
                last_heartbeat_sent_ns: now_ns,
                leader_recording_id,
            });
            self.catchup_replay_session_id = None;
            let _ = self.consensus_publisher.publish(&ConsensusMessage::NewLeadershipTerm(NewLeadershipTerm {
                next_leadership_term_id: leadership_term_id,
                next_term_base_log_position: term_base_log_position,
                next_log_position: term_base_log_position,
                current_leadership_term_id: local_extent.leadership_term_id,
                current_term_base_log_position: local_extent.log_position,
                leader_recording_id,
                timestamp: self.clock.time_ms(),
                leader_id: self.local_member_id,
                log_session_id: 0,
                app_version: self.config.app_version,
                is_startup: local_extent.leadership_term_id == 0,
            }));
        }

        let work = match outcome {
            ElectionOutcome::InProgress => 1,
            ElectionOutcome::Concluded { leadership_term_id, is_leader } => {
                self.leadership_term_id = leadership_term_id;
                self.counters.set_cluster_role(if is_leader { ClusterRole::Leader } else { ClusterRole::Follower });
                1
            }
        };

        self.election = Some(election);
        Ok(work)
    }

    /// The leader's bounded synchronous handshake before replicating a new
    /// term: truncate any uncommitted tail in the previous recording, open a
    /// new one to record into (spec.md §4.2 Leader steps, §5).
    async fn handshake_leader_log_replication(&self) -> Result<(), crate::error::AnyError> {
        if let Some(recording_id) = self.recording_log.find_last_term_recording_id() {
            self.archive
                .truncate_recording(recording_id, self.local_append_position)
                .await?;
        }
        Ok(())
    }

    /// The follower's bounded synchronous handshake: replay the leader's
    /// recording up to `termBaseLogPosition` before joining the live image
    /// (spec.md §4.2 Follower steps). Returns whether the target has been
    /// reached yet; `false` means the caller should try again next tick.
    async fn handshake_follower_log_replication(&mut self) -> Result<bool, crate::error::AnyError> {
        let Some(book) = &self.leader_book else { return Ok(true) };
        let target = book.term_base_log_position;
        if self.local_append_position >= target {
            return Ok(true);
        }
        let leader_recording_id = book.leader_recording_id;

        if self.catchup_replay_session_id.is_none() {
            let remaining = (target - self.local_append_position) as i64;
            let session_id = self
                .archive
                .start_replay(leader_recording_id, self.local_append_position, remaining, "catchup", 0)
                .await?;
            self.catchup_replay_session_id = Some(session_id);
        }

        let stop_position = self.archive.get_stop_position(leader_recording_id).await?;
        if stop_position < target {
            return Ok(false);
        }

        if let Some(session_id) = self.catchup_replay_session_id.take() {
            self.archive.stop_replay(session_id).await?;
        }
        self.local_append_position = target;
        Ok(true)
    }

    /// Leader duties run every tick: detect a disconnected quorum, advance
    /// the commit position, fire due timers, and sweep state that trails the
    /// commit position (spec.md §4.1).
    #[tracing::instrument(level = "trace", skip(self))]
    fn leader_work(&mut self, now_ns: u64) -> Result<u64, ClusterError> {
        let mut work = 0;

        let responsive = self.members.responsive_follower_count(now_ns, self.config.leader_heartbeat_timeout.as_nanos() as u64);
        let required = self.members.quorum_threshold();
        if responsive < required {
            let event = ClusterEvent::InactiveFollowerQuorum { active: responsive, required };
            warn!(%event, "leader lost quorum of responsive followers, returning to election");
            self.election = Some(Election::new(self.local_member_id, self.config.service_count as usize, true));
            self.leader_book = None;
            self.counters.set_cluster_role(ClusterRole::Candidate);
            return Ok(1);
        }

        let new_commit = quorum::quorum_position(
            self.members
                .active()
                .map(|m| if m.id == self.local_member_id { self.local_append_position } else { m.log_position })
                .collect(),
        )
        .min(self.local_append_position);

        if new_commit > self.commit_position {
            self.commit_position = new_commit;
            self.counters.set_commit_position(self.commit_position);
            work += 1;
            let _ = self.consensus_publisher.publish(&ConsensusMessage::CommitPosition(CommitPosition {
                leadership_term_id: self.leadership_term_id,
                log_position: self.commit_position,
                leader_member_id: self.local_member_id,
            }));
        }

        for fired in self.timers.poll(now_ns) {
            let frame = LogFrame::TimerEvent { correlation_id: fired.correlation_id };
            if let Ok(position) = self.log_publisher.append(&frame) {
                self.local_append_position = position as u64;
                work += 1;
            }
        }

        for tracker in self.pending.iter_mut() {
            work += tracker.sweep_committed(self.commit_position) as u64;
        }
        self.sessions.sweep_closed(self.commit_position);

        if let Some(book) = &mut self.leader_book {
            if now_ns.saturating_sub(book.last_heartbeat_sent_ns) >= self.config.leader_heartbeat_interval.as_nanos() as u64 {
                let _ = self.consensus_publisher.publish(&ConsensusMessage::HeartbeatRequest(HeartbeatRequest {
                    leadership_term_id: book.leadership_term_id,
                    leader_member_id: self.local_member_id,
                }));
                book.last_heartbeat_sent_ns = now_ns;
                work += 1;
            }
        }

        let removed = self.members.remove_if_past_commit(self.commit_position);
        work += removed.len() as u64;

        Ok(work)
    }

    /// Follower duties: replay the log up to the leader-notified commit
    /// position, fanning each frame out to the service container and this
    /// node's own session/timer/pending state, then report progress back to
    /// the leader (spec.md §4.1, §4.5).
    #[tracing::instrument(level = "trace", skip(self))]
    async fn follower_work(&mut self, now_ns: u64) -> Result<u64, ClusterError> {
        let limit = std::cmp::min(self.commit_position, self.log_adapter.position() + 1_000_000);
        let mut frames = Vec::new();
        let delivered = self.log_adapter.poll_up_to(limit, 64, &mut |frame, position| frames.push((frame, position)));

        for (frame, position) in frames {
            self.apply_frame(&frame, position).await;
            self.local_append_position = position;
        }

        if delivered > 0 {
            let _ = self.consensus_publisher.publish(&ConsensusMessage::AppendPosition(AppendPosition {
                leadership_term_id: self.leadership_term_id,
                log_position: self.local_append_position,
                follower_member_id: self.local_member_id,
                flags: AppendPositionFlags::None,
            }));
        }

        let _ = now_ns;
        Ok(delivered as u64)
    }

    /// Applies one replayed log frame to local state, the shared step every
    /// member (leader included, on replay) takes (spec.md §4.1, §4.4–§4.6).
    async fn apply_frame(&mut self, frame: &LogFrame, position: LogPosition) {
        match frame {
            LogFrame::SessionOpen { .. } | LogFrame::SessionClose { .. } | LogFrame::SessionKeepAlive { .. } => {
                if let Some(session_id) = frame.cluster_session_id() {
                    if let LogFrame::SessionClose { close_reason, .. } = frame {
                        if let Some(session) = self.sessions.get_mut(session_id) {
                            session.begin_close(position, *close_reason);
                        }
                    }
                }
            }
            LogFrame::ClientRequest { cluster_session_id, .. } | LogFrame::ServiceMessage { cluster_session_id, .. } => {
                if let Some((service_id, _)) = crate::pending::decode_service_session_id(*cluster_session_id) {
                    if let Some(tracker) = self.pending.get_mut(service_id as usize) {
                        tracker.observe_replayed(*cluster_session_id);
                    }
                }
            }
            LogFrame::TimerEvent { correlation_id } => {
                if self.timers.replay_expired(*correlation_id) {
                    self.timers.cancel(*correlation_id);
                }
            }
            LogFrame::NewLeadershipTermEvent {
                leadership_term_id,
                term_base_log_position,
                log_position,
                timestamp_ms,
                is_startup,
                ..
            } => {
                self.service
                    .on_join_log(*leadership_term_id, *term_base_log_position, *log_position, *timestamp_ms, *is_startup)
                    .await;
            }
            LogFrame::ClusterAction { action, .. } => {
                if *action == crate::log_adapter::ClusterActionKind::Snapshot {
                    self.service.on_snapshot_request(CONSENSUS_MODULE_SERVICE_ID).await;
                }
            }
            LogFrame::MembershipChange { member_id, change, removal_position } => {
                match change {
                    crate::log_adapter::MembershipChangeKind::Join => self.members.promote_to_active(*member_id),
                    crate::log_adapter::MembershipChangeKind::Quit => {
                        if let Some(member) = self.members.get_mut(*member_id) {
                            member.removal_position = *removal_position;
                        }
                    }
                }
            }
            LogFrame::TerminationPosition { log_position, .. } => {
                self.service.on_termination_position(*log_position).await;
            }
        }
    }

    /// Submits one ack on behalf of `service_id`, checked against every
    /// queue with [`has_reached`] to decide whether the current snapshot,
    /// recovery, or termination step is complete (spec.md §4.1).
    pub fn on_service_ack(&mut self, service_id: u32, ack: ServiceAck) {
        if let Some(queue) = self.service_ack_queues.get_mut(service_id as usize) {
            queue.push(ack);
        }
        // Only the JOIN ack is consumed here, on arrival: it only ever
        // gates election progress. Snapshot and termination acks are left
        // queued for `drive_termination`/the recovery plan to consume at
        // their own pace (spec.md §4.1).
        if ack.ack_id == crate::service::ACK_ID_JOIN && has_reached(ack.log_position, ack.ack_id, &self.service_ack_queues) {
            if let Some(election) = self.election.as_mut() {
                election.on_service_joined();
            }
            crate::service::consume_reached(&mut self.service_ack_queues);
        }
    }

    /// The periodic low-frequency housekeeping tick: archive signal
    /// draining, idle-session expiry, election backoff checks. Gated behind
    /// `slow_tick_interval` the way the leader's `archive.pollSignals()` and
    /// session sweeps are in the source, so they never run on every fast
    /// tick (spec.md §4.1 "slow tick cadence").
    #[tracing::instrument(level = "trace", skip(self))]
    fn slow_tick(&mut self, now_ns: u64) -> u64 {
        let mut work = 0;
        for signal in self.archive.poll_signals() {
            debug!(?signal, "recording signal");
            work += 1;
        }

        let expired = self.sessions.expire_idle(now_ns, self.config.session_timeout.as_nanos() as u64, self.local_append_position);
        if !expired.is_empty() {
            self.counters.increment_timed_out_client_counter();
            work += expired.len() as u64;
        }

        if now_ns.saturating_sub(self.time_of_last_log_progress_ns) >= self.config.leader_heartbeat_timeout.as_nanos() as u64 {
            if self.election.as_ref().map(|e| e.state() != ElectionState::Canvass).unwrap_or(true) {
                warn!("no log progress within heartbeat timeout, re-entering election");
                self.election = Some(Election::new(self.local_member_id, self.config.service_count as usize, true));
                work += 1;
            }
        }

        work
    }

    pub fn leadership_term_id(&self) -> LeadershipTermId {
        self.leadership_term_id
    }

    pub fn commit_position(&self) -> LogPosition {
        self.commit_position
    }

    pub fn members(&self) -> &ClusterMemberTable {
        &self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::FileSyncLevel;
    use crate::membership::ClusterMember;
    use crate::membership::MemberEndpoints;
    use crate::transport::FragmentAction;
    use crate::transport::OfferResult;
    use crate::transport::RecordingDescriptor;
    use crate::transport::RecordingSignalEvent;
    use crate::transport::SourceLocation;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct FakePublication {
        pos: u64,
    }
    impl Publication for FakePublication {
        fn offer(&mut self, buffer: &[u8]) -> OfferResult {
            self.pos += buffer.len() as u64;
            Ok(self.pos as i64)
        }
        fn position(&self) -> u64 {
            self.pos
        }
        fn is_connected(&self) -> bool {
            true
        }
    }

    struct FakeImage {
        frames: VecDeque<Vec<u8>>,
        pos: u64,
    }
    impl Image for FakeImage {
        fn position(&self) -> u64 {
            self.pos
        }
        fn join_position(&self) -> u64 {
            0
        }
        fn end_position(&self) -> u64 {
            self.pos
        }
        fn is_closed(&self) -> bool {
            false
        }
        fn poll(&mut self, limit: usize, handler: &mut dyn FnMut(&[u8], u64) -> FragmentAction) -> usize {
            let mut n = 0;
            while n < limit {
                match self.frames.pop_front() {
                    Some(f) => {
                        self.pos += f.len() as u64;
                        handler(&f, self.pos);
                        n += 1;
                    }
                    None => break,
                }
            }
            n
        }
    }

    struct NullArchive;
    #[async_trait]
    impl ArchiveClient for NullArchive {
        async fn start_recording(&self, _: &str, _: i32, _: SourceLocation) -> Result<i64, crate::error::AnyError> {
            Ok(1)
        }
        async fn extend_recording(&self, _: i64, _: &str, _: i32, _: SourceLocation) -> Result<i64, crate::error::AnyError> {
            Ok(1)
        }
        async fn stop_recording(&self, _: i64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn truncate_recording(&self, _: i64, _: u64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn start_replay(&self, _: i64, _: u64, _: i64, _: &str, _: i32) -> Result<i64, crate::error::AnyError> {
            Ok(1)
        }
        async fn stop_replay(&self, _: i64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn get_stop_position(&self, _: i64) -> Result<u64, crate::error::AnyError> {
            Ok(0)
        }
        async fn purge_segments(&self, _: i64, _: u64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn detach_segments(&self, _: i64, _: u64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn attach_segments(&self, _: i64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn delete_detached_segments(&self, _: i64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn migrate_segments(&self, _: i64, _: i64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn list_recording(&self, _: i64) -> Result<Option<RecordingDescriptor>, crate::error::AnyError> {
            Ok(None)
        }
        fn poll_signals(&self) -> Vec<RecordingSignalEvent> {
            Vec::new()
        }
    }

    struct NullService;
    #[async_trait]
    impl ServiceContainer for NullService {
        async fn on_join_log(&self, _: u64, _: LogPosition, _: LogPosition, _: i64, _: bool) {}
        async fn on_snapshot_request(&self, _: u32) {}
        async fn on_termination_position(&self, _: LogPosition) {}
        async fn on_cluster_members_response(&self, _: i64, _: Vec<NodeId>) {}
        async fn on_cluster_members_extended_response(&self, _: i64, _: String) {}
    }

    fn new_agent() -> ConsensusModuleAgent<TestClock, NullArchive, NullService, FakePublication, FakeImage, FakePublication, FakeImage> {
        let mut members = ClusterMemberTable::new();
        members.add_active(ClusterMember::new(
            0,
            MemberEndpoints {
                consensus: "c0".into(),
                log: "l0".into(),
                ingress: "i0".into(),
                catchup: "k0".into(),
                archive: "a0".into(),
            },
        ));
        let log = RecordingLog::open(tempfile::NamedTempFile::new().unwrap().path(), FileSyncLevel::None).unwrap();
        ConsensusModuleAgent::new(
            ConsensusModuleConfig { service_count: 1, ..Default::default() },
            TestClock::new(),
            NullArchive,
            NullService,
            0,
            members,
            log,
            FakePublication { pos: 0 },
            FakeImage { frames: VecDeque::new(), pos: 0 },
            FakePublication { pos: 0 },
            FakeImage { frames: VecDeque::new(), pos: 0 },
        )
    }

    #[tokio::test]
    async fn on_start_enters_canvass() {
        let mut agent = new_agent();
        agent.on_start().await.unwrap();
        assert_eq!(agent.election.as_ref().unwrap().state(), ElectionState::Canvass);
    }

    #[tokio::test]
    async fn single_member_cluster_elects_itself_leader() {
        let mut agent = new_agent();
        agent.on_start().await.unwrap();

        // Single-member table: quorum is 1, so CANVASS completes immediately
        // with zero peer responses and this node nominates itself.
        for _ in 0..10 {
            agent.do_work().await.unwrap();
            if agent.is_leader() {
                break;
            }
        }
        assert!(agent.is_leader());
    }

    #[tokio::test]
    async fn service_ack_quorum_advances_election_join() {
        let mut agent = new_agent();
        agent.on_start().await.unwrap();
        for _ in 0..10 {
            agent.do_work().await.unwrap();
        }
        agent.on_service_ack(0, ServiceAck { ack_id: 0, log_position: 0, relevant_id: 0 });
        assert!(agent.service_ack_queues[0].front().is_none());
    }

    /// A SHUTDOWN control toggle drives the full snapshot-then-terminate
    /// protocol (spec.md §4.1 "On termination", §5, §8 S3): the leader
    /// snapshots, broadcasts the termination position, waits on its own
    /// service ack (here, its only member is itself, so reaching quorum
    /// just means reaching its own ack), and only then reports `Terminate`.
    #[tokio::test]
    async fn shutdown_toggle_snapshots_then_terminates_single_member_cluster() {
        let mut agent = new_agent();
        agent.on_start().await.unwrap();
        for _ in 0..10 {
            agent.do_work().await.unwrap();
            if agent.is_leader() {
                break;
            }
        }
        assert!(agent.is_leader());

        agent.counters().request_toggle(ControlToggle::Shutdown);
        agent.do_work().await.unwrap();
        assert_eq!(agent.counters().module_state(), ModuleState::Snapshot as i32);
        let snapshot_log_position = agent.local_append_position;

        agent.on_service_ack(0, ServiceAck { ack_id: crate::service::ACK_ID_SNAPSHOT, log_position: snapshot_log_position, relevant_id: 0 });
        for _ in 0..5 {
            agent.do_work().await.unwrap();
            if agent.counters().module_state() == ModuleState::Terminating as i32 {
                break;
            }
        }
        assert_eq!(agent.counters().module_state(), ModuleState::Terminating as i32);

        agent.on_service_ack(0, ServiceAck { ack_id: crate::service::ACK_ID_TERMINATION, log_position: snapshot_log_position, relevant_id: 0 });
        let mut control = LoopControl::Continue;
        for _ in 0..5 {
            control = agent.do_work().await.unwrap();
            if control.is_terminate() {
                break;
            }
        }
        assert_eq!(control, LoopControl::Terminate { expected: true });
        assert_eq!(agent.counters().module_state(), ModuleState::Closed as i32);
    }

    /// An archive that reports a configurable, externally-advanceable stop
    /// position, standing in for a real catch-up replay that takes several
    /// ticks to close (spec.md §4.2 Follower steps, §8 testable property:
    /// follower catch-up).
    struct StepArchive {
        stop_position: std::sync::Arc<std::sync::atomic::AtomicU64>,
    }
    #[async_trait]
    impl ArchiveClient for StepArchive {
        async fn start_recording(&self, _: &str, _: i32, _: SourceLocation) -> Result<i64, crate::error::AnyError> {
            Ok(1)
        }
        async fn extend_recording(&self, _: i64, _: &str, _: i32, _: SourceLocation) -> Result<i64, crate::error::AnyError> {
            Ok(1)
        }
        async fn stop_recording(&self, _: i64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn truncate_recording(&self, _: i64, _: u64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn start_replay(&self, _: i64, _: u64, _: i64, _: &str, _: i32) -> Result<i64, crate::error::AnyError> {
            Ok(42)
        }
        async fn stop_replay(&self, _: i64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn get_stop_position(&self, _: i64) -> Result<u64, crate::error::AnyError> {
            Ok(self.stop_position.load(std::sync::atomic::Ordering::SeqCst))
        }
        async fn purge_segments(&self, _: i64, _: u64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn detach_segments(&self, _: i64, _: u64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn attach_segments(&self, _: i64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn delete_detached_segments(&self, _: i64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn migrate_segments(&self, _: i64, _: i64) -> Result<(), crate::error::AnyError> {
            Ok(())
        }
        async fn list_recording(&self, _: i64) -> Result<Option<RecordingDescriptor>, crate::error::AnyError> {
            Ok(None)
        }
        fn poll_signals(&self) -> Vec<RecordingSignalEvent> {
            Vec::new()
        }
    }

    fn new_agent_with_archive(
        archive: StepArchive,
    ) -> ConsensusModuleAgent<TestClock, StepArchive, NullService, FakePublication, FakeImage, FakePublication, FakeImage> {
        let mut members = ClusterMemberTable::new();
        members.add_active(ClusterMember::new(
            0,
            MemberEndpoints {
                consensus: "c0".into(),
                log: "l0".into(),
                ingress: "i0".into(),
                catchup: "k0".into(),
                archive: "a0".into(),
            },
        ));
        let log = RecordingLog::open(tempfile::NamedTempFile::new().unwrap().path(), FileSyncLevel::None).unwrap();
        ConsensusModuleAgent::new(
            ConsensusModuleConfig { service_count: 1, ..Default::default() },
            TestClock::new(),
            archive,
            NullService,
            0,
            members,
            log,
            FakePublication { pos: 0 },
            FakeImage { frames: VecDeque::new(), pos: 0 },
            FakePublication { pos: 0 },
            FakeImage { frames: VecDeque::new(), pos: 0 },
        )
    }

    #[tokio::test]
    async fn follower_log_replication_waits_for_archive_to_catch_up() {
        let stop_position = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut agent = new_agent_with_archive(StepArchive { stop_position: stop_position.clone() });
        agent.leader_book = Some(LeaderBook {
            leadership_term_id: 1,
            term_base_log_position: 100,
            last_heartbeat_sent_ns: 0,
            leader_recording_id: 7,
        });

        assert!(!agent.handshake_follower_log_replication().await.unwrap());
        assert_eq!(agent.local_append_position, 0);
        assert_eq!(agent.catchup_replay_session_id, Some(42));

        // Archive hasn't caught up yet: a repeated call must not start a
        // second replay session.
        assert!(!agent.handshake_follower_log_replication().await.unwrap());
        assert_eq!(agent.catchup_replay_session_id, Some(42));

        stop_position.store(100, std::sync::atomic::Ordering::SeqCst);
        assert!(agent.handshake_follower_log_replication().await.unwrap());
        assert_eq!(agent.local_append_position, 100);
        assert_eq!(agent.catchup_replay_session_id, None);
    }
}
