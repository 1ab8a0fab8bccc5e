//! The leader-election state machine (spec.md §4.2): canvass, nomination,
//! voting, log catch-up, and term transition.
//!
//! Redesigned per spec.md §9 "Coroutine-ish handshakes": every wait
//! (`startupCanvassTimeout`, a quorum of votes, a service ack at
//! `termBaseLogPosition`, catch-up converging to the near-live window) is an
//! explicit field on [`Election`], not a blocking call or a thrown/caught
//! control-flow exception. Each call to [`Election::do_work`] either
//! advances that state or returns zero work, the same shape
//! `async-raft::core::replication` uses for its per-tick `RaftCore` poll.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::ClusterEvent;
use crate::membership::ClusterMemberTable;
use crate::quorum;
use crate::recording_log::RecordingLog;
use crate::wire::CanvassPosition;
use crate::wire::NewLeadershipTerm;
use crate::wire::RequestVote;
use crate::wire::Vote;
use crate::LeadershipTermId;
use crate::LogPosition;
use crate::NodeId;
use crate::RecordingId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ElectionError {
    #[error("canvass timed out with no quorum of peer positions")]
    CanvassTimedOut,

    #[error("candidate ballot lost: only {votes} of {required} required votes received")]
    BallotLost { votes: usize, required: usize },

    #[error("log replication from leader recording {recording_id} failed: {detail}")]
    LogReplicationFailed { recording_id: RecordingId, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Init,
    Canvass,
    Nominate,
    CandidateBallot,
    LeaderLogReplication,
    LeaderReplay,
    LeaderInit,
    LeaderReady,
    FollowerBallot,
    FollowerLogReplication,
    FollowerReplay,
    FollowerCatchup,
    FollowerLogInit,
    FollowerReady,
    Closed,
}

/// A peer's reported `(logLeadershipTermId, logPosition)`, collected during
/// `CANVASS` (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogExtent {
    pub log_position: LogPosition,
    pub leadership_term_id: LeadershipTermId,
}

/// The leader-election state machine for one member. Owns no back-reference
/// to the agent; the agent hands it borrowed access to the member table and
/// recording log for the duration of one `do_work()` call (spec.md §9
/// "arena-per-tick").
pub struct Election {
    state: ElectionState,
    local_member_id: NodeId,

    /// Entered CANVASS at this clock reading; used against
    /// `startup_canvass_timeout`.
    state_entered_ns: u64,

    /// Backoff applied the next time the election restarts from CANVASS
    /// after an error (spec.md §4.2 "Cancellation").
    backoff: Duration,

    /// Peer positions collected during CANVASS, keyed by member id.
    canvass_positions: BTreeMap<NodeId, LogExtent>,

    /// Votes collected during CANDIDATE_BALLOT, keyed by voter member id.
    votes: BTreeMap<NodeId, bool>,

    /// Set once this member declares itself a candidate (spec.md §4.2
    /// Nominate).
    candidate_term_id: Option<LeadershipTermId>,

    /// Whether this member voted yet for the current `candidate_term_id`
    /// seen from some other candidate (spec.md §4.2 Vote: "a follower votes
    /// yes once per candidateTermId").
    voted_for_term: Option<LeadershipTermId>,

    leader_member_id: Option<NodeId>,
    is_leader: bool,
    leadership_term_id: LeadershipTermId,
    term_base_log_position: LogPosition,

    /// Services that have acknowledged the `NewLeadershipTermEvent` join at
    /// `termBaseLogPosition` (spec.md §4.2 "wait for all services to
    /// acknowledge the join").
    services_joined: usize,
    service_count: usize,
}

pub enum ElectionOutcome {
    InProgress,
    /// The election concluded: this member is now leader or follower for
    /// `leadership_term_id`.
    Concluded { leadership_term_id: LeadershipTermId, is_leader: bool },
}

impl Election {
    /// Starts at `INIT`, moving to `CANVASS` on the first tick, or directly
    /// at `CANVASS` if re-entering from a previously running node (spec.md
    /// §4.2).
    pub fn new(local_member_id: NodeId, service_count: usize, re_entering: bool) -> Self {
        Self {
            state: if re_entering { ElectionState::Canvass } else { ElectionState::Init },
            local_member_id,
            state_entered_ns: 0,
            backoff: Duration::from_millis(100),
            canvass_positions: BTreeMap::new(),
            votes: BTreeMap::new(),
            candidate_term_id: None,
            voted_for_term: None,
            leader_member_id: None,
            is_leader: false,
            leadership_term_id: 0,
            term_base_log_position: 0,
            services_joined: 0,
            service_count,
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    /// At any non-terminal state, a `NewLeadershipTerm` for a higher term
    /// replaces the current election outright (spec.md §4.2 Cancellation).
    pub fn on_new_leadership_term(&mut self, msg: &NewLeadershipTerm, now_ns: u64) {
        if self.state == ElectionState::Closed {
            return;
        }
        if msg.next_leadership_term_id <= self.leadership_term_id && self.state != ElectionState::Init && self.state != ElectionState::Canvass {
            return;
        }
        info!(term = msg.next_leadership_term_id, leader = msg.leader_id, "election cancelled by higher NewLeadershipTerm");
        self.leadership_term_id = msg.next_leadership_term_id;
        self.term_base_log_position = msg.next_term_base_log_position;
        self.leader_member_id = Some(msg.leader_id);
        self.is_leader = msg.leader_id == self.local_member_id;
        self.services_joined = 0;
        // The announcement itself is what moves a follower out of the passive
        // FOLLOWER_BALLOT wait; a leader reaching this state is always the
        // candidate who just won its own ballot.
        self.state = if self.is_leader { ElectionState::LeaderLogReplication } else { ElectionState::FollowerLogReplication };
        self.state_entered_ns = now_ns;
    }

    /// Any `RequestVote` from a term higher than our own forces re-entry
    /// into election (spec.md §4.1 "Failure detection").
    pub fn on_higher_request_vote(&mut self, msg: &RequestVote, now_ns: u64) {
        if msg.candidate_term_id > self.leadership_term_id {
            debug!(term = msg.candidate_term_id, "higher RequestVote observed, restarting from CANVASS");
            self.restart_from_canvass(now_ns);
        }
    }

    /// Delegates any election-time error to `handle_error`, which always
    /// restarts from CANVASS with monotonically increasing backoff
    /// (spec.md §7 "Any exception raised while an election is in progress is
    /// delegated to `election.handle_error`").
    pub fn handle_error(&mut self, now_ns: u64, error: &ElectionError) {
        warn!(%error, "election error, restarting from CANVASS");
        self.restart_from_canvass(now_ns);
    }

    fn restart_from_canvass(&mut self, now_ns: u64) {
        self.state = ElectionState::Canvass;
        self.state_entered_ns = now_ns;
        self.canvass_positions.clear();
        self.votes.clear();
        self.candidate_term_id = None;
        self.backoff = std::cmp::min(self.backoff * 2, Duration::from_secs(10));
    }

    /// Offers a peer's canvass response. Returns `true` if this completed
    /// the set needed to proceed (a quorum has now responded).
    pub fn on_canvass_position(&mut self, msg: &CanvassPosition, active_count: usize) -> bool {
        if self.state != ElectionState::Canvass {
            return false;
        }
        self.canvass_positions.insert(
            msg.follower_member_id,
            LogExtent {
                log_position: msg.log_position,
                leadership_term_id: msg.log_leadership_term_id,
            },
        );
        quorum::has_quorum(self.canvass_positions.len() + 1, active_count)
    }

    pub fn on_vote(&mut self, msg: &Vote, active_count: usize) -> bool {
        if self.state != ElectionState::CandidateBallot || Some(msg.candidate_term_id) != self.candidate_term_id {
            return false;
        }
        self.votes.insert(msg.follower_member_id, msg.vote);
        let yes_votes = self.votes.values().filter(|&&v| v).count() + 1; // + self-vote
        quorum::has_quorum(yes_votes, active_count)
    }

    /// A follower votes yes once per `candidateTermId` iff the candidate's
    /// `(logTermId, logPosition)` is at least as current as the local one
    /// (spec.md §4.2 Vote).
    pub fn decide_vote(&mut self, candidate_term_id: LeadershipTermId, candidate_extent: LogExtent, local_extent: LogExtent) -> bool {
        if self.voted_for_term == Some(candidate_term_id) {
            return false;
        }
        self.voted_for_term = Some(candidate_term_id);
        candidate_extent >= local_extent
    }

    /// One tick. `local_extent` is this member's own `(logPosition,
    /// leadershipTermId)`; `members` and `log` are borrowed only for this
    /// call (spec.md §9 "arena-per-tick").
    pub fn do_work(
        &mut self,
        now_ns: u64,
        startup_canvass_timeout_ns: u64,
        near_live_window: u64,
        local_extent: LogExtent,
        members: &ClusterMemberTable,
        _log: &RecordingLog,
    ) -> ElectionOutcome {
        if self.state_entered_ns == 0 {
            self.state_entered_ns = now_ns;
        }

        match self.state {
            ElectionState::Init => {
                self.state = ElectionState::Canvass;
                self.state_entered_ns = now_ns;
                ElectionOutcome::InProgress
            }

            ElectionState::Canvass => {
                let active = members.active_count().max(1);
                let elapsed = now_ns.saturating_sub(self.state_entered_ns);
                let have_quorum = quorum::has_quorum(self.canvass_positions.len() + 1, active);
                if have_quorum || elapsed >= startup_canvass_timeout_ns {
                    self.enter_nominate(local_extent, now_ns);
                }
                ElectionOutcome::InProgress
            }

            ElectionState::Nominate => {
                // Transient: immediately issues RequestVote and moves to the
                // relevant ballot state; the agent is responsible for
                // actually publishing the RequestVote message this tick.
                if self.is_leader_candidate(local_extent) {
                    self.candidate_term_id = Some(self.next_candidate_term());
                    self.state = ElectionState::CandidateBallot;
                } else {
                    self.state = ElectionState::FollowerBallot;
                }
                self.state_entered_ns = now_ns;
                ElectionOutcome::InProgress
            }

            ElectionState::CandidateBallot => {
                let active = members.active_count().max(1);
                let yes_votes = self.votes.values().filter(|&&v| v).count() + 1;
                if quorum::has_quorum(yes_votes, active) {
                    self.leadership_term_id = self.candidate_term_id.unwrap_or(self.leadership_term_id);
                    self.is_leader = true;
                    self.leader_member_id = Some(self.local_member_id);
                    self.term_base_log_position = local_extent.log_position;
                    self.services_joined = 0;
                    self.state = ElectionState::LeaderLogReplication;
                    self.state_entered_ns = now_ns;
                }
                ElectionOutcome::InProgress
            }

            ElectionState::FollowerBallot => {
                // Waits passively for a NewLeadershipTerm from the winning
                // candidate; on_new_leadership_term drives the transition
                // out of this state.
                ElectionOutcome::InProgress
            }

            ElectionState::LeaderLogReplication => {
                // Truncation / recording-open handshake with the archive is
                // performed by the agent (bounded synchronous handshake,
                // spec.md §5); once it reports done the agent calls
                // `advance_leader_replay`.
                ElectionOutcome::InProgress
            }

            ElectionState::LeaderReplay => {
                self.state = ElectionState::LeaderInit;
                self.state_entered_ns = now_ns;
                ElectionOutcome::InProgress
            }

            ElectionState::LeaderInit => {
                if self.services_joined >= self.service_count {
                    self.state = ElectionState::LeaderReady;
                    self.state_entered_ns = now_ns;
                    return ElectionOutcome::Concluded {
                        leadership_term_id: self.leadership_term_id,
                        is_leader: true,
                    };
                }
                ElectionOutcome::InProgress
            }

            ElectionState::LeaderReady => ElectionOutcome::Concluded {
                leadership_term_id: self.leadership_term_id,
                is_leader: true,
            },

            ElectionState::FollowerLogReplication => {
                ElectionOutcome::InProgress
            }

            ElectionState::FollowerReplay => {
                self.state = ElectionState::FollowerCatchup;
                self.state_entered_ns = now_ns;
                ElectionOutcome::InProgress
            }

            ElectionState::FollowerCatchup => {
                let gap = local_extent.log_position.saturating_sub(self.term_base_log_position);
                if gap <= near_live_window {
                    self.state = ElectionState::FollowerLogInit;
                    self.state_entered_ns = now_ns;
                }
                ElectionOutcome::InProgress
            }

            ElectionState::FollowerLogInit => {
                if self.services_joined >= self.service_count {
                    self.state = ElectionState::FollowerReady;
                    self.state_entered_ns = now_ns;
                    return ElectionOutcome::Concluded {
                        leadership_term_id: self.leadership_term_id,
                        is_leader: false,
                    };
                }
                ElectionOutcome::InProgress
            }

            ElectionState::FollowerReady => ElectionOutcome::Concluded {
                leadership_term_id: self.leadership_term_id,
                is_leader: false,
            },

            ElectionState::Closed => ElectionOutcome::Concluded {
                leadership_term_id: self.leadership_term_id,
                is_leader: self.is_leader,
            },
        }
    }

    /// Called by the agent once it observes (via `ServiceAck::has_reached`)
    /// that a service has joined the new term at `termBaseLogPosition`
    /// (spec.md §4.2 Leader/Follower steps, §4.1 Service acknowledgements).
    pub fn on_service_joined(&mut self) {
        self.services_joined += 1;
    }

    /// Advances out of `LEADER_LOG_REPLICATION` once the agent's bounded
    /// archive handshake (truncate, open new recording) has completed.
    pub fn advance_leader_replay(&mut self, now_ns: u64) {
        if self.state == ElectionState::LeaderLogReplication {
            self.state = ElectionState::LeaderReplay;
            self.state_entered_ns = now_ns;
        }
    }

    /// Advances out of `FOLLOWER_LOG_REPLICATION` once replicating missing
    /// recording segments up to the leader's `termBaseLogPosition` has
    /// completed.
    pub fn advance_follower_replay(&mut self, now_ns: u64) {
        if self.state == ElectionState::FollowerLogReplication {
            self.state = ElectionState::FollowerReplay;
            self.state_entered_ns = now_ns;
        }
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn leadership_term_id(&self) -> LeadershipTermId {
        self.leadership_term_id
    }

    pub fn leader_member_id(&self) -> Option<NodeId> {
        self.leader_member_id
    }

    /// The term this member is canvassing votes for, once it has declared
    /// itself a candidate (spec.md §4.2 Nominate). `None` before `NOMINATE`
    /// concludes or once it has lost/deferred to a higher term.
    pub fn candidate_term_id(&self) -> Option<LeadershipTermId> {
        self.candidate_term_id
    }

    /// The log position the winning leader's new term is based on, valid
    /// once this member has (or believes it has) entered `LEADER_LOG_REPLICATION`
    /// or `FOLLOWER_LOG_REPLICATION` (spec.md §4.2 Leader/Follower steps).
    pub fn term_base_log_position(&self) -> LogPosition {
        self.term_base_log_position
    }

    /// The member with the highest `(logPosition, leadershipTermId)` among
    /// canvassed peers and self, tie-broken by lowest `memberId`, declares
    /// itself candidate (spec.md §4.2 Nominate).
    fn is_leader_candidate(&self, local_extent: LogExtent) -> bool {
        let mut best_extent = local_extent;
        let mut best_member = self.local_member_id;
        for (&member_id, &extent) in &self.canvass_positions {
            if extent > best_extent || (extent == best_extent && member_id < best_member) {
                best_extent = extent;
                best_member = member_id;
            }
        }
        best_member == self.local_member_id
    }

    fn next_candidate_term(&self) -> LeadershipTermId {
        let max_seen = self
            .canvass_positions
            .values()
            .map(|e| e.leadership_term_id)
            .chain(std::iter::once(self.leadership_term_id))
            .max()
            .unwrap_or(self.leadership_term_id);
        max_seen + 1
    }

    fn enter_nominate(&mut self, local_extent: LogExtent, now_ns: u64) {
        if self.canvass_positions.is_empty() {
            // No peers responded within the timeout: treat as a soft event,
            // not fatal, and let the caller observe via ElectionEvent.
        }
        let _ = local_extent;
        self.state = ElectionState::Nominate;
        self.state_entered_ns = now_ns;
    }
}

/// Non-fatal anomalies surfaced while driving the election, reported
/// through the caller's error handler rather than returned from
/// `do_work` (spec.md §7).
pub fn canvass_timeout_event(elapsed_ns: u64, timeout_ns: u64) -> ClusterEvent {
    ClusterEvent::LogDisconnectedFromLeader { elapsed_ns, timeout_ns }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_active(n: usize) -> ClusterMemberTable {
        let mut table = ClusterMemberTable::new();
        for id in 0..n as NodeId {
            table.add_active(crate::membership::ClusterMember::new(
                id,
                crate::membership::MemberEndpoints {
                    consensus: format!("c{id}"),
                    log: format!("l{id}"),
                    ingress: format!("i{id}"),
                    catchup: format!("k{id}"),
                    archive: format!("a{id}"),
                },
            ));
        }
        table
    }

    #[test]
    fn highest_log_position_wins_nomination_tie_broken_by_member_id() {
        let mut election = Election::new(2, 1, false);
        election.on_canvass_position(
            &CanvassPosition {
                log_leadership_term_id: 0,
                log_position: 100,
                leadership_term_id: 0,
                follower_member_id: 1,
                protocol_version: 1,
            },
            3,
        );
        election.on_canvass_position(
            &CanvassPosition {
                log_leadership_term_id: 0,
                log_position: 50,
                leadership_term_id: 0,
                follower_member_id: 0,
                protocol_version: 1,
            },
            3,
        );
        // local member 2's extent (0 here) is lower than peer 1's 100, so 2 is not the candidate.
        assert!(!election.is_leader_candidate(LogExtent { log_position: 0, leadership_term_id: 0 }));
        // but if local extent ties the best peer and has a lower id, local should not win either since 1 < 2.
        assert!(!election.is_leader_candidate(LogExtent { log_position: 100, leadership_term_id: 0 }));
    }

    #[test]
    fn vote_requires_candidate_at_least_as_current() {
        let mut election = Election::new(1, 1, false);
        let local = LogExtent { log_position: 100, leadership_term_id: 2 };
        let weaker = LogExtent { log_position: 50, leadership_term_id: 2 };
        let stronger = LogExtent { log_position: 200, leadership_term_id: 2 };

        assert!(!election.decide_vote(5, weaker, local));
        // Already voted for term 5; a later, stronger request for the same term must not be granted again.
        let mut election2 = Election::new(1, 1, false);
        assert!(election2.decide_vote(5, stronger, local));
        assert!(!election2.decide_vote(5, stronger, local));
    }

    #[test]
    fn canvass_advances_to_nominate_on_quorum() {
        let mut election = Election::new(0, 1, false);
        let table = table_with_active(3);
        let local = LogExtent { log_position: 0, leadership_term_id: 0 };
        let log = RecordingLog::open(tempfile::NamedTempFile::new().unwrap().path(), crate::config::FileSyncLevel::None).unwrap();

        election.do_work(0, 1_000_000, 1024, local, &table, &log); // Init -> Canvass
        assert_eq!(election.state(), ElectionState::Canvass);

        election.on_canvass_position(
            &CanvassPosition {
                log_leadership_term_id: 0,
                log_position: 0,
                leadership_term_id: 0,
                follower_member_id: 1,
                protocol_version: 1,
            },
            3,
        );
        election.do_work(10, 1_000_000, 1024, local, &table, &log);
        assert_eq!(election.state(), ElectionState::CandidateBallot);
    }

    #[test]
    fn new_leadership_term_cancels_election_unconditionally() {
        let mut election = Election::new(5, 1, false);
        election.on_new_leadership_term(
            &NewLeadershipTerm {
                next_leadership_term_id: 3,
                next_term_base_log_position: 1000,
                next_log_position: 1000,
                current_leadership_term_id: 2,
                current_term_base_log_position: 0,
                leader_recording_id: 9,
                timestamp: 0,
                leader_id: 9,
                log_session_id: 1,
                app_version: 1,
                is_startup: false,
            },
            0,
        );
        assert_eq!(election.state(), ElectionState::FollowerLogReplication);
        assert!(!election.is_leader());
        assert_eq!(election.leadership_term_id(), 3);
    }

    #[test]
    fn error_restarts_from_canvass_with_growing_backoff() {
        let mut election = Election::new(1, 1, false);
        let first_backoff = election.backoff();
        election.handle_error(100, &ElectionError::CanvassTimedOut);
        assert_eq!(election.state(), ElectionState::Canvass);
        assert!(election.backoff() > first_backoff);
    }
}
