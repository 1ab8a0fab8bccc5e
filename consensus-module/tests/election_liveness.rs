//! Multi-member scenario coverage (spec.md §8, S7 "Election liveness" and
//! S1 "Echo at steady state"): several [`ConsensusModuleAgent`]s wired
//! together over an in-memory broadcast bus instead of a real transport,
//! ticked round-robin the way a test harness would drive `async-raft`'s
//! `MemRaft` cluster in its own integration tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use consensus_module::agent::ConsensusModuleAgent;
use consensus_module::clock::TestClock;
use consensus_module::config::ConsensusModuleConfig;
use consensus_module::config::FileSyncLevel;
use consensus_module::error::AnyError;
use consensus_module::membership::ClusterMember;
use consensus_module::membership::ClusterMemberTable;
use consensus_module::membership::MemberEndpoints;
use consensus_module::recording_log::RecordingLog;
use consensus_module::service::ServiceContainer;
use consensus_module::transport::ArchiveClient;
use consensus_module::transport::FragmentAction;
use consensus_module::transport::Image;
use consensus_module::transport::OfferResult;
use consensus_module::transport::Publication;
use consensus_module::transport::RecordingDescriptor;
use consensus_module::transport::RecordingSignalEvent;
use consensus_module::transport::SourceLocation;
use consensus_module::LogPosition;
use consensus_module::NodeId;

/// A broadcast channel shared by every member: `offer` fans a frame out to
/// every other member's inbox, modeling the point-to-point reliability (but
/// not the ordering subtleties) of the real multicast transport.
#[derive(Clone)]
struct Bus {
    inboxes: Vec<Arc<Mutex<VecDeque<Vec<u8>>>>>,
}

impl Bus {
    fn new(member_count: usize) -> Self {
        Self {
            inboxes: (0..member_count).map(|_| Arc::new(Mutex::new(VecDeque::new()))).collect(),
        }
    }
}

struct BusPublication {
    bus: Bus,
    from: usize,
    pos: u64,
}

impl Publication for BusPublication {
    fn offer(&mut self, buffer: &[u8]) -> OfferResult {
        self.pos += buffer.len() as u64;
        for (i, inbox) in self.bus.inboxes.iter().enumerate() {
            if i != self.from {
                inbox.lock().unwrap().push_back(buffer.to_vec());
            }
        }
        Ok(self.pos as i64)
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn is_connected(&self) -> bool {
        true
    }
}

struct BusImage {
    inbox: Arc<Mutex<VecDeque<Vec<u8>>>>,
    pos: u64,
}

impl Image for BusImage {
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

    fn poll(&mut self, fragment_limit: usize, handler: &mut dyn FnMut(&[u8], u64) -> FragmentAction) -> usize {
        let mut polled = 0;
        while polled < fragment_limit {
            let frame = self.inbox.lock().unwrap().pop_front();
            match frame {
                Some(bytes) => {
                    self.pos += bytes.len() as u64;
                    handler(&bytes, self.pos);
                    polled += 1;
                }
                None => break,
            }
        }
        polled
    }
}

struct NullArchive;

#[async_trait]
impl ArchiveClient for NullArchive {
    async fn start_recording(&self, _: &str, _: i32, _: SourceLocation) -> Result<i64, AnyError> {
        Ok(1)
    }
    async fn extend_recording(&self, _: i64, _: &str, _: i32, _: SourceLocation) -> Result<i64, AnyError> {
        Ok(1)
    }
    async fn stop_recording(&self, _: i64) -> Result<(), AnyError> {
        Ok(())
    }
    async fn truncate_recording(&self, _: i64, _: u64) -> Result<(), AnyError> {
        Ok(())
    }
    async fn start_replay(&self, _: i64, _: u64, _: i64, _: &str, _: i32) -> Result<i64, AnyError> {
        Ok(1)
    }
    async fn stop_replay(&self, _: i64) -> Result<(), AnyError> {
        Ok(())
    }
    async fn get_stop_position(&self, _: i64) -> Result<u64, AnyError> {
        Ok(0)
    }
    async fn purge_segments(&self, _: i64, _: u64) -> Result<(), AnyError> {
        Ok(())
    }
    async fn detach_segments(&self, _: i64, _: u64) -> Result<(), AnyError> {
        Ok(())
    }
    async fn attach_segments(&self, _: i64) -> Result<(), AnyError> {
        Ok(())
    }
    async fn delete_detached_segments(&self, _: i64) -> Result<(), AnyError> {
        Ok(())
    }
    async fn migrate_segments(&self, _: i64, _: i64) -> Result<(), AnyError> {
        Ok(())
    }
    async fn list_recording(&self, _: i64) -> Result<Option<RecordingDescriptor>, AnyError> {
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

type TestAgent = ConsensusModuleAgent<TestClock, NullArchive, NullService, BusPublication, BusImage, BusPublication, BusImage>;

fn member_table(member_count: usize) -> ClusterMemberTable {
    let mut members = ClusterMemberTable::new();
    for id in 0..member_count as u64 {
        members.add_active(ClusterMember::new(
            id,
            MemberEndpoints {
                consensus: format!("consensus-{id}"),
                log: format!("log-{id}"),
                ingress: format!("ingress-{id}"),
                catchup: format!("catchup-{id}"),
                archive: format!("archive-{id}"),
            },
        ));
    }
    members
}

fn spawn_cluster(member_count: usize) -> Vec<TestAgent> {
    let consensus_bus = Bus::new(member_count);
    let log_bus = Bus::new(member_count);

    (0..member_count)
        .map(|id| {
            let log = RecordingLog::open(tempfile::NamedTempFile::new().unwrap().path(), FileSyncLevel::None).unwrap();
            ConsensusModuleAgent::new(
                ConsensusModuleConfig { service_count: 1, ..Default::default() },
                TestClock::new(),
                NullArchive,
                NullService,
                id as u64,
                member_table(member_count),
                log,
                BusPublication { bus: consensus_bus.clone(), from: id, pos: 0 },
                BusImage { inbox: consensus_bus.inboxes[id].clone(), pos: 0 },
                BusPublication { bus: log_bus.clone(), from: id, pos: 0 },
                BusImage { inbox: log_bus.inboxes[id].clone(), pos: 0 },
            )
        })
        .collect()
}

/// A cluster of three members, ticked round-robin, converges on exactly one
/// leader and every member agrees on the resulting leadership term — the
/// liveness property spec.md §8 names "Election liveness" (S7).
#[tokio::test]
async fn three_member_cluster_converges_on_one_leader() {
    let mut agents = spawn_cluster(3);
    for agent in &mut agents {
        agent.on_start().await.unwrap();
    }

    for _ in 0..200 {
        for agent in &mut agents {
            agent.do_work().await.unwrap();
        }
        if agents.iter().filter(|a| a.is_leader()).count() == 1 {
            break;
        }
    }

    let leaders: Vec<_> = agents.iter().filter(|a| a.is_leader()).collect();
    assert_eq!(leaders.len(), 1, "exactly one member must become leader");

    let term = leaders[0].leadership_term_id();
    assert!(term > 0);
    for agent in &agents {
        assert_eq!(agent.leadership_term_id(), term, "every member must agree on the winning term");
    }
}

/// Once a leader is settled, steady-state ticking keeps every follower's
/// commit position tracking the leader's without additional intervention
/// (spec.md §8, S1 "Echo at steady state" — no log traffic here, only the
/// heartbeat/`AppendPosition`/`CommitPosition` exchange that keeps the
/// cluster's view of progress converged).
#[tokio::test]
async fn steady_state_keeps_commit_position_converged() {
    let mut agents = spawn_cluster(3);
    for agent in &mut agents {
        agent.on_start().await.unwrap();
    }

    for _ in 0..200 {
        for agent in &mut agents {
            agent.do_work().await.unwrap();
        }
        if agents.iter().filter(|a| a.is_leader()).count() == 1 {
            break;
        }
    }
    assert_eq!(agents.iter().filter(|a| a.is_leader()).count(), 1);

    for _ in 0..100 {
        for agent in &mut agents {
            agent.do_work().await.unwrap();
        }
    }

    let leader_commit = agents.iter().find(|a| a.is_leader()).unwrap().commit_position();
    for agent in &agents {
        assert_eq!(agent.commit_position(), leader_commit, "followers must converge on the leader's commit position");
    }
}
