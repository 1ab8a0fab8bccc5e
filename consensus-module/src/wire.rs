//! Inter-member control messages (spec.md §6, "Consensus wire messages").
//!
//! The source encodes these with a generated SBE codec (`schemaId`,
//! `templateId`, `blockLength`, `version` header, then a fixed block and
//! variable-length strings). This crate has no SBE generator in its
//! dependency stack, so the header is kept as an explicit struct and the
//! payload is carried as a `serde`-tagged enum instead — the same choice the
//! teacher makes for its own RPC payloads, where `RaftNetwork` ships
//! `AppendEntriesRequest`/`VoteRequest` as plain `serde`-derived structs over
//! whatever transport a `RaftNetwork` impl chooses (`toy-rpc` in
//! `raft-kv-rocksdb`). Field names and shapes match spec.md's table exactly;
//! only the encoding mechanism differs.

use serde::Deserialize;
use serde::Serialize;

use crate::config::TimeUnit;
use crate::LeadershipTermId;
use crate::LogPosition;
use crate::NodeId;
use crate::RecordingId;
use crate::ServiceId;
use crate::TimestampMs;

/// Mirrors the SBE message header every consensus message in the source
/// carries ahead of its fixed block. Kept even though `serde` doesn't need
/// it, so that `protocol_version` compatibility checks have somewhere to
/// live (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub schema_id: u16,
    pub template_id: u16,
    pub block_length: u16,
    pub version: u16,
}

pub const SCHEMA_ID: u16 = 1;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvassPosition {
    pub log_leadership_term_id: LeadershipTermId,
    pub log_position: LogPosition,
    pub leadership_term_id: LeadershipTermId,
    pub follower_member_id: NodeId,
    pub protocol_version: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVote {
    pub log_leadership_term_id: LeadershipTermId,
    pub log_position: LogPosition,
    pub candidate_term_id: LeadershipTermId,
    pub candidate_id: NodeId,
    pub protocol_version: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub candidate_term_id: LeadershipTermId,
    pub log_leadership_term_id: LeadershipTermId,
    pub log_position: LogPosition,
    pub candidate_member_id: NodeId,
    pub follower_member_id: NodeId,
    pub vote: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLeadershipTerm {
    pub next_leadership_term_id: LeadershipTermId,
    pub next_term_base_log_position: LogPosition,
    pub next_log_position: LogPosition,
    pub current_leadership_term_id: LeadershipTermId,
    pub current_term_base_log_position: LogPosition,
    pub leader_recording_id: RecordingId,
    pub timestamp: TimestampMs,
    pub leader_id: NodeId,
    pub log_session_id: i64,
    pub app_version: i32,
    pub is_startup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendPositionFlags {
    None,
    Catchup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendPosition {
    pub leadership_term_id: LeadershipTermId,
    pub log_position: LogPosition,
    pub follower_member_id: NodeId,
    pub flags: AppendPositionFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPosition {
    pub leadership_term_id: LeadershipTermId,
    pub log_position: LogPosition,
    pub leader_member_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchupPosition {
    pub leadership_term_id: LeadershipTermId,
    pub log_position: LogPosition,
    pub follower_member_id: NodeId,
    pub catchup_endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopCatchup {
    pub leadership_term_id: LeadershipTermId,
    pub follower_member_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPassiveMember {
    pub correlation_id: i64,
    pub member_endpoints: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembersChange {
    pub leadership_term_id: LeadershipTermId,
    pub member_id: NodeId,
    pub cluster_members: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveMember {
    pub member_id: NodeId,
    pub is_passive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCluster {
    pub leadership_term_id: LeadershipTermId,
    pub member_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationPosition {
    pub leadership_term_id: LeadershipTermId,
    pub log_position: LogPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationAck {
    pub leadership_term_id: LeadershipTermId,
    pub log_position: LogPosition,
    pub member_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecordings {
    pub leadership_term_id: LeadershipTermId,
    pub log_position: LogPosition,
    pub leader_member_id: NodeId,
    /// One `(serviceId, recordingId)` pair per service plus the consensus
    /// module's own, in `ServiceId` order (`CONSENSUS_MODULE_SERVICE_ID`
    /// first).
    pub recordings: Vec<(ServiceId, RecordingId)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupQuery {
    pub correlation_id: i64,
    pub requester_member_id: NodeId,
    pub version: i32,
    pub time_unit: TimeUnit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub correlation_id: i64,
    pub cluster_session_id: i64,
    pub encoded_credentials: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub leadership_term_id: LeadershipTermId,
    pub leader_member_id: NodeId,
}

/// The admin request/response surface referenced in spec.md §7 and
/// exercised end-to-end by §8 scenario S6. Not an SBE-style wire message in
/// the source (it rides the ingress channel as an encoded client request),
/// but given the same tagged-enum shape here for uniformity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminRequest {
    Snapshot,
    Suspend,
    Resume,
    Shutdown,
    Abort,
    ListMembers,
    RemoveMember { member_id: NodeId },
    RemovePassiveMember { member_id: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminResponseCode {
    Ok,
    Error,
    UnauthorisedAccess,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminResponse {
    pub code: AdminResponseCode,
    pub correlation_id: i64,
    pub message: String,
}

/// Every inter-member message kind, tagged for dispatch by
/// `consensus_adapter::ConsensusAdapter` (spec.md §6 table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    CanvassPosition(CanvassPosition),
    RequestVote(RequestVote),
    Vote(Vote),
    NewLeadershipTerm(NewLeadershipTerm),
    AppendPosition(AppendPosition),
    CommitPosition(CommitPosition),
    CatchupPosition(CatchupPosition),
    StopCatchup(StopCatchup),
    AddPassiveMember(AddPassiveMember),
    ClusterMembersChange(ClusterMembersChange),
    RemoveMember(RemoveMember),
    JoinCluster(JoinCluster),
    TerminationPosition(TerminationPosition),
    TerminationAck(TerminationAck),
    SnapshotRecordings(SnapshotRecordings),
    BackupQuery(BackupQuery),
    ChallengeResponse(ChallengeResponse),
    HeartbeatRequest(HeartbeatRequest),
}

impl ConsensusMessage {
    /// Encodes with a length-prefixed `serde_json` body behind the header,
    /// standing in for the source's SBE `templateId`-dispatched codec.
    pub fn encode(&self) -> Vec<u8> {
        let body = serde_json::to_vec(self).expect("ConsensusMessage serializes");
        let header = MessageHeader {
            schema_id: SCHEMA_ID,
            template_id: self.template_id(),
            block_length: body.len() as u16,
            version: CURRENT_PROTOCOL_VERSION,
        };
        let mut out = serde_json::to_vec(&header).expect("MessageHeader serializes");
        out.push(b'\n');
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let split = bytes.iter().position(|&b| b == b'\n').unwrap_or(0);
        let (_header, rest) = bytes.split_at(split);
        serde_json::from_slice(&rest[1..])
    }

    fn template_id(&self) -> u16 {
        match self {
            ConsensusMessage::CanvassPosition(_) => 1,
            ConsensusMessage::RequestVote(_) => 2,
            ConsensusMessage::Vote(_) => 3,
            ConsensusMessage::NewLeadershipTerm(_) => 4,
            ConsensusMessage::AppendPosition(_) => 5,
            ConsensusMessage::CommitPosition(_) => 6,
            ConsensusMessage::CatchupPosition(_) => 7,
            ConsensusMessage::StopCatchup(_) => 8,
            ConsensusMessage::AddPassiveMember(_) => 9,
            ConsensusMessage::ClusterMembersChange(_) => 10,
            ConsensusMessage::RemoveMember(_) => 11,
            ConsensusMessage::JoinCluster(_) => 12,
            ConsensusMessage::TerminationPosition(_) => 13,
            ConsensusMessage::TerminationAck(_) => 14,
            ConsensusMessage::SnapshotRecordings(_) => 15,
            ConsensusMessage::BackupQuery(_) => 16,
            ConsensusMessage::ChallengeResponse(_) => 17,
            ConsensusMessage::HeartbeatRequest(_) => 18,
        }
    }
}
