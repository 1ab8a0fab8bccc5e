//! Snapshot taker/loader (spec.md §4.7): serializes/deserializes the full
//! consensus-module state into an archived stream as a sequence of tagged
//! sections, the way `memstore::do_log_compaction` serializes its state
//! machine with `serde_json` into a `MemStoreSnapshot` — except here the
//! state is spread across several owners (`SessionTable`, `TimerService`,
//! `PendingServiceMessageTracker` per service, `ClusterMemberTable`) rather
//! than a single state machine, so the format is a sequence of sections
//! instead of one blob.

use std::io::BufRead;
use std::io::Write;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::config::TimeUnit;
use crate::membership::ClusterMember;
use crate::pending::PendingServiceMessage;
use crate::session::ClusterSession;
use crate::timer::TimerEntry;
use crate::NodeId;
use crate::ServiceId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("incompatible snapshot app version: running {running}, found {found}")]
    IncompatibleAppVersion { running: i32, found: i32 },

    #[error("incompatible snapshot time unit: running {running:?}, found {found:?}")]
    IncompatibleTimeUnit { running: TimeUnit, found: TimeUnit },

    #[error("snapshot missing required section: {0}")]
    MissingSection(&'static str),

    #[error("malformed snapshot section: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SnapshotError {
    fn from(e: std::io::Error) -> Self {
        SnapshotError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(e: serde_json::Error) -> Self {
        SnapshotError::Malformed(e.to_string())
    }
}

/// The `consensusModuleState` section header (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusModuleSnapshotHeader {
    pub app_version: i32,
    pub time_unit: TimeUnit,
    pub next_session_id: i64,
    pub next_service_session_id: u32,
    pub log_service_session_id: u32,
    pub pending_message_capacity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMembersSection {
    pub member_id: NodeId,
    pub high_member_id: NodeId,
    pub encoded_members: Vec<ClusterMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingServiceMessagesSection {
    pub service_id: ServiceId,
    pub pending: Vec<PendingServiceMessage>,
    pub next_service_session_id: u32,
    pub log_service_session_id: u32,
}

/// One line of the snapshot stream, in the fixed order spec.md §4.7
/// mandates: `begin • consensusModuleState • clusterMembers • sessions •
/// timer set • per-service pending-message trackers • end`.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Section {
    Begin { app_version: i32, time_unit: TimeUnit },
    ConsensusModuleState(ConsensusModuleSnapshotHeader),
    ClusterMembers(ClusterMembersSection),
    Sessions(Vec<ClusterSession>),
    Timers(Vec<TimerEntry>),
    PendingServiceMessages(PendingServiceMessagesSection),
    End,
}

/// Everything a [`SnapshotLoader`] hands back once a snapshot has been
/// validated and parsed.
#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub header: ConsensusModuleSnapshotHeader,
    pub members: ClusterMembersSection,
    pub sessions: Vec<ClusterSession>,
    pub timers: Vec<TimerEntry>,
    pub pending: Vec<PendingServiceMessagesSection>,
}

/// Writes a full snapshot as newline-delimited JSON sections onto any
/// `Write` (in practice, a publication into a fresh archived stream opened
/// for the duration of `SNAPSHOT` state).
pub struct SnapshotTaker;

impl SnapshotTaker {
    #[allow(clippy::too_many_arguments)]
    pub fn take<W: Write>(
        writer: &mut W,
        app_version: i32,
        time_unit: TimeUnit,
        header: ConsensusModuleSnapshotHeader,
        members: ClusterMembersSection,
        sessions: &[ClusterSession],
        timers: &[TimerEntry],
        pending: &[PendingServiceMessagesSection],
    ) -> Result<(), SnapshotError> {
        Self::write_section(writer, &Section::Begin { app_version, time_unit })?;
        Self::write_section(writer, &Section::ConsensusModuleState(header))?;
        Self::write_section(writer, &Section::ClusterMembers(members))?;
        // Only OPEN and CLOSING sessions are snapshotted (spec.md §4.7).
        let snapshot_sessions: Vec<ClusterSession> = sessions
            .iter()
            .filter(|s| matches!(s.state, crate::session::SessionState::Open | crate::session::SessionState::Closing))
            .cloned()
            .collect();
        Self::write_section(writer, &Section::Sessions(snapshot_sessions))?;
        Self::write_section(writer, &Section::Timers(timers.to_vec()))?;
        for tracker in pending {
            Self::write_section(writer, &Section::PendingServiceMessages(tracker.clone()))?;
        }
        Self::write_section(writer, &Section::End)?;
        Ok(())
    }

    fn write_section<W: Write>(writer: &mut W, section: &Section) -> Result<(), SnapshotError> {
        let line = serde_json::to_string(section)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

/// Reads a snapshot produced by [`SnapshotTaker`], rejecting it outright if
/// its `appVersion`/`timeUnit` is incompatible with the running node's
/// (spec.md §4.7).
pub struct SnapshotLoader;

impl SnapshotLoader {
    pub fn load<R: BufRead>(reader: R, running_app_version: i32, running_time_unit: TimeUnit) -> Result<LoadedSnapshot, SnapshotError> {
        let mut lines = reader.lines();

        let begin: Section = serde_json::from_str(&lines.next().ok_or(SnapshotError::MissingSection("begin"))??)?;
        match begin {
            Section::Begin { app_version, time_unit } => {
                if app_version != running_app_version {
                    return Err(SnapshotError::IncompatibleAppVersion { running: running_app_version, found: app_version });
                }
                if time_unit != running_time_unit {
                    return Err(SnapshotError::IncompatibleTimeUnit { running: running_time_unit, found: time_unit });
                }
            }
            _ => return Err(SnapshotError::Malformed("expected Begin section".into())),
        }

        let header = match Self::next_section(&mut lines)? {
            Section::ConsensusModuleState(h) => h,
            _ => return Err(SnapshotError::Malformed("expected ConsensusModuleState section".into())),
        };
        let members = match Self::next_section(&mut lines)? {
            Section::ClusterMembers(m) => m,
            _ => return Err(SnapshotError::Malformed("expected ClusterMembers section".into())),
        };
        let sessions = match Self::next_section(&mut lines)? {
            Section::Sessions(s) => s,
            _ => return Err(SnapshotError::Malformed("expected Sessions section".into())),
        };
        let timers = match Self::next_section(&mut lines)? {
            Section::Timers(t) => t,
            _ => return Err(SnapshotError::Malformed("expected Timers section".into())),
        };

        let mut pending = Vec::new();
        loop {
            match Self::next_section(&mut lines)? {
                Section::PendingServiceMessages(p) => pending.push(p),
                Section::End => break,
                _ => return Err(SnapshotError::Malformed("expected PendingServiceMessages or End section".into())),
            }
        }

        Ok(LoadedSnapshot { header, members, sessions, timers, pending })
    }

    fn next_section(lines: &mut std::io::Lines<impl BufRead>) -> Result<Section, SnapshotError> {
        let line = lines.next().ok_or(SnapshotError::MissingSection("truncated snapshot"))??;
        Ok(serde_json::from_str(&line)?)
    }
}

/// Outcome of running the pending-service-messages patch utility
/// (spec.md §4.7, §8 testable property 11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    NoChange,
    Patched { log_service_session_id: u32, next_service_session_id: u32 },
}

/// A historical defect could leave `logServiceSessionId`/`nextServiceSessionId`
/// not bracketing the pending messages' sequence numbers by exactly the
/// right count. Given the sequence numbers actually present in the pending
/// list, recompute the tight bracket `[min - 1, max + 1]` and report whether
/// anything changed (spec.md §4.7).
pub fn patch_pending_bracket(pending_sequences: &[u32], log_service_session_id: u32, next_service_session_id: u32) -> PatchOutcome {
    if pending_sequences.is_empty() {
        return PatchOutcome::NoChange;
    }
    let min = *pending_sequences.iter().min().unwrap();
    let max = *pending_sequences.iter().max().unwrap();
    let correct_log = min.saturating_sub(1);
    let correct_next = max + 1;
    if correct_log == log_service_session_id && correct_next == next_service_session_id {
        PatchOutcome::NoChange
    } else {
        PatchOutcome::Patched {
            log_service_session_id: correct_log,
            next_service_session_id: correct_next,
        }
    }
}

/// Applies [`patch_pending_bracket`] to a snapshot file in place, rewriting
/// only the affected tracker sections and preserving `nextSessionId`
/// (spec.md §8 testable property 11). Operates on a stopped node, the way
/// `RecordingLog::sort_recording_log` does.
pub fn patch_snapshot_file(path: &std::path::Path) -> Result<PatchOutcome, SnapshotError> {
    let content = std::fs::read_to_string(path)?;
    let mut sections: Vec<Section> = content
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;

    let mut all_sequences = Vec::new();
    for section in &sections {
        if let Section::PendingServiceMessages(tracker) = section {
            for m in &tracker.pending {
                if let Some((_, sequence)) = crate::pending::decode_service_session_id(m.cluster_session_id) {
                    all_sequences.push(sequence);
                }
            }
        }
    }

    let header_position = sections.iter().position(|s| matches!(s, Section::ConsensusModuleState(_)));
    let Some(header_position) = header_position else {
        return Err(SnapshotError::MissingSection("consensusModuleState"));
    };
    let (log_id, next_id) = match &sections[header_position] {
        Section::ConsensusModuleState(h) => (h.log_service_session_id, h.next_service_session_id),
        _ => unreachable!(),
    };

    let outcome = patch_pending_bracket(&all_sequences, log_id, next_id);
    if let PatchOutcome::Patched { log_service_session_id, next_service_session_id } = outcome {
        if let Section::ConsensusModuleState(h) = &mut sections[header_position] {
            h.log_service_session_id = log_service_session_id;
            h.next_service_session_id = next_service_session_id;
        }
        let tmp_path = path.with_extension("tmp");
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            for section in &sections {
                let line = serde_json::to_string(section)?;
                tmp.write_all(line.as_bytes())?;
                tmp.write_all(b"\n")?;
            }
        }
        std::fs::rename(tmp_path, path)?;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header() -> ConsensusModuleSnapshotHeader {
        ConsensusModuleSnapshotHeader {
            app_version: 1,
            time_unit: TimeUnit::Millis,
            next_session_id: 10,
            next_service_session_id: 0,
            log_service_session_id: 0,
            pending_message_capacity: 128,
        }
    }

    fn members() -> ClusterMembersSection {
        ClusterMembersSection {
            member_id: 1,
            high_member_id: 1,
            encoded_members: vec![],
        }
    }

    #[test]
    fn take_then_load_round_trips() {
        let mut buf = Vec::new();
        SnapshotTaker::take(&mut buf, 1, TimeUnit::Millis, header(), members(), &[], &[], &[]).unwrap();

        let loaded = SnapshotLoader::load(Cursor::new(buf), 1, TimeUnit::Millis).unwrap();
        assert_eq!(loaded.header.next_session_id, 10);
        assert!(loaded.sessions.is_empty());
    }

    #[test]
    fn load_rejects_incompatible_app_version() {
        let mut buf = Vec::new();
        SnapshotTaker::take(&mut buf, 2, TimeUnit::Millis, header(), members(), &[], &[], &[]).unwrap();
        let err = SnapshotLoader::load(Cursor::new(buf), 1, TimeUnit::Millis).unwrap_err();
        assert_eq!(err, SnapshotError::IncompatibleAppVersion { running: 1, found: 2 });
    }

    #[test]
    fn load_rejects_incompatible_time_unit() {
        let mut buf = Vec::new();
        SnapshotTaker::take(&mut buf, 1, TimeUnit::Nanos, header(), members(), &[], &[], &[]).unwrap();
        let err = SnapshotLoader::load(Cursor::new(buf), 1, TimeUnit::Millis).unwrap_err();
        assert_eq!(err, SnapshotError::IncompatibleTimeUnit { running: TimeUnit::Millis, found: TimeUnit::Nanos });
    }

    #[test]
    fn only_open_and_closing_sessions_are_snapshotted() {
        use crate::session::ClusterSession;
        use crate::session::SessionAction;
        use crate::session::SessionState;

        let mut open = ClusterSession::new(1, 1, SessionAction::Client, "chan".into(), 1);
        open.state = SessionState::Open;
        let mut closing = ClusterSession::new(2, 2, SessionAction::Client, "chan".into(), 1);
        closing.state = SessionState::Closing;
        let mut connecting = ClusterSession::new(3, 3, SessionAction::Client, "chan".into(), 1);
        connecting.state = SessionState::Connecting;

        let mut buf = Vec::new();
        SnapshotTaker::take(&mut buf, 1, TimeUnit::Millis, header(), members(), &[open, closing, connecting], &[], &[]).unwrap();
        let loaded = SnapshotLoader::load(Cursor::new(buf), 1, TimeUnit::Millis).unwrap();
        let ids: Vec<i64> = loaded.sessions.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn patch_bracket_no_change_when_already_correct() {
        assert_eq!(patch_pending_bracket(&[3, 4, 5], 2, 6), PatchOutcome::NoChange);
    }

    #[test]
    fn patch_bracket_tightens_wrong_range() {
        assert_eq!(
            patch_pending_bracket(&[3, 4, 5], 0, 100),
            PatchOutcome::Patched { log_service_session_id: 2, next_service_session_id: 6 }
        );
    }

    #[test]
    fn patch_file_preserves_next_session_id() {
        use crate::pending::encode_service_session_id;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot");
        let mut buf = Vec::new();
        let tracker = PendingServiceMessagesSection {
            service_id: 0,
            pending: vec![PendingServiceMessage {
                cluster_session_id: encode_service_session_id(0, 5),
                body: vec![],
                append_position: None,
            }],
            next_service_session_id: 100,
            log_service_session_id: 0,
        };
        SnapshotTaker::take(&mut buf, 1, TimeUnit::Millis, header(), members(), &[], &[], std::slice::from_ref(&tracker)).unwrap();
        std::fs::write(&path, &buf).unwrap();

        let outcome = patch_snapshot_file(&path).unwrap();
        assert_eq!(outcome, PatchOutcome::Patched { log_service_session_id: 4, next_service_session_id: 6 });

        // idempotent: running again reports no change, and nextSessionId (10) is untouched.
        assert_eq!(patch_snapshot_file(&path).unwrap(), PatchOutcome::NoChange);
        let loaded = SnapshotLoader::load(Cursor::new(std::fs::read(&path).unwrap()), 1, TimeUnit::Millis).unwrap();
        assert_eq!(loaded.header.next_session_id, 10);
    }
}
