//! The durable, sorted index of leadership terms and snapshots used for
//! recovery (spec.md §4.3). In-memory sorted vector plus an append-only disk
//! file of fixed-size records, analogous in shape to `memstore`'s in-memory
//! `BTreeMap<u64, Entry<D>>` log but backed by real bytes on disk since this
//! index, unlike the application log, must survive a process restart on its
//! own (the application log itself lives in the archive, an external
//! collaborator per spec.md §1).

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Cursor;
use std::io::Read as _;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use byteorder::ByteOrder as _;
use byteorder::LittleEndian;
use byteorder::ReadBytesExt as _;
use byteorder::WriteBytesExt as _;
use thiserror::Error;

use crate::config::FileSyncLevel;
use crate::transport::ArchiveClient;
use crate::LeadershipTermId;
use crate::LogPosition;
use crate::RecordingId;
use crate::ServiceId;
use crate::TimestampMs;
use crate::CONSENSUS_MODULE_SERVICE_ID;
use crate::NULL_POSITION;
use crate::NULL_RECORDING_ID;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordingLogError {
    #[error("recordingId -1 is reserved and cannot be appended")]
    NullRecordingId,

    #[error("duplicate valid TERM entry for leadershipTermId {term_id}: existing recordingId {existing}, attempted {attempted}")]
    DuplicateTerm {
        term_id: LeadershipTermId,
        existing: RecordingId,
        attempted: RecordingId,
    },

    #[error("appendSnapshot requires a valid TERM with termBaseLogPosition <= {snapshot_term_base}, found none for leadershipTermId {term_id}")]
    NoMatchingTerm { term_id: LeadershipTermId, snapshot_term_base: LogPosition },

    #[error("commitLogPosition: unknown leadershipTermId {term_id}")]
    UnknownTerm { term_id: LeadershipTermId },

    #[error("invalidateLatestSnapshot: no parent TERM for leadershipTermId {term_id}")]
    NoParentTerm { term_id: LeadershipTermId },

    #[error("invalidateLatestSnapshot: no valid snapshot to invalidate")]
    NoSnapshotToInvalidate,

    #[error("invalidate_entry: no entry at index {entry_index}")]
    NoSuchEntry { entry_index: u64 },

    #[error("ensureCoherent: last term {term_id} is unfinished and no termBase was supplied")]
    UnfinishedTerm { term_id: LeadershipTermId },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("corrupt record at index {entry_index}: checksum mismatch")]
    ChecksumMismatch { entry_index: u64 },
}

impl From<std::io::Error> for RecordingLogError {
    fn from(e: std::io::Error) -> Self {
        RecordingLogError::Io(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Term,
    Snapshot,
}

impl EntryType {
    fn code(self) -> u8 {
        match self {
            EntryType::Term => 0,
            EntryType::Snapshot => 1,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(EntryType::Term),
            1 => Some(EntryType::Snapshot),
            _ => None,
        }
    }
}

/// One persisted record (spec.md §3, §6). Fixed-size, little-endian,
/// checksummed so `reload()` can tell a torn write from a valid record after
/// an unclean shutdown (spec.md §A, Recording-log CRC/validity).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub recording_id: RecordingId,
    pub leadership_term_id: LeadershipTermId,
    pub term_base_log_position: LogPosition,
    pub log_position: LogPosition,
    pub timestamp: TimestampMs,
    pub service_id: ServiceId,
    pub entry_type: EntryType,
    pub is_valid: bool,
    pub entry_index: u64,
}

/// 8+8+8+8+8+4+1+1+8 data bytes, plus a trailing 4-byte CRC32.
pub const ENTRY_DATA_LENGTH: usize = 54;
pub const ENTRY_LENGTH: usize = ENTRY_DATA_LENGTH + 4;

impl Entry {
    fn to_bytes(self) -> [u8; ENTRY_LENGTH] {
        let mut buf = [0u8; ENTRY_LENGTH];
        {
            let mut w = Cursor::new(&mut buf[..ENTRY_DATA_LENGTH]);
            w.write_i64::<LittleEndian>(self.recording_id).unwrap();
            w.write_u64::<LittleEndian>(self.leadership_term_id).unwrap();
            w.write_u64::<LittleEndian>(self.term_base_log_position).unwrap();
            w.write_u64::<LittleEndian>(self.log_position).unwrap();
            w.write_i64::<LittleEndian>(self.timestamp).unwrap();
            w.write_u32::<LittleEndian>(self.service_id).unwrap();
            w.write_u8(self.entry_type.code()).unwrap();
            w.write_u8(self.is_valid as u8).unwrap();
            w.write_u64::<LittleEndian>(self.entry_index).unwrap();
        }
        let crc = crc32fast::hash(&buf[..ENTRY_DATA_LENGTH]);
        LittleEndian::write_u32(&mut buf[ENTRY_DATA_LENGTH..], crc);
        buf
    }

    fn from_bytes(buf: &[u8; ENTRY_LENGTH]) -> Result<Self, RecordingLogError> {
        let data = &buf[..ENTRY_DATA_LENGTH];
        let crc_stored = LittleEndian::read_u32(&buf[ENTRY_DATA_LENGTH..]);
        let crc_computed = crc32fast::hash(data);
        let entry_index = LittleEndian::read_u64(&data[46..54]);
        if crc_stored != crc_computed {
            return Err(RecordingLogError::ChecksumMismatch { entry_index });
        }
        let mut r = Cursor::new(data);
        let recording_id = r.read_i64::<LittleEndian>().unwrap();
        let leadership_term_id = r.read_u64::<LittleEndian>().unwrap();
        let term_base_log_position = r.read_u64::<LittleEndian>().unwrap();
        let log_position = r.read_u64::<LittleEndian>().unwrap();
        let timestamp = r.read_i64::<LittleEndian>().unwrap();
        let service_id = r.read_u32::<LittleEndian>().unwrap();
        let entry_type_code = r.read_u8().unwrap();
        let is_valid = r.read_u8().unwrap() != 0;
        Ok(Entry {
            recording_id,
            leadership_term_id,
            term_base_log_position,
            log_position,
            timestamp,
            service_id,
            entry_type: EntryType::from_code(entry_type_code).ok_or(RecordingLogError::ChecksumMismatch { entry_index })?,
            is_valid,
            entry_index,
        })
    }

    pub fn is_term(&self) -> bool {
        matches!(self.entry_type, EntryType::Term)
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self.entry_type, EntryType::Snapshot)
    }

    /// `(leadershipTermId asc, type: TERM before SNAPSHOT, serviceId asc:
    /// SERVICE_ID first, then ascending, among equals by entryIndex asc)`,
    /// invalid entries sorting after valid peers of equal key (spec.md §4.3).
    fn sort_key(&self) -> (LeadershipTermId, u8, u64, u8, u64) {
        let type_rank = match self.entry_type {
            EntryType::Term => 0,
            EntryType::Snapshot => 1,
        };
        let service_rank = if self.service_id == CONSENSUS_MODULE_SERVICE_ID {
            0
        } else {
            1 + self.service_id as u64
        };
        let validity_rank = if self.is_valid { 0 } else { 1 };
        (self.leadership_term_id, type_rank, service_rank, validity_rank, self.entry_index)
    }
}

/// Derived from the log on recovery (spec.md §3 RecoveryPlan).
#[derive(Debug, Clone, Default)]
pub struct RecoveryPlan {
    pub last_leadership_term_id: Option<LeadershipTermId>,
    pub last_term_base_log_position: LogPosition,
    pub appended_log_position: LogPosition,
    pub log: Option<Entry>,
    pub snapshots: Vec<Entry>,
}

/// In-memory sorted view plus the backing disk file (spec.md §4.3).
pub struct RecordingLog {
    path: PathBuf,
    file: File,
    entries: Vec<Entry>,
    next_entry_index: u64,
    sync_level: FileSyncLevel,
}

impl RecordingLog {
    /// Opens (creating if absent) the recording-log file at `path` and loads
    /// its entries into memory, sorted per the logical order.
    pub fn open(path: impl AsRef<Path>, sync_level: FileSyncLevel) -> Result<Self, RecordingLogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        let mut log = Self {
            path,
            file,
            entries: Vec::new(),
            next_entry_index: 0,
            sync_level,
        };
        log.reload()?;
        Ok(log)
    }

    /// Re-reads the file from scratch and re-sorts, discarding the in-memory
    /// view (spec.md §8, testable property 5: "`entries()` equals the
    /// in-memory order after `reload()`").
    pub fn reload(&mut self) -> Result<(), RecordingLogError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        self.file.read_to_end(&mut bytes)?;
        self.entries.clear();
        self.next_entry_index = 0;
        let mut offset = 0;
        while offset + ENTRY_LENGTH <= bytes.len() {
            let chunk: [u8; ENTRY_LENGTH] = bytes[offset..offset + ENTRY_LENGTH].try_into().unwrap();
            match Entry::from_bytes(&chunk) {
                Ok(entry) => {
                    self.next_entry_index = self.next_entry_index.max(entry.entry_index + 1);
                    self.entries.push(entry);
                }
                Err(_) => break, // torn tail write; stop at the last coherent record
            }
            offset += ENTRY_LENGTH;
        }
        self.sort_in_memory();
        Ok(())
    }

    fn sort_in_memory(&mut self) {
        self.entries.sort_by_key(Entry::sort_key);
    }

    /// The full, sorted set of entries (spec.md §4.3, §6).
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    fn append_record(&mut self, entry: Entry) -> Result<(), RecordingLogError> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&entry.to_bytes())?;
        self.sync(false)?;
        self.entries.push(entry);
        self.sort_in_memory();
        Ok(())
    }

    fn rewrite_record(&mut self, index_in_file_order: u64, entry: Entry) -> Result<(), RecordingLogError> {
        self.file.seek(SeekFrom::Start(index_in_file_order * ENTRY_LENGTH as u64))?;
        self.file.write_all(&entry.to_bytes())?;
        self.sync(true)?;
        if let Some(slot) = self.entries.iter_mut().find(|e| e.entry_index == entry.entry_index) {
            *slot = entry;
        }
        self.sort_in_memory();
        Ok(())
    }

    fn sync(&mut self, metadata: bool) -> Result<(), RecordingLogError> {
        match self.sync_level {
            FileSyncLevel::None => Ok(()),
            FileSyncLevel::Data if !metadata => self.file.sync_data().map_err(Into::into),
            _ => self.file.sync_all().map_err(Into::into),
        }
    }

    fn valid_term_entry(&self, term_id: LeadershipTermId) -> Option<&Entry> {
        self.entries.iter().find(|e| e.is_term() && e.is_valid && e.leadership_term_id == term_id)
    }

    /// Enforces invariants (i)/(ii)/testable property 3: a duplicate valid
    /// TERM for `term_id`, whether or not `recording_id` matches, fails
    /// (spec.md §3, §8 S3).
    pub fn append_term(
        &mut self,
        recording_id: RecordingId,
        term_id: LeadershipTermId,
        term_base_log_position: LogPosition,
        timestamp: TimestampMs,
    ) -> Result<u64, RecordingLogError> {
        if recording_id == NULL_RECORDING_ID {
            return Err(RecordingLogError::NullRecordingId);
        }
        if let Some(existing) = self.valid_term_entry(term_id) {
            return Err(RecordingLogError::DuplicateTerm {
                term_id,
                existing: existing.recording_id,
                attempted: recording_id,
            });
        }
        let index = self.next_entry_index;
        self.next_entry_index += 1;
        self.append_record(Entry {
            recording_id,
            leadership_term_id: term_id,
            term_base_log_position,
            log_position: NULL_POSITION,
            timestamp,
            service_id: CONSENSUS_MODULE_SERVICE_ID,
            entry_type: EntryType::Term,
            is_valid: true,
            entry_index: index,
        })?;
        Ok(index)
    }

    /// Requires a matching valid TERM with `termBaseLogPosition <=
    /// snapshot.termBaseLogPosition` (spec.md §3 invariant (iii)).
    pub fn append_snapshot(
        &mut self,
        recording_id: RecordingId,
        term_id: LeadershipTermId,
        term_base_log_position: LogPosition,
        log_position: LogPosition,
        timestamp: TimestampMs,
        service_id: ServiceId,
    ) -> Result<u64, RecordingLogError> {
        if recording_id == NULL_RECORDING_ID {
            return Err(RecordingLogError::NullRecordingId);
        }
        match self.valid_term_entry(term_id) {
            Some(term) if term.term_base_log_position <= term_base_log_position => {}
            _ => {
                return Err(RecordingLogError::NoMatchingTerm {
                    term_id,
                    snapshot_term_base: term_base_log_position,
                })
            }
        }
        let index = self.next_entry_index;
        self.next_entry_index += 1;
        self.append_record(Entry {
            recording_id,
            leadership_term_id: term_id,
            term_base_log_position,
            log_position,
            timestamp,
            service_id,
            entry_type: EntryType::Snapshot,
            is_valid: true,
            entry_index: index,
        })?;
        Ok(index)
    }

    /// Updates the matching TERM's `logPosition`; fails if the term is
    /// unknown (spec.md §3 invariant (iv)).
    pub fn commit_log_position(&mut self, term_id: LeadershipTermId, log_position: LogPosition) -> Result<(), RecordingLogError> {
        let file_index = self
            .entries
            .iter()
            .find(|e| e.is_term() && e.leadership_term_id == term_id)
            .map(|e| e.entry_index)
            .ok_or(RecordingLogError::UnknownTerm { term_id })?;
        let mut entry = *self.entries.iter().find(|e| e.entry_index == file_index).unwrap();
        entry.log_position = log_position;
        self.rewrite_record(file_index, entry)
    }

    /// Marks a single entry invalid by its (file) `entry_index`.
    pub fn invalidate_entry(&mut self, entry_index: u64) -> Result<(), RecordingLogError> {
        let mut entry = *self
            .entries
            .iter()
            .find(|e| e.entry_index == entry_index)
            .ok_or(RecordingLogError::NoSuchEntry { entry_index })?;
        entry.is_valid = false;
        self.rewrite_record(entry_index, entry)
    }

    /// Atomically marks the `SERVICE_ID` snapshot and all per-service peer
    /// snapshots for the same `(termId, logPosition)` as invalid; fails if
    /// no parent TERM exists for that term (spec.md §3 invariant (v)).
    pub fn invalidate_latest_snapshot(&mut self) -> Result<(), RecordingLogError> {
        let latest = self
            .entries
            .iter()
            .filter(|e| e.is_snapshot() && e.is_valid && e.service_id == CONSENSUS_MODULE_SERVICE_ID)
            .max_by_key(|e| (e.leadership_term_id, e.log_position))
            .copied()
            .ok_or(RecordingLogError::NoSnapshotToInvalidate)?;

        if self.valid_term_entry(latest.leadership_term_id).is_none() {
            return Err(RecordingLogError::NoParentTerm { term_id: latest.leadership_term_id });
        }

        let group: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| {
                e.is_snapshot()
                    && e.is_valid
                    && e.leadership_term_id == latest.leadership_term_id
                    && e.log_position == latest.log_position
            })
            .map(|e| e.entry_index)
            .collect();

        for index in group {
            self.invalidate_entry(index)?;
        }
        Ok(())
    }

    pub fn find_last_term(&self) -> Option<&Entry> {
        self.entries
            .iter()
            .filter(|e| e.is_term() && e.is_valid)
            .max_by_key(|e| e.leadership_term_id)
    }

    pub fn find_term_entry(&self, term_id: LeadershipTermId) -> Option<&Entry> {
        self.valid_term_entry(term_id)
    }

    pub fn get_latest_snapshot(&self, service_id: ServiceId) -> Option<&Entry> {
        self.entries
            .iter()
            .filter(|e| e.is_snapshot() && e.is_valid && e.service_id == service_id)
            .max_by_key(|e| (e.leadership_term_id, e.log_position))
    }

    pub fn find_last_term_recording_id(&self) -> Option<RecordingId> {
        self.find_last_term().map(|e| e.recording_id)
    }

    /// Derives the plan a restarting node uses to reconstruct state: the
    /// latest valid TERM and, for the newest `(termId, termBase, logPosition)`
    /// group that has a matching valid snapshot for *every* service plus the
    /// consensus module itself, that whole snapshot group (spec.md §3
    /// RecoveryPlan, §8 testable property 4).
    pub async fn create_recovery_plan(
        &self,
        archive: &dyn ArchiveClient,
        service_count: u32,
        log_recording_id: RecordingId,
    ) -> Result<RecoveryPlan, RecordingLogError> {
        let log = self.find_last_term().copied();
        let appended_log_position = match archive.get_stop_position(log_recording_id).await {
            Ok(p) => p,
            Err(_) => log.map(|e| e.log_position).filter(|&p| p != NULL_POSITION).unwrap_or(0),
        };

        // Candidate groups: every distinct (termId, logPosition) that has a
        // valid consensus-module snapshot, newest first.
        let mut groups: Vec<(LeadershipTermId, LogPosition)> = self
            .entries
            .iter()
            .filter(|e| e.is_snapshot() && e.is_valid && e.service_id == CONSENSUS_MODULE_SERVICE_ID)
            .map(|e| (e.leadership_term_id, e.log_position))
            .collect();
        groups.sort_unstable();
        groups.dedup();
        groups.reverse();

        for (term_id, log_position) in groups {
            let peers: Vec<&Entry> = self
                .entries
                .iter()
                .filter(|e| e.is_snapshot() && e.is_valid && e.leadership_term_id == term_id && e.log_position == log_position)
                .collect();
            let has_all_services = (0..service_count).all(|sid| peers.iter().any(|e| e.service_id == sid));
            if has_all_services {
                let mut snapshots: Vec<Entry> = peers.iter().map(|&&e| e).collect();
                snapshots.sort_by_key(Entry::sort_key);
                let term_base = snapshots.first().map(|e| e.term_base_log_position).unwrap_or(0);
                return Ok(RecoveryPlan {
                    last_leadership_term_id: log.map(|e| e.leadership_term_id),
                    last_term_base_log_position: term_base,
                    appended_log_position,
                    log,
                    snapshots,
                });
            }
        }

        Ok(RecoveryPlan {
            last_leadership_term_id: log.map(|e| e.leadership_term_id),
            last_term_base_log_position: log.map(|e| e.term_base_log_position).unwrap_or(0),
            appended_log_position,
            log,
            snapshots: Vec::new(),
        })
    }

    /// Back-fills empty TERM entries so every leadership-term id in
    /// `[initial_term_id, term_id]` appears exactly once; fails if the last
    /// term is unfinished (no committed `logPosition`) and no `term_base` is
    /// supplied for it (spec.md §4.3).
    pub fn ensure_coherent(
        &mut self,
        recording_id: RecordingId,
        initial_term_id: LeadershipTermId,
        initial_term_base: LogPosition,
        term_id: LeadershipTermId,
        term_base: Option<LogPosition>,
        timestamp: TimestampMs,
    ) -> Result<(), RecordingLogError> {
        if self.valid_term_entry(term_id).is_none() && term_base.is_none() {
            return Err(RecordingLogError::UnfinishedTerm { term_id });
        }

        let mut base = initial_term_base;
        for id in initial_term_id..=term_id {
            if self.valid_term_entry(id).is_some() {
                if let Some(e) = self.valid_term_entry(id) {
                    base = e.term_base_log_position;
                }
                continue;
            }
            let this_base = if id == term_id { term_base.unwrap_or(base) } else { base };
            self.append_term(recording_id, id, this_base, timestamp)?;
            base = this_base;
        }
        Ok(())
    }

    /// Rewrites the file via `.tmp` + rename, on a stopped node only
    /// (spec.md §4.3, §6). Leaves `entries()` in the same logical order.
    pub fn sort_recording_log(&mut self) -> Result<(), RecordingLogError> {
        self.sort_in_memory();
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
            for entry in &self.entries {
                tmp.write_all(&entry.to_bytes())?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        Ok(())
    }

    /// Rewrites the file to contain only the latest valid snapshot group
    /// with `termBaseLogPosition = 0` and `logPosition = 0`; a `.bak` backup
    /// is left behind (spec.md §4.3, §8 testable property 6).
    pub fn seed_recording_log_from_snapshot(&mut self) -> Result<(), RecordingLogError> {
        let latest = self
            .entries
            .iter()
            .filter(|e| e.is_snapshot() && e.is_valid && e.service_id == CONSENSUS_MODULE_SERVICE_ID)
            .max_by_key(|e| (e.leadership_term_id, e.log_position))
            .copied();

        let Some(latest) = latest else {
            return Ok(());
        };

        let group: Vec<Entry> = self
            .entries
            .iter()
            .filter(|e| e.is_snapshot() && e.is_valid && e.leadership_term_id == latest.leadership_term_id && e.log_position == latest.log_position)
            .map(|e| Entry {
                term_base_log_position: 0,
                log_position: 0,
                entry_index: 0, // reassigned below
                ..*e
            })
            .collect();

        let bak_path = self.path.with_extension("bak");
        std::fs::copy(&self.path, &bak_path)?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
            for (i, mut entry) in group.into_iter().enumerate() {
                entry.entry_index = i as u64;
                tmp.write_all(&entry.to_bytes())?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.reload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RecordingDescriptor;

    struct StubArchive {
        stop_position: u64,
    }

    #[async_trait::async_trait]
    impl ArchiveClient for StubArchive {
        async fn start_recording(&self, _: &str, _: i32, _: crate::transport::SourceLocation) -> Result<i64, crate::error::AnyError> {
            unimplemented!()
        }
        async fn extend_recording(&self, _: RecordingId, _: &str, _: i32, _: crate::transport::SourceLocation) -> Result<i64, crate::error::AnyError> {
            unimplemented!()
        }
        async fn stop_recording(&self, _: i64) -> Result<(), crate::error::AnyError> {
            unimplemented!()
        }
        async fn truncate_recording(&self, _: RecordingId, _: u64) -> Result<(), crate::error::AnyError> {
            unimplemented!()
        }
        async fn start_replay(&self, _: RecordingId, _: u64, _: i64, _: &str, _: i32) -> Result<i64, crate::error::AnyError> {
            unimplemented!()
        }
        async fn stop_replay(&self, _: i64) -> Result<(), crate::error::AnyError> {
            unimplemented!()
        }
        async fn get_stop_position(&self, _: RecordingId) -> Result<u64, crate::error::AnyError> {
            Ok(self.stop_position)
        }
        async fn purge_segments(&self, _: RecordingId, _: u64) -> Result<(), crate::error::AnyError> {
            unimplemented!()
        }
        async fn detach_segments(&self, _: RecordingId, _: u64) -> Result<(), crate::error::AnyError> {
            unimplemented!()
        }
        async fn attach_segments(&self, _: RecordingId) -> Result<(), crate::error::AnyError> {
            unimplemented!()
        }
        async fn delete_detached_segments(&self, _: RecordingId) -> Result<(), crate::error::AnyError> {
            unimplemented!()
        }
        async fn migrate_segments(&self, _: RecordingId, _: RecordingId) -> Result<(), crate::error::AnyError> {
            unimplemented!()
        }
        async fn list_recording(&self, _: RecordingId) -> Result<Option<RecordingDescriptor>, crate::error::AnyError> {
            Ok(None)
        }
        fn poll_signals(&self) -> Vec<crate::transport::RecordingSignalEvent> {
            Vec::new()
        }
    }

    fn open_tmp() -> (tempfile::TempDir, RecordingLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = RecordingLog::open(dir.path().join("recording.log"), FileSyncLevel::None).unwrap();
        (dir, log)
    }

    #[test]
    fn null_recording_id_rejected() {
        let (_dir, mut log) = open_tmp();
        assert_eq!(log.append_term(NULL_RECORDING_ID, 0, 0, 0), Err(RecordingLogError::NullRecordingId));
    }

    #[test]
    fn duplicate_valid_term_fails_even_with_different_recording_id() {
        let (_dir, mut log) = open_tmp();
        log.append_term(1, 0, 0, 0).unwrap();
        let err = log.append_term(2, 0, 0, 0).unwrap_err();
        assert!(matches!(err, RecordingLogError::DuplicateTerm { term_id: 0, .. }));
        let err2 = log.append_term(1, 0, 0, 0).unwrap_err();
        assert!(matches!(err2, RecordingLogError::DuplicateTerm { term_id: 0, .. }));
    }

    #[test]
    fn append_snapshot_requires_matching_term() {
        let (_dir, mut log) = open_tmp();
        let err = log.append_snapshot(1, 0, 0, 100, 0, CONSENSUS_MODULE_SERVICE_ID).unwrap_err();
        assert!(matches!(err, RecordingLogError::NoMatchingTerm { term_id: 0, .. }));

        log.append_term(1, 0, 0, 0).unwrap();
        log.append_snapshot(1, 0, 0, 100, 0, CONSENSUS_MODULE_SERVICE_ID).unwrap();
    }

    #[test]
    fn commit_log_position_requires_known_term() {
        let (_dir, mut log) = open_tmp();
        assert_eq!(log.commit_log_position(7, 100), Err(RecordingLogError::UnknownTerm { term_id: 7 }));
        log.append_term(1, 7, 0, 0).unwrap();
        log.commit_log_position(7, 100).unwrap();
        assert_eq!(log.find_term_entry(7).unwrap().log_position, 100);
    }

    #[test]
    fn sort_order_matches_spec_s5() {
        let (_dir, mut log) = open_tmp();
        for term_id in [0u64, 2, 3, 1] {
            log.append_term(term_id as i64 + 1, term_id, 0, 0).unwrap();
            let ids: Vec<LeadershipTermId> = log.entries().iter().map(|e| e.leadership_term_id).collect();
            let mut sorted = ids.clone();
            sorted.sort_unstable();
            assert_eq!(ids, sorted, "entries() must stay sorted after each append");
        }
        log.reload().unwrap();
        let ids: Vec<LeadershipTermId> = log.entries().iter().map(|e| e.leadership_term_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn invalidate_latest_snapshot_fails_without_parent_term() {
        let (_dir, mut log) = open_tmp();
        assert_eq!(log.invalidate_latest_snapshot(), Err(RecordingLogError::NoSnapshotToInvalidate));
    }

    #[test]
    fn invalidate_latest_snapshot_marks_whole_group_invalid() {
        let (_dir, mut log) = open_tmp();
        log.append_term(1, 0, 0, 0).unwrap();
        log.append_snapshot(1, 0, 0, 100, 0, CONSENSUS_MODULE_SERVICE_ID).unwrap();
        log.append_snapshot(2, 0, 0, 100, 0, 0).unwrap();
        log.invalidate_latest_snapshot().unwrap();
        assert!(log.get_latest_snapshot(CONSENSUS_MODULE_SERVICE_ID).is_none());
        assert!(log.get_latest_snapshot(0).is_none());
    }

    #[tokio::test]
    async fn recovery_plan_requires_every_service_snapshot() {
        let (_dir, mut log) = open_tmp();
        log.append_term(1, 0, 0, 0).unwrap();
        log.append_snapshot(1, 0, 0, 100, 0, CONSENSUS_MODULE_SERVICE_ID).unwrap();
        // only the consensus-module snapshot exists; service 0's own snapshot is missing.
        let archive = StubArchive { stop_position: 500 };
        let plan = log.create_recovery_plan(&archive, 1, 1).await.unwrap();
        assert!(plan.snapshots.is_empty());

        log.append_snapshot(2, 0, 0, 100, 0, 0).unwrap();
        let plan = log.create_recovery_plan(&archive, 1, 1).await.unwrap();
        assert_eq!(plan.snapshots.len(), 2);
        assert_eq!(plan.appended_log_position, 500);
    }

    #[test]
    fn seed_from_snapshot_round_trips_s6() {
        let (_dir, mut log) = open_tmp();
        log.append_term(1, 0, 0, 0).unwrap();
        log.append_snapshot(1, 0, 0, 300, 0, CONSENSUS_MODULE_SERVICE_ID).unwrap();
        log.append_snapshot(2, 0, 0, 300, 0, 0).unwrap();
        log.seed_recording_log_from_snapshot().unwrap();

        log.reload().unwrap();
        assert!(log.path.with_extension("bak").exists());
        for e in log.entries() {
            assert!(e.is_valid);
            assert_eq!(e.term_base_log_position, 0);
            assert_eq!(e.log_position, 0);
        }
    }

    #[test]
    fn sort_recording_log_preserves_logical_order_after_reload() {
        let (_dir, mut log) = open_tmp();
        for term_id in [3u64, 1, 2] {
            log.append_term(term_id as i64 + 1, term_id, 0, 0).unwrap();
        }
        log.sort_recording_log().unwrap();
        log.reload().unwrap();
        let ids: Vec<LeadershipTermId> = log.entries().iter().map(|e| e.leadership_term_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
