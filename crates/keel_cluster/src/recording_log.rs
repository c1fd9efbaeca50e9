//! Durable metadata about recorded leadership terms and snapshots.
//!
//! Persisted as pretty JSON with load-or-init semantics; the store is small
//! and rewritten whole on every append or commit.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};

use crate::archive::Archive;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Term,
    Snapshot,
}

/// One recording-log entry.
///
/// `log_position` is the base of the term in the conceptual log;
/// `term_position` is the committed position within the term (snapshot
/// position for snapshot entries), `None` while a term is still open.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub entry_type: EntryType,
    pub recording_id: u64,
    pub leadership_term_id: i64,
    pub log_position: u64,
    pub term_position: Option<u64>,
    pub timestamp_ms: u64,
}

/// One replay step of a recovery plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayStep {
    pub entry: Entry,
    pub recording_start_position: u64,
    /// `None` replays an open term to the end of its recording.
    pub recording_stop_position: Option<u64>,
}

/// Ordered plan bringing a node back to its last known state.
#[derive(Clone, Debug, Default)]
pub struct RecoveryPlan {
    pub snapshot_step: Option<ReplayStep>,
    pub term_steps: Vec<ReplayStep>,
    /// Base log position of the last recorded term.
    pub last_log_position: u64,
    /// Bytes appended to the last term's recording.
    pub last_term_position_appended: u64,
}

/// File-backed store of term and snapshot entries.
#[derive(Debug)]
pub struct RecordingLog {
    path: PathBuf,
    entries: Vec<Entry>,
}

impl RecordingLog {
    pub fn load_or_init(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Ok(data) = fs::read(&path) {
            let entries =
                serde_json::from_slice(&data).context("parse recording log entries")?;
            return Ok(Self { path, entries });
        }
        Ok(Self {
            path,
            entries: Vec::new(),
        })
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Record the start of a leadership term.
    pub fn append_term(
        &mut self,
        recording_id: u64,
        leadership_term_id: i64,
        base_log_position: u64,
        timestamp_ms: u64,
    ) -> anyhow::Result<()> {
        self.entries.push(Entry {
            entry_type: EntryType::Term,
            recording_id,
            leadership_term_id,
            log_position: base_log_position,
            term_position: None,
            timestamp_ms,
        });
        self.persist()
    }

    pub fn append_snapshot(
        &mut self,
        recording_id: u64,
        leadership_term_id: i64,
        base_log_position: u64,
        term_position: u64,
        timestamp_ms: u64,
    ) -> anyhow::Result<()> {
        self.entries.push(Entry {
            entry_type: EntryType::Snapshot,
            recording_id,
            leadership_term_id,
            log_position: base_log_position,
            term_position: Some(term_position),
            timestamp_ms,
        });
        self.persist()
    }

    /// Commit the reached position of a term.
    pub fn commit_leadership_term_position(
        &mut self,
        leadership_term_id: i64,
        term_position: u64,
    ) -> anyhow::Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .rev()
            .find(|e| {
                e.entry_type == EntryType::Term && e.leadership_term_id == leadership_term_id
            })
            .with_context(|| format!("no term entry for leadership term {leadership_term_id}"))?;
        ensure!(
            entry.term_position.map_or(true, |p| p <= term_position),
            "term {leadership_term_id} commit position regressed"
        );
        entry.term_position = Some(term_position);
        self.persist()
    }

    /// Build the recovery plan: optional snapshot, then the terms after it.
    pub fn create_recovery_plan(&self, archive: &Archive) -> anyhow::Result<RecoveryPlan> {
        let mut plan = RecoveryPlan::default();

        let snapshot = self
            .entries
            .iter()
            .rev()
            .find(|e| e.entry_type == EntryType::Snapshot)
            .cloned();
        if let Some(entry) = &snapshot {
            let extent = archive
                .list_recording(entry.recording_id)
                .with_context(|| format!("snapshot recording {} not found", entry.recording_id))?;
            plan.snapshot_step = Some(ReplayStep {
                entry: entry.clone(),
                recording_start_position: extent.start_position,
                recording_stop_position: Some(extent.stop_position),
            });
        }

        for entry in self.entries.iter() {
            if entry.entry_type != EntryType::Term {
                continue;
            }
            let start = match &snapshot {
                Some(snap) if entry.leadership_term_id < snap.leadership_term_id => continue,
                Some(snap) if entry.leadership_term_id == snap.leadership_term_id => {
                    snap.term_position.unwrap_or(0)
                }
                _ => 0,
            };
            let stop = match entry.term_position {
                Some(committed) => Some(committed),
                None => archive
                    .list_recording(entry.recording_id)
                    .map(|extent| extent.stop_position),
            };
            if let Some(stop) = stop {
                if stop <= start {
                    continue;
                }
            }
            plan.term_steps.push(ReplayStep {
                entry: entry.clone(),
                recording_start_position: start,
                recording_stop_position: stop,
            });
        }

        if let Some(last_term) = self
            .entries
            .iter()
            .rev()
            .find(|e| e.entry_type == EntryType::Term)
        {
            plan.last_log_position = last_term.log_position;
            plan.last_term_position_appended = archive
                .list_recording(last_term.recording_id)
                .map_or(0, |extent| extent.stop_position);
        }

        Ok(plan)
    }

    fn persist(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("create recording log dir")?;
        }
        let data = serde_json::to_vec_pretty(&self.entries).context("serialize recording log")?;
        fs::write(&self.path, data).context("write recording log")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::SourceLocation;
    use crate::bus::MediaBus;

    fn recorded_term(bus: &MediaBus, archive: &Archive, payloads: &[&[u8]]) -> (u64, u64) {
        let publication = bus.add_publication("mem://log", 1).unwrap();
        let channel = format!("mem://log?session-id={}", publication.session_id());
        let recording_id = archive
            .start_recording(&channel, 1, SourceLocation::Local)
            .unwrap();
        let mut end = 0;
        for payload in payloads {
            end = publication.offer(payload).unwrap();
        }
        (recording_id, end)
    }

    #[test]
    fn persists_and_reloads_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording.log");

        let mut log = RecordingLog::load_or_init(&path).unwrap();
        log.append_term(3, 0, 0, 1_000).unwrap();
        log.commit_leadership_term_position(0, 640).unwrap();
        log.append_snapshot(4, 0, 0, 640, 2_000).unwrap();

        let reloaded = RecordingLog::load_or_init(&path).unwrap();
        assert_eq!(reloaded.entries(), log.entries());
        assert_eq!(reloaded.entries()[0].term_position, Some(640));
    }

    #[test]
    fn commit_rejects_a_regressing_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RecordingLog::load_or_init(dir.path().join("recording.log")).unwrap();
        log.append_term(3, 0, 0, 1_000).unwrap();
        log.commit_leadership_term_position(0, 640).unwrap();
        assert!(log.commit_leadership_term_position(0, 639).is_err());
        assert!(log.commit_leadership_term_position(1, 0).is_err());
    }

    #[test]
    fn cold_plan_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let bus = MediaBus::new();
        let archive = Archive::connect(&bus);
        let log = RecordingLog::load_or_init(dir.path().join("recording.log")).unwrap();

        let plan = log.create_recovery_plan(&archive).unwrap();
        assert!(plan.snapshot_step.is_none());
        assert!(plan.term_steps.is_empty());
        assert_eq!(plan.last_log_position, 0);
        assert_eq!(plan.last_term_position_appended, 0);
    }

    #[test]
    fn plan_replays_the_snapshot_term_from_the_snapshot_position() {
        let dir = tempfile::tempdir().unwrap();
        let bus = MediaBus::new();
        let archive = Archive::connect(&bus);
        let mut log = RecordingLog::load_or_init(dir.path().join("recording.log")).unwrap();

        let (term_recording, appended) =
            recorded_term(&bus, &archive, &[b"open", b"message", b"close"]);
        let (snapshot_recording, snapshot_len) = recorded_term(&bus, &archive, &[b"snapshot"]);

        log.append_term(term_recording, 0, 0, 1_000).unwrap();
        // Snapshot taken mid-term at an aligned record boundary.
        let snapshot_position = crate::codec::framed_len(4) as u64;
        log.append_snapshot(snapshot_recording, 0, 0, snapshot_position, 2_000)
            .unwrap();

        let plan = log.create_recovery_plan(&archive).unwrap();
        let snapshot_step = plan.snapshot_step.unwrap();
        assert_eq!(snapshot_step.entry.recording_id, snapshot_recording);
        assert_eq!(snapshot_step.recording_stop_position, Some(snapshot_len));

        assert_eq!(plan.term_steps.len(), 1);
        let step = &plan.term_steps[0];
        assert_eq!(step.recording_start_position, snapshot_position);
        assert_eq!(step.recording_stop_position, Some(appended));
        assert_eq!(plan.last_log_position, 0);
        assert_eq!(plan.last_term_position_appended, appended);
    }

    #[test]
    fn fully_snapshotted_term_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let bus = MediaBus::new();
        let archive = Archive::connect(&bus);
        let mut log = RecordingLog::load_or_init(dir.path().join("recording.log")).unwrap();

        let (term_recording, appended) = recorded_term(&bus, &archive, &[b"only"]);
        let (snapshot_recording, _) = recorded_term(&bus, &archive, &[b"snapshot"]);

        log.append_term(term_recording, 0, 0, 1_000).unwrap();
        log.commit_leadership_term_position(0, appended).unwrap();
        log.append_snapshot(snapshot_recording, 0, 0, appended, 2_000)
            .unwrap();

        let plan = log.create_recovery_plan(&archive).unwrap();
        assert!(plan.term_steps.is_empty());
    }
}
