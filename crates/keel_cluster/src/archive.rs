//! In-process recording archive over the media bus.
//!
//! Recordings reference the live term buffer of the recorded publication, so
//! the recording position is always the appended position and recorded byte
//! ranges stay replayable after the publication itself is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, ensure, Context};

use crate::bus::{ChannelUri, MediaBus, Publication, TermBuffer};

/// Where the recorded stream originates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceLocation {
    Local,
    Remote,
}

/// Byte range covered by a recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordingExtent {
    pub start_position: u64,
    pub stop_position: u64,
}

/// Live view of a recording's appended position.
#[derive(Clone, Debug)]
pub struct RecordingPos {
    recording_id: u64,
    buffer: Arc<TermBuffer>,
    active: Arc<AtomicBool>,
}

impl RecordingPos {
    pub fn recording_id(&self) -> u64 {
        self.recording_id
    }

    pub fn get(&self) -> u64 {
        self.buffer.position()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct RecordingEntry {
    buffer: Arc<TermBuffer>,
    active: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct ArchiveState {
    next_recording_id: u64,
    recordings: HashMap<u64, RecordingEntry>,
    error: Option<String>,
}

/// One node's connection to its recording archive.
///
/// Replay session ids are per-connection: ordinary replays count up from
/// zero (so the i-th replay of a fresh connection is session i), snapshot
/// replays draw from a reserved negative range.
#[derive(Clone, Debug)]
pub struct Archive {
    bus: MediaBus,
    state: Arc<Mutex<ArchiveState>>,
    next_replay_session_id: Arc<AtomicI32>,
    next_snapshot_session_id: Arc<AtomicI32>,
}

impl Archive {
    pub fn connect(bus: &MediaBus) -> Self {
        Self {
            bus: bus.clone(),
            state: Arc::new(Mutex::new(ArchiveState::default())),
            next_replay_session_id: Arc::new(AtomicI32::new(0)),
            next_snapshot_session_id: Arc::new(AtomicI32::new(-1)),
        }
    }

    /// A fresh connection to the same archived state, restarting the
    /// replay-session id sequence.
    pub fn reconnect(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            state: Arc::clone(&self.state),
            next_replay_session_id: Arc::new(AtomicI32::new(0)),
            next_snapshot_session_id: Arc::new(AtomicI32::new(-1)),
        }
    }

    fn record_buffer(&self, buffer: Arc<TermBuffer>) -> (u64, Arc<AtomicBool>) {
        buffer.mark_recorded();
        let mut state = self.state.lock().unwrap();
        let recording_id = state.next_recording_id;
        state.next_recording_id += 1;
        let active = Arc::new(AtomicBool::new(true));
        state.recordings.insert(
            recording_id,
            RecordingEntry {
                buffer,
                active: Arc::clone(&active),
            },
        );
        (recording_id, active)
    }

    /// Start recording the publication addressed by `channel` (which must
    /// carry a `session-id` param).
    pub fn start_recording(
        &self,
        channel: &str,
        stream_id: i32,
        _source: SourceLocation,
    ) -> anyhow::Result<u64> {
        let buffer = self
            .bus
            .find_publication_buffer(channel, stream_id)
            .with_context(|| format!("start recording on {channel}"))?;
        let (recording_id, _) = self.record_buffer(buffer);
        Ok(recording_id)
    }

    pub fn stop_recording(&self, recording_id: u64) -> anyhow::Result<()> {
        let state = self.state.lock().unwrap();
        let entry = state
            .recordings
            .get(&recording_id)
            .ok_or_else(|| anyhow!("unknown recording {recording_id}"))?;
        entry.active.store(false, Ordering::Release);
        Ok(())
    }

    /// Add a publication whose stream is recorded from the first byte.
    pub fn add_recorded_exclusive_publication(
        &self,
        channel: &str,
        stream_id: i32,
    ) -> anyhow::Result<Publication> {
        let publication = self.bus.add_exclusive_publication(channel, stream_id)?;
        self.record_buffer(publication.buffer());
        Ok(publication)
    }

    pub fn list_recording(&self, recording_id: u64) -> Option<RecordingExtent> {
        let state = self.state.lock().unwrap();
        let entry = state.recordings.get(&recording_id)?;
        Some(RecordingExtent {
            start_position: entry.buffer.start_position(),
            stop_position: entry.buffer.position(),
        })
    }

    /// Find the recording position for a recorded publication session.
    pub fn recording_pos(&self, session_id: i32) -> Option<RecordingPos> {
        let state = self.state.lock().unwrap();
        state
            .recordings
            .iter()
            .filter(|(_, entry)| entry.buffer.session_id() == session_id)
            .max_by_key(|(id, _)| *id)
            .map(|(id, entry)| RecordingPos {
                recording_id: *id,
                buffer: Arc::clone(&entry.buffer),
                active: Arc::clone(&entry.active),
            })
    }

    pub fn is_recording_active(&self, recording_id: u64) -> bool {
        let state = self.state.lock().unwrap();
        state
            .recordings
            .get(&recording_id)
            .is_some_and(|entry| entry.active.load(Ordering::Acquire))
    }

    /// Replay `[position, position + length)` of a recording onto `channel`.
    ///
    /// Session ids count up from zero per connection; any `session-id`
    /// param on the channel is ignored in favor of the archive-assigned id,
    /// which the subscription side filters on.
    pub fn start_replay(
        &self,
        recording_id: u64,
        position: u64,
        length: u64,
        channel: &str,
        stream_id: i32,
    ) -> anyhow::Result<i32> {
        let session_id = self.next_replay_session_id.fetch_add(1, Ordering::AcqRel);
        self.replay(recording_id, position, length, channel, stream_id, session_id)
    }

    /// Replay a snapshot recording on a reserved negative session id.
    pub fn start_snapshot_replay(
        &self,
        recording_id: u64,
        position: u64,
        length: u64,
        channel: &str,
        stream_id: i32,
    ) -> anyhow::Result<i32> {
        let session_id = self.next_snapshot_session_id.fetch_sub(1, Ordering::AcqRel);
        self.replay(recording_id, position, length, channel, stream_id, session_id)
    }

    fn replay(
        &self,
        recording_id: u64,
        position: u64,
        length: u64,
        channel: &str,
        stream_id: i32,
        session_id: i32,
    ) -> anyhow::Result<i32> {
        let buffer = {
            let state = self.state.lock().unwrap();
            let entry = state
                .recordings
                .get(&recording_id)
                .ok_or_else(|| anyhow!("unknown recording {recording_id}"))?;
            Arc::clone(&entry.buffer)
        };

        let stop_position = if length == u64::MAX {
            buffer.position()
        } else {
            position
                .checked_add(length)
                .ok_or_else(|| anyhow!("replay length overflow"))?
        };
        ensure!(
            stop_position <= buffer.position(),
            "replay range [{position}, {stop_position}) beyond recording end {}",
            buffer.position()
        );

        let frames = buffer.copy_range(position, stop_position)?;
        let mut uri = ChannelUri::parse(channel)?;
        uri.session_id = None;
        self.bus
            .add_replay_publication(&uri.to_string(), stream_id, session_id, position, frames)?;
        Ok(session_id)
    }

    /// Surface any asynchronous archive fault; polled on slow ticks.
    pub fn check_for_error_response(&self) -> anyhow::Result<()> {
        let state = self.state.lock().unwrap();
        if let Some(error) = &state.error {
            bail!("archive error: {error}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ControlledAction;

    #[test]
    fn records_and_replays_a_publication() {
        let bus = MediaBus::new();
        let archive = Archive::connect(&bus);
        let publication = bus.add_publication("mem://log", 1).unwrap();

        let channel = format!("mem://log?session-id={}", publication.session_id());
        let recording_id = archive
            .start_recording(&channel, 1, SourceLocation::Local)
            .unwrap();

        // Recording counts as a consumer, so offers succeed with no images.
        let first_end = publication.offer(b"one").unwrap();
        publication.offer(b"two").unwrap();

        let extent = archive.list_recording(recording_id).unwrap();
        assert_eq!(extent.start_position, 0);
        assert!(extent.stop_position > first_end);

        let replay_sub = bus.add_subscription("mem://replay", 20).unwrap();
        let session_id = archive
            .start_replay(recording_id, 0, u64::MAX, "mem://replay", 20)
            .unwrap();
        assert_eq!(session_id, 0);

        let image = replay_sub.image_by_session_id(session_id).unwrap();
        let mut seen = Vec::new();
        image.controlled_poll(
            &mut |_, payload| {
                seen.push(payload.to_vec());
                ControlledAction::Continue
            },
            16,
        );
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(image.is_end_of_stream());
    }

    #[test]
    fn partial_replay_keeps_recorded_positions() {
        let bus = MediaBus::new();
        let archive = Archive::connect(&bus);
        let publication = bus.add_publication("mem://log", 1).unwrap();
        let channel = format!("mem://log?session-id={}", publication.session_id());
        let recording_id = archive
            .start_recording(&channel, 1, SourceLocation::Local)
            .unwrap();

        let first_end = publication.offer(b"one").unwrap();
        let second_end = publication.offer(b"two").unwrap();

        let replay_sub = bus.add_subscription("mem://replay", 20).unwrap();
        let session_id = archive
            .start_replay(
                recording_id,
                first_end,
                second_end - first_end,
                "mem://replay",
                20,
            )
            .unwrap();

        let image = replay_sub.image_by_session_id(session_id).unwrap();
        assert_eq!(image.position(), first_end);
        let mut seen = Vec::new();
        image.controlled_poll(
            &mut |_, payload| {
                seen.push(payload.to_vec());
                ControlledAction::Continue
            },
            16,
        );
        assert_eq!(seen, vec![b"two".to_vec()]);
        assert_eq!(image.position(), second_end);
    }

    #[test]
    fn replay_session_ids_are_sequential() {
        let bus = MediaBus::new();
        let archive = Archive::connect(&bus);
        let publication = bus.add_publication("mem://log", 1).unwrap();
        let channel = format!("mem://log?session-id={}", publication.session_id());
        let recording_id = archive
            .start_recording(&channel, 1, SourceLocation::Local)
            .unwrap();
        publication.offer(b"x").unwrap();

        for expected in 0..3 {
            let session_id = archive
                .start_replay(recording_id, 0, u64::MAX, "mem://replay", 20)
                .unwrap();
            assert_eq!(session_id, expected);
        }

        // Snapshot replays draw from the reserved negative range.
        let snapshot_session = archive
            .start_snapshot_replay(recording_id, 0, u64::MAX, "mem://replay", 20)
            .unwrap();
        assert_eq!(snapshot_session, -1);

        // A reconnect restarts the ordinary sequence.
        let reconnected = archive.reconnect();
        let session_id = reconnected
            .start_replay(recording_id, 0, u64::MAX, "mem://replay", 20)
            .unwrap();
        assert_eq!(session_id, 0);
    }

    #[test]
    fn recorded_exclusive_publication_tracks_position() {
        let bus = MediaBus::new();
        let archive = Archive::connect(&bus);
        let publication = archive
            .add_recorded_exclusive_publication("mem://snapshot", 30)
            .unwrap();
        publication.offer(b"snap").unwrap();

        let recording_pos = archive.recording_pos(publication.session_id()).unwrap();
        assert_eq!(recording_pos.get(), publication.position());
        assert!(recording_pos.is_active());

        archive.stop_recording(recording_pos.recording_id()).unwrap();
        assert!(!recording_pos.is_active());
    }
}
