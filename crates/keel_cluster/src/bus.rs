//! In-process media bus: publications, subscriptions, and images.
//!
//! Channels are `mem://<name>?k=v` URIs (optionally `spy:`-prefixed). A
//! publication owns an append-only term buffer of CRC-framed records with
//! byte positions; images are per-consumer cursors over a buffer. Flow
//! control bounds a publisher to the slowest attached image plus a window,
//! so a stalled consumer yields back-pressure instead of unbounded memory.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{anyhow, ensure};

use crate::codec;

/// Default publisher window when the channel does not set `window=`.
pub const DEFAULT_WINDOW: u64 = 1 << 20;

/// Outcome of a controlled fragment handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlledAction {
    /// Consume the fragment and advance past it.
    Continue,
    /// Stop polling without advancing; the fragment is re-presented next poll.
    Abort,
}

/// Parsed `mem://` channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelUri {
    pub name: String,
    pub is_spy: bool,
    pub endpoint: Option<String>,
    pub session_id: Option<i32>,
    pub window: Option<u64>,
}

impl ChannelUri {
    pub fn parse(channel: &str) -> anyhow::Result<Self> {
        let (is_spy, rest) = match channel.strip_prefix("spy:") {
            Some(rest) => (true, rest),
            None => (false, channel),
        };
        let rest = rest
            .strip_prefix("mem://")
            .ok_or_else(|| anyhow!("channel is not a mem:// uri: {channel}"))?;

        let (name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (rest, None),
        };
        ensure!(!name.is_empty(), "channel has an empty name: {channel}");

        let mut uri = Self {
            name: name.to_string(),
            is_spy,
            endpoint: None,
            session_id: None,
            window: None,
        };

        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("malformed channel param {pair:?} in {channel}"))?;
                match key {
                    "endpoint" => uri.endpoint = Some(value.to_string()),
                    "session-id" => uri.session_id = Some(value.parse()?),
                    "window" => uri.window = Some(value.parse()?),
                    _ => return Err(anyhow!("unknown channel param {key:?} in {channel}")),
                }
            }
        }

        Ok(uri)
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    pub fn with_session_id(mut self, session_id: i32) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn prefix_spy(mut self) -> Self {
        self.is_spy = true;
        self
    }

    fn topic_key(&self, stream_id: i32) -> (String, i32) {
        let endpoint = self.endpoint.as_deref().unwrap_or("");
        (format!("{}|{endpoint}", self.name), stream_id)
    }
}

impl fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_spy {
            write!(f, "spy:")?;
        }
        write!(f, "mem://{}", self.name)?;
        let mut sep = '?';
        if let Some(endpoint) = &self.endpoint {
            write!(f, "{sep}endpoint={endpoint}")?;
            sep = '&';
        }
        if let Some(session_id) = self.session_id {
            write!(f, "{sep}session-id={session_id}")?;
            sep = '&';
        }
        if let Some(window) = self.window {
            write!(f, "{sep}window={window}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct TermBufferState {
    bytes: Vec<u8>,
    closed: bool,
    end_of_stream: bool,
    recorded: bool,
    images: Vec<Weak<ImageState>>,
}

/// Append-only framed record stream for one publication.
#[derive(Debug)]
pub(crate) struct TermBuffer {
    session_id: i32,
    start_position: u64,
    state: Mutex<TermBufferState>,
}

impl TermBuffer {
    fn new(session_id: i32, start_position: u64) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            start_position,
            state: Mutex::new(TermBufferState {
                bytes: Vec::new(),
                closed: false,
                end_of_stream: false,
                recorded: false,
                images: Vec::new(),
            }),
        })
    }

    pub(crate) fn session_id(&self) -> i32 {
        self.session_id
    }

    pub(crate) fn start_position(&self) -> u64 {
        self.start_position
    }

    pub(crate) fn position(&self) -> u64 {
        self.start_position + self.state.lock().unwrap().bytes.len() as u64
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub(crate) fn mark_recorded(&self) {
        self.state.lock().unwrap().recorded = true;
    }

    /// Copy the framed bytes in `[from, to)` out of the buffer.
    pub(crate) fn copy_range(&self, from: u64, to: u64) -> anyhow::Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let end = self.start_position + state.bytes.len() as u64;
        ensure!(
            from >= self.start_position && to <= end && from <= to,
            "recording range [{from}, {to}) outside [{}, {end})",
            self.start_position
        );
        let lo = (from - self.start_position) as usize;
        let hi = (to - self.start_position) as usize;
        Ok(state.bytes[lo..hi].to_vec())
    }

    fn attach_image(self: &Arc<Self>) -> Image {
        let image = Arc::new(ImageState {
            buffer: Arc::clone(self),
            position: AtomicU64::new(self.start_position),
            detached: AtomicBool::new(false),
        });
        self.state.lock().unwrap().images.push(Arc::downgrade(&image));
        Image { state: image }
    }

    fn close(&self, end_of_stream: bool) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.end_of_stream = end_of_stream;
    }
}

#[derive(Debug)]
struct ImageState {
    buffer: Arc<TermBuffer>,
    position: AtomicU64,
    detached: AtomicBool,
}

/// A consumer's view of one publication session, progressing by byte position.
#[derive(Clone, Debug)]
pub struct Image {
    state: Arc<ImageState>,
}

impl Image {
    pub fn session_id(&self) -> i32 {
        self.state.buffer.session_id
    }

    pub fn position(&self) -> u64 {
        self.state.position.load(Ordering::Acquire)
    }

    /// True once the publication is closed and every fragment was consumed.
    pub fn is_closed(&self) -> bool {
        if self.state.detached.load(Ordering::Acquire) {
            return true;
        }
        let buffer = self.state.buffer.state.lock().unwrap();
        buffer.closed
            && self.position()
                >= self.state.buffer.start_position + buffer.bytes.len() as u64
    }

    pub fn is_end_of_stream(&self) -> bool {
        let buffer = self.state.buffer.state.lock().unwrap();
        buffer.closed
            && buffer.end_of_stream
            && self.position()
                >= self.state.buffer.start_position + buffer.bytes.len() as u64
    }

    pub fn controlled_poll(
        &self,
        handler: &mut dyn FnMut(u64, &[u8]) -> ControlledAction,
        fragment_limit: usize,
    ) -> usize {
        self.poll_frames(handler, u64::MAX, fragment_limit)
    }

    /// Poll fragments whose end position does not exceed `limit_position`.
    pub fn bounded_controlled_poll(
        &self,
        handler: &mut dyn FnMut(u64, &[u8]) -> ControlledAction,
        limit_position: u64,
        fragment_limit: usize,
    ) -> usize {
        self.poll_frames(handler, limit_position, fragment_limit)
    }

    fn poll_frames(
        &self,
        handler: &mut dyn FnMut(u64, &[u8]) -> ControlledAction,
        limit_position: u64,
        fragment_limit: usize,
    ) -> usize {
        let mut fragments = 0;
        while fragments < fragment_limit {
            let position = self.position();
            // Copy the frame out so the buffer lock is not held across the
            // handler; handlers publish to other buffers.
            let frame = {
                let buffer = self.state.buffer.state.lock().unwrap();
                let offset = (position - self.state.buffer.start_position) as usize;
                codec::read_frame(&buffer.bytes, offset).map(|f| f.map(<[u8]>::to_vec))
            };
            let payload = match frame {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(error = ?err, "dropping image on corrupt frame");
                    self.state.detached.store(true, Ordering::Release);
                    break;
                }
            };

            let end_position = position + codec::framed_len(payload.len()) as u64;
            if end_position > limit_position {
                break;
            }
            match handler(end_position, &payload) {
                ControlledAction::Continue => {
                    self.state.position.store(end_position, Ordering::Release);
                    fragments += 1;
                }
                ControlledAction::Abort => break,
            }
        }
        fragments
    }

    fn is_live(&self) -> bool {
        !self.state.detached.load(Ordering::Acquire)
    }

    fn detach(&self) {
        self.state.detached.store(true, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct Topic {
    publications: Mutex<Vec<Arc<TermBuffer>>>,
    subscriptions: Mutex<Vec<Weak<SubscriptionState>>>,
}

#[derive(Debug)]
struct SubscriptionState {
    session_filter: Option<i32>,
    images: Mutex<Vec<Image>>,
}

impl SubscriptionState {
    fn maybe_attach(&self, buffer: &Arc<TermBuffer>) {
        if let Some(filter) = self.session_filter {
            if filter != buffer.session_id {
                return;
            }
        }
        let mut images = self.images.lock().unwrap();
        if images.iter().any(|i| i.session_id() == buffer.session_id) {
            return;
        }
        images.push(buffer.attach_image());
    }
}

/// Consumer endpoint on a channel and stream.
#[derive(Clone, Debug)]
pub struct Subscription {
    channel: String,
    stream_id: i32,
    state: Arc<SubscriptionState>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn image_by_session_id(&self, session_id: i32) -> Option<Image> {
        self.state
            .images
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.session_id() == session_id && i.is_live())
            .cloned()
    }

    pub fn images(&self) -> Vec<Image> {
        self.state
            .images
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.is_live())
            .cloned()
            .collect()
    }

    pub fn controlled_poll(
        &self,
        handler: &mut dyn FnMut(u64, &[u8]) -> ControlledAction,
        fragment_limit: usize,
    ) -> usize {
        let mut fragments = 0;
        for image in self.images() {
            if fragments >= fragment_limit {
                break;
            }
            fragments += image.controlled_poll(handler, fragment_limit - fragments);
        }
        fragments
    }

    /// Detach all images; the publisher stops counting them for flow control.
    pub fn close(&self) {
        let mut images = self.state.images.lock().unwrap();
        for image in images.iter() {
            image.detach();
        }
        images.clear();
    }
}

/// Producer endpoint owning one term buffer.
#[derive(Clone, Debug)]
pub struct Publication {
    channel: String,
    stream_id: i32,
    window: u64,
    buffer: Arc<TermBuffer>,
    destinations: Arc<Mutex<Vec<String>>>,
}

impl Publication {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn session_id(&self) -> i32 {
        self.buffer.session_id
    }

    pub fn position(&self) -> u64 {
        self.buffer.position()
    }

    pub fn is_connected(&self) -> bool {
        let state = self.buffer.state.lock().unwrap();
        state.recorded || state.images.iter().any(|w| {
            w.upgrade()
                .is_some_and(|i| !i.detached.load(Ordering::Acquire))
        })
    }

    /// Append one framed record; `None` signals back-pressure or no consumer.
    pub fn offer(&self, payload: &[u8]) -> Option<u64> {
        let mut state = self.buffer.state.lock().unwrap();
        if state.closed {
            return None;
        }

        let mut min_live_position = None;
        state.images.retain(|weak| match weak.upgrade() {
            Some(image) => {
                if !image.detached.load(Ordering::Acquire) {
                    let position = image.position.load(Ordering::Acquire);
                    min_live_position = Some(match min_live_position {
                        Some(current) => position.min(current),
                        None => position,
                    });
                }
                true
            }
            None => false,
        });

        if min_live_position.is_none() && !state.recorded {
            return None;
        }

        let end_position = self.buffer.start_position
            + state.bytes.len() as u64
            + codec::framed_len(payload.len()) as u64;
        if let Some(min_position) = min_live_position {
            if end_position > min_position + self.window {
                return None;
            }
        }

        codec::write_frame(&mut state.bytes, payload);
        Some(self.buffer.start_position + state.bytes.len() as u64)
    }

    /// Record an extra delivery destination (multi-destination-cast channels).
    pub fn add_destination(&self, endpoint: &str) {
        self.destinations.lock().unwrap().push(endpoint.to_string());
    }

    pub fn destinations(&self) -> Vec<String> {
        self.destinations.lock().unwrap().clone()
    }

    /// Close with end-of-stream; consumers drain what was published.
    pub fn close(&self) {
        self.buffer.close(true);
    }

    /// Close without end-of-stream, as a failed publisher would.
    pub fn close_abruptly(&self) {
        self.buffer.close(false);
    }

    pub(crate) fn buffer(&self) -> Arc<TermBuffer> {
        Arc::clone(&self.buffer)
    }
}

#[derive(Debug, Default)]
struct BusState {
    topics: HashMap<(String, i32), Arc<Topic>>,
    next_session_id: i32,
}

/// The shared in-process transport all cluster members attach to.
#[derive(Clone, Debug, Default)]
pub struct MediaBus {
    state: Arc<Mutex<BusState>>,
}

impl MediaBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, uri: &ChannelUri, stream_id: i32) -> Arc<Topic> {
        let mut state = self.state.lock().unwrap();
        Arc::clone(
            state
                .topics
                .entry(uri.topic_key(stream_id))
                .or_default(),
        )
    }

    fn next_session_id(&self) -> i32 {
        let mut state = self.state.lock().unwrap();
        state.next_session_id += 1;
        state.next_session_id
    }

    pub fn add_publication(&self, channel: &str, stream_id: i32) -> anyhow::Result<Publication> {
        self.add_publication_at(channel, stream_id, None, 0)
    }

    /// All publications own their term buffer, so exclusive is the default.
    pub fn add_exclusive_publication(
        &self,
        channel: &str,
        stream_id: i32,
    ) -> anyhow::Result<Publication> {
        self.add_publication(channel, stream_id)
    }

    pub(crate) fn add_publication_at(
        &self,
        channel: &str,
        stream_id: i32,
        session_id: Option<i32>,
        start_position: u64,
    ) -> anyhow::Result<Publication> {
        let uri = ChannelUri::parse(channel)?;
        ensure!(!uri.is_spy, "cannot publish on a spy channel: {channel}");
        let session_id = session_id
            .or(uri.session_id)
            .unwrap_or_else(|| self.next_session_id());
        let topic = self.topic(&uri, stream_id);
        let buffer = TermBuffer::new(session_id, start_position);

        topic.publications.lock().unwrap().push(Arc::clone(&buffer));
        let mut subscriptions = topic.subscriptions.lock().unwrap();
        subscriptions.retain(|weak| match weak.upgrade() {
            Some(sub) => {
                sub.maybe_attach(&buffer);
                true
            }
            None => false,
        });

        Ok(Publication {
            channel: channel.to_string(),
            stream_id,
            window: uri.window.unwrap_or(DEFAULT_WINDOW),
            buffer,
            destinations: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> anyhow::Result<Subscription> {
        let uri = ChannelUri::parse(channel)?;
        let topic = self.topic(&uri, stream_id);
        let state = Arc::new(SubscriptionState {
            session_filter: uri.session_id,
            images: Mutex::new(Vec::new()),
        });

        for buffer in topic.publications.lock().unwrap().iter() {
            state.maybe_attach(buffer);
        }
        topic
            .subscriptions
            .lock()
            .unwrap()
            .push(Arc::downgrade(&state));

        Ok(Subscription {
            channel: channel.to_string(),
            stream_id,
            state,
        })
    }

    /// Attach a complete, already-framed byte range as a closed publication.
    ///
    /// Archive replays are delivered this way: the stream carries the
    /// recorded positions (`start_position` offset) and ends with
    /// end-of-stream once consumers drain it.
    pub(crate) fn add_replay_publication(
        &self,
        channel: &str,
        stream_id: i32,
        session_id: i32,
        start_position: u64,
        frames: Vec<u8>,
    ) -> anyhow::Result<()> {
        let uri = ChannelUri::parse(channel)?;
        let topic = self.topic(&uri, stream_id);
        let buffer = TermBuffer::new(session_id, start_position);
        {
            let mut state = buffer.state.lock().unwrap();
            state.bytes = frames;
            state.closed = true;
            state.end_of_stream = true;
        }

        topic.publications.lock().unwrap().push(Arc::clone(&buffer));
        let mut subscriptions = topic.subscriptions.lock().unwrap();
        subscriptions.retain(|weak| match weak.upgrade() {
            Some(sub) => {
                sub.maybe_attach(&buffer);
                true
            }
            None => false,
        });
        Ok(())
    }

    pub(crate) fn find_publication_buffer(
        &self,
        channel: &str,
        stream_id: i32,
    ) -> anyhow::Result<Arc<TermBuffer>> {
        let uri = ChannelUri::parse(channel)?;
        let session_id = uri
            .session_id
            .ok_or_else(|| anyhow!("recording channel needs session-id: {channel}"))?;
        let topic = self.topic(&uri, stream_id);
        let publications = topic.publications.lock().unwrap();
        publications
            .iter()
            .find(|b| b.session_id == session_id)
            .cloned()
            .ok_or_else(|| anyhow!("no publication with session-id {session_id} on {channel}"))
    }

    /// Cooperative conductor step; prunes dead topic registrations.
    pub fn conduct(&self) -> usize {
        let state = self.state.lock().unwrap();
        for topic in state.topics.values() {
            topic
                .subscriptions
                .lock()
                .unwrap()
                .retain(|weak| weak.strong_count() > 0);
        }
        0
    }
}
