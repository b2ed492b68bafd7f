//! Pending-frame queue and per-reel write cursors.
//!
//! **Why**: Parallel encoders finish frames in whatever order they like, but
//! each reel's container must receive frames strictly in sequence. The queue
//! holds the out-of-order backlog; the cursors answer "which item is next?".
//!
//! **Used by**: writer (single consumer thread owns both, producers enqueue)

use log::trace;

use crate::types::Eyes;

/// What a queued item asks the sink to do.
///
/// A payload exists only on `Full`; `None` there means the bytes were spilled
/// to temp storage and must be recovered by `(reel, frame, eyes)`. `Fake` and
/// `Repeat` never carry data, so an inconsistent "fake with payload" state
/// cannot be represented.
#[derive(Debug)]
pub enum QueueKind {
    Full(Option<Vec<u8>>),
    Fake,
    Repeat,
}

impl QueueKind {
    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::Full(_) => "FULL",
            QueueKind::Fake => "FAKE",
            QueueKind::Repeat => "REPEAT",
        }
    }
}

/// One pending write request.
#[derive(Debug)]
pub struct QueueItem {
    /// Index of the reel sink this belongs to.
    pub reel: usize,
    /// Frame number relative to the start of that reel.
    pub frame: i64,
    pub eyes: Eyes,
    pub kind: QueueKind,
}

impl QueueItem {
    fn key(&self) -> (usize, i64, Eyes) {
        (self.reel, self.frame, self.eyes)
    }

    /// True if this is a FULL item whose payload is still resident in memory.
    pub fn holds_payload(&self) -> bool {
        matches!(self.kind, QueueKind::Full(Some(_)))
    }
}

// Items compare by position only; the kind is irrelevant to ordering.
impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

/// Last frame actually committed to one reel's sink.
///
/// Starts "before frame 0": the initial state accepts `(0, Both)` for 2D and
/// `(0, Left)` for 3D, nothing else.
#[derive(Debug, Clone, Copy)]
pub struct LastWritten {
    frame: i64,
    eyes: Eyes,
}

impl LastWritten {
    pub fn new() -> Self {
        LastWritten { frame: -1, eyes: Eyes::Right }
    }

    pub fn frame(&self) -> i64 {
        self.frame
    }

    pub fn eyes(&self) -> Eyes {
        self.eyes
    }

    /// True once at least one frame has been committed.
    pub fn any_written(&self) -> bool {
        self.frame >= 0
    }

    /// Successor test. 2D: the next frame index with `Both`. 3D: `Right` of
    /// the same frame after `Left`, or `Left` of the next frame after `Right`.
    pub fn next_is(&self, frame: i64, eyes: Eyes) -> bool {
        match eyes {
            Eyes::Both => frame == self.frame + 1,
            Eyes::Right => self.eyes == Eyes::Left && frame == self.frame,
            Eyes::Left => self.eyes == Eyes::Right && frame == self.frame + 1,
        }
    }

    pub fn advance(&mut self, frame: i64, eyes: Eyes) {
        debug_assert!(self.next_is(frame, eyes), "cursor advanced out of sequence");
        self.frame = frame;
        self.eyes = eyes;
    }
}

impl Default for LastWritten {
    fn default() -> Self {
        LastWritten::new()
    }
}

/// Ordered, bounded backlog of pending write requests.
///
/// Kept as a plain vector sorted on demand: the queue is short (bounded by
/// the memory cap) and producers only ever append.
#[derive(Debug, Default)]
pub struct FrameQueue {
    items: Vec<QueueItem>,
    full_in_memory: usize,
}

impl FrameQueue {
    pub fn new() -> Self {
        FrameQueue::default()
    }

    /// Append; never blocks. O(1) amortized.
    pub fn push(&mut self, item: QueueItem) {
        if item.holds_payload() {
            self.full_in_memory += 1;
        }
        trace!(
            "queue {} reel {} frame {} {}",
            item.kind.name(),
            item.reel,
            item.frame,
            item.eyes
        );
        self.items.push(item);
    }

    /// Sort by `(reel, frame, eyes)`. Must run before `ready_head`/`pop_ready`.
    pub fn sort(&mut self) {
        self.items.sort();
    }

    /// Is the head item the immediate successor for its reel?
    /// Only meaningful right after `sort()` under the same lock.
    pub fn ready_head(&self, cursors: &[LastWritten]) -> bool {
        match self.items.first() {
            Some(item) => cursors[item.reel].next_is(item.frame, item.eyes),
            None => false,
        }
    }

    /// Remove and return the head. Valid only immediately after `ready_head`
    /// returned true with no intervening unlock.
    pub fn pop_ready(&mut self) -> QueueItem {
        let item = self.items.remove(0);
        if item.holds_payload() {
            self.full_in_memory -= 1;
        }
        item
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// FULL items whose payloads are resident in memory right now.
    pub fn full_in_memory(&self) -> usize {
        self.full_in_memory
    }

    /// Index of the best spill candidate: the FULL-with-payload item closest
    /// to the tail, i.e. the one least likely to be needed soon.
    pub fn spill_candidate(&self) -> Option<usize> {
        self.items.iter().rposition(QueueItem::holds_payload)
    }

    /// Take the payload out of item `idx`, leaving a disk-resident stub.
    pub fn take_payload(&mut self, idx: usize) -> Option<(usize, i64, Eyes, Vec<u8>)> {
        let item = &mut self.items[idx];
        if let QueueKind::Full(payload @ Some(_)) = &mut item.kind {
            let bytes = payload.take().unwrap();
            self.full_in_memory -= 1;
            Some((item.reel, item.frame, item.eyes, bytes))
        } else {
            None
        }
    }

    /// Remove everything, returning the leftovers for logging.
    pub fn clear(&mut self) -> Vec<QueueItem> {
        self.full_in_memory = 0;
        std::mem::take(&mut self.items)
    }
}
