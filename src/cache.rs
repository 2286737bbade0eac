use crate::models::{GroupId, Message};
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Memory side of the message log.
///
/// Holds a bounded ring of recent messages per group (the groups themselves
/// are kept in an LRU) and the buffer of messages not yet written to the
/// store.
pub struct MessageLog {
    recent: Mutex<LruCache<GroupId, VecDeque<Message>>>,
    pending: Mutex<VecDeque<Message>>,
    per_group: usize,
    buffer_cap: usize,
    dropped: AtomicU64,
}

impl MessageLog {
    pub fn new(per_group: usize, groups_capacity: usize, buffer_cap: usize) -> Self {
        let cap = NonZeroUsize::new(groups_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            recent: Mutex::new(LruCache::new(cap)),
            pending: Mutex::new(VecDeque::new()),
            per_group: per_group.max(1),
            buffer_cap: buffer_cap.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Buffers a message for the store and remembers it as recent.
    pub fn append(&self, message: Message) {
        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.buffer_cap {
                pending.pop_front();
                self.note_dropped(1);
            }
            pending.push_back(message.clone());
        }
        self.remember(message);
    }

    /// Adds to the recent ring only, used when warming from the store.
    pub fn remember(&self, message: Message) {
        let mut recent = self.recent.lock();
        let group_id = message.group_id;
        if let Some(ring) = recent.get_mut(&group_id) {
            if ring.len() >= self.per_group {
                ring.pop_front();
            }
            ring.push_back(message);
            return;
        }
        let mut ring = VecDeque::with_capacity(self.per_group);
        ring.push_back(message);
        recent.put(group_id, ring);
    }

    pub fn last_in_group(&self, group_id: GroupId) -> Option<Message> {
        let recent = self.recent.lock();
        recent.peek(&group_id).and_then(|ring| ring.back().cloned())
    }

    /// One uniformly sampled recent message for every tracked group.
    pub fn recent_per_group(&self) -> HashMap<GroupId, Message> {
        let recent = self.recent.lock();
        let mut rng = rand::thread_rng();
        recent
            .iter()
            .filter(|(_, ring)| !ring.is_empty())
            .map(|(group_id, ring)| (*group_id, ring[rng.gen_range(0..ring.len())].clone()))
            .collect()
    }

    /// Takes the current buffer generation; writers start a fresh one.
    pub fn take_pending(&self) -> Vec<Message> {
        let mut pending = self.pending.lock();
        std::mem::take(&mut *pending).into()
    }

    /// Puts a failed generation back in front of anything buffered since.
    pub fn restore_pending(&self, messages: Vec<Message>) {
        let mut pending = self.pending.lock();
        let newer = std::mem::take(&mut *pending);
        let mut merged: VecDeque<Message> = messages.into();
        merged.extend(newer);
        let overflow = merged.len().saturating_sub(self.buffer_cap);
        if overflow > 0 {
            merged.drain(..overflow);
            self.note_dropped(overflow as u64);
        }
        *pending = merged;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn note_dropped(&self, n: u64) {
        let total = self.dropped.fetch_add(n, Ordering::Relaxed) + n;
        warn!(
            "Message log buffer full (cap {}), dropped {} oldest entries ({} total)",
            self.buffer_cap, n, total
        );
    }
}
