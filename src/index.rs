//! The learned model, held in memory as the source of truth while hot.
//!
//! Contexts are sharded by fingerprint hash. Each shard keeps the live
//! contexts next to the deltas accumulated since the last flush, and both are
//! updated under the same write lock so a flush that swaps the delta map out
//! can never miss an observation.

use crate::models::{Answer, Ban, Context, ContextDelta, GroupId};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tracing::debug;

#[derive(Default)]
struct Shard {
    contexts: HashMap<String, Context>,
    pending: HashMap<String, ContextDelta>,
}

impl Shard {
    fn pending_for(&mut self, keywords: &str, time: i64) -> &mut ContextDelta {
        self.pending
            .entry(keywords.to_string())
            .or_insert_with(|| ContextDelta::new(keywords, time))
    }
}

/// Result of one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Learned {
    pub keywords: String,
    /// Context count after the observation.
    pub context_count: i64,
    pub context_time: i64,
    pub answer: Answer,
}

pub struct ContextIndex {
    shards: Vec<RwLock<Shard>>,
}

impl ContextIndex {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| RwLock::new(Shard::default())).collect(),
        }
    }

    fn shard(&self, keywords: &str) -> &RwLock<Shard> {
        let mut hasher = DefaultHasher::new();
        keywords.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    /// Installs contexts loaded from the store. Hot entries win.
    pub fn hydrate(&self, contexts: Vec<Context>) -> usize {
        let mut installed = 0;
        for context in contexts {
            let mut shard = self.shard(&context.keywords).write();
            if !shard.contexts.contains_key(&context.keywords) {
                shard.contexts.insert(context.keywords.clone(), context);
                installed += 1;
            }
        }
        installed
    }

    /// Counts `text` as a reply to `keywords` in `group_id`.
    pub fn observe(&self, keywords: &str, group_id: GroupId, text: &str, time: i64) -> Learned {
        let mut guard = self.shard(keywords).write();
        let shard = &mut *guard;
        shard.pending_for(keywords, time).record(group_id, text, time);

        let context = shard
            .contexts
            .entry(keywords.to_string())
            .or_insert_with(|| Context::new(keywords, time));
        let answer = context.record(group_id, text, time).clone();
        Learned {
            keywords: keywords.to_string(),
            context_count: context.count,
            context_time: context.time,
            answer,
        }
    }

    pub fn lookup(&self, keywords: &str) -> Option<Context> {
        self.shard(keywords).read().contexts.get(keywords).cloned()
    }

    /// Runs `f` against the live context under a read lock.
    pub fn with_context<R>(&self, keywords: &str, f: impl FnOnce(&Context) -> R) -> Option<R> {
        self.shard(keywords).read().contexts.get(keywords).map(f)
    }

    /// Forgets every learned answer of a context.
    pub fn clear(&self, keywords: &str, time: i64) -> bool {
        let mut guard = self.shard(keywords).write();
        let shard = &mut *guard;
        let Some(context) = shard.contexts.get_mut(keywords) else {
            return false;
        };
        context.answers.clear();
        context.count = 0;
        context.clear_time = time;
        shard.pending_for(keywords, time).clear(time);
        debug!("Index: cleared context '{}'", keywords);
        true
    }

    /// Returns false when the group already had a ban for this fingerprint.
    pub fn ban(&self, keywords: &str, group_id: GroupId, reason: &str, time: i64) -> bool {
        let mut guard = self.shard(keywords).write();
        let shard = &mut *guard;
        let context = shard
            .contexts
            .entry(keywords.to_string())
            .or_insert_with(|| Context::new(keywords, time));
        if context.is_banned(group_id) {
            return false;
        }
        context.ban.push(Ban {
            keywords: keywords.to_string(),
            group_id,
            reason: reason.to_string(),
            time,
        });
        let bans = context.ban.clone();
        shard.pending_for(keywords, time).bans = Some(bans);
        true
    }

    pub fn unban(&self, keywords: &str, group_id: GroupId, time: i64) -> bool {
        let mut guard = self.shard(keywords).write();
        let shard = &mut *guard;
        let Some(context) = shard.contexts.get_mut(keywords) else {
            return false;
        };
        let before = context.ban.len();
        context.ban.retain(|b| b.group_id != group_id);
        if context.ban.len() == before {
            return false;
        }
        let bans = context.ban.clone();
        shard.pending_for(keywords, time).bans = Some(bans);
        true
    }

    pub fn is_banned(&self, keywords: &str, group_id: GroupId) -> bool {
        self.with_context(keywords, |c| c.is_banned(group_id))
            .unwrap_or(false)
    }

    /// Takes the current delta generation of every shard.
    pub fn take_pending(&self) -> Vec<ContextDelta> {
        let mut deltas = Vec::new();
        for shard in &self.shards {
            let taken = std::mem::take(&mut shard.write().pending);
            deltas.extend(taken.into_values());
        }
        deltas
    }

    /// Puts a failed generation back underneath anything recorded since.
    pub fn restore_pending(&self, deltas: Vec<ContextDelta>) {
        for mut delta in deltas {
            let mut shard = self.shard(&delta.keywords).write();
            if let Some(newer) = shard.pending.remove(&delta.keywords) {
                delta.absorb(newer);
            }
            shard.pending.insert(delta.keywords.clone(), delta);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.shards.iter().map(|s| s.read().pending.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().contexts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
