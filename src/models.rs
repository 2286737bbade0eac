//! Persistent shapes of the learned model and the message log.
//!
//! Everything here is plain data plus the merge rules shared by the in-memory
//! index and the store, so that a delta applied in memory and the same delta
//! applied to a stored document always agree.

use serde::{Deserialize, Serialize};

pub type GroupId = i64;
pub type UserId = i64;
pub type BotId = i64;

/// One observed chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub bot_id: BotId,
    pub raw_message: String,
    pub is_plain_text: bool,
    pub plain_text: String,
    /// Empty when the message is not plain text.
    pub keywords: String,
    pub time: i64,
}

/// A distinct reply text inside an [`Answer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub text: String,
    pub count: i64,
    pub time: i64,
}

/// Reply variants learned for one fingerprint within one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub keywords: String,
    pub group_id: GroupId,
    pub count: i64,
    pub time: i64,
    pub messages: Vec<Variant>,
}

impl Answer {
    pub fn new(keywords: &str, group_id: GroupId, time: i64) -> Self {
        Self {
            keywords: keywords.to_string(),
            group_id,
            count: 0,
            time,
            messages: Vec::new(),
        }
    }

    /// Counts one more sighting of `text`.
    pub fn record(&mut self, text: &str, time: i64) {
        self.count += 1;
        self.time = self.time.max(time);
        match self.messages.iter_mut().find(|v| v.text == text) {
            Some(variant) => {
                variant.count += 1;
                variant.time = variant.time.max(time);
            }
            None => self.messages.push(Variant {
                text: text.to_string(),
                count: 1,
                time,
            }),
        }
    }

    /// Adds the counts of `other` (same keywords and group) into this answer.
    pub fn absorb(&mut self, other: &Answer) {
        self.count += other.count;
        self.time = self.time.max(other.time);
        for incoming in &other.messages {
            match self.messages.iter_mut().find(|v| v.text == incoming.text) {
                Some(variant) => {
                    variant.count += incoming.count;
                    variant.time = variant.time.max(incoming.time);
                }
                None => self.messages.push(incoming.clone()),
            }
        }
    }

    pub fn variant(&self, text: &str) -> Option<&Variant> {
        self.messages.iter().find(|v| v.text == text)
    }
}

/// Marks a fingerprint as unusable in one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ban {
    pub keywords: String,
    pub group_id: GroupId,
    pub reason: String,
    pub time: i64,
}

/// Learned record for one fingerprint across all groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub keywords: String,
    pub time: i64,
    pub count: i64,
    pub answers: Vec<Answer>,
    pub ban: Vec<Ban>,
    pub clear_time: i64,
}

impl Context {
    pub fn new(keywords: &str, time: i64) -> Self {
        Self {
            keywords: keywords.to_string(),
            time,
            count: 0,
            answers: Vec::new(),
            ban: Vec::new(),
            clear_time: 0,
        }
    }

    pub fn answer(&self, group_id: GroupId) -> Option<&Answer> {
        self.answers.iter().find(|a| a.group_id == group_id)
    }

    pub fn is_banned(&self, group_id: GroupId) -> bool {
        self.ban.iter().any(|b| b.group_id == group_id)
    }

    /// Applies one observation and returns the touched answer.
    pub fn record(&mut self, group_id: GroupId, text: &str, time: i64) -> &Answer {
        self.count += 1;
        self.time = self.time.max(time);
        record_answer(&mut self.answers, &self.keywords, group_id, text, time)
    }

    /// Applies a buffered delta with upsert-with-increment semantics.
    pub fn merge_delta(&mut self, delta: &ContextDelta) {
        if let Some(cleared_at) = delta.cleared_at {
            self.answers.clear();
            self.count = 0;
            self.clear_time = self.clear_time.max(cleared_at);
        }
        self.count += delta.count;
        self.time = self.time.max(delta.time);
        for incoming in &delta.answers {
            match self.answers.iter_mut().find(|a| a.group_id == incoming.group_id) {
                Some(answer) => answer.absorb(incoming),
                None => self.answers.push(incoming.clone()),
            }
        }
        if let Some(bans) = &delta.bans {
            self.ban = bans.clone();
        }
    }

    /// Answer counts summed; equals `count` whenever the context is settled.
    pub fn answer_total(&self) -> i64 {
        self.answers.iter().map(|a| a.count).sum()
    }
}

fn record_answer<'a>(
    answers: &'a mut Vec<Answer>,
    keywords: &str,
    group_id: GroupId,
    text: &str,
    time: i64,
) -> &'a Answer {
    let idx = match answers.iter().position(|a| a.group_id == group_id) {
        Some(idx) => idx,
        None => {
            answers.push(Answer::new(keywords, group_id, time));
            answers.len() - 1
        }
    };
    answers[idx].record(text, time);
    &answers[idx]
}

/// Changes to one context accumulated since the last flush.
///
/// `count` and `answers` are increments on top of the stored document, or on
/// top of an empty answer set when `cleared_at` is set. `bans` is a full
/// replacement of the stored ban list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDelta {
    pub keywords: String,
    pub time: i64,
    pub count: i64,
    pub answers: Vec<Answer>,
    pub cleared_at: Option<i64>,
    pub bans: Option<Vec<Ban>>,
}

impl ContextDelta {
    pub fn new(keywords: &str, time: i64) -> Self {
        Self {
            keywords: keywords.to_string(),
            time,
            count: 0,
            answers: Vec::new(),
            cleared_at: None,
            bans: None,
        }
    }

    pub fn record(&mut self, group_id: GroupId, text: &str, time: i64) {
        self.count += 1;
        self.time = self.time.max(time);
        record_answer(&mut self.answers, &self.keywords, group_id, text, time);
    }

    pub fn clear(&mut self, time: i64) {
        self.count = 0;
        self.answers.clear();
        self.cleared_at = Some(time);
    }

    /// Folds a later delta for the same keywords into this one.
    pub fn absorb(&mut self, later: ContextDelta) {
        self.time = self.time.max(later.time);
        if later.cleared_at.is_some() {
            self.cleared_at = later.cleared_at;
            self.count = later.count;
            self.answers = later.answers;
        } else {
            self.count += later.count;
            for incoming in &later.answers {
                match self.answers.iter_mut().find(|a| a.group_id == incoming.group_id) {
                    Some(answer) => answer.absorb(incoming),
                    None => self.answers.push(incoming.clone()),
                }
            }
        }
        if later.bans.is_some() {
            self.bans = later.bans;
        }
    }
}

/// Per-group moderation lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackList {
    pub group_id: GroupId,
    /// Enforced.
    pub answers: Vec<String>,
    /// Staged, not enforced until promoted.
    pub answers_reserve: Vec<String>,
}

impl BlackList {
    pub fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            ..Default::default()
        }
    }

    pub fn contains(&self, text: &str) -> bool {
        self.answers.iter().any(|a| a == text)
    }
}
