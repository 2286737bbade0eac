//! The surface collaborators talk to.
//!
//! A [`Repeater`] is shared behind an `Arc` by every ingestion path. All reply
//! decisions are served from memory; the store is only touched at startup, on
//! flush, and for the group keyword scan.

use crate::cache::MessageLog;
use crate::config::Config;
use crate::db::Store;
use crate::error::{RepeaterError, Result};
use crate::index::{ContextIndex, Learned};
use crate::keywords;
use crate::models::{BotId, Context, GroupId, Message, UserId};
use crate::moderation::{Moderation, Placement};
use crate::repeat::RepeatTracker;
use crate::selector::{self, SelectParams};
use crate::sync::{Background, BlacklistRefresher, FlushReport, FlushScheduler, SyncController};
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A group message as handed over by a platform adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub bot_id: BotId,
    pub raw_message: String,
    pub time: i64,
}

impl IncomingMessage {
    /// Stamped with the current time.
    pub fn new(group_id: GroupId, user_id: UserId, bot_id: BotId, raw_message: &str) -> Self {
        Self {
            group_id,
            user_id,
            bot_id,
            raw_message: raw_message.to_string(),
            time: Utc::now().timestamp(),
        }
    }

    pub fn at(mut self, time: i64) -> Self {
        self.time = time;
        self
    }
}

/// What the engine did with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// As written to the message log.
    pub message: Message,
    /// Set when the message was learned as an answer to the previous one.
    pub learned: Option<Learned>,
    /// Set when the message completed a repeat run the bot should join.
    pub repeat: Option<String>,
}

impl Observation {
    /// Fingerprint to look replies up with, if the message is plain text.
    pub fn fingerprint(&self) -> Option<&str> {
        (!self.message.keywords.is_empty()).then_some(self.message.keywords.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub contexts: usize,
    pub pending_contexts: usize,
    pub pending_messages: usize,
    pub dropped_messages: u64,
    pub global_blacklist: usize,
}

pub struct Repeater {
    config: Config,
    params: SelectParams,
    index: ContextIndex,
    log: MessageLog,
    moderation: Moderation,
    repeats: RepeatTracker,
    sync: SyncController,
}

impl Repeater {
    /// Builds an empty engine. Call [`Repeater::hydrate`] before serving.
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        Self {
            params: SelectParams::from(&config),
            index: ContextIndex::new(config.index_shards),
            log: MessageLog::new(
                config.recent_messages_per_group,
                config.recent_groups_capacity,
                config.message_buffer_cap,
            ),
            moderation: Moderation::from_config(&config),
            repeats: RepeatTracker::new(config.repeat_threshold),
            sync: SyncController::new(store),
            config,
        }
    }

    /// Builds and hydrates. Fails when the store cannot be read, since
    /// replies must not be served without the blacklists.
    pub async fn open(config: Config, store: Arc<dyn Store>) -> Result<Arc<Self>> {
        let engine = Arc::new(Self::new(config, store));
        engine.hydrate().await?;
        Ok(engine)
    }

    pub async fn hydrate(&self) -> Result<()> {
        let groups = self
            .with_retries("loading blacklists", || self.hydrate_global_blacklist())
            .await?;

        let contexts = self
            .with_retries("loading contexts", || self.sync.store().load_contexts())
            .await?;
        let loaded = self.index.hydrate(contexts);

        let mut warmed = 0;
        if self.config.warm_recent_messages > 0 {
            match self
                .sync
                .store()
                .load_recent_messages(self.config.warm_recent_messages)
                .await
            {
                Ok(messages) => {
                    warmed = messages.len();
                    for message in messages.into_iter().rev() {
                        self.log.remember(message);
                    }
                }
                Err(e) => warn!("Hydrate: recent messages unavailable, starting cold: {}", e),
            }
        }

        info!(
            "Hydrate: {} blacklisted groups, {} contexts, {} recent messages",
            groups, loaded, warmed
        );
        Ok(())
    }

    async fn with_retries<T, F, Fut>(&self, what: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.hydrate_retries.max(1);
        let delay = std::time::Duration::from_secs(self.config.hydrate_retry_delay_secs);
        let mut last = None;
        for attempt in 1..=attempts {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Store: {} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                    last = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| RepeaterError::StoreUnavailable(what.to_string())))
    }

    /// Ingests one group message.
    ///
    /// Returns `None` when the message has no usable content. Otherwise the
    /// message is logged and, when it follows another user's plain-text
    /// message closely enough, learned as an answer to it.
    pub fn observe(&self, incoming: IncomingMessage) -> Option<Observation> {
        let Some(normalized) = keywords::normalize(&incoming.raw_message) else {
            debug!(
                "Observe: ignoring empty message from {} in group {}",
                incoming.user_id, incoming.group_id
            );
            return None;
        };
        let fingerprint = if normalized.is_plain_text {
            keywords::fingerprint(&normalized.plain_text, self.config.keyword_limit)
        } else {
            None
        };

        let message = Message {
            group_id: incoming.group_id,
            user_id: incoming.user_id,
            bot_id: incoming.bot_id,
            raw_message: incoming.raw_message,
            is_plain_text: fingerprint.is_some(),
            plain_text: normalized.plain_text,
            keywords: fingerprint.unwrap_or_default(),
            time: incoming.time,
        };
        let group_id = message.group_id;
        let from_bot = message.user_id == message.bot_id;

        let mut learned = None;
        let mut repeat = None;
        if !message.is_plain_text {
            self.repeats.reset(group_id);
        } else if !from_bot {
            learned = self
                .log
                .last_in_group(group_id)
                .filter(|previous| self.answers(previous, &message))
                .map(|previous| {
                    self.index
                        .observe(&previous.keywords, group_id, &message.plain_text, message.time)
                });
            repeat = self
                .repeats
                .observe(group_id, message.user_id, &message.plain_text)
                .filter(|text| {
                    !self.moderation.is_forbidden(group_id, text)
                        && !self.index.is_banned(&message.keywords, group_id)
                });
        }

        if let Some(l) = &learned {
            debug!(
                "Observe: learned '{}' -> '{}' in group {} (count {})",
                l.keywords, message.plain_text, group_id, l.context_count
            );
        }

        self.log.append(message.clone());
        Some(Observation {
            message,
            learned,
            repeat,
        })
    }

    fn answers(&self, previous: &Message, message: &Message) -> bool {
        previous.is_plain_text
            && !previous.keywords.is_empty()
            && previous.user_id != previous.bot_id
            && previous.user_id != message.user_id
            && message.time >= previous.time
            && message.time - previous.time <= self.config.context_window_secs
    }

    /// Learns `text` as an answer to `fingerprint` directly.
    pub fn learn(&self, fingerprint: &str, group_id: GroupId, text: &str, time: i64) -> Learned {
        self.index.observe(fingerprint, group_id, text, time)
    }

    pub fn fingerprint(&self, plain_text: &str) -> Option<String> {
        keywords::fingerprint(plain_text, self.config.keyword_limit)
    }

    /// A reply for `fingerprint` in `group_id`, ignoring any trigger roll.
    pub fn select_reply(&self, fingerprint: &str, group_id: GroupId) -> Option<String> {
        self.index
            .with_context(fingerprint, |context| {
                selector::select(
                    context,
                    group_id,
                    &self.moderation,
                    &self.params,
                    &mut rand::thread_rng(),
                )
            })
            .flatten()
    }

    /// Rolls `probability` first, then selects.
    pub fn maybe_reply(
        &self,
        fingerprint: &str,
        group_id: GroupId,
        probability: f64,
    ) -> Option<String> {
        let p = if probability.is_nan() { 0.0 } else { probability.clamp(0.0, 1.0) };
        if !rand::thread_rng().gen_bool(p) {
            return None;
        }
        self.select_reply(fingerprint, group_id)
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<Context> {
        self.index.lookup(fingerprint)
    }

    pub fn ban(&self, fingerprint: &str, group_id: GroupId, reason: &str) -> bool {
        let added = self
            .index
            .ban(fingerprint, group_id, reason, Utc::now().timestamp());
        if added {
            info!("Moderation: banned '{}' in group {} ({})", fingerprint, group_id, reason);
        }
        added
    }

    pub fn unban(&self, fingerprint: &str, group_id: GroupId) -> bool {
        self.index
            .unban(fingerprint, group_id, Utc::now().timestamp())
    }

    pub fn is_banned(&self, fingerprint: &str, group_id: GroupId) -> bool {
        self.index.is_banned(fingerprint, group_id)
    }

    pub fn blacklist(&self, group_id: GroupId, text: &str) -> Placement {
        self.moderation.blacklist(group_id, text)
    }

    pub fn unblacklist(&self, group_id: GroupId, text: &str) -> bool {
        self.moderation.unblacklist(group_id, text)
    }

    pub fn is_blacklisted(&self, group_id: GroupId, text: &str) -> bool {
        self.moderation.is_blacklisted(group_id, text)
    }

    pub fn is_globally_blacklisted(&self, text: &str) -> bool {
        self.moderation.is_globally_blacklisted(text)
    }

    /// Forgets everything learned for `fingerprint`.
    pub fn clear(&self, fingerprint: &str) -> bool {
        let cleared = self.index.clear(fingerprint, Utc::now().timestamp());
        if cleared {
            info!("Index: cleared '{}'", fingerprint);
        }
        cleared
    }

    /// Reloads every group's blacklist and rebuilds the global union.
    pub async fn hydrate_global_blacklist(&self) -> Result<usize> {
        let lists = self.sync.store().load_blacklists().await?;
        let groups = lists.len();
        self.moderation.install(lists);
        Ok(groups)
    }

    pub async fn flush_now(&self) -> Result<FlushReport> {
        self.sync
            .flush(&self.index, &self.log, &self.moderation)
            .await
    }

    pub fn recent_per_group(&self) -> HashMap<GroupId, Message> {
        self.log.recent_per_group()
    }

    /// Fingerprints with answers learned in `group_id`, most popular first.
    /// Reads the store, so only flushed state is visible.
    pub async fn learned_in_group(&self, group_id: GroupId, limit: usize) -> Result<Vec<String>> {
        self.sync.store().group_keywords(group_id, limit).await
    }

    /// Starts the flush scheduler and, if configured, the blacklist refresher.
    pub fn spawn_background(self: &Arc<Self>) -> Background {
        let (tx, rx) = watch::channel(false);
        let mut handles = vec![tokio::spawn(
            FlushScheduler::new(self.clone(), self.config.flush_interval()).run(rx.clone()),
        )];
        if let Some(every) = self.config.blacklist_refresh_interval() {
            handles.push(tokio::spawn(
                BlacklistRefresher::new(self.clone(), every).run(rx),
            ));
        }
        Background::new(tx, handles)
    }

    /// Stops the background loops, then writes everything still buffered,
    /// retrying like startup hydration does.
    pub async fn shutdown(&self, background: Background) -> Result<FlushReport> {
        background.shutdown().await;
        let report = self
            .with_retries("shutdown flush", || self.flush_now())
            .await?;
        info!(
            "Shutdown flush: {} contexts, {} blacklists, {} messages",
            report.contexts, report.blacklists, report.messages
        );
        Ok(report)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            contexts: self.index.len(),
            pending_contexts: self.index.pending_len(),
            pending_messages: self.log.pending_len(),
            dropped_messages: self.log.dropped(),
            global_blacklist: self.moderation.global_len(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn engine() -> Repeater {
        let config = Config {
            database_url: ":memory:".to_string(),
            ..Config::default()
        };
        Repeater::new(config, Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_observe_links_previous_message() {
        let engine = engine();
        let first = engine
            .observe(IncomingMessage::new(1, 10, 99, "摸摸头").at(100))
            .unwrap();
        assert!(first.learned.is_none());
        assert_eq!(first.fingerprint(), Some("摸摸头"));

        let second = engine
            .observe(IncomingMessage::new(1, 11, 99, "喵~").at(101))
            .unwrap();
        let learned = second.learned.unwrap();
        assert_eq!(learned.keywords, "摸摸头");
        assert_eq!(learned.answer.variant("喵~").unwrap().count, 1);
        assert_eq!(engine.select_reply("摸摸头", 1).as_deref(), Some("喵~"));
        assert_eq!(engine.select_reply("摸摸头", 2), None);
    }

    #[test]
    fn test_observe_skips_unlinked_messages() {
        let engine = engine();
        engine.observe(IncomingMessage::new(1, 10, 99, "hello").at(100));
        // Same user continuing.
        let own = engine.observe(IncomingMessage::new(1, 10, 99, "again").at(101)).unwrap();
        assert!(own.learned.is_none());
        // Too late.
        let late = engine.observe(IncomingMessage::new(1, 11, 99, "late").at(10_000)).unwrap();
        assert!(late.learned.is_none());
        // The bot's own line is logged but never learned, nor used as a trigger.
        let bot = engine.observe(IncomingMessage::new(1, 99, 99, "beep").at(10_001)).unwrap();
        assert!(bot.learned.is_none());
        let after_bot = engine.observe(IncomingMessage::new(1, 12, 99, "boop").at(10_002)).unwrap();
        assert!(after_bot.learned.is_none());
        // Media breaks the chain.
        engine.observe(IncomingMessage::new(1, 13, 99, "[CQ:image,file=a]").at(10_003));
        let after_media = engine.observe(IncomingMessage::new(1, 14, 99, "nice").at(10_004)).unwrap();
        assert!(after_media.learned.is_none());

        assert!(engine.observe(IncomingMessage::new(1, 15, 99, "  ")).is_none());
        assert_eq!(engine.stats().pending_messages, 7);
    }

    #[test]
    fn test_repeat_respects_moderation() {
        let engine = engine();
        engine.blacklist(1, "spam");
        for user in 10..13 {
            let obs = engine.observe(IncomingMessage::new(1, user, 99, "spam").at(100)).unwrap();
            assert!(obs.repeat.is_none());
        }
        let mut fired = None;
        for user in 10..13 {
            fired = engine
                .observe(IncomingMessage::new(2, user, 99, "+1").at(100))
                .unwrap()
                .repeat;
        }
        assert_eq!(fired.as_deref(), Some("+1"));
    }

    #[test]
    fn test_maybe_reply_respects_roll() {
        let engine = engine();
        engine.learn("hi", 1, "hello", 1);
        assert_eq!(engine.maybe_reply("hi", 1, 0.0), None);
        assert_eq!(engine.maybe_reply("hi", 1, f64::NAN), None);
        assert_eq!(engine.maybe_reply("hi", 1, 1.0).as_deref(), Some("hello"));
    }
}
