use async_trait::async_trait;
use repeater::models::{BlackList, Context, ContextDelta, GroupId, Message};
use repeater::{Config, Database, IncomingMessage, Repeater, RepeaterError, Result, Store};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn test_config(database_url: &str) -> Config {
    Config {
        database_url: database_url.to_string(),
        hydrate_retry_delay_secs: 0,
        ..Config::default()
    }
}

async fn memory_engine() -> (Arc<Repeater>, Database) {
    let db = Database::open_in_memory().unwrap();
    let engine = Repeater::open(test_config(":memory:"), Arc::new(db.clone()))
        .await
        .unwrap();
    (engine, db)
}

fn variant_counts(context: &Context, group_id: GroupId) -> HashMap<String, i64> {
    context
        .answer(group_id)
        .map(|answer| {
            answer
                .messages
                .iter()
                .map(|v| (v.text.clone(), v.count))
                .collect()
        })
        .unwrap_or_default()
}

/// Delegates to a database but can be told to fail writes or reads.
struct FlakyStore {
    inner: Database,
    fail_writes: AtomicBool,
    /// Fails this many more writes, then recovers.
    write_failures: AtomicUsize,
    fail_reads: AtomicBool,
    blacklist_reads: AtomicUsize,
}

impl FlakyStore {
    fn new(inner: Database) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            write_failures: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            blacklist_reads: AtomicUsize::new(0),
        }
    }

    fn check(&self, flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(RepeaterError::StoreUnavailable("injected".to_string()))
        } else {
            Ok(())
        }
    }

    fn check_write(&self) -> Result<()> {
        let transient = self
            .write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(RepeaterError::StoreUnavailable("transient".to_string()));
        }
        self.check(&self.fail_writes)
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn load_contexts(&self) -> Result<Vec<Context>> {
        self.check(&self.fail_reads)?;
        self.inner.load_contexts().await
    }

    async fn load_blacklists(&self) -> Result<Vec<BlackList>> {
        self.blacklist_reads.fetch_add(1, Ordering::SeqCst);
        self.check(&self.fail_reads)?;
        self.inner.load_blacklists().await
    }

    async fn load_recent_messages(&self, limit: usize) -> Result<Vec<Message>> {
        self.check(&self.fail_reads)?;
        self.inner.load_recent_messages(limit).await
    }

    async fn append_messages(&self, messages: &[Message]) -> Result<()> {
        self.check_write()?;
        self.inner.append_messages(messages).await
    }

    async fn merge_contexts(&self, deltas: &[ContextDelta]) -> Result<()> {
        self.check_write()?;
        self.inner.merge_contexts(deltas).await
    }

    async fn save_blacklists(&self, lists: &[BlackList]) -> Result<()> {
        self.check_write()?;
        Store::save_blacklists(&self.inner, lists).await
    }

    async fn group_keywords(&self, group_id: GroupId, limit: usize) -> Result<Vec<String>> {
        self.inner.group_keywords(group_id, limit).await
    }
}

#[tokio::test]
async fn test_counts_match_after_flush() {
    let (engine, db) = memory_engine().await;
    for t in 0..5 {
        engine.learn("早上好", 1, "早", 100 + t);
    }
    engine.learn("早上好", 2, "早安", 200);

    let context = engine.lookup("早上好").unwrap();
    assert_eq!(context.answer(1).unwrap().count, 5);
    assert_eq!(context.count, 6);
    assert_eq!(context.answer_total(), context.count);

    engine.flush_now().await.unwrap();
    let stored = db.get_context("早上好").unwrap().unwrap();
    assert_eq!(stored.count, 6);
    assert_eq!(stored.answer_total(), 6);
    assert_eq!(variant_counts(&stored, 1)["早"], 5);
    assert_eq!(variant_counts(&stored, 2)["早安"], 1);
}

#[tokio::test]
async fn test_petting_scenario() {
    let (engine, _db) = memory_engine().await;
    let pairs = [("喵~", 10), ("喵~", 20), ("别摸", 30)];
    for (i, (reply, t)) in pairs.iter().enumerate() {
        let asker = 100 + i as i64;
        engine.observe(IncomingMessage::new(1, asker, 0, "摸摸头").at(*t));
        let obs = engine
            .observe(IncomingMessage::new(1, asker + 50, 0, reply).at(t + 1))
            .unwrap();
        assert_eq!(obs.learned.unwrap().keywords, "摸摸头");
    }

    let context = engine.lookup("摸摸头").unwrap();
    assert_eq!(context.count, 3);
    let counts = variant_counts(&context, 1);
    assert_eq!(counts["喵~"], 2);
    assert_eq!(counts["别摸"], 1);

    let mut picks: HashMap<String, usize> = HashMap::new();
    for _ in 0..3000 {
        let reply = engine.select_reply("摸摸头", 1).unwrap();
        *picks.entry(reply).or_default() += 1;
    }
    assert!(picks.get("喵~").copied().unwrap_or(0) > picks.get("别摸").copied().unwrap_or(0));
}

#[tokio::test]
async fn test_ban_applies_before_flush() {
    let (engine, db) = memory_engine().await;
    engine.learn("hi", 1, "hello", 1);
    assert!(engine.select_reply("hi", 1).is_some());

    assert!(engine.ban("hi", 1, "spam"));
    assert!(engine.is_banned("hi", 1));
    assert_eq!(engine.select_reply("hi", 1), None);
    assert!(db.get_context("hi").unwrap().is_none());

    engine.flush_now().await.unwrap();
    let stored = db.get_context("hi").unwrap().unwrap();
    assert!(stored.is_banned(1));

    assert!(engine.unban("hi", 1));
    assert_eq!(engine.select_reply("hi", 1).as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_blacklisted_text_is_never_selected() {
    let (engine, _db) = memory_engine().await;
    engine.learn("hi", 1, "hello", 1);
    engine.learn("hi", 1, "bad word", 1);
    engine.learn("hi", 1, "bad word", 2);
    engine.blacklist(1, "bad word");
    for _ in 0..500 {
        assert_eq!(engine.select_reply("hi", 1).as_deref(), Some("hello"));
    }
}

#[tokio::test]
async fn test_global_blacklist_protects_other_groups() {
    let db = Database::open_in_memory().unwrap();
    let mut a = BlackList::new(1);
    a.answers.push("t1".into());
    let mut b = BlackList::new(2);
    b.answers.push("t2".into());
    db.save_blacklists(&[a, b]).unwrap();

    let engine = Repeater::open(test_config(":memory:"), Arc::new(db.clone()))
        .await
        .unwrap();
    assert_eq!(engine.hydrate_global_blacklist().await.unwrap(), 2);
    assert!(engine.is_globally_blacklisted("t1"));
    assert!(engine.is_globally_blacklisted("t2"));
    assert!(!engine.is_blacklisted(3, "t1"));

    for text in ["t1", "t2", "fine"] {
        engine.learn("k", 3, text, 1);
    }
    for _ in 0..500 {
        assert_eq!(engine.select_reply("k", 3).as_deref(), Some("fine"));
    }
}

#[tokio::test]
async fn test_recent_per_group_skips_silent_groups() {
    let (engine, _db) = memory_engine().await;
    engine.observe(IncomingMessage::new(1, 10, 0, "hello there"));
    engine.observe(IncomingMessage::new(1, 11, 0, "hi"));
    engine.observe(IncomingMessage::new(2, 12, 0, "yo"));

    let recent = engine.recent_per_group();
    let keys: HashSet<GroupId> = recent.keys().copied().collect();
    assert_eq!(keys, HashSet::from([1, 2]));
    assert_eq!(recent[&2].plain_text, "yo");
}

#[tokio::test]
async fn test_restart_reloads_flushed_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repeater.db");
    let url = path.to_string_lossy().to_string();

    let before = {
        let db = Database::open(&url).unwrap();
        db.execute_init().unwrap();
        let engine = Repeater::open(test_config(&url), Arc::new(db)).await.unwrap();
        engine.observe(IncomingMessage::new(1, 10, 0, "摸摸头").at(10));
        engine.observe(IncomingMessage::new(1, 11, 0, "喵~").at(11));
        engine.learn("摸摸头", 1, "喵~", 12);
        engine.learn("摸摸头", 2, "别摸", 13);
        engine.ban("摸摸头", 3, "noisy");
        engine.blacklist(1, "bad");
        engine.flush_now().await.unwrap();
        engine.lookup("摸摸头").unwrap()
    };

    let db = Database::open(&url).unwrap();
    db.execute_init().unwrap();
    let engine = Repeater::open(test_config(&url), Arc::new(db)).await.unwrap();
    let after = engine.lookup("摸摸头").unwrap();

    assert_eq!(after.count, before.count);
    assert_eq!(after.count, 3);
    for group_id in [1, 2] {
        assert_eq!(variant_counts(&after, group_id), variant_counts(&before, group_id));
    }
    assert!(engine.is_banned("摸摸头", 3));
    assert!(engine.is_blacklisted(1, "bad"));
    assert!(engine.is_globally_blacklisted("bad"));
    let warmed = engine.recent_per_group()[&1].plain_text.clone();
    assert!(warmed == "摸摸头" || warmed == "喵~");
    assert_eq!(
        engine.learned_in_group(2, 10).await.unwrap(),
        vec!["摸摸头".to_string()]
    );
}

#[tokio::test]
async fn test_failed_flush_keeps_deltas_for_next_flush() {
    let db = Database::open_in_memory().unwrap();
    let store = Arc::new(FlakyStore::new(db.clone()));
    let engine = Repeater::open(test_config(":memory:"), store.clone())
        .await
        .unwrap();

    engine.learn("hi", 1, "hello", 1);
    engine.learn("hi", 1, "hello", 2);
    engine.blacklist(1, "bad");
    engine.observe(IncomingMessage::new(1, 10, 0, "some message"));

    store.fail_writes.store(true, Ordering::SeqCst);
    let err = engine.flush_now().await.unwrap_err();
    assert!(matches!(err, RepeaterError::StoreUnavailable(_)));
    assert!(db.get_context("hi").unwrap().is_none());
    let stats = engine.stats();
    assert_eq!(stats.pending_contexts, 1);
    assert_eq!(stats.pending_messages, 1);

    // Writes made while the store was down join the retained generation.
    engine.learn("hi", 1, "hello", 3);

    store.fail_writes.store(false, Ordering::SeqCst);
    let report = engine.flush_now().await.unwrap();
    assert_eq!(report.contexts, 1);
    assert_eq!(report.blacklists, 1);
    assert_eq!(report.messages, 1);

    let stored = db.get_context("hi").unwrap().unwrap();
    assert_eq!(stored.count, 3);
    assert_eq!(variant_counts(&stored, 1)["hello"], 3);
    assert_eq!(db.count_messages().unwrap(), 1);

    assert!(engine.flush_now().await.unwrap().is_empty());
    assert_eq!(db.get_context("hi").unwrap().unwrap().count, 3);
}

#[tokio::test]
async fn test_hydration_failure_is_fatal() {
    let store = Arc::new(FlakyStore::new(Database::open_in_memory().unwrap()));
    store.fail_reads.store(true, Ordering::SeqCst);
    let config = Config {
        hydrate_retries: 2,
        ..test_config(":memory:")
    };

    let result = Repeater::open(config, store.clone()).await;
    assert!(matches!(result, Err(RepeaterError::StoreUnavailable(_))));
    assert_eq!(store.blacklist_reads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_clear_forgets_everywhere() {
    let (engine, db) = memory_engine().await;
    engine.learn("hi", 1, "hello", 1);
    engine.flush_now().await.unwrap();
    assert!(db.get_context("hi").unwrap().is_some());

    assert!(engine.clear("hi"));
    assert_eq!(engine.select_reply("hi", 1), None);
    engine.learn("hi", 1, "fresh", 5);
    engine.flush_now().await.unwrap();

    let stored = db.get_context("hi").unwrap().unwrap();
    assert_eq!(stored.count, 1);
    assert_eq!(variant_counts(&stored, 1).keys().collect::<Vec<_>>(), vec!["fresh"]);
}

#[tokio::test]
async fn test_background_shutdown_flushes() {
    let (engine, db) = memory_engine().await;
    let background = engine.spawn_background();
    engine.learn("hi", 1, "hello", 1);

    let report = engine.shutdown(background).await.unwrap();
    assert_eq!(report.contexts, 1);
    assert_eq!(db.get_context("hi").unwrap().unwrap().count, 1);
}

#[tokio::test]
async fn test_shutdown_flush_retries_after_store_error() {
    let db = Database::open_in_memory().unwrap();
    let store = Arc::new(FlakyStore::new(db.clone()));
    let engine = Repeater::open(test_config(":memory:"), store.clone())
        .await
        .unwrap();
    let background = engine.spawn_background();

    engine.learn("hi", 1, "hello", 1);
    engine.ban("hi", 2, "spam");
    store.write_failures.store(1, Ordering::SeqCst);

    let report = engine.shutdown(background).await.unwrap();
    assert_eq!(report.contexts, 1);
    assert_eq!(store.write_failures.load(Ordering::SeqCst), 0);

    let stored = db.get_context("hi").unwrap().unwrap();
    assert_eq!(stored.count, 1);
    assert!(stored.is_banned(2));
    assert_eq!(engine.stats().pending_contexts, 0);
}

#[tokio::test]
async fn test_blacklist_survives_refresh_after_failed_flush() {
    let db = Database::open_in_memory().unwrap();
    let store = Arc::new(FlakyStore::new(db.clone()));
    let engine = Repeater::open(test_config(":memory:"), store.clone())
        .await
        .unwrap();

    engine.learn("hi", 1, "hello", 1);
    engine.learn("hi", 1, "bad", 2);
    engine.blacklist(1, "bad");

    store.fail_writes.store(true, Ordering::SeqCst);
    assert!(engine.flush_now().await.is_err());
    engine.hydrate_global_blacklist().await.unwrap();
    assert!(engine.is_blacklisted(1, "bad"));
    assert!(engine.is_globally_blacklisted("bad"));

    store.fail_writes.store(false, Ordering::SeqCst);
    assert_eq!(engine.flush_now().await.unwrap().blacklists, 1);
    engine.hydrate_global_blacklist().await.unwrap();
    assert!(engine.is_blacklisted(1, "bad"));
    for _ in 0..200 {
        assert_eq!(engine.select_reply("hi", 1).as_deref(), Some("hello"));
    }
}
