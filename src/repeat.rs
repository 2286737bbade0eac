use crate::models::{GroupId, UserId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

struct Run {
    text: String,
    users: HashSet<UserId>,
    fired: bool,
}

/// Detects a group echoing the same line and tells the bot to join in, once
/// per run.
pub struct RepeatTracker {
    runs: Mutex<HashMap<GroupId, Run>>,
    threshold: usize,
}

impl RepeatTracker {
    /// `threshold` distinct senders complete a run; 0 disables.
    pub fn new(threshold: usize) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            threshold,
        }
    }

    /// Returns the text when this message completes a run.
    pub fn observe(&self, group_id: GroupId, user_id: UserId, text: &str) -> Option<String> {
        if self.threshold == 0 {
            return None;
        }
        let mut runs = self.runs.lock();
        let run = runs.entry(group_id).or_insert_with(|| Run {
            text: String::new(),
            users: HashSet::new(),
            fired: false,
        });
        if run.text != text {
            run.text = text.to_string();
            run.users.clear();
            run.fired = false;
        }
        run.users.insert(user_id);

        if !run.fired && run.users.len() >= self.threshold {
            run.fired = true;
            return Some(run.text.clone());
        }
        None
    }

    /// Breaks the current run, e.g. on a media message.
    pub fn reset(&self, group_id: GroupId) {
        self.runs.lock().remove(&group_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_per_run() {
        let tracker = RepeatTracker::new(3);
        assert_eq!(tracker.observe(1, 10, "+1"), None);
        assert_eq!(tracker.observe(1, 10, "+1"), None);
        assert_eq!(tracker.observe(1, 11, "+1"), None);
        assert_eq!(tracker.observe(1, 12, "+1").as_deref(), Some("+1"));
        assert_eq!(tracker.observe(1, 13, "+1"), None);

        // A different line starts a new run.
        tracker.observe(1, 10, "hello");
        tracker.observe(1, 11, "hello");
        assert_eq!(tracker.observe(1, 12, "hello").as_deref(), Some("hello"));
    }

    #[test]
    fn test_groups_and_resets_are_independent() {
        let tracker = RepeatTracker::new(2);
        tracker.observe(1, 10, "x");
        tracker.observe(2, 11, "x");
        tracker.reset(1);
        assert_eq!(tracker.observe(1, 12, "x"), None);
        assert_eq!(tracker.observe(2, 12, "x").as_deref(), Some("x"));

        let disabled = RepeatTracker::new(0);
        assert_eq!(disabled.observe(1, 1, "x"), None);
    }
}
