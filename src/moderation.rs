//! Per-group blacklists and the global blacklist union.
//!
//! Keyword bans live on the contexts themselves (see [`crate::index`]); this
//! module covers the answer-text side of moderation. Every check is a memory
//! read because it gates every reply decision.

use crate::config::{BlacklistPolicyKind, Config};
use crate::models::{BlackList, GroupId};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Where a reported text ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Enforced from now on.
    Active,
    /// Staged; not enforced.
    Reserve,
    /// Was already enforced.
    AlreadyActive,
}

/// Decides how a report moves a text between the reserve and active lists.
pub trait PromotionPolicy: Send + Sync {
    fn place(&self, list: &mut BlackList, text: &str) -> Placement;
}

/// Every report is enforced immediately.
pub struct ImmediatePolicy;

impl PromotionPolicy for ImmediatePolicy {
    fn place(&self, list: &mut BlackList, text: &str) -> Placement {
        if list.contains(text) {
            return Placement::AlreadyActive;
        }
        list.answers_reserve.retain(|t| t != text);
        list.answers.push(text.to_string());
        Placement::Active
    }
}

/// Reports are staged in the reserve list and promoted after `strikes`
/// reports. The reserve list keeps one entry per report.
pub struct ReservePolicy {
    pub strikes: usize,
}

impl PromotionPolicy for ReservePolicy {
    fn place(&self, list: &mut BlackList, text: &str) -> Placement {
        if list.contains(text) {
            return Placement::AlreadyActive;
        }
        let reports = list.answers_reserve.iter().filter(|t| *t == text).count() + 1;
        if reports >= self.strikes {
            list.answers_reserve.retain(|t| t != text);
            list.answers.push(text.to_string());
            Placement::Active
        } else {
            list.answers_reserve.push(text.to_string());
            Placement::Reserve
        }
    }
}

pub struct Moderation {
    lists: RwLock<HashMap<GroupId, BlackList>>,
    global: RwLock<HashSet<String>>,
    dirty: Mutex<HashSet<GroupId>>,
    /// Taken by a flush whose save has not been confirmed yet.
    in_flight: Mutex<HashSet<GroupId>>,
    policy: Box<dyn PromotionPolicy>,
}

impl Moderation {
    pub fn new(policy: Box<dyn PromotionPolicy>) -> Self {
        Self {
            lists: RwLock::new(HashMap::new()),
            global: RwLock::new(HashSet::new()),
            dirty: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashSet::new()),
            policy,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let policy: Box<dyn PromotionPolicy> = match config.blacklist_policy {
            BlacklistPolicyKind::Immediate => Box::new(ImmediatePolicy),
            BlacklistPolicyKind::Reserve => Box::new(ReservePolicy {
                strikes: config.blacklist_reserve_strikes.max(1),
            }),
        };
        Self::new(policy)
    }

    /// Reports `text` as unwanted in `group_id`.
    pub fn blacklist(&self, group_id: GroupId, text: &str) -> Placement {
        let placement = {
            let mut lists = self.lists.write();
            let list = lists
                .entry(group_id)
                .or_insert_with(|| BlackList::new(group_id));
            self.policy.place(list, text)
        };

        match placement {
            Placement::Active => {
                self.global.write().insert(text.to_string());
                self.dirty.lock().insert(group_id);
                info!("Moderation: blacklisted '{}' in group {}", text, group_id);
            }
            Placement::Reserve => {
                self.dirty.lock().insert(group_id);
                debug!("Moderation: staged '{}' in group {}", text, group_id);
            }
            Placement::AlreadyActive => {}
        }
        placement
    }

    /// Drops `text` from both lists of the group. The global union keeps it
    /// until the next rebuild.
    pub fn unblacklist(&self, group_id: GroupId, text: &str) -> bool {
        let removed = {
            let mut lists = self.lists.write();
            let Some(list) = lists.get_mut(&group_id) else {
                return false;
            };
            let before = list.answers.len() + list.answers_reserve.len();
            list.answers.retain(|t| t != text);
            list.answers_reserve.retain(|t| t != text);
            before != list.answers.len() + list.answers_reserve.len()
        };
        if removed {
            self.dirty.lock().insert(group_id);
        }
        removed
    }

    pub fn is_blacklisted(&self, group_id: GroupId, text: &str) -> bool {
        self.lists
            .read()
            .get(&group_id)
            .is_some_and(|list| list.contains(text))
    }

    pub fn is_globally_blacklisted(&self, text: &str) -> bool {
        self.global.read().contains(text)
    }

    /// Either check, as used by reply selection.
    pub fn is_forbidden(&self, group_id: GroupId, text: &str) -> bool {
        self.is_globally_blacklisted(text) || self.is_blacklisted(group_id, text)
    }

    pub fn blacklist_of(&self, group_id: GroupId) -> Option<BlackList> {
        self.lists.read().get(&group_id).cloned()
    }

    /// Replaces the per-group lists with stored ones and rebuilds the union.
    /// Groups with unsaved local changes keep their memory copy, including
    /// groups whose save is still in flight.
    pub fn install(&self, stored: Vec<BlackList>) {
        let mut dirty = self.dirty.lock().clone();
        dirty.extend(self.in_flight.lock().iter().copied());
        let mut lists = self.lists.write();
        let mut fresh: HashMap<GroupId, BlackList> = stored
            .into_iter()
            .filter(|list| !dirty.contains(&list.group_id))
            .map(|list| (list.group_id, list))
            .collect();
        for group_id in &dirty {
            if let Some(list) = lists.remove(group_id) {
                fresh.insert(*group_id, list);
            }
        }
        *lists = fresh;

        let union: HashSet<String> = lists
            .values()
            .flat_map(|list| list.answers.iter().cloned())
            .collect();
        info!(
            "Moderation: global blacklist rebuilt from {} groups ({} texts)",
            lists.len(),
            union.len()
        );
        *self.global.write() = union;
    }

    /// Snapshots of groups changed since the last call. The groups stay
    /// protected from [`Moderation::install`] until the save is settled with
    /// [`Moderation::confirm_saved`] or [`Moderation::restore_dirty`].
    pub fn take_dirty(&self) -> Vec<BlackList> {
        let mut dirty = self.dirty.lock();
        let mut in_flight = self.in_flight.lock();
        let groups = std::mem::take(&mut *dirty);
        in_flight.extend(groups.iter().copied());
        let lists = self.lists.read();
        groups
            .into_iter()
            .filter_map(|group_id| lists.get(&group_id).cloned())
            .collect()
    }

    pub fn confirm_saved(&self, lists: &[BlackList]) {
        let mut in_flight = self.in_flight.lock();
        for list in lists {
            in_flight.remove(&list.group_id);
        }
    }

    /// Marks groups from a failed save as changed again.
    pub fn restore_dirty(&self, lists: &[BlackList]) {
        let mut dirty = self.dirty.lock();
        let mut in_flight = self.in_flight.lock();
        for list in lists {
            in_flight.remove(&list.group_id);
            dirty.insert(list.group_id);
        }
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.lock().len()
    }

    pub fn global_len(&self) -> usize {
        self.global.read().len()
    }
}
