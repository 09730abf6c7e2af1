//! Update queue and auto-sync schedule.
//!
//! The [`UpdateQueue`] holds live entries competing for a worker slot:
//! `manual` entries beat `auto` ones, then the earliest due time wins and
//! repository ids break ties. The [`Schedule`] holds idle repositories
//! waiting for their next automatic sync; they are promoted into the queue
//! once due. Both keep at most one entry per repository.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::types::{RepoId, TriggerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub repo_id: RepoId,
    pub due_at: DateTime<Utc>,
    pub trigger: TriggerKind,
}

#[derive(Debug, Default)]
pub struct UpdateQueue {
    manual: BTreeSet<(DateTime<Utc>, RepoId)>,
    auto: BTreeSet<(DateTime<Utc>, RepoId)>,
    entries: HashMap<RepoId, QueueEntry>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, repo_id: RepoId) -> Option<&QueueEntry> {
        self.entries.get(&repo_id)
    }

    /// Inserts `entry`, replacing any entry the repository already had.
    pub fn push(&mut self, entry: QueueEntry) {
        self.remove(entry.repo_id);
        self.class_mut(entry.trigger)
            .insert((entry.due_at, entry.repo_id));
        self.entries.insert(entry.repo_id, entry);
    }

    pub fn remove(&mut self, repo_id: RepoId) -> Option<QueueEntry> {
        let entry = self.entries.remove(&repo_id)?;
        self.class_mut(entry.trigger)
            .remove(&(entry.due_at, entry.repo_id));
        Some(entry)
    }

    /// Removes and returns the highest-priority entry due at or before `now`.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<QueueEntry> {
        let next = [TriggerKind::Manual, TriggerKind::Auto]
            .into_iter()
            .find_map(|trigger| {
                self.class(trigger)
                    .first()
                    .filter(|(due_at, _)| *due_at <= now)
                    .map(|(_, repo_id)| *repo_id)
            })?;
        self.remove(next)
    }

    /// Earliest due time of any live entry.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        let manual = self.manual.first().map(|(due_at, _)| *due_at);
        let auto = self.auto.first().map(|(due_at, _)| *due_at);
        manual.into_iter().chain(auto).min()
    }

    fn class(&self, trigger: TriggerKind) -> &BTreeSet<(DateTime<Utc>, RepoId)> {
        match trigger {
            TriggerKind::Manual => &self.manual,
            TriggerKind::Auto => &self.auto,
        }
    }

    fn class_mut(&mut self, trigger: TriggerKind) -> &mut BTreeSet<(DateTime<Utc>, RepoId)> {
        match trigger {
            TriggerKind::Manual => &mut self.manual,
            TriggerKind::Auto => &mut self.auto,
        }
    }
}

/// Next automatic due time per idle repository.
#[derive(Debug, Default)]
pub struct Schedule {
    order: BTreeSet<(DateTime<Utc>, RepoId)>,
    due: HashMap<RepoId, DateTime<Utc>>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }

    pub fn due_at(&self, repo_id: RepoId) -> Option<DateTime<Utc>> {
        self.due.get(&repo_id).copied()
    }

    pub fn insert(&mut self, repo_id: RepoId, due_at: DateTime<Utc>) {
        self.remove(repo_id);
        self.order.insert((due_at, repo_id));
        self.due.insert(repo_id, due_at);
    }

    pub fn remove(&mut self, repo_id: RepoId) -> Option<DateTime<Utc>> {
        let due_at = self.due.remove(&repo_id)?;
        self.order.remove(&(due_at, repo_id));
        Some(due_at)
    }

    /// Removes every entry due at or before `now`, earliest first.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<(RepoId, DateTime<Utc>)> {
        let mut due = Vec::new();
        while let Some(&(due_at, repo_id)) = self.order.first() {
            if due_at > now {
                break;
            }
            self.order.pop_first();
            self.due.remove(&repo_id);
            due.push((repo_id, due_at));
        }
        due
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.order.first().map(|(due_at, _)| *due_at)
    }
}
