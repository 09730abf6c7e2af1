//! # Sync Scheduler
//!
//! Owns the known-repository set, the auto-sync schedule and the update
//! queue, and decides which repository is synced next. All of that state
//! lives behind one lock that is never held across an `.await`; job store
//! calls happen between lock sections.
//!
//! Per repository: `Known(idle) -> Queued -> Running -> Known(idle)`, with
//! `Removed` reachable from anywhere via [`Scheduler::deregister`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{JobStoreError, SchedulerError, SyncError, SyncErrorKind};
use crate::job_store::{Completion, JobStore};
use crate::observability::SyncMetrics;
use crate::types::{JobOutcome, RepoId, RepoName, RepoSpec, Repository, SyncJob, TriggerKind};
use crate::update_queue::{QueueEntry, Schedule, UpdateQueue};

/// Consecutive storage failures after which a repository reports degraded.
const STORAGE_DEGRADED_THRESHOLD: u32 = 3;

/// Attempts at persisting one outcome before leaving the job open.
const COMPLETE_ATTEMPTS: u32 = 3;
const COMPLETE_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// Work handed to the executor by [`Scheduler::tick`].
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub job: SyncJob,
    pub repo: Repository,
    pub trigger: TriggerKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Dispatched(Dispatch),
    /// The popped repository already had a job in flight and was re-queued.
    Deferred { repo_id: RepoId },
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoLifecycle {
    Idle,
    Queued,
    Running,
    Removed,
}

/// Diagnostics projection of one tracked repository.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoStatus {
    pub repository: Repository,
    pub state: RepoLifecycle,
    pub next_due: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<SyncError>,
    pub degraded: bool,
}

/// What the purge worker needs to know, taken under a single lock.
#[derive(Debug, Clone, Default)]
pub struct PurgeSnapshot {
    pub tracked: HashSet<RepoName>,
    pub removed: Vec<(RepoId, RepoName)>,
    pub running: HashSet<RepoName>,
}

#[derive(Debug, Clone)]
struct TrackedRepo {
    repository: Repository,
    consecutive_failures: u32,
    storage_failures: u32,
    last_error: Option<SyncError>,
}

impl TrackedRepo {
    fn new(repository: Repository) -> Self {
        Self {
            repository,
            consecutive_failures: 0,
            storage_failures: 0,
            last_error: None,
        }
    }

    fn degraded(&self) -> bool {
        self.last_error
            .as_ref()
            .is_some_and(SyncError::needs_attention)
            || self.storage_failures >= STORAGE_DEGRADED_THRESHOLD
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    known: HashMap<RepoId, TrackedRepo>,
    schedule: Schedule,
    queue: UpdateQueue,
    /// Repositories between a successful pop and their recorded outcome.
    running: HashSet<RepoId>,
    /// Storage names the purge worker is removing right now.
    purging: HashSet<RepoName>,
}

impl SchedulerState {
    fn active(&self, repo_id: RepoId) -> Option<&TrackedRepo> {
        self.known
            .get(&repo_id)
            .filter(|tracked| !tracked.repository.is_removed())
    }

    fn active_count(&self) -> usize {
        self.known
            .values()
            .filter(|tracked| !tracked.repository.is_removed())
            .count()
    }
}

pub struct Scheduler {
    job_store: Arc<dyn JobStore>,
    backoff: BackoffPolicy,
    metrics: SyncMetrics,
    clock: Arc<dyn Clock>,
    defer_recheck: Duration,
    state: Mutex<SchedulerState>,
    wake: Notify,
}

impl Scheduler {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        backoff: BackoffPolicy,
        metrics: SyncMetrics,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            job_store,
            backoff,
            metrics,
            clock,
            defer_recheck: Duration::seconds(config.defer_recheck_seconds as i64),
            state: Mutex::new(SchedulerState::default()),
            wake: Notify::new(),
        }
    }

    /// Resolves when new work may be available.
    pub fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }

    /// Track a repository reported by a source.
    ///
    /// New (or previously removed) repositories are queued immediately with
    /// `auto` priority. Known ones only get their metadata refreshed. Returns
    /// whether the repository was queued.
    pub fn register(&self, spec: RepoSpec) -> bool {
        let repo_id = spec.id;
        let queued = {
            let mut state = self.lock();

            let queued = match state.known.get_mut(&repo_id) {
                Some(tracked) => {
                    let revived = tracked.repository.is_removed();
                    let repository = &mut tracked.repository;
                    repository.name = spec.name;
                    repository.family = spec.family;
                    repository.origin = spec.origin;
                    repository.deleted_at = None;
                    revived
                }
                None => {
                    state
                        .known
                        .insert(repo_id, TrackedRepo::new(Repository::from_spec(spec)));
                    true
                }
            };

            if queued {
                // The Unix epoch: due before anything else in its class.
                let due_at = DateTime::<Utc>::default();
                state.schedule.remove(repo_id);
                state.queue.push(QueueEntry {
                    repo_id,
                    due_at,
                    trigger: TriggerKind::Auto,
                });
                if let Some(tracked) = state.known.get_mut(&repo_id) {
                    tracked.repository.next_due_at = Some(due_at);
                    info!(
                        repo_id = %repo_id,
                        repo = %tracked.repository.name,
                        family = tracked.repository.family.as_str(),
                        "Registered repository"
                    );
                }
            }

            self.publish_gauges(&state);
            queued
        };

        if queued {
            self.wake.notify_one();
        }
        queued
    }

    /// Queue a `manual` sync due now, superseding any pending auto sync.
    pub fn request_immediate_sync(&self, repo_id: RepoId) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        {
            let mut state = self.lock();
            if state.active(repo_id).is_none() {
                return Err(SchedulerError::UnknownRepository { repo_id });
            }
            if state.running.contains(&repo_id) {
                return Err(SchedulerError::AlreadySyncing { repo_id });
            }

            state.schedule.remove(repo_id);
            state.queue.push(QueueEntry {
                repo_id,
                due_at: now,
                trigger: TriggerKind::Manual,
            });
            if let Some(tracked) = state.known.get_mut(&repo_id) {
                tracked.repository.next_due_at = Some(now);
            }
            self.publish_gauges(&state);
        }

        debug!(repo_id = %repo_id, "Immediate sync requested");
        self.wake.notify_one();
        Ok(())
    }

    /// Promote due schedule entries and try to begin a job for the
    /// highest-priority due queue entry.
    pub async fn tick(&self) -> TickOutcome {
        let now = self.clock.now();
        self.metrics.scheduler_loop();

        let (entry, repository) = {
            let mut state = self.lock();

            for (repo_id, due_at) in state.schedule.take_due(now) {
                state.queue.push(QueueEntry {
                    repo_id,
                    due_at,
                    trigger: TriggerKind::Auto,
                });
            }

            let picked = loop {
                let Some(entry) = state.queue.pop_due(now) else {
                    break None;
                };
                // Entries of removed repositories are cancelled eagerly; skip any stragglers.
                if let Some(tracked) = state.active(entry.repo_id) {
                    break Some((entry, tracked.repository.clone()));
                }
            };

            let Some((entry, repository)) = picked else {
                self.publish_gauges(&state);
                return TickOutcome::Idle;
            };

            if state.running.contains(&entry.repo_id) {
                debug!(repo_id = %entry.repo_id, "Repository already syncing; deferring");
                self.defer(&mut state, entry, now);
                return TickOutcome::Deferred {
                    repo_id: entry.repo_id,
                };
            }
            if state.purging.contains(&repository.name) {
                debug!(
                    repo_id = %entry.repo_id,
                    repo = %repository.name,
                    "Storage is being purged; deferring"
                );
                self.defer(&mut state, entry, now);
                return TickOutcome::Deferred {
                    repo_id: entry.repo_id,
                };
            }

            state.running.insert(entry.repo_id);
            self.publish_gauges(&state);
            (entry, repository)
        };

        match self.job_store.begin(entry.repo_id, entry.trigger, now).await {
            Ok(job) => {
                self.metrics.dispatched(entry.trigger);
                info!(
                    job_id = %job.id,
                    repo_id = %repository.id,
                    repo = %repository.name,
                    trigger = entry.trigger.as_str(),
                    attempt = job.attempt,
                    "Dispatching sync job"
                );

                let mut state = self.lock();
                if let Some(tracked) = state.known.get_mut(&entry.repo_id) {
                    tracked.repository.next_due_at = None;
                }

                TickOutcome::Dispatched(Dispatch {
                    job,
                    repo: repository,
                    trigger: entry.trigger,
                })
            }
            Err(JobStoreError::AlreadyRunning { repo_id }) => {
                let violation = SyncError::invariant(format!(
                    "job store already holds an in-flight job for repository {repo_id}"
                ));
                warn!(repo_id = %repo_id, error = %violation, "Rejected duplicate begin; deferring");

                // Nothing of ours is in flight for the repository, so the
                // store's open job lost its outcome.
                self.close_orphaned_job(repo_id, now).await;

                let mut state = self.lock();
                state.running.remove(&entry.repo_id);
                self.defer(&mut state, entry, now);
                TickOutcome::Deferred { repo_id }
            }
            Err(err) => {
                error!(repo_id = %entry.repo_id, error = %err, "Failed to begin sync job; deferring");
                self.metrics.scheduler_error();

                let mut state = self.lock();
                state.running.remove(&entry.repo_id);
                self.defer(&mut state, entry, now);
                TickOutcome::Deferred {
                    repo_id: entry.repo_id,
                }
            }
        }
    }

    /// Mark a dispatched job as running. Store failures are logged only.
    pub async fn start(&self, dispatch: &Dispatch) {
        let now = self.clock.now();
        if let Err(err) = self.job_store.mark_running(dispatch.job.id, now).await {
            warn!(job_id = %dispatch.job.id, error = %err, "Failed to mark sync job running");
            self.metrics.scheduler_error();
        }
    }

    /// Persist a job's outcome and reschedule its repository.
    ///
    /// Returns the repository's next due time, or `None` when it was removed
    /// meanwhile or the dispatch had already been reported.
    #[instrument(skip_all, fields(job_id = %dispatch.job.id, repo_id = %dispatch.repo.id))]
    pub async fn record_outcome(
        &self,
        dispatch: &Dispatch,
        outcome: &JobOutcome,
    ) -> Option<DateTime<Utc>> {
        let repo_id = dispatch.repo.id;
        let now = self.clock.now();

        let persisted = self.persist_outcome(dispatch, outcome, now).await;

        // Only trust the store's count once this outcome is part of it.
        let stored_failures = match outcome {
            JobOutcome::Errored(_) if persisted => {
                match self.job_store.consecutive_failures(repo_id).await {
                    Ok(failures) => Some(failures),
                    Err(err) => {
                        warn!(error = %err, "Failed to read consecutive failures; using in-memory count");
                        None
                    }
                }
            }
            _ => None,
        };

        let mut state = self.lock();
        if !state.running.remove(&repo_id) {
            debug!("Outcome reported for a repository that is not running; ignoring");
            return None;
        }
        let tracked = state.known.get_mut(&repo_id)?;
        let family = tracked.repository.family;

        let delay = match outcome {
            JobOutcome::Completed(summary) => {
                tracked.consecutive_failures = 0;
                tracked.storage_failures = 0;
                tracked.last_error = None;
                tracked.repository.last_synced_at = Some(now);
                tracked.repository.cloneable = true;
                info!(
                    changes = summary.changes,
                    no_op = summary.no_op,
                    "Sync job {} completed",
                    dispatch.job.id
                );
                self.backoff.refresh_delay(&mut rand::thread_rng())
            }
            JobOutcome::Errored(err) => {
                let failures = stored_failures
                    .filter(|failures| *failures > 0)
                    .unwrap_or_else(|| tracked.consecutive_failures.saturating_add(1));
                tracked.consecutive_failures = failures;
                tracked.storage_failures = if err.kind == SyncErrorKind::Storage {
                    tracked.storage_failures.saturating_add(1)
                } else {
                    0
                };
                if err.needs_attention() {
                    tracked.repository.cloneable = false;
                    warn!(
                        error = %err,
                        failures,
                        repo = %tracked.repository.name,
                        "Sync job failed; origin needs attention"
                    );
                } else {
                    warn!(error = %err, failures, "Sync job failed");
                }
                tracked.last_error = Some(err.clone());
                self.backoff.failure_delay(family, failures)
            }
        };

        if tracked.repository.is_removed() {
            tracked.repository.next_due_at = None;
            debug!("Repository was removed while syncing; not rescheduling");
            self.publish_gauges(&state);
            return None;
        }

        // Re-registered while running: the queued entry stands.
        if let Some(queued) = state.queue.get(repo_id).copied() {
            if let Some(tracked) = state.known.get_mut(&repo_id) {
                tracked.repository.next_due_at = Some(queued.due_at);
            }
            self.publish_gauges(&state);
            debug!(next_due = %queued.due_at, "Repository already queued; not rescheduling");
            return Some(queued.due_at);
        }

        let due_at = due_after(now, delay);
        state.schedule.insert(repo_id, due_at);
        if let Some(tracked) = state.known.get_mut(&repo_id) {
            tracked.repository.next_due_at = Some(due_at);
        }
        self.publish_gauges(&state);
        debug!(next_due = %due_at, "Rescheduled repository");
        Some(due_at)
    }

    /// Soft-remove a repository and cancel its pending work. Data is left for
    /// the purge worker. Returns whether the repository was active.
    pub fn deregister(&self, repo_id: RepoId) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();

        let Some(tracked) = state.known.get_mut(&repo_id) else {
            return false;
        };
        if tracked.repository.is_removed() {
            return false;
        }
        tracked.repository.deleted_at = Some(now);
        tracked.repository.next_due_at = None;
        info!(repo_id = %repo_id, repo = %tracked.repository.name, "Deregistered repository");

        state.queue.remove(repo_id);
        state.schedule.remove(repo_id);
        self.publish_gauges(&state);
        true
    }

    /// Hard-remove a soft-removed repository that is not running.
    pub fn forget(&self, repo_id: RepoId) -> bool {
        let mut state = self.lock();
        let removable = state
            .known
            .get(&repo_id)
            .is_some_and(|tracked| tracked.repository.is_removed())
            && !state.running.contains(&repo_id);

        if removable {
            state.known.remove(&repo_id);
            debug!(repo_id = %repo_id, "Forgot removed repository");
        }
        removable
    }

    pub fn status(&self, repo_id: RepoId) -> Option<RepoStatus> {
        let state = self.lock();
        let tracked = state.known.get(&repo_id)?;

        let lifecycle = if tracked.repository.is_removed() {
            RepoLifecycle::Removed
        } else if state.running.contains(&repo_id) {
            RepoLifecycle::Running
        } else if state.queue.get(repo_id).is_some() {
            RepoLifecycle::Queued
        } else {
            RepoLifecycle::Idle
        };

        let next_due = state
            .queue
            .get(repo_id)
            .map(|entry| entry.due_at)
            .or_else(|| state.schedule.due_at(repo_id));

        Some(RepoStatus {
            repository: tracked.repository.clone(),
            state: lifecycle,
            next_due,
            consecutive_failures: tracked.consecutive_failures,
            last_error: tracked.last_error.clone(),
            degraded: tracked.degraded(),
        })
    }

    pub fn purge_snapshot(&self) -> PurgeSnapshot {
        let state = self.lock();
        let mut snapshot = PurgeSnapshot::default();

        for (repo_id, tracked) in &state.known {
            let name = tracked.repository.name.clone();
            if state.running.contains(repo_id) {
                snapshot.running.insert(name.clone());
            }
            if tracked.repository.is_removed() {
                snapshot.removed.push((*repo_id, name));
            } else {
                snapshot.tracked.insert(name);
            }
        }
        snapshot.removed.sort();
        snapshot
    }

    /// Reserve `name` for removal when no active repository owns it and
    /// none running maps to it. While reserved, [`Scheduler::tick`] defers
    /// every repository stored under that name.
    pub fn claim_purge(&self, name: &RepoName) -> bool {
        let mut state = self.lock();
        let owned = state.known.iter().any(|(repo_id, tracked)| {
            tracked.repository.name == *name
                && (!tracked.repository.is_removed() || state.running.contains(repo_id))
        });
        if owned {
            return false;
        }
        state.purging.insert(name.clone())
    }

    pub fn release_purge(&self, name: &RepoName) {
        let released = self.lock().purging.remove(name);
        if released {
            self.wake.notify_one();
        }
    }

    pub fn is_running(&self, repo_id: RepoId) -> bool {
        self.lock().running.contains(&repo_id)
    }

    /// Ids of every repository that is tracked and not removed.
    pub fn active_ids(&self) -> HashSet<RepoId> {
        let state = self.lock();
        state
            .known
            .iter()
            .filter(|(_, tracked)| !tracked.repository.is_removed())
            .map(|(repo_id, _)| *repo_id)
            .collect()
    }

    /// Time until the earliest queued or scheduled entry falls due.
    pub fn until_next_due(&self) -> Option<std::time::Duration> {
        let next = {
            let state = self.lock();
            match (state.queue.next_due(), state.schedule.next_due()) {
                (Some(queued), Some(scheduled)) => Some(queued.min(scheduled)),
                (queued, scheduled) => queued.or(scheduled),
            }
        }?;
        Some(
            (next - self.clock.now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO),
        )
    }

    /// Persist an outcome, retrying transient store failures.
    async fn persist_outcome(
        &self,
        dispatch: &Dispatch,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) -> bool {
        let mut delay = COMPLETE_RETRY_DELAY;
        for attempt in 1..=COMPLETE_ATTEMPTS {
            match self.job_store.complete(dispatch.job.id, outcome, now).await {
                Ok(Completion::Recorded) => return true,
                Ok(Completion::Duplicate) => {
                    warn!("Job store already holds an outcome for this job; ignoring report");
                    return true;
                }
                Err(err) => {
                    self.metrics.scheduler_error();
                    if attempt == COMPLETE_ATTEMPTS {
                        error!(error = %err, attempt, "Failed to persist sync job outcome");
                        break;
                    }
                    warn!(error = %err, attempt, "Failed to persist sync job outcome; retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        false
    }

    /// Fail the job the store still holds open for `repo_id`.
    async fn close_orphaned_job(&self, repo_id: RepoId, now: DateTime<Utc>) {
        let job = match self.job_store.in_flight(repo_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(err) => {
                warn!(repo_id = %repo_id, error = %err, "Failed to look up in-flight job");
                self.metrics.scheduler_error();
                return;
            }
        };

        let outcome = JobOutcome::Errored(SyncError::storage(
            "job was left in flight without a recorded outcome",
        ));
        match self.job_store.complete(job.id, &outcome, now).await {
            Ok(_) => warn!(job_id = %job.id, repo_id = %repo_id, "Closed orphaned sync job"),
            Err(err) => {
                warn!(
                    job_id = %job.id,
                    repo_id = %repo_id,
                    error = %err,
                    "Failed to close orphaned sync job"
                );
                self.metrics.scheduler_error();
            }
        }
    }

    fn defer(&self, state: &mut SchedulerState, entry: QueueEntry, now: DateTime<Utc>) {
        self.metrics.deferred();
        if state.active(entry.repo_id).is_none() || state.queue.get(entry.repo_id).is_some() {
            return;
        }

        let due_at = due_after(now, self.defer_recheck);
        state.queue.push(QueueEntry { due_at, ..entry });
        if let Some(tracked) = state.known.get_mut(&entry.repo_id) {
            tracked.repository.next_due_at = Some(due_at);
        }
        self.publish_gauges(state);
    }

    fn publish_gauges(&self, state: &SchedulerState) {
        self.metrics.set_known_repos(state.active_count());
        self.metrics.set_update_queue_length(state.queue.len());
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn due_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Scheduler")
            .field("known", &state.known.len())
            .field("queued", &state.queue.len())
            .field("scheduled", &state.schedule.len())
            .field("running", &state.running.len())
            .field("purging", &state.purging.len())
            .finish()
    }
}
