//! Member Registry
//!
//! Tracks every backend known to the cluster, its lifecycle status and
//! the writes it still has to apply.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::action::{ActionId, WriteAction};
use crate::backend::{BackendId, BackendRef};
use crate::error::{Error, Result};

/// Member status in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Added, data consistency with the cluster unknown
    Unsynchronised,
    /// Synchronization is running against the member
    Processing,
    /// Consistent; serves reads and receives writes
    Ready,
    /// Excluded after a runtime failure, awaiting reconnection
    Ejected,
    /// Administratively paused
    Paused,
    /// Administratively retired
    Dead,
    /// Not a member
    Unknown,
}

impl MemberStatus {
    /// Whether background reconnection and plain adds may synchronize this member
    pub fn is_synchronizable(&self) -> bool {
        matches!(self, MemberStatus::Unsynchronised | MemberStatus::Ejected)
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Unsynchronised => write!(f, "UNSYNCHRONISED"),
            MemberStatus::Processing => write!(f, "PROCESSING"),
            MemberStatus::Ready => write!(f, "READY"),
            MemberStatus::Ejected => write!(f, "EJECTED"),
            MemberStatus::Paused => write!(f, "PAUSED"),
            MemberStatus::Dead => write!(f, "DEAD"),
            MemberStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Outcome of the individual first run of a write action
#[derive(Debug, Clone)]
pub(crate) enum FirstRun {
    Pending,
    Applied(WriteAction),
    Abandoned,
}

/// A write waiting to be applied to one member
#[derive(Debug, Clone)]
pub(crate) struct QueuedWrite {
    /// Cluster-wide enqueue order
    seq: u64,
    action: WriteAction,
    /// Set when the action must first run on one member; replays wait for it
    first_run: Option<watch::Receiver<FirstRun>>,
}

impl QueuedWrite {
    pub(crate) fn new(
        seq: u64,
        action: WriteAction,
        first_run: Option<watch::Receiver<FirstRun>>,
    ) -> Self {
        Self {
            seq,
            action,
            first_run,
        }
    }

    pub(crate) fn id(&self) -> ActionId {
        self.action.id()
    }

    /// Whether rows copied from a member that applied this write already
    /// carry its effect: every mutation is DML on one of `copied`
    fn covered_by(&self, copied: &HashSet<String>) -> bool {
        self.action.mutations().iter().all(|m| {
            !m.is_ddl()
                && m
                    .table_name()
                    .is_some_and(|t| copied.contains(&t.to_lowercase()))
        })
    }

    /// The action to replay, once known. `None` means the write was abandoned.
    pub(crate) async fn replay(&self) -> Option<WriteAction> {
        let Some(rx) = &self.first_run else {
            return Some(self.action.clone());
        };

        let mut rx = rx.clone();
        let outcome = match rx.wait_for(|r| !matches!(r, FirstRun::Pending)).await {
            Ok(outcome) => outcome.clone(),
            // First run dropped before reporting
            Err(_) => FirstRun::Abandoned,
        };
        match outcome {
            FirstRun::Applied(resolved) => Some(resolved),
            FirstRun::Pending | FirstRun::Abandoned => None,
        }
    }
}

/// One backend plus its cluster-managed status and write queue
pub(crate) struct Member {
    backend: BackendRef,
    status: watch::Sender<MemberStatus>,
    queue: Mutex<VecDeque<QueuedWrite>>,
    /// Serializes every operation against the backend
    gate: tokio::sync::Mutex<()>,
    /// Writes with a lower sequence were queued before the member joined
    joined_seq: u64,
    added_at: chrono::DateTime<chrono::Utc>,
}

impl Member {
    fn new(backend: BackendRef, joined_seq: u64) -> Self {
        let (status, _) = watch::channel(MemberStatus::Unsynchronised);
        Self {
            backend,
            status,
            queue: Mutex::new(VecDeque::new()),
            gate: tokio::sync::Mutex::new(()),
            joined_seq,
            added_at: chrono::Utc::now(),
        }
    }

    pub(crate) fn id(&self) -> &BackendId {
        self.backend.id()
    }

    pub(crate) fn backend(&self) -> &BackendRef {
        &self.backend
    }

    /// Exclusive access to the backend
    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Exclusive access to the backend while the member is READY.
    ///
    /// Gives up as soon as the member leaves READY, so routing never waits
    /// behind a synchronization of this member.
    pub(crate) async fn lock_ready(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        let mut rx = self.status.subscribe();
        let left_ready = async move {
            let _ = rx.wait_for(|s| *s != MemberStatus::Ready).await;
        };
        let guard = tokio::select! {
            guard = self.gate.lock() => guard,
            _ = left_ready => return None,
        };
        (self.status() == MemberStatus::Ready).then_some(guard)
    }

    pub(crate) fn status(&self) -> MemberStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: MemberStatus) -> MemberStatus {
        self.status.send_replace(status)
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<QueuedWrite>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue().len()
    }

    fn enqueue(&self, write: QueuedWrite) {
        self.queue().push_back(write);
    }

    pub(crate) fn is_queued(&self, id: ActionId) -> bool {
        self.queue().iter().any(|q| q.id() == id)
    }

    /// Remove an applied write from the queue
    pub(crate) fn dequeue(&self, id: ActionId) -> bool {
        let mut queue = self.queue();
        match queue.iter().position(|q| q.id() == id) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Oldest write still to apply
    pub(crate) fn front(&self) -> Option<QueuedWrite> {
        self.queue().front().cloned()
    }

    fn queue_snapshot(&self) -> VecDeque<QueuedWrite> {
        self.queue().clone()
    }

    pub(crate) fn added_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.added_at
    }
}

/// Status counts across the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub total_members: usize,
    pub ready: usize,
    pub processing: usize,
    pub unsynchronised: usize,
    pub ejected: usize,
    pub paused: usize,
    pub dead: usize,
}

/// Registry of cluster members
pub(crate) struct MemberRegistry {
    members: RwLock<HashMap<BackendId, Arc<Member>>>,
    next_seq: AtomicU64,
}

impl MemberRegistry {
    pub(crate) fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Add a backend; returns false if a member with the same identity exists
    pub(crate) async fn add(&self, backend: BackendRef) -> bool {
        let mut members = self.members.write().await;
        let id = backend.id().clone();
        if members.contains_key(&id) {
            return false;
        }
        // Enqueues hold the read lock, so none races this snapshot
        let joined_seq = self.next_seq.load(Ordering::SeqCst);
        members.insert(id.clone(), Arc::new(Member::new(backend, joined_seq)));
        tracing::info!("Member {} added ({} members)", id, members.len());
        true
    }

    /// Remove a member, refusing to empty the cluster
    pub(crate) async fn remove(&self, id: &BackendId) -> Result<BackendRef> {
        let mut members = self.members.write().await;
        if !members.contains_key(id) {
            return Err(Error::MemberNotFound(id.to_string()));
        }
        if members.len() == 1 {
            return Err(Error::CannotRemoveLastMember);
        }
        let member = members
            .remove(id)
            .ok_or_else(|| Error::MemberNotFound(id.to_string()))?;
        tracing::info!("Member {} removed ({} members)", id, members.len());
        Ok(Arc::clone(&member.backend))
    }

    pub(crate) async fn get(&self, id: &BackendId) -> Option<Arc<Member>> {
        self.members.read().await.get(id).cloned()
    }

    pub(crate) async fn member(&self, id: &BackendId) -> Result<Arc<Member>> {
        self.get(id)
            .await
            .ok_or_else(|| Error::MemberNotFound(id.to_string()))
    }

    /// Force a member out of routing after a runtime failure.
    ///
    /// Refuses to eject the last ready member; returns whether the status changed.
    pub(crate) async fn eject(&self, id: &BackendId) -> Result<bool> {
        self.set_unavailable(id, MemberStatus::Ejected).await
    }

    /// Administrative pause
    pub(crate) async fn pause(&self, id: &BackendId) -> Result<bool> {
        self.set_unavailable(id, MemberStatus::Paused).await
    }

    /// Administrative retirement
    pub(crate) async fn retire(&self, id: &BackendId) -> Result<bool> {
        self.set_unavailable(id, MemberStatus::Dead).await
    }

    async fn set_unavailable(&self, id: &BackendId, target: MemberStatus) -> Result<bool> {
        // Write lock: the last-ready check and the transition must not interleave
        let members = self.members.write().await;
        let member = members
            .get(id)
            .ok_or_else(|| Error::MemberNotFound(id.to_string()))?;

        let status = member.status();
        if status == target {
            return Ok(false);
        }
        if target == MemberStatus::Ejected
            && matches!(status, MemberStatus::Paused | MemberStatus::Dead)
        {
            return Ok(false);
        }
        if status == MemberStatus::Ready {
            let ready = members
                .values()
                .filter(|m| m.status() == MemberStatus::Ready)
                .count();
            if ready <= 1 {
                return Err(Error::CannotRemoveLastMember);
            }
        }

        member.set_status(target);
        if target == MemberStatus::Dead {
            // Never drained again; re-adding the backend recopies its data
            member.queue().clear();
        }
        match target {
            MemberStatus::Ejected => tracing::warn!("Member {} ejected (was {})", id, status),
            _ => tracing::info!("Member {} is now {} (was {})", id, target, status),
        }
        Ok(true)
    }

    /// Return a paused member to the synchronizable pool
    pub(crate) async fn resume(&self, id: &BackendId) -> Result<bool> {
        let member = self.member(id).await?;
        let resumed = member.status.send_if_modified(|status| {
            if *status != MemberStatus::Paused {
                return false;
            }
            *status = MemberStatus::Unsynchronised;
            true
        });
        if resumed {
            tracing::info!("Member {} resumed", id);
        }
        Ok(resumed)
    }

    async fn with_status(&self, status: MemberStatus) -> Vec<Arc<Member>> {
        self.members
            .read()
            .await
            .values()
            .filter(|m| m.status() == status)
            .cloned()
            .collect()
    }

    /// Snapshot of members with status READY
    pub(crate) async fn ready_members(&self) -> Vec<Arc<Member>> {
        self.with_status(MemberStatus::Ready).await
    }

    pub(crate) async fn ready_count(&self) -> usize {
        self.ready_members().await.len()
    }

    pub(crate) async fn unsynchronised_members(&self) -> Vec<Arc<Member>> {
        self.with_status(MemberStatus::Unsynchronised).await
    }

    pub(crate) async fn ejected_members(&self) -> Vec<Arc<Member>> {
        self.with_status(MemberStatus::Ejected).await
    }

    pub(crate) async fn all_members(&self) -> Vec<Arc<Member>> {
        let mut all: Vec<Arc<Member>> = self.members.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.added_at().cmp(&b.added_at()).then_with(|| a.id().cmp(b.id())));
        all
    }

    pub(crate) async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    /// Uniform random choice among ready members
    pub(crate) async fn pick_random_ready(&self) -> Result<Arc<Member>> {
        let ready = self.ready_members().await;
        ready
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(Error::NoAvailableBackend)
    }

    /// A ready member other than `exclude`, to synchronize from
    pub(crate) async fn template_member(&self, exclude: &BackendId) -> Result<Arc<Member>> {
        let ready: Vec<Arc<Member>> = self
            .ready_members()
            .await
            .into_iter()
            .filter(|m| m.id() != exclude)
            .collect();
        ready
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(Error::NoAvailableBackend)
    }

    /// Queue a write on every member that may still apply it, that is
    /// every member not retired
    pub(crate) async fn enqueue_write(
        &self,
        action: &WriteAction,
        first_run: Option<watch::Receiver<FirstRun>>,
    ) -> usize {
        let members = self.members.read().await;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut queued = 0;
        for member in members.values().filter(|m| m.status() != MemberStatus::Dead) {
            member.enqueue(QueuedWrite::new(seq, action.clone(), first_run.clone()));
            queued += 1;
        }
        tracing::trace!("Queued action {} on {} members", action.id(), queued);
        queued
    }

    /// Drop a write no member applied from every queue
    pub(crate) async fn discard(&self, id: ActionId) -> usize {
        let members = self.members.read().await;
        members.values().filter(|m| m.dequeue(id)).count()
    }

    /// Move a member to PROCESSING; returns its previous status, or `None`
    /// if it is not in a state that may be synchronized
    pub(crate) async fn mark_processing(&self, id: &BackendId) -> Result<Option<MemberStatus>> {
        let members = self.members.write().await;
        let member = self.member_unlocked(&members, id)?;
        let previous = member.status();
        if !previous.is_synchronizable() {
            return Ok(None);
        }
        member.set_status(MemberStatus::Processing);
        Ok(Some(previous))
    }

    /// Mark a member READY, only if its queue has been fully drained.
    ///
    /// Checked under the registry write lock so no write can be queued
    /// between the emptiness check and the transition.
    pub(crate) async fn mark_ready(&self, id: &BackendId) -> Result<bool> {
        let members = self.members.write().await;
        let member = self.member_unlocked(&members, id)?;
        if member.queue_len() > 0 {
            return Ok(false);
        }
        member.set_status(MemberStatus::Ready);
        Ok(true)
    }

    /// Return a member to a non-routable status after a failed synchronization
    pub(crate) async fn mark_failed(&self, id: &BackendId, status: MemberStatus) -> Result<()> {
        let member = self.member(id).await?;
        member.status.send_if_modified(|current| {
            if *current != MemberStatus::Processing {
                return false;
            }
            *current = status;
            true
        });
        Ok(())
    }

    /// Rebuild a synchronizing member's queue after the tables in `copied`
    /// were replaced with its template's rows.
    ///
    /// Writes still pending on the template stay queued, and those queued
    /// before the member joined are taken over. A write the template
    /// already applied is dropped only when the copied rows carry it;
    /// every other write is kept for replay. The result is in enqueue
    /// order. Returns how many entries were dropped.
    ///
    /// Must be called while holding the template's backend lock.
    pub(crate) async fn adopt_pending(
        &self,
        target: &Member,
        template: &Member,
        copied: &HashSet<String>,
    ) -> usize {
        let _members = self.members.write().await;
        let pending = template.queue_snapshot();
        let pending_ids: HashSet<ActionId> = pending.iter().map(QueuedWrite::id).collect();

        let mut queue = target.queue();
        let before = queue.len();
        let mut rebuilt: Vec<QueuedWrite> = queue
            .drain(..)
            .filter(|q| pending_ids.contains(&q.id()) || !q.covered_by(copied))
            .collect();
        let dropped = before - rebuilt.len();

        rebuilt.extend(pending.into_iter().filter(|p| p.seq < target.joined_seq));
        rebuilt.sort_by_key(|q| q.seq);
        queue.extend(rebuilt);
        dropped
    }

    pub(crate) async fn summary(&self) -> ClusterSummary {
        let members = self.members.read().await;
        let mut summary = ClusterSummary {
            total_members: members.len(),
            ..Default::default()
        };
        for member in members.values() {
            match member.status() {
                MemberStatus::Ready => summary.ready += 1,
                MemberStatus::Processing => summary.processing += 1,
                MemberStatus::Unsynchronised => summary.unsynchronised += 1,
                MemberStatus::Ejected => summary.ejected += 1,
                MemberStatus::Paused => summary.paused += 1,
                MemberStatus::Dead => summary.dead += 1,
                MemberStatus::Unknown => {}
            }
        }
        summary
    }

    fn member_unlocked(
        &self,
        members: &HashMap<BackendId, Arc<Member>>,
        id: &BackendId,
    ) -> Result<Arc<Member>> {
        members
            .get(id)
            .cloned()
            .ok_or_else(|| Error::MemberNotFound(id.to_string()))
    }
}
