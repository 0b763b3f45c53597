//! Pending-write queue and its two ledgers.
//!
//! Three collections live in the local store:
//!
//! - `pendingRequests`: records not yet acknowledged, oldest `created_at` first.
//! - `offlineResponses`: form responses that reached the server, with `pendingSync = false`.
//! - `failedRequests`: records that will never be replayed, kept for audit.
//!
//! Ledgers are written before the pending list. If the process dies between the two writes the
//! record shows up in both places; [`PendingQueue::open`] drops such pending copies, so a record
//! is never replayed after it was resolved or failed.
//!
//! Delivered history shares the storage budget with undelivered work and is the first thing
//! given up when a write does not fit: the oldest `offlineResponses` entries are trimmed before
//! any pending record is evicted.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tally_core::{
    generate_record_id,
    limits::{FAILED_REQUESTS_KEY, OFFLINE_RESPONSES_KEY, PENDING_REQUESTS_KEY},
    PendingRecord, RecordKind,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    events::{EventBus, SyncEvent},
    store::{self, LocalStore, StorageError},
};

#[derive(Debug, Error)]
pub enum QueueError {
    /// The write did not fit even after trimming history and evicting every older pending record.
    #[error("local storage is full: {needed} bytes could not be freed")]
    StorageFull { needed: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// A record with this id is pending or was settled earlier; nothing was written.
    Duplicate,
}

/// Audit entry for a record that will never be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRecord {
    #[serde(flatten)]
    pub record: PendingRecord,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// What a sync pass decided for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    StillPending,
    Resolved,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    pub id: String,
    pub attempts: u32,
    pub disposition: Disposition,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<PendingRecord>,
    resolved: Vec<PendingRecord>,
    failed: Vec<FailedRecord>,
    /// Every id that left `pending`: resolved, failed, evicted, or trimmed from history.
    settled: HashSet<String>,
}

impl QueueState {
    fn contains(&self, id: &str) -> bool {
        self.settled.contains(id) || self.pending.iter().any(|r| r.id == id)
    }
}

pub struct PendingQueue {
    store: Arc<dyn LocalStore>,
    bus: EventBus,
    state: Mutex<QueueState>,
}

impl PendingQueue {
    /// Loads the three collections and reconciles any record caught between two writes.
    pub fn open(store: Arc<dyn LocalStore>, bus: EventBus) -> Result<Self, QueueError> {
        let mut pending: Vec<PendingRecord> =
            store::load(store.as_ref(), PENDING_REQUESTS_KEY)?.unwrap_or_default();
        let resolved: Vec<PendingRecord> =
            store::load(store.as_ref(), OFFLINE_RESPONSES_KEY)?.unwrap_or_default();
        let failed: Vec<FailedRecord> =
            store::load(store.as_ref(), FAILED_REQUESTS_KEY)?.unwrap_or_default();

        let settled: HashSet<String> = resolved
            .iter()
            .map(|r| r.id.clone())
            .chain(failed.iter().map(|f| f.record.id.clone()))
            .collect();

        let before = pending.len();
        pending.retain(|record| !settled.contains(&record.id));
        pending.sort_by_key(|record| record.created_at);
        if pending.len() != before {
            warn!(
                dropped = before - pending.len(),
                "pending records already settled in a ledger; dropping stale copies"
            );
            store::save(store.as_ref(), PENDING_REQUESTS_KEY, &pending)?;
        }

        info!(
            pending = pending.len(),
            resolved = resolved.len(),
            failed = failed.len(),
            "pending queue opened"
        );

        Ok(Self {
            store,
            bus,
            state: Mutex::new(QueueState {
                pending,
                resolved,
                failed,
                settled,
            }),
        })
    }

    /// Adds `record` in creation order.
    ///
    /// On a full store the oldest delivered history is trimmed first, then the oldest pending
    /// records are evicted. If both together cannot free enough, nothing is dropped and the
    /// write is refused with [`QueueError::StorageFull`].
    pub fn enqueue(&self, record: PendingRecord) -> Result<EnqueueOutcome, QueueError> {
        let evicted = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.contains(&record.id) {
                debug!(id = %record.id, "duplicate enqueue ignored");
                return Ok(EnqueueOutcome::Duplicate);
            }

            let mut next = state.pending.clone();
            insert_ordered(&mut next, record.clone());

            match store::save(self.store.as_ref(), PENDING_REQUESTS_KEY, &next) {
                Ok(()) => {
                    state.pending = next;
                    None
                }
                Err(StorageError::QuotaExceeded { needed, .. }) => {
                    self.make_room(state, next, &record.id, needed)?
                }
                Err(err) => return Err(err.into()),
            }
        };

        if let Some(event) = evicted {
            self.bus.publish(event);
        }
        debug!(id = %record.id, kind = ?record.kind(), "record queued");
        Ok(EnqueueOutcome::Queued)
    }

    /// Frees `needed` bytes for `next` and saves it, history first.
    fn make_room(
        &self,
        state: &mut QueueState,
        mut next: Vec<PendingRecord>,
        id: &str,
        needed: u64,
    ) -> Result<Option<SyncEvent>, QueueError> {
        let history_sizes = encoded_sizes(&state.resolved)?;
        let (trim, trimmed_bytes) = plan_front_trim(&history_sizes, needed, false);
        // `next` always keeps the new record, so every victim owns a separator.
        let pending_sizes = encoded_sizes(&state.pending)?;
        let (evict, evicted_bytes) =
            plan_front_trim(&pending_sizes, needed.saturating_sub(trimmed_bytes), true);
        if trimmed_bytes + evicted_bytes < needed {
            warn!(%id, needed, "storage full and neither history nor eviction can free enough");
            return Err(QueueError::StorageFull { needed });
        }

        if trim > 0 {
            self.drop_oldest_history(&mut state.resolved, trim)?;
        }
        let victims: Vec<String> = state.pending[..evict].iter().map(|r| r.id.clone()).collect();
        next.retain(|r| !victims.contains(&r.id));
        match store::save(self.store.as_ref(), PENDING_REQUESTS_KEY, &next) {
            Ok(()) => {}
            Err(StorageError::QuotaExceeded { needed, .. }) => {
                warn!(%id, needed, "storage still full after making room");
                return Err(QueueError::StorageFull { needed });
            }
            Err(err) => return Err(err.into()),
        }
        state.pending = next;

        if victims.is_empty() {
            return Ok(None);
        }
        state.settled.extend(victims.iter().cloned());
        warn!(evicted = ?victims, freed_bytes = evicted_bytes, "evicted oldest pending records");
        Ok(Some(SyncEvent::RecordsEvicted {
            ids: victims,
            freed_bytes: evicted_bytes,
        }))
    }

    /// Oldest first.
    pub fn dequeue_all_pending(&self) -> Vec<PendingRecord> {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|r| r.pending_sync)
            .cloned()
            .collect()
    }

    /// Moves a pending record out of the queue after a successful delivery.
    /// Returns false when no pending record carries `id`.
    ///
    /// The record is settled in memory even when the pending write fails; the error is
    /// still returned and [`PendingQueue::open`] reconciles the stale copy on disk.
    pub fn mark_resolved(&self, id: &str) -> Result<bool, QueueError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(index) = state.pending.iter().position(|r| r.id == id) else {
            return Ok(false);
        };

        let mut pending = state.pending.clone();
        let mut record = pending.remove(index);
        record.pending_sync = false;
        if record.kind() == RecordKind::FormResponse {
            state.resolved.push(record);
            self.persist_history(&mut state.resolved);
        }
        state.settled.insert(id.to_string());
        let saved = self.save_making_room(PENDING_REQUESTS_KEY, &pending, &mut state.resolved);
        state.pending = pending;
        saved?;
        Ok(true)
    }

    /// Moves a pending record to the failed ledger; a record lands there at most once.
    pub fn mark_failed_permanently(&self, id: &str, reason: &str) -> Result<bool, QueueError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(index) = state.pending.iter().position(|r| r.id == id) else {
            return Ok(false);
        };

        let mut pending = state.pending.clone();
        let record = pending.remove(index);
        let mut failed = state.failed.clone();
        failed.push(FailedRecord {
            record,
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });

        self.save_making_room(FAILED_REQUESTS_KEY, &failed, &mut state.resolved)?;
        state.failed = failed;
        state.settled.insert(id.to_string());
        let saved = self.save_making_room(PENDING_REQUESTS_KEY, &pending, &mut state.resolved);
        state.pending = pending;
        warn!(%id, reason, "record failed permanently");
        saved?;
        Ok(true)
    }

    /// Ledger entry for a form response delivered directly, without ever being queued.
    pub fn record_delivered(&self, mut record: PendingRecord) {
        record.pending_sync = false;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.contains(&record.id) {
            return;
        }
        state.settled.insert(record.id.clone());
        state.resolved.push(record);
        self.persist_history(&mut state.resolved);
    }

    /// Evicts the oldest pending records until at least `bytes` are freed.
    ///
    /// Returns false, evicting nothing, when dropping the whole queue would not free enough.
    pub fn remove_oldest_until_bytes_freed(&self, bytes: u64) -> Result<bool, QueueError> {
        let event = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let sizes = encoded_sizes(&state.pending)?;
            let (evict, freed) = plan_front_trim(&sizes, bytes, false);
            if freed < bytes {
                return Ok(false);
            }
            if evict == 0 {
                return Ok(true);
            }
            let next = state.pending[evict..].to_vec();
            store::save(self.store.as_ref(), PENDING_REQUESTS_KEY, &next)?;
            let ids: Vec<String> = state.pending[..evict].iter().map(|r| r.id.clone()).collect();
            state.pending = next;
            state.settled.extend(ids.iter().cloned());

            warn!(evicted = ?ids, freed_bytes = freed, "evicted oldest pending records");
            SyncEvent::RecordsEvicted {
                ids,
                freed_bytes: freed,
            }
        };
        self.bus.publish(event);
        Ok(true)
    }

    /// Applies the results of one sync pass.
    ///
    /// Outcomes are keyed by id against the live queue, so records enqueued while the pass
    /// was running are left as they are; outcomes for records no longer pending are ignored.
    ///
    /// Ledgers are written before the pending list. Records whose failure cannot be written
    /// to the failed ledger stay pending with their new attempt count. In-memory state always
    /// takes the pass, so a failed pending write is returned as an error without losing
    /// attempt counts or resolving anything twice.
    pub fn apply(&self, outcomes: &[PassOutcome]) -> Result<(), QueueError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut pending = Vec::with_capacity(state.pending.len());
        let mut history = state.resolved.clone();
        let mut failed = state.failed.clone();
        let mut settled = Vec::new();
        let now = Utc::now();

        for record in &state.pending {
            let Some(outcome) = outcomes.iter().find(|o| o.id == record.id) else {
                pending.push(record.clone());
                continue;
            };
            let mut record = record.clone();
            record.attempts = record.attempts.max(outcome.attempts);
            match &outcome.disposition {
                Disposition::StillPending => pending.push(record),
                Disposition::Resolved => {
                    record.pending_sync = false;
                    settled.push(record.id.clone());
                    if record.kind() == RecordKind::FormResponse {
                        history.push(record);
                    }
                }
                Disposition::Failed { reason } => failed.push(FailedRecord {
                    record,
                    reason: reason.clone(),
                    failed_at: now,
                }),
            }
        }

        if history.len() != state.resolved.len() {
            self.persist_history(&mut history);
        }
        let mut result: Result<(), QueueError> = Ok(());
        let failed_before = state.failed.len();
        if failed.len() != failed_before {
            match self.save_making_room(FAILED_REQUESTS_KEY, &failed, &mut history) {
                Ok(()) => {
                    settled.extend(failed[failed_before..].iter().map(|f| f.record.id.clone()));
                }
                Err(err) => {
                    error!(error = %err, "failed to persist failed ledger; records stay pending");
                    for entry in failed.drain(failed_before..) {
                        insert_ordered(&mut pending, entry.record);
                    }
                    result = Err(err.into());
                }
            }
        }
        if let Err(err) = self.save_making_room(PENDING_REQUESTS_KEY, &pending, &mut history) {
            error!(error = %err, "failed to persist pending queue after sync pass");
            if result.is_ok() {
                result = Err(err.into());
            }
        }

        state.pending = pending;
        state.resolved = history;
        state.failed = failed;
        state.settled.extend(settled);
        result
    }

    /// A record id with `prefix` that no pending or settled record carries.
    pub fn fresh_id(&self, prefix: &str) -> String {
        let state = self.state.lock();
        loop {
            let id = generate_record_id(prefix);
            if !state.contains(&id) {
                return id;
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn resolved(&self) -> Vec<PendingRecord> {
        self.state.lock().resolved.clone()
    }

    pub fn failed(&self) -> Vec<FailedRecord> {
        self.state.lock().failed.clone()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.state.lock().contains(id)
    }

    pub fn used_bytes(&self) -> u64 {
        self.store.estimate_used_bytes()
    }

    // The resolved ledger is a cache for dashboards; losing a write is logged, not fatal.
    // A full store trims the oldest entries until the ledger fits again.
    fn persist_history(&self, history: &mut Vec<PendingRecord>) {
        let err = match store::save(self.store.as_ref(), OFFLINE_RESPONSES_KEY, history) {
            Ok(()) => return,
            Err(StorageError::QuotaExceeded { needed, .. }) => {
                match self.free_history_bytes(history, needed) {
                    Ok(_) => return,
                    Err(err) => err,
                }
            }
            Err(err) => err,
        };
        warn!(error = %err, "failed to persist resolved responses");
    }

    /// Writes `value` under `key`, trimming delivered history once if the store is full.
    fn save_making_room<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        history: &mut Vec<PendingRecord>,
    ) -> Result<(), StorageError> {
        match store::save(self.store.as_ref(), key, value) {
            Err(StorageError::QuotaExceeded { needed, .. }) if !history.is_empty() => {
                self.free_history_bytes(history, needed)?;
                store::save(self.store.as_ref(), key, value)
            }
            other => other,
        }
    }

    /// Drops the oldest history entries until `needed` bytes are freed, or all of them.
    fn free_history_bytes(
        &self,
        history: &mut Vec<PendingRecord>,
        needed: u64,
    ) -> Result<usize, StorageError> {
        let sizes = encoded_sizes(history)?;
        let (count, _) = plan_front_trim(&sizes, needed, false);
        self.drop_oldest_history(history, count)?;
        Ok(count)
    }

    fn drop_oldest_history(
        &self,
        history: &mut Vec<PendingRecord>,
        count: usize,
    ) -> Result<(), StorageError> {
        let kept = &history[count..];
        store::save(self.store.as_ref(), OFFLINE_RESPONSES_KEY, &kept)?;
        history.drain(..count);
        info!(dropped = count, kept = history.len(), "trimmed oldest delivered responses");
        Ok(())
    }
}

fn insert_ordered(pending: &mut Vec<PendingRecord>, record: PendingRecord) {
    let at = pending.partition_point(|r| r.created_at <= record.created_at);
    pending.insert(at, record);
}

fn encoded_sizes(records: &[PendingRecord]) -> Result<Vec<u64>, StorageError> {
    records
        .iter()
        .map(|record| Ok(record.encoded_len()? as u64))
        .collect()
}

/// How many leading elements of a serialized array to drop to free at least `needed` bytes,
/// and how many bytes that frees. Stops at the whole array when that is not enough.
///
/// Each dropped element also frees its separator, except the last one left in an array that
/// ends up empty; `keeps_others` says the array holds elements outside `sizes`.
fn plan_front_trim(sizes: &[u64], needed: u64, keeps_others: bool) -> (usize, u64) {
    let mut count = 0;
    let mut freed = 0u64;
    for size in sizes {
        if freed >= needed {
            break;
        }
        count += 1;
        freed += size + u64::from(keeps_others || count < sizes.len());
    }
    (count, freed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::EventKind, store::MemoryStore};
    use chrono::Duration;
    use serde_json::Value;
    use std::{
        io,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use tally_core::{ConnectionEvent, FormData, FormResponse, RecordPayload};

    fn response(id: &str, at: DateTime<Utc>) -> PendingRecord {
        let form = FormData::new("B1").with_answer("attentes", "Très satisfait");
        let payload = RecordPayload::FormResponse(FormResponse::stamp(id.to_string(), form, at));
        PendingRecord::new(id.to_string(), payload, at)
    }

    fn open(capacity: u64) -> (Arc<MemoryStore>, PendingQueue) {
        let store = Arc::new(MemoryStore::new(capacity));
        let queue = PendingQueue::open(store.clone(), EventBus::new()).unwrap();
        (store, queue)
    }

    #[test]
    fn enqueue_is_idempotent_on_id() {
        let (_, queue) = open(64 * 1024);
        let now = Utc::now();
        assert_eq!(queue.enqueue(response("r1", now)).unwrap(), EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue(response("r1", now)).unwrap(), EnqueueOutcome::Duplicate);
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn pending_is_returned_oldest_first() {
        let (_, queue) = open(64 * 1024);
        let now = Utc::now();
        queue.enqueue(response("late", now)).unwrap();
        queue.enqueue(response("early", now - Duration::seconds(10))).unwrap();
        queue.enqueue(response("mid", now - Duration::seconds(5))).unwrap();

        let ids: Vec<String> = queue.dequeue_all_pending().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["early", "mid", "late"]);
    }

    #[test]
    fn resolved_ids_are_never_reused() {
        let (_, queue) = open(64 * 1024);
        let now = Utc::now();
        queue.enqueue(response("r1", now)).unwrap();
        assert!(queue.mark_resolved("r1").unwrap());
        assert!(!queue.mark_resolved("r1").unwrap());

        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.enqueue(response("r1", now)).unwrap(), EnqueueOutcome::Duplicate);
        let resolved = queue.resolved();
        assert_eq!(resolved.len(), 1);
        assert!(!resolved[0].pending_sync);
    }

    #[test]
    fn resolved_connection_events_leave_no_ledger_entry() {
        let (_, queue) = open(64 * 1024);
        let payload = RecordPayload::ConnectionEvent(ConnectionEvent::register("s1", None));
        queue
            .enqueue(PendingRecord::new("conn-1".into(), payload, Utc::now()))
            .unwrap();
        assert!(queue.mark_resolved("conn-1").unwrap());
        assert!(queue.resolved().is_empty());
    }

    #[test]
    fn failed_records_land_in_ledger_once() {
        let (_, queue) = open(64 * 1024);
        queue.enqueue(response("bad", Utc::now())).unwrap();
        assert!(queue.mark_failed_permanently("bad", "malformed").unwrap());
        assert!(!queue.mark_failed_permanently("bad", "malformed").unwrap());

        let failed = queue.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason, "malformed");
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn state_survives_reopen_and_reconciles_stale_pending() {
        let store = Arc::new(MemoryStore::new(64 * 1024));
        let now = Utc::now();
        {
            let queue = PendingQueue::open(store.clone(), EventBus::new()).unwrap();
            queue.enqueue(response("a", now)).unwrap();
            queue.enqueue(response("b", now + Duration::seconds(1))).unwrap();
            queue.mark_resolved("a").unwrap();
        }

        // Simulate a crash after the ledger write but before the pending write.
        let mut stale = response("a", now);
        stale.attempts = 1;
        let pending: Vec<PendingRecord> = vec![stale, response("b", now + Duration::seconds(1))];
        store::save(store.as_ref(), PENDING_REQUESTS_KEY, &pending).unwrap();

        let queue = PendingQueue::open(store.clone(), EventBus::new()).unwrap();
        let ids: Vec<String> = queue.dequeue_all_pending().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b"]);
        assert_eq!(queue.resolved().len(), 1);
    }

    #[test]
    fn eviction_drops_oldest_first_and_publishes() {
        let now = Utc::now();
        let one = response("r0", now).encoded_len().unwrap() as u64;
        // Room for roughly three records plus key and brackets.
        let capacity = PENDING_REQUESTS_KEY.len() as u64 + 2 + 3 * (one + 1);
        let store = Arc::new(MemoryStore::new(capacity));
        let bus = EventBus::new();
        let evicted_events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evicted_events);
        let _sub = bus.subscribe(EventKind::RecordsEvicted, move |event| {
            if let SyncEvent::RecordsEvicted { ids, .. } = event {
                assert_eq!(ids, &vec!["r0".to_string()]);
            }
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let queue = PendingQueue::open(store, bus).unwrap();

        for i in 0..3 {
            let record = response(&format!("r{i}"), now + Duration::seconds(i));
            assert_eq!(queue.enqueue(record).unwrap(), EnqueueOutcome::Queued);
        }
        queue
            .enqueue(response("r3", now + Duration::seconds(3)))
            .unwrap();

        let ids: Vec<String> = queue.dequeue_all_pending().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
        assert_eq!(evicted_events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn oversized_write_is_refused_without_evicting() {
        let now = Utc::now();
        let one = response("small", now).encoded_len().unwrap() as u64;
        let capacity = PENDING_REQUESTS_KEY.len() as u64 + 2 + one + 8;
        let (_, queue) = open(capacity);
        queue.enqueue(response("small", now)).unwrap();

        let mut form = FormData::new("B1");
        form = form.with_answer("commentaire", "x".repeat(4 * capacity as usize));
        let payload = RecordPayload::FormResponse(FormResponse::stamp("huge".into(), form, now));
        let huge = PendingRecord::new("huge".into(), payload, now + Duration::seconds(1));

        assert!(matches!(
            queue.enqueue(huge),
            Err(QueueError::StorageFull { .. })
        ));
        assert_eq!(queue.pending_len(), 1);
        assert!(!queue.remove_oldest_until_bytes_freed(capacity * 10).unwrap());
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn remove_oldest_frees_requested_budget() {
        let (_, queue) = open(64 * 1024);
        let now = Utc::now();
        for i in 0..4 {
            queue
                .enqueue(response(&format!("r{i}"), now + Duration::seconds(i)))
                .unwrap();
        }
        let one = response("r0", now).encoded_len().unwrap() as u64;
        assert!(queue.remove_oldest_until_bytes_freed(one + 2).unwrap());
        let ids: Vec<String> = queue.dequeue_all_pending().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r2", "r3"]);
        assert_eq!(queue.enqueue(response("r0", now)).unwrap(), EnqueueOutcome::Duplicate);
    }

    #[test]
    fn apply_leaves_records_enqueued_mid_pass_untouched() {
        let (_, queue) = open(64 * 1024);
        let now = Utc::now();
        queue.enqueue(response("ok", now)).unwrap();
        queue.enqueue(response("retry", now + Duration::seconds(1))).unwrap();
        queue.enqueue(response("bad", now + Duration::seconds(2))).unwrap();

        let _snapshot = queue.dequeue_all_pending();
        queue.enqueue(response("fresh", now + Duration::seconds(3))).unwrap();

        queue
            .apply(&[
                PassOutcome {
                    id: "ok".into(),
                    attempts: 1,
                    disposition: Disposition::Resolved,
                },
                PassOutcome {
                    id: "retry".into(),
                    attempts: 1,
                    disposition: Disposition::StillPending,
                },
                PassOutcome {
                    id: "bad".into(),
                    attempts: 1,
                    disposition: Disposition::Failed {
                        reason: "malformed".into(),
                    },
                },
            ])
            .unwrap();

        let pending = queue.dequeue_all_pending();
        let summary: Vec<(String, u32)> =
            pending.into_iter().map(|r| (r.id, r.attempts)).collect();
        assert_eq!(
            summary,
            vec![("retry".to_string(), 1), ("fresh".to_string(), 0)]
        );
        assert_eq!(queue.resolved().len(), 1);
        assert_eq!(queue.failed().len(), 1);
    }

    /// Refuses writes to one key; everything else goes to memory.
    struct FlakyStore {
        inner: MemoryStore,
        fail_key: Mutex<Option<&'static str>>,
    }

    impl FlakyStore {
        fn new(capacity: u64) -> Self {
            Self {
                inner: MemoryStore::new(capacity),
                fail_key: Mutex::new(None),
            }
        }

        fn fail_writes_to(&self, key: Option<&'static str>) {
            *self.fail_key.lock() = key;
        }
    }

    impl LocalStore for FlakyStore {
        fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
            if *self.fail_key.lock() == Some(key) {
                return Err(StorageError::Backend(io::Error::new(
                    io::ErrorKind::Other,
                    "disk unavailable",
                )));
            }
            self.inner.put(key, value)
        }

        fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
            self.inner.get(key)
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key)
        }

        fn estimate_used_bytes(&self) -> u64 {
            self.inner.estimate_used_bytes()
        }

        fn capacity(&self) -> u64 {
            self.inner.capacity()
        }
    }

    fn outcome(id: &str, attempts: u32, disposition: Disposition) -> PassOutcome {
        PassOutcome {
            id: id.into(),
            attempts,
            disposition,
        }
    }

    #[test]
    fn delivered_history_gives_way_to_offline_writes() {
        let store = Arc::new(MemoryStore::new(16 * 1024));
        let queue = PendingQueue::open(store.clone(), EventBus::new()).unwrap();
        let now = Utc::now();
        for i in 0..200 {
            queue.record_delivered(response(&format!("d{i}"), now + Duration::seconds(i)));
        }

        assert!(queue.used_bytes() <= store.capacity());
        let history = queue.resolved();
        assert!(history.len() < 200);
        assert_eq!(history.last().map(|r| r.id.as_str()), Some("d199"));
        let on_disk: Vec<PendingRecord> =
            store::load(store.as_ref(), OFFLINE_RESPONSES_KEY).unwrap().unwrap();
        assert_eq!(on_disk, history);

        for id in ["a", "b"] {
            let record = response(id, now + Duration::seconds(300));
            assert_eq!(queue.enqueue(record).unwrap(), EnqueueOutcome::Queued);
        }
        let ids: Vec<String> = queue.dequeue_all_pending().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(queue.resolved().len() < history.len());
        assert_eq!(queue.enqueue(response("d0", now)).unwrap(), EnqueueOutcome::Duplicate);
    }

    #[test]
    fn resolved_connection_ids_are_never_requeued() {
        let (_, queue) = open(64 * 1024);
        let record = || {
            let payload = RecordPayload::ConnectionEvent(ConnectionEvent::register("s1", None));
            PendingRecord::new("conn-1".into(), payload, Utc::now())
        };
        queue.enqueue(record()).unwrap();
        assert!(queue.mark_resolved("conn-1").unwrap());

        assert!(queue.contains_id("conn-1"));
        assert_eq!(queue.enqueue(record()).unwrap(), EnqueueOutcome::Duplicate);
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn fresh_id_is_unused() {
        let (_, queue) = open(64 * 1024);
        let id = queue.fresh_id("connection");
        assert!(id.starts_with("connection-"));
        assert!(!queue.contains_id(&id));

        queue.enqueue(response(&id, Utc::now())).unwrap();
        assert_ne!(queue.fresh_id("connection"), id);
    }

    #[test]
    fn apply_keeps_pass_results_when_pending_write_fails() {
        let store = Arc::new(FlakyStore::new(64 * 1024));
        let queue = PendingQueue::open(store.clone(), EventBus::new()).unwrap();
        let now = Utc::now();
        queue.enqueue(response("ok", now)).unwrap();
        queue.enqueue(response("retry", now + Duration::seconds(1))).unwrap();

        store.fail_writes_to(Some(PENDING_REQUESTS_KEY));
        let outcomes = [
            outcome("ok", 1, Disposition::Resolved),
            outcome("retry", 1, Disposition::StillPending),
        ];
        assert!(queue.apply(&outcomes).is_err());

        let summary: Vec<(String, u32)> = queue
            .dequeue_all_pending()
            .into_iter()
            .map(|r| (r.id, r.attempts))
            .collect();
        assert_eq!(summary, vec![("retry".to_string(), 1)]);
        assert_eq!(queue.resolved().len(), 1);

        // A repeat of the same pass must not resolve "ok" a second time.
        assert!(queue.apply(&outcomes).is_err());
        assert_eq!(queue.resolved().len(), 1);

        store.fail_writes_to(None);
        drop(queue);
        let queue = PendingQueue::open(store, EventBus::new()).unwrap();
        let ids: Vec<String> = queue.dequeue_all_pending().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["retry"]);
        assert_eq!(queue.resolved().len(), 1);
    }

    #[test]
    fn apply_keeps_failures_pending_when_ledger_write_fails() {
        let store = Arc::new(FlakyStore::new(64 * 1024));
        let queue = PendingQueue::open(store.clone(), EventBus::new()).unwrap();
        let now = Utc::now();
        queue.enqueue(response("ok", now)).unwrap();
        queue.enqueue(response("bad", now + Duration::seconds(1))).unwrap();

        store.fail_writes_to(Some(FAILED_REQUESTS_KEY));
        let exhausted = || Disposition::Failed {
            reason: "exceeded 5 delivery attempts".into(),
        };
        let result = queue.apply(&[
            outcome("ok", 1, Disposition::Resolved),
            outcome("bad", 6, exhausted()),
        ]);
        assert!(result.is_err());

        let pending = queue.dequeue_all_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!((pending[0].id.as_str(), pending[0].attempts), ("bad", 6));
        assert!(queue.failed().is_empty());
        assert_eq!(queue.resolved().len(), 1);
        assert!(queue.contains_id("ok"));

        store.fail_writes_to(None);
        queue.apply(&[outcome("bad", 6, exhausted())]).unwrap();
        queue.apply(&[outcome("bad", 6, exhausted())]).unwrap();
        assert_eq!(queue.failed().len(), 1);
        assert_eq!(queue.pending_len(), 0);
    }
}
