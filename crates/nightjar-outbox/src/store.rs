//! Disk-backed implementation of the outbox.
//!
//! One JSON file per record, named after the (sanitized) message id,
//! written via tmp-then-rename.  A lock file makes the directory
//! single-writer: only one process may mutate outbound state.  The
//! in-memory index is the read path; the files are the durability path.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use fs_mistrust::{CheckedDir, Mistrust};
use nightjar_envelope::MessageId;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::backoff::backoff_ms;
use crate::record::{OutboxRecord, Priority, RecordStatus};

/// Name of the exclusive-writer lock file.
const LOCK_FILE: &str = "outbox.lock";

/// An error from the outbox store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Could not create or verify the outbox directory.
    #[error("filesystem problem with the outbox directory")]
    Fs(#[from] fs_mistrust::Error),

    /// Plain I/O failure on a record file.
    #[error("I/O problem on an outbox record")]
    Io(#[from] std::io::Error),

    /// Another process holds the outbox lock.
    #[error("outbox is locked by another process")]
    AlreadyLocked,

    /// A record would not serialize.
    #[error("could not encode outbox record")]
    Encode(#[from] serde_json::Error),

    /// A record id is unknown.
    #[error("no such outbox record: {0}")]
    NoSuchRecord(MessageId),
}

/// The durable outbound queue.
///
/// Owns all outbound records exclusively; the router and the scheduler
/// only reach records through this interface, which is what makes the
/// "at most one in-flight per message id" invariant enforceable: the
/// claim step is atomic under the store's one mutex.
pub struct OutboxStore {
    /// The record directory.
    dir: CheckedDir,
    /// Held for the store's lifetime; guards cross-process exclusivity.
    #[allow(dead_code)]
    lockfile: Mutex<fslock::LockFile>,
    /// In-memory index of all live records.
    records: Mutex<BTreeMap<MessageId, OutboxRecord>>,
}

impl OutboxStore {
    /// Open the outbox under `dir`, taking the writer lock.
    ///
    /// Records left `in_flight` by a previous process revert to
    /// `pending`: after a crash, nothing is in flight by definition.
    pub fn open(dir: &Path, mistrust: &Mistrust) -> Result<Self, StoreError> {
        let dir = mistrust.verifier().make_secure_dir(dir)?;

        let lockpath = dir.join(LOCK_FILE)?;
        let mut lockfile = fslock::LockFile::open(&lockpath).map_err(std::io::Error::other)?;
        if !lockfile.try_lock().map_err(std::io::Error::other)? {
            return Err(StoreError::AlreadyLocked);
        }

        let mut records = BTreeMap::new();
        for entry in std::fs::read_dir(dir.as_path())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = match std::fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    warn!("skipping unreadable outbox record {:?}: {}", path, e);
                    continue;
                }
            };
            let mut record: OutboxRecord = match serde_json::from_str(&text) {
                Ok(r) => r,
                Err(e) => {
                    warn!("skipping corrupt outbox record {:?}: {}", path, e);
                    continue;
                }
            };
            if record.status == RecordStatus::InFlight {
                record.status = RecordStatus::Pending;
                record.in_flight_at_ms = None;
                record.ack_deadline_ms = None;
            }
            records.insert(record.message_id.clone(), record);
        }
        if !records.is_empty() {
            info!("outbox loaded {} pending record(s)", records.len());
        }

        Ok(OutboxStore {
            dir,
            lockfile: Mutex::new(lockfile),
            records: Mutex::new(records),
        })
    }

    /// Relative file name for a record.
    fn rel_filename(id: &MessageId) -> String {
        sanitize_filename::sanitize(id.as_str()) + ".json"
    }

    /// Persist one record to its file.
    fn persist(&self, record: &OutboxRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(record)?;
        self.dir
            .write_and_replace(Self::rel_filename(&record.message_id), json)?;
        Ok(())
    }

    /// Remove a record's file.
    fn unlink(&self, id: &MessageId) -> Result<(), StoreError> {
        let path = self.dir.join(Self::rel_filename(id))?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert (or overwrite) a record.
    pub fn put(&self, record: OutboxRecord) -> Result<(), StoreError> {
        self.persist(&record)?;
        self.records
            .lock()
            .expect("poisoned outbox lock")
            .insert(record.message_id.clone(), record);
        Ok(())
    }

    /// Delete a record outright.
    pub fn delete(&self, id: &MessageId) -> Result<bool, StoreError> {
        let removed = self
            .records
            .lock()
            .expect("poisoned outbox lock")
            .remove(id)
            .is_some();
        if removed {
            self.unlink(id)?;
        }
        Ok(removed)
    }

    /// Look up a record by id.
    pub fn get(&self, id: &MessageId) -> Option<OutboxRecord> {
        self.records
            .lock()
            .expect("poisoned outbox lock")
            .get(id)
            .cloned()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.lock().expect("poisoned outbox lock").len()
    }

    /// True if the outbox is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically claim up to `limit` due records.
    ///
    /// A record is due when it is `pending` and its `next_attempt_at_ms`
    /// has passed.  Claimed records flip to `in_flight` with an ack
    /// deadline of `now + ack_deadline_ms` before this method returns, so
    /// no concurrent tick can claim them again.  Drain order: high
    /// priority first, then FIFO by creation time (ties by id).
    pub fn claim_due(
        &self,
        now_ms: u64,
        limit: usize,
        ack_deadline_ms: u64,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let mut claimed = Vec::new();
        {
            let mut records = self.records.lock().expect("poisoned outbox lock");
            let mut due: Vec<&OutboxRecord> = records
                .values()
                .filter(|r| r.status == RecordStatus::Pending && r.next_attempt_at_ms <= now_ms)
                .collect();
            due.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.created_at_ms.cmp(&b.created_at_ms))
                    .then(a.message_id.cmp(&b.message_id))
            });
            let ids: Vec<MessageId> = due
                .into_iter()
                .take(limit)
                .map(|r| r.message_id.clone())
                .collect();
            for id in ids {
                let record = records.get_mut(&id).expect("due record vanished");
                record.status = RecordStatus::InFlight;
                record.in_flight_at_ms = Some(now_ms);
                record.ack_deadline_ms = Some(now_ms + ack_deadline_ms);
                record.last_attempt_at_ms = Some(now_ms);
                claimed.push(record.clone());
            }
        }
        for record in &claimed {
            self.persist(record)?;
        }
        Ok(claimed)
    }

    /// An ack arrived for `id`: the record is done and destroyed.
    ///
    /// Returns false if we held no such record (duplicate ack, or ack for
    /// something already expired); that is not an error.
    pub fn note_ack(&self, id: &MessageId) -> Result<bool, StoreError> {
        let removed = self.delete(id)?;
        if removed {
            debug!("outbox record {} acked", id);
        }
        Ok(removed)
    }

    /// Return a claimed record to `pending`, with backoff.
    ///
    /// Increments the attempt count and schedules the next try at
    /// `now + backoff(attempts)`.
    pub fn release_for_retry<R: Rng>(
        &self,
        id: &MessageId,
        now_ms: u64,
        rng: &mut R,
    ) -> Result<OutboxRecord, StoreError> {
        let record = {
            let mut records = self.records.lock().expect("poisoned outbox lock");
            let record = records
                .get_mut(id)
                .ok_or_else(|| StoreError::NoSuchRecord(id.clone()))?;
            record.attempts += 1;
            record.status = RecordStatus::Pending;
            record.in_flight_at_ms = None;
            record.ack_deadline_ms = None;
            record.next_attempt_at_ms = now_ms + backoff_ms(record.attempts, rng);
            record.clone()
        };
        self.persist(&record)?;
        Ok(record)
    }

    /// Reclaim in-flight records whose ack deadline passed, putting them
    /// back in `pending` with backoff.  Returns the affected ids.
    pub fn reclaim_overdue<R: Rng>(
        &self,
        now_ms: u64,
        rng: &mut R,
    ) -> Result<Vec<MessageId>, StoreError> {
        let overdue: Vec<MessageId> = {
            let records = self.records.lock().expect("poisoned outbox lock");
            records
                .values()
                .filter(|r| {
                    r.status == RecordStatus::InFlight
                        && r.ack_deadline_ms.map(|d| d < now_ms).unwrap_or(false)
                })
                .map(|r| r.message_id.clone())
                .collect()
        };
        for id in &overdue {
            debug!("outbox record {} missed its ack deadline", id);
            self.release_for_retry(id, now_ms, rng)?;
        }
        Ok(overdue)
    }

    /// Expire and delete records past their TTL or attempt budget.
    /// Returns the expired ids.
    pub fn sweep_expired(
        &self,
        now_ms: u64,
        max_attempts: u32,
    ) -> Result<Vec<MessageId>, StoreError> {
        let dead: Vec<MessageId> = {
            let records = self.records.lock().expect("poisoned outbox lock");
            records
                .values()
                .filter(|r| r.is_expired_at(now_ms) || r.attempts >= max_attempts)
                .map(|r| r.message_id.clone())
                .collect()
        };
        for id in &dead {
            info!("outbox record {} expired", id);
            self.delete(id)?;
        }
        Ok(dead)
    }

    /// The earliest `next_attempt_at_ms` among pending records, if any.
    ///
    /// The scheduler sleeps until then (or until woken).
    pub fn next_due_at(&self) -> Option<u64> {
        self.records
            .lock()
            .expect("poisoned outbox lock")
            .values()
            .filter(|r| r.status == RecordStatus::Pending)
            .map(|r| r.next_attempt_at_ms)
            .min()
    }

    /// Snapshot of all records, for diagnostics.
    pub fn snapshot(&self) -> Vec<OutboxRecord> {
        self.records
            .lock()
            .expect("poisoned outbox lock")
            .values()
            .cloned()
            .collect()
    }

    /// Pending records for a conversation, FIFO.  (Diagnostics and the
    /// friend-control scheduler use this.)
    pub fn pending_for_conv(&self, conv: &nightjar_envelope::ConvId) -> Vec<OutboxRecord> {
        let mut v: Vec<OutboxRecord> = self
            .records
            .lock()
            .expect("poisoned outbox lock")
            .values()
            .filter(|r| r.status == RecordStatus::Pending && &r.conv_id == conv)
            .cloned()
            .collect();
        v.sort_by(|a, b| {
            (a.priority, a.created_at_ms, a.message_id.clone()).cmp(&(
                b.priority,
                b.created_at_ms,
                b.message_id.clone(),
            ))
        });
        v
    }
}
