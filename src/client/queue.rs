//! Upload queue bookkeeping.
//!
//! [`UploadQueue`] is a plain state machine: it decides which entry transfers
//! next and tracks progress, but performs no I/O. The manager actor drives it.

use crate::client::worker::UploadSource;
use serde::Serialize;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Queued,
    Uploading,
    Completed,
    Error,
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: Uuid,
    pub source: UploadSource,
    pub transferred: u64,
    /// Bytes per second reported for the last request.
    pub speed: f64,
    pub status: EntryStatus,
    /// Insertion order; the lowest queued position uploads first.
    pub position: u64,
    pub error: Option<String>,
    cancel: Option<CancellationToken>,
}

impl QueueEntry {
    pub fn name(&self) -> &str {
        &self.source.name
    }

    pub fn size(&self) -> u64 {
        self.source.size
    }

    pub fn percent(&self) -> f64 {
        if self.source.size == 0 {
            return if self.status == EntryStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.transferred as f64 / self.source.size as f64) * 100.0
    }
}

/// An entry that has just moved to `Uploading`.
#[derive(Debug, Clone)]
pub struct StartedTransfer {
    pub id: Uuid,
    pub source: UploadSource,
    pub cancel: CancellationToken,
}

#[derive(Debug, Default)]
pub struct UploadQueue {
    entries: HashMap<Uuid, QueueEntry>,
    next_position: u64,
    active: Option<Uuid>,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append entries in the order given; each gets a fresh id and position.
    pub fn enqueue(&mut self, sources: Vec<UploadSource>) -> Vec<QueueEntry> {
        sources
            .into_iter()
            .map(|source| {
                let entry = QueueEntry {
                    id: Uuid::new_v4(),
                    source,
                    transferred: 0,
                    speed: 0.0,
                    status: EntryStatus::Queued,
                    position: self.take_position(),
                    error: None,
                    cancel: None,
                };
                self.entries.insert(entry.id, entry.clone());
                entry
            })
            .collect()
    }

    fn take_position(&mut self) -> u64 {
        let position = self.next_position;
        self.next_position += 1;
        position
    }

    pub fn active(&self) -> Option<Uuid> {
        self.active
    }

    pub fn get(&self, id: Uuid) -> Option<&QueueEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Nothing uploading and nothing waiting. Errored entries do not count.
    pub fn is_idle(&self) -> bool {
        self.active.is_none()
            && !self
                .entries
                .values()
                .any(|e| e.status == EntryStatus::Queued)
    }

    /// If no transfer is active, promote the queued entry with the lowest
    /// position to `Uploading`.
    pub fn start_next(&mut self) -> Option<StartedTransfer> {
        if self.active.is_some() {
            return None;
        }
        let next = self
            .entries
            .values_mut()
            .filter(|e| e.status == EntryStatus::Queued)
            .min_by_key(|e| e.position)?;

        let cancel = CancellationToken::new();
        next.status = EntryStatus::Uploading;
        next.transferred = 0;
        next.speed = 0.0;
        next.error = None;
        next.cancel = Some(cancel.clone());
        self.active = Some(next.id);

        Some(StartedTransfer {
            id: next.id,
            source: next.source.clone(),
            cancel,
        })
    }

    /// Apply a progress report. Reports for anything but the active entry
    /// are stale and ignored.
    pub fn record_progress(&mut self, id: Uuid, transferred: u64, speed: f64) -> bool {
        if self.active != Some(id) {
            return false;
        }
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.transferred = transferred.min(entry.source.size);
                entry.speed = speed;
                true
            }
            None => false,
        }
    }

    /// The active transfer succeeded; the entry leaves the queue.
    pub fn complete(&mut self, id: Uuid) -> Option<QueueEntry> {
        if self.active != Some(id) {
            return None;
        }
        self.active = None;
        let mut entry = self.entries.remove(&id)?;
        entry.status = EntryStatus::Completed;
        entry.transferred = entry.source.size;
        entry.cancel = None;
        Some(entry)
    }

    /// The active transfer failed; the entry stays with its error and its
    /// progress reset.
    pub fn fail(&mut self, id: Uuid, error: impl Into<String>) -> bool {
        if self.active != Some(id) {
            return false;
        }
        self.active = None;
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.status = EntryStatus::Error;
                entry.transferred = 0;
                entry.speed = 0.0;
                entry.error = Some(error.into());
                entry.cancel = None;
                true
            }
            None => false,
        }
    }

    /// Remove an entry in any state. An active transfer has its token
    /// cancelled and the slot is freed for the next entry.
    pub fn cancel(&mut self, id: Uuid) -> Option<QueueEntry> {
        let entry = self.entries.remove(&id)?;
        if let Some(token) = entry.cancel.as_ref() {
            token.cancel();
        }
        if self.active == Some(id) {
            self.active = None;
        }
        Some(entry)
    }

    /// Put an errored entry back at the tail of the queue.
    pub fn retry(&mut self, id: Uuid) -> Option<u64> {
        let position = self.next_position;
        let entry = self.entries.get_mut(&id)?;
        if entry.status != EntryStatus::Error {
            return None;
        }
        entry.status = EntryStatus::Queued;
        entry.error = None;
        entry.position = position;
        self.next_position += 1;
        Some(position)
    }

    /// Entries ordered by position.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.position);
        entries
    }

    /// Cancel whatever is running; used when the queue shuts down.
    pub fn cancel_active(&mut self) {
        if let Some(id) = self.active.take() {
            if let Some(token) = self.entries.get(&id).and_then(|e| e.cancel.as_ref()) {
                token.cancel();
            }
        }
    }
}
