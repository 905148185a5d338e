//! Upload queue actor.
//!
//! One task owns the [`UploadQueue`]; callers talk to it through an
//! [`UploadHandle`] and observe it through broadcast [`QueueEvent`]s. Each
//! transfer runs in its own task and reports back to the actor, which is the
//! only place queue state changes.

use crate::{
    client::{
        api::FileHostApi,
        queue::{QueueEntry, StartedTransfer, UploadQueue},
        worker::{ChunkPolicy, TransferProgress, TransferWorker, UploadSource, UploadedObject},
    },
    models::{api::CreateFileRequest, uploaded_file::UploadedFile},
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("upload queue has shut down")]
    Closed,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued {
        id: Uuid,
        name: String,
        size: u64,
        position: u64,
    },
    Started {
        id: Uuid,
        name: String,
    },
    Progress {
        id: Uuid,
        progress: TransferProgress,
    },
    /// The payload is stored. `file` is the persisted record; when persisting
    /// failed it is `None` and `persist_error` says why.
    Completed {
        id: Uuid,
        name: String,
        object: UploadedObject,
        file: Option<UploadedFile>,
        persist_error: Option<String>,
    },
    Failed {
        id: Uuid,
        name: String,
        error: String,
    },
    Cancelled {
        id: Uuid,
    },
    Retried {
        id: Uuid,
        position: u64,
    },
}

enum Command {
    Enqueue {
        sources: Vec<UploadSource>,
        reply: oneshot::Sender<Vec<Uuid>>,
    },
    Cancel {
        id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    Retry {
        id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<QueueEntry>>,
    },
    WhenIdle {
        reply: oneshot::Sender<()>,
    },
}

enum Outcome {
    Uploaded {
        object: UploadedObject,
        persisted: Result<UploadedFile, String>,
    },
    Cancelled,
    Failed(String),
}

enum Report {
    Progress {
        id: Uuid,
        progress: TransferProgress,
    },
    Finished {
        id: Uuid,
        outcome: Outcome,
    },
}

/// Cloneable handle to the queue actor. The actor stops, cancelling any
/// active transfer, once every handle is dropped.
#[derive(Clone)]
pub struct UploadHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<QueueEvent>,
}

impl UploadHandle {
    /// Start the actor on the current runtime.
    pub fn spawn(api: Arc<dyn FileHostApi>, policy: ChunkPolicy) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (reports, report_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = Actor {
            queue: UploadQueue::new(),
            worker: Arc::new(TransferWorker::new(api.clone(), policy)),
            api,
            events: events.clone(),
            reports,
            idle_waiters: Vec::new(),
        };
        tokio::spawn(actor.run(command_rx, report_rx));

        Self { commands, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)
    }

    /// Append files in order; returns their entry ids.
    pub async fn enqueue(&self, sources: Vec<UploadSource>) -> Result<Vec<Uuid>, QueueError> {
        self.request(|reply| Command::Enqueue { sources, reply }).await
    }

    /// Cancel or remove an entry in any state. Returns false if unknown.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, QueueError> {
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    /// Drop an errored entry. Same as [`UploadHandle::cancel`].
    pub async fn remove(&self, id: Uuid) -> Result<bool, QueueError> {
        self.cancel(id).await
    }

    /// Queue an errored entry again at the tail.
    pub async fn retry(&self, id: Uuid) -> Result<bool, QueueError> {
        self.request(|reply| Command::Retry { id, reply }).await
    }

    pub async fn snapshot(&self) -> Result<Vec<QueueEntry>, QueueError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Resolves once nothing is uploading or waiting.
    pub async fn wait_idle(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::WhenIdle { reply }).await
    }
}

struct Actor {
    queue: UploadQueue,
    worker: Arc<TransferWorker>,
    api: Arc<dyn FileHostApi>,
    events: broadcast::Sender<QueueEvent>,
    reports: mpsc::UnboundedSender<Report>,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<Report>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(report) = reports.recv() => self.handle_report(report),
            }
            self.drain();
        }
        self.queue.cancel_active();
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { sources, reply } => {
                let added = self.queue.enqueue(sources);
                for entry in &added {
                    self.emit(QueueEvent::Enqueued {
                        id: entry.id,
                        name: entry.name().to_string(),
                        size: entry.size(),
                        position: entry.position,
                    });
                }
                let _ = reply.send(added.iter().map(|e| e.id).collect());
            }
            Command::Cancel { id, reply } => {
                let removed = self.queue.cancel(id).is_some();
                if removed {
                    info!("upload {} cancelled", id);
                    self.emit(QueueEvent::Cancelled { id });
                }
                let _ = reply.send(removed);
            }
            Command::Retry { id, reply } => {
                let position = self.queue.retry(id);
                if let Some(position) = position {
                    self.emit(QueueEvent::Retried { id, position });
                }
                let _ = reply.send(position.is_some());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.queue.snapshot());
            }
            Command::WhenIdle { reply } => self.idle_waiters.push(reply),
        }
    }

    fn handle_report(&mut self, report: Report) {
        match report {
            Report::Progress { id, progress } => {
                if self
                    .queue
                    .record_progress(id, progress.transferred, progress.speed)
                {
                    self.emit(QueueEvent::Progress { id, progress });
                }
            }
            Report::Finished { id, outcome } => match outcome {
                Outcome::Uploaded { object, persisted } => {
                    let Some(entry) = self.queue.complete(id) else {
                        // Cancelled while the record was being saved.
                        if persisted.is_ok() {
                            tokio::spawn(discard(self.api.clone(), object.public_id));
                        }
                        return;
                    };
                    let (file, persist_error) = match persisted {
                        Ok(file) => (Some(file), None),
                        Err(err) => {
                            warn!(
                                "{} uploaded to {} but was not recorded: {}",
                                entry.name(),
                                object.url,
                                err
                            );
                            (None, Some(err))
                        }
                    };
                    info!("upload {} completed: {}", entry.name(), object.url);
                    self.emit(QueueEvent::Completed {
                        id,
                        name: entry.name().to_string(),
                        object,
                        file,
                        persist_error,
                    });
                }
                Outcome::Failed(error) => {
                    let name = self
                        .queue
                        .get(id)
                        .map(|e| e.name().to_string())
                        .unwrap_or_default();
                    if self.queue.fail(id, error.clone()) {
                        warn!("upload {} failed: {}", name, error);
                        self.emit(QueueEvent::Failed { id, name, error });
                    }
                }
                Outcome::Cancelled => {
                    if self.queue.active() == Some(id) && self.queue.cancel(id).is_some() {
                        self.emit(QueueEvent::Cancelled { id });
                    }
                }
            },
        }
    }

    /// Start the next entry if the slot is free, then wake idle waiters.
    fn drain(&mut self) {
        if let Some(started) = self.queue.start_next() {
            self.emit(QueueEvent::Started {
                id: started.id,
                name: started.source.name.clone(),
            });
            self.spawn_transfer(started);
        }

        if self.queue.is_idle() {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn spawn_transfer(&self, started: StartedTransfer) {
        let worker = self.worker.clone();
        let api = self.api.clone();
        let reports = self.reports.clone();

        tokio::spawn(async move {
            let StartedTransfer { id, source, cancel } = started;
            let progress_reports = reports.clone();
            let result = worker
                .transfer(id, &source, &cancel, |progress| {
                    let _ = progress_reports.send(Report::Progress { id, progress });
                })
                .await;

            let outcome = match result {
                Ok(Some(_)) if cancel.is_cancelled() => Outcome::Cancelled,
                Ok(Some(object)) => {
                    let request = CreateFileRequest {
                        url: object.url.clone(),
                        public_id: object.public_id.clone(),
                        original_name: source.name.clone(),
                    };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            // The save may already have landed server-side.
                            discard(api.clone(), object.public_id).await;
                            Outcome::Cancelled
                        }
                        res = api.register_file(&request) => Outcome::Uploaded {
                            object,
                            persisted: res.map_err(|err| err.to_string()),
                        },
                    }
                }
                Ok(None) => Outcome::Cancelled,
                Err(err) => Outcome::Failed(err.to_string()),
            };
            let _ = reports.send(Report::Finished { id, outcome });
        });
    }
}

/// Remove a record saved for an upload the user cancelled. A missing record
/// is fine; the stored object is then left to the server's orphan sweep.
async fn discard(api: Arc<dyn FileHostApi>, public_id: String) {
    match api.delete_file(&public_id).await {
        Ok(()) => info!("removed {} saved after cancellation", public_id),
        Err(err) if err.is_not_found() => {
            debug!("no record for cancelled upload {}", public_id)
        }
        Err(err) => warn!("could not remove cancelled upload {}: {}", public_id, err),
    }
}
