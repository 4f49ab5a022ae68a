//! Background sync scheduling
//!
//! One task per engine drives passes from three inputs: explicit triggers,
//! debounced dirty marks from local edits, and a periodic interval that
//! sweeps every registered library. Passes themselves are spawned so slow
//! libraries never hold up the command loop; the orchestrator's guard keeps
//! each library to one pass at a time.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::error::{Result, SyncError};
use crate::storage::{library_queries, Storage};
use crate::sync::orchestrator::{PassOutcome, SyncOrchestrator};
use crate::types::LibraryId;

/// Commands for the sync worker
#[derive(Debug)]
pub enum SyncCommand {
    /// Run a pass now
    Trigger(LibraryId),
    /// A local edit happened; schedule a pass after the quiet period
    MarkDirty(LibraryId),
    /// Ask an in-flight pass to stop at the next item boundary
    Cancel(LibraryId),
    /// Drain dirty libraries, then exit
    Stop,
}

/// Handle to the background scheduling task
pub struct SyncWorker {
    sender: mpsc::Sender<SyncCommand>,
}

impl SyncWorker {
    /// Start the worker task
    ///
    /// `sync_interval_ms = 0` disables the periodic all-library sweep;
    /// debounced and explicit passes still run.
    pub fn start(
        storage: Storage,
        orchestrator: SyncOrchestrator,
        debounce_ms: u64,
        sync_interval_ms: u64,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<SyncCommand>(100);
        let debounce = Duration::from_millis(debounce_ms.max(1));

        tokio::spawn(async move {
            let mut dirty: HashMap<LibraryId, Instant> = HashMap::new();
            let mut debounce_check = interval(Duration::from_millis(250));
            debounce_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // A zero interval parks the periodic sweep on a far-off timer
            let mut periodic = interval(Duration::from_millis(sync_interval_ms.max(1)));
            periodic.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let periodic_enabled = sync_interval_ms > 0;
            // The first tick of a tokio interval fires immediately
            periodic.tick().await;

            loop {
                tokio::select! {
                    Some(cmd) = receiver.recv() => {
                        match cmd {
                            SyncCommand::Trigger(library_id) => {
                                dirty.remove(&library_id);
                                spawn_pass(&orchestrator, library_id);
                            }
                            SyncCommand::MarkDirty(library_id) => {
                                dirty.insert(library_id, Instant::now());
                            }
                            SyncCommand::Cancel(library_id) => {
                                dirty.remove(&library_id);
                                orchestrator.cancel(library_id);
                            }
                            SyncCommand::Stop => {
                                // Local edits made just before shutdown still
                                // get their pass
                                let remaining: Vec<LibraryId> = dirty.drain().map(|(id, _)| id).collect();
                                for library_id in remaining {
                                    run_pass_logged(&orchestrator, library_id).await;
                                }
                                break;
                            }
                        }
                    }
                    _ = debounce_check.tick() => {
                        let due: Vec<LibraryId> = dirty
                            .iter()
                            .filter(|(_, marked)| marked.elapsed() >= debounce)
                            .map(|(id, _)| *id)
                            .collect();
                        for library_id in due {
                            dirty.remove(&library_id);
                            tracing::debug!(library = library_id, "debounce elapsed, scheduling pass");
                            spawn_pass(&orchestrator, library_id);
                        }
                    }
                    _ = periodic.tick(), if periodic_enabled => {
                        match storage.with_connection(library_queries::list_libraries) {
                            Ok(libraries) => {
                                for library in libraries {
                                    dirty.remove(&library.id);
                                    spawn_pass(&orchestrator, library.id);
                                }
                            }
                            Err(err) => {
                                tracing::error!(error = %err, "periodic sweep could not list libraries");
                            }
                        }
                    }
                }
            }

            tracing::info!("sync worker stopped");
        });

        Self { sender }
    }

    /// Run a pass for one library as soon as possible
    pub async fn trigger(&self, library_id: LibraryId) -> Result<()> {
        self.send(SyncCommand::Trigger(library_id)).await
    }

    /// Note a local edit; a pass follows once the library goes quiet
    pub async fn mark_dirty(&self, library_id: LibraryId) -> Result<()> {
        self.send(SyncCommand::MarkDirty(library_id)).await
    }

    /// Request cancellation of the library's in-flight pass
    pub async fn cancel(&self, library_id: LibraryId) -> Result<()> {
        self.send(SyncCommand::Cancel(library_id)).await
    }

    /// Stop the worker after draining dirty libraries
    pub async fn stop(&self) -> Result<()> {
        self.send(SyncCommand::Stop).await
    }

    async fn send(&self, cmd: SyncCommand) -> Result<()> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| SyncError::Internal("sync worker channel closed".to_string()))
    }
}

fn spawn_pass(orchestrator: &SyncOrchestrator, library_id: LibraryId) {
    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        run_pass_logged(&orchestrator, library_id).await;
    });
}

async fn run_pass_logged(orchestrator: &SyncOrchestrator, library_id: LibraryId) {
    match orchestrator.run_pass(library_id).await {
        Ok(PassOutcome::Ran(_)) => {}
        Ok(PassOutcome::AlreadyRunning) => {
            tracing::debug!(library = library_id, "pass already in flight");
        }
        Err(err) => {
            tracing::error!(library = library_id, error = %err, "sync pass error");
        }
    }
}
