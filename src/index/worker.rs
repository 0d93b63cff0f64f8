use std::sync::Arc;
use std::thread::{self, JoinHandle};
use crossbeam::channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use crate::core::cancel::CancelToken;
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::index::definition::MapReduceDefinition;
use crate::index::engine::IndexEngine;
use crate::index::table::IndexShared;
use crate::storage::document_store::{ChangeNotification, DocumentStore};
use crate::storage::layout::StorageLayout;

enum IndexCommand {
    Rebuild { cancel: CancelToken, reply: Sender<Result<()>> },
    Flush { reply: Sender<Result<()>> },
    Shutdown,
}

/// A registered index: its shared table plus the worker thread feeding it.
///
/// The worker is the single reducer for the index, applying the store's
/// change feed strictly in etag order. Distinct indexes run on distinct
/// threads and share nothing mutable.
pub struct IndexHandle {
    pub shared: Arc<IndexShared>,
    commands: Sender<IndexCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IndexHandle {
    /// Subscribe to `store` and start the worker, whose first job is the
    /// initial build (or restore from a persisted checkpoint).
    pub fn spawn(
        definition: Arc<dyn MapReduceDefinition>,
        store: Arc<DocumentStore>,
        storage: Option<Arc<StorageLayout>>,
        config: &Config,
    ) -> Result<Self> {
        let shared = Arc::new(IndexShared::new(definition.name()));
        let engine = IndexEngine::new(
            definition,
            shared.clone(),
            storage,
            config.index_checkpoint_interval,
            config.rebuild_batch_size,
        );

        // Subscribe before the worker takes its snapshot so no mutation can
        // fall between the two.
        let changes = store.subscribe();
        let (commands, command_rx) = unbounded();

        let thread = thread::Builder::new()
            .name(format!("index-{}", shared.name))
            .spawn(move || run(engine, store, changes, command_rx))?;

        Ok(IndexHandle {
            shared,
            commands,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Full rebuild from the store's current contents. Blocks until the
    /// build finishes, fails, or `cancel` stops it.
    pub fn rebuild(&self, cancel: CancelToken) -> Result<()> {
        let (reply, result) = bounded(1);
        self.send(IndexCommand::Rebuild { cancel, reply })?;
        result.recv().map_err(|_| self.stopped())?
    }

    /// Persist the index state as of its current checkpoint.
    pub fn flush(&self) -> Result<()> {
        let (reply, result) = bounded(1);
        self.send(IndexCommand::Flush { reply })?;
        result.recv().map_err(|_| self.stopped())?
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(IndexCommand::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!(index = %self.name(), "index worker panicked");
            }
        }
    }

    fn send(&self, command: IndexCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| self.stopped())
    }

    fn stopped(&self) -> Error {
        Error::new(ErrorKind::InvalidState, format!("index '{}' worker is not running", self.name()))
    }
}

impl Drop for IndexHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    mut engine: IndexEngine,
    store: Arc<DocumentStore>,
    changes: Receiver<ChangeNotification>,
    commands: Receiver<IndexCommand>,
) {
    let snapshot = store.snapshot();
    if !engine.restore(snapshot.etag) {
        // Failures are recorded in the index state; nothing else to do here.
        let _ = engine.build(&snapshot, &CancelToken::new());
    }

    loop {
        select! {
            recv(commands) -> command => match command {
                Ok(IndexCommand::Rebuild { cancel, reply }) => {
                    let snapshot = store.snapshot();
                    let _ = reply.send(engine.build(&snapshot, &cancel));
                }
                Ok(IndexCommand::Flush { reply }) => {
                    let _ = reply.send(engine.persist());
                }
                Ok(IndexCommand::Shutdown) | Err(_) => break,
            },
            recv(changes) -> change => match change {
                Ok(change) => {
                    let _ = engine.apply(&change);
                }
                Err(_) => break,
            },
        }
    }

    if let Err(e) = engine.persist() {
        tracing::warn!(index = %engine.name(), error = %e, "failed to save index checkpoint on shutdown");
    }
    tracing::debug!(index = %engine.name(), checkpoint = engine.checkpoint().0, "index worker stopped");
}
