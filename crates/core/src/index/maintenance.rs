//! Maintenance worker: a dedicated thread that runs rebuilds requested through a
//! crossbeam channel.
//!
//! The worker holds a `Weak` reference to the index, so a queued task never keeps
//! a dropped index alive. Dropping the index sends [`MaintenanceTask::Shutdown`]
//! and joins the thread.

use crate::error::{IndexError, Result};
use crate::index::generation::{BuildReport, RebuildTrigger};
use crate::index::IndexShared;
use crossbeam::channel::{Receiver, Sender};
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;
const FINISHED: u8 = 3;

/// Lifecycle of one explicit build request.
#[derive(Debug)]
pub(crate) struct BuildTicket(AtomicU8);

impl BuildTicket {
    fn new() -> Self {
        Self(AtomicU8::new(QUEUED))
    }

    fn try_start(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cancel(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self) {
        self.0.store(FINISHED, Ordering::Release);
    }

    fn state(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

pub(crate) enum MaintenanceTask {
    Build {
        ticket: Arc<BuildTicket>,
        reply: Sender<Result<BuildReport>>,
    },
    /// The mutation threshold was crossed in background mode.
    AutoRebuild,
    Shutdown,
}

/// Handle to a build queued with
/// [`VectorIndex::build_async`](crate::index::VectorIndex::build_async).
#[derive(Debug)]
pub struct BuildHandle {
    ticket: Arc<BuildTicket>,
    done: Receiver<Result<BuildReport>>,
}

impl BuildHandle {
    /// Cancel the build if it has not started yet. Returns whether it was cancelled.
    /// A build that is already running always runs to completion.
    pub fn cancel(&self) -> bool {
        self.ticket.cancel()
    }

    /// Whether the build has completed or was cancelled.
    pub fn is_finished(&self) -> bool {
        matches!(self.ticket.state(), FINISHED | CANCELLED)
    }

    /// Block until the build finishes. A cancelled build yields
    /// [`IndexError::BuildCancelled`].
    pub fn wait(self) -> Result<BuildReport> {
        self.done
            .recv()
            .unwrap_or(Err(IndexError::MaintenanceUnavailable))
    }
}

pub(crate) struct MaintenanceWorker {
    tx: Sender<MaintenanceTask>,
    join: Option<thread::JoinHandle<()>>,
}

impl MaintenanceWorker {
    pub(crate) fn spawn(
        shared: Weak<IndexShared>,
        tx: Sender<MaintenanceTask>,
        rx: Receiver<MaintenanceTask>,
    ) -> io::Result<Self> {
        let join = thread::Builder::new()
            .name("lsmvec-maintenance".to_string())
            .spawn(move || run(shared, rx))?;
        Ok(Self {
            tx,
            join: Some(join),
        })
    }

    /// Queue an explicit build.
    pub(crate) fn submit_build(&self) -> Result<BuildHandle> {
        let ticket = Arc::new(BuildTicket::new());
        let (reply, done) = crossbeam::channel::bounded(1);
        self.tx
            .send(MaintenanceTask::Build {
                ticket: Arc::clone(&ticket),
                reply,
            })
            .map_err(|_| IndexError::MaintenanceUnavailable)?;
        Ok(BuildHandle { ticket, done })
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(MaintenanceTask::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("maintenance worker panicked");
            }
        }
    }
}

fn run(shared: Weak<IndexShared>, rx: Receiver<MaintenanceTask>) {
    while let Ok(task) = rx.recv() {
        match task {
            MaintenanceTask::Shutdown => break,
            MaintenanceTask::Build { ticket, reply } => {
                if !ticket.try_start() {
                    let _ = reply.send(Err(IndexError::BuildCancelled));
                    continue;
                }
                let result = match shared.upgrade() {
                    Some(index) => index.rebuild(RebuildTrigger::Explicit),
                    None => Err(IndexError::MaintenanceUnavailable),
                };
                if result.is_ok() {
                    if let Some(index) = shared.upgrade() {
                        index.clear_rebuild_error();
                    }
                }
                ticket.finish();
                let _ = reply.send(result);
            }
            MaintenanceTask::AutoRebuild => {
                let Some(index) = shared.upgrade() else {
                    break;
                };
                index.run_background_rebuild();
            }
        }
    }
    tracing::debug!("maintenance worker stopped");
}
