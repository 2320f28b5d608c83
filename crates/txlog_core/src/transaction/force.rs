//! Making appended transactions durable.
//!
//! With [`ForceMode::PerCommit`] every committer forces the log itself. With
//! [`ForceMode::Batched`] a background thread forces on behalf of everyone:
//! a committer takes a ticket once its entries are written out and waits
//! until a force has covered that ticket. N concurrent commits then cost
//! about one fsync instead of N, at the price of some latency for the last
//! one to arrive in a batch.

use crate::config::ForceMode;
use crate::error::{CoreError, CoreResult};
use crate::log::LogFile;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Default)]
struct ForceState {
    /// Highest ticket handed out.
    requested: u64,
    /// Highest ticket covered by a completed force.
    forced: u64,
    /// A failed force leaves the file in an unknown state; every later
    /// wait fails with this message.
    failure: Option<String>,
    shutdown: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ForceState>,
    wake: Condvar,
    done: Condvar,
}

/// Background forcer shared by all committers.
pub struct BatchingForcer {
    shared: Arc<Shared>,
    max_wait: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingForcer {
    /// Starts the forcing thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(log: Arc<LogFile>, max_wait: Duration) -> CoreResult<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(ForceState::default()),
            wake: Condvar::new(),
            done: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("txlog-force".into())
            .spawn(move || run(&thread_shared, &log))?;
        Ok(Self {
            shared,
            max_wait: max_wait.max(Duration::from_micros(100)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Takes a ticket for everything written out so far.
    pub fn request(&self) -> u64 {
        let mut state = self.shared.state.lock();
        state.requested += 1;
        let ticket = state.requested;
        drop(state);
        self.shared.wake.notify_one();
        ticket
    }

    /// Waits until a force has covered `ticket`.
    ///
    /// # Errors
    ///
    /// Returns an error if a force failed or the forcer was shut down
    /// before covering the ticket.
    pub fn await_forced(&self, ticket: u64) -> CoreResult<()> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(message) = &state.failure {
                return Err(CoreError::Io(io::Error::other(format!(
                    "log force failed: {message}"
                ))));
            }
            if state.forced >= ticket {
                return Ok(());
            }
            if state.shutdown {
                return Err(CoreError::Closed);
            }
            self.shared.wake.notify_one();
            self.shared.done.wait_for(&mut state, self.max_wait);
        }
    }

    /// Forces what is pending and stops the thread.
    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("log force thread panicked");
            }
        }
    }
}

fn run(shared: &Shared, log: &LogFile) {
    loop {
        let target = {
            let mut state = shared.state.lock();
            while state.requested == state.forced && !state.shutdown {
                shared.wake.wait(&mut state);
            }
            if state.requested == state.forced || state.failure.is_some() {
                // Shut down with nothing pending, or broken.
                return;
            }
            state.requested
        };

        let result = log.force();

        let mut state = shared.state.lock();
        match result {
            Ok(()) => {
                debug!(ticket = target, "batched force");
                state.forced = state.forced.max(target);
            }
            Err(e) => {
                error!(error = %e, "batched log force failed");
                state.failure = Some(e.to_string());
            }
        }
        drop(state);
        shared.done.notify_all();
    }
}

impl Drop for BatchingForcer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BatchingForcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchingForcer")
            .field("state", &*self.shared.state.lock())
            .finish_non_exhaustive()
    }
}

/// How committers make their transactions durable.
#[derive(Debug)]
pub enum Forcer {
    /// Each committer forces the log.
    PerCommit(Arc<LogFile>),
    /// A background thread forces for everyone.
    Batched(BatchingForcer),
}

impl Forcer {
    /// Creates the forcer for `mode`.
    ///
    /// # Errors
    ///
    /// Returns an error if the batching thread cannot be started.
    pub fn new(mode: ForceMode, log: Arc<LogFile>) -> CoreResult<Self> {
        Ok(match mode {
            ForceMode::PerCommit => Self::PerCommit(log),
            ForceMode::Batched { max_wait } => Self::Batched(BatchingForcer::start(log, max_wait)?),
        })
    }

    /// Takes a ticket, with the log's entries written out.
    pub fn ticket(&self) -> u64 {
        match self {
            Self::PerCommit(_) => 0,
            Self::Batched(forcer) => forcer.request(),
        }
    }

    /// Makes everything up to `ticket` durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the force fails.
    pub fn force(&self, ticket: u64) -> CoreResult<()> {
        match self {
            Self::PerCommit(log) => log.force(),
            Self::Batched(forcer) => forcer.await_forced(ticket),
        }
    }

    /// Stops the background thread, if any.
    pub fn shutdown(&self) {
        if let Self::Batched(forcer) = self {
            forcer.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::log::LogFiles;
    use crate::store::TransactionIdStore;
    use crate::transaction::TransactionMetadataCache;
    use txlog_storage::InMemoryFileSystem;

    fn log() -> Arc<LogFile> {
        let fs = InMemoryFileSystem::new();
        let files = LogFiles::new(Arc::new(fs), "db", "log");
        Arc::new(
            LogFile::open(
                files,
                Config::default(),
                Arc::new(TransactionIdStore::default()),
                Arc::new(TransactionMetadataCache::new(10, 10)),
            )
            .unwrap(),
        )
    }

    #[test]
    fn per_commit_forces_directly() {
        let forcer = Forcer::new(ForceMode::PerCommit, log()).unwrap();
        let ticket = forcer.ticket();
        forcer.force(ticket).unwrap();
    }

    #[test]
    fn batched_covers_every_ticket() {
        let forcer = Forcer::new(
            ForceMode::Batched {
                max_wait: Duration::from_millis(1),
            },
            log(),
        )
        .unwrap();

        let tickets: Vec<u64> = (0..5).map(|_| forcer.ticket()).collect();
        assert_eq!(tickets, vec![1, 2, 3, 4, 5]);
        for ticket in tickets.into_iter().rev() {
            forcer.force(ticket).unwrap();
        }
        forcer.shutdown();
    }

    #[test]
    fn batched_from_many_threads() {
        let forcer = Arc::new(
            Forcer::new(
                ForceMode::Batched {
                    max_wait: Duration::from_millis(1),
                },
                log(),
            )
            .unwrap(),
        );
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let forcer = Arc::clone(&forcer);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let ticket = forcer.ticket();
                        forcer.force(ticket).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn waiting_after_shutdown_fails() {
        let forcer = BatchingForcer::start(log(), Duration::from_millis(1)).unwrap();
        forcer.shutdown();
        assert!(matches!(forcer.await_forced(1), Err(CoreError::Closed)));
    }
}
