//! Stress tests for txlog.
//!
//! These drive many committers at once, optionally with rotations running
//! beside them, and check what the log ends up holding.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use txlog_core::{new_xid, CoreResult, DataSource, TransactionId, TransactionRepresentation};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Successful commits.
    pub successful_ops: usize,
    /// Failed commits.
    pub failed_ops: usize,
    /// Rotations performed beside the commits.
    pub rotations: usize,
    /// Total duration.
    pub duration: Duration,
    /// Ids handed out, sorted.
    pub tx_ids: Vec<u64>,
}

impl StressTestResult {
    /// Returns commits per second.
    #[must_use]
    pub fn ops_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.successful_ops as f64 / secs
        } else {
            0.0
        }
    }

    /// Returns whether the ids form `first..=last` with no gaps or repeats.
    #[must_use]
    pub fn ids_are_gap_free(&self, first: u64) -> bool {
        self.tx_ids
            .iter()
            .enumerate()
            .all(|(i, &id)| id == first + i as u64)
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of committing threads.
    pub threads: usize,
    /// Commits per thread.
    pub commits_per_thread: usize,
    /// Explicit rotations to run while the committers work.
    pub rotations: usize,
    /// Commit through the resource manager with two phases.
    pub two_phase: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            commits_per_thread: 50,
            rotations: 0,
            two_phase: false,
        }
    }
}

/// Commits `make(thread, n)` from every thread and rotates alongside.
pub fn stress_commits<F>(ds: &DataSource, config: &StressConfig, make: F) -> StressTestResult
where
    F: Fn(usize, usize) -> TransactionRepresentation + Sync,
{
    let failed = AtomicUsize::new(0);
    let rotations = AtomicUsize::new(0);
    let start = Instant::now();

    let mut tx_ids: Vec<u64> = thread::scope(|scope| {
        let committers: Vec<_> = (0..config.threads)
            .map(|t| {
                let make = &make;
                let failed = &failed;
                scope.spawn(move || {
                    let mut ids = Vec::with_capacity(config.commits_per_thread);
                    for n in 0..config.commits_per_thread {
                        let tx = make(t, n);
                        let result = if config.two_phase {
                            commit_two_phase(ds, tx)
                        } else {
                            ds.commit(&tx).map(Some)
                        };
                        match result {
                            Ok(Some(id)) => ids.push(id.as_u64()),
                            Ok(None) => {}
                            Err(_) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    ids
                })
            })
            .collect();

        for _ in 0..config.rotations {
            thread::sleep(Duration::from_millis(1));
            if ds.rotate().is_ok() {
                rotations.fetch_add(1, Ordering::Relaxed);
            }
        }

        committers
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_default())
            .collect()
    });
    tx_ids.sort_unstable();

    StressTestResult {
        successful_ops: tx_ids.len(),
        failed_ops: failed.into_inner(),
        rotations: rotations.into_inner(),
        duration: start.elapsed(),
        tx_ids,
    }
}

fn commit_two_phase(ds: &DataSource, tx: TransactionRepresentation) -> CoreResult<Option<TransactionId>> {
    let rm = ds.resource_manager();
    let xid = new_xid(ds.name());
    rm.start(xid.clone(), tx)?;
    rm.prepare(&xid)?;
    rm.commit(&xid, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{legacy_index_transaction, node_transaction, TestLog};
    use txlog_core::{Config, ForceMode};

    fn read_back(log: &TestLog, from: u64) -> Vec<(u64, usize)> {
        log.get_cursor(TransactionId::new(from))
            .unwrap()
            .map(|tx| {
                let tx = tx.unwrap();
                (tx.commit.tx_id, tx.transaction.len())
            })
            .collect()
    }

    #[test]
    fn concurrent_commits_are_gap_free() {
        let log = TestLog::memory();
        let result = stress_commits(&log, &StressConfig::default(), |t, n| {
            node_transaction((t * 1000 + n) as u64, 1)
        });
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 200);
        assert!(result.ids_are_gap_free(1));
        assert_eq!(log.committed_tx_ids(), (1..=200).collect::<Vec<_>>());
    }

    #[test]
    fn batched_forcing_is_gap_free() {
        let log = TestLog::with_config(Config::new().force_mode(ForceMode::Batched {
            max_wait: Duration::from_millis(2),
        }));
        let result = stress_commits(&log, &StressConfig::default(), |t, n| {
            node_transaction((t * 1000 + n) as u64, 2)
        });
        assert_eq!(result.failed_ops, 0);
        assert!(result.ids_are_gap_free(1));

        let recovered = log.reopen_after(crate::crash::CrashKind::PowerLoss);
        assert_eq!(recovered.last_committed_tx().as_u64(), 200);
    }

    #[test]
    fn automatic_rotation_keeps_every_transaction() {
        let log = TestLog::with_config(Config::new().rotate_at_size(4 * 1024));
        let result = stress_commits(&log, &StressConfig::default(), |t, n| {
            node_transaction((t * 1000 + n) as u64, 3)
        });
        assert!(result.ids_are_gap_free(1));
        assert!(log.log().current_version() > 0);

        let read = read_back(&log, 1);
        assert_eq!(read.len(), 200);
        assert!(read.iter().enumerate().all(|(i, &(id, len))| id == i as u64 + 1 && len == 3));
    }

    #[test]
    fn cursor_is_unaffected_by_concurrent_rotation() {
        let log = TestLog::memory();
        for i in 1..=30 {
            log.commit(&node_transaction(i, (i % 3 + 1) as usize)).unwrap();
        }
        let mut cursor = log.get_cursor(TransactionId::new(1)).unwrap();
        let mut seen: Vec<(u64, usize)> = cursor
            .by_ref()
            .take(10)
            .map(|tx| {
                let tx = tx.unwrap();
                (tx.commit.tx_id, tx.transaction.len())
            })
            .collect();

        let config = StressConfig {
            threads: 2,
            commits_per_thread: 15,
            rotations: 3,
            two_phase: false,
        };
        let result = stress_commits(&log, &config, |t, n| {
            let id = (31 + t * 15 + n) as u64;
            node_transaction(id, (id % 3 + 1) as usize)
        });
        assert!(result.ids_are_gap_free(31));
        assert_eq!(result.rotations, 3);

        seen.extend(cursor.map(|tx| {
            let tx = tx.unwrap();
            (tx.commit.tx_id, tx.transaction.len())
        }));
        assert_eq!(seen.len(), 60);
        assert!(seen.iter().enumerate().all(|(i, &(id, _))| id == i as u64 + 1));
        assert_eq!(seen[..30], read_back(&log, 1)[..30]);
    }

    #[test]
    fn legacy_index_changes_apply_in_id_order() {
        let log = TestLog::memory();
        let config = StressConfig {
            threads: 4,
            commits_per_thread: 10,
            ..StressConfig::default()
        };
        let result = stress_commits(&log, &config, |t, n| {
            legacy_index_transaction("people", (t * 100 + n) as u64)
        });
        assert!(result.ids_are_gap_free(1));

        let order = log.applier.legacy_index_order();
        assert_eq!(order, (1..=40).collect::<Vec<_>>());
        assert!(log.appender().legacy_index_order().is_empty());
    }

    #[test]
    fn two_phase_commits_are_gap_free() {
        let log = TestLog::memory();
        let config = StressConfig {
            threads: 4,
            commits_per_thread: 10,
            two_phase: true,
            ..StressConfig::default()
        };
        let result = stress_commits(&log, &config, |t, n| node_transaction((t * 100 + n) as u64, 1));
        assert_eq!(result.failed_ops, 0);
        assert!(result.ids_are_gap_free(1));
        assert!(log.resource_manager().is_empty());
        assert_eq!(log.log().writer().in_flight_count(), 0);
        assert_eq!(log.committed_tx_ids(), (1..=40).collect::<Vec<_>>());
    }
}
