//! Bulk prediction: drives one oracle across every pending statement of a
//! dialect with bounded parallelism and durable, at-most-once persistence.
//!
//! Pipeline shape:
//!
//! ```text
//! pending selection → bounded queue → worker pool → results queue → store
//!     (producer)      (backpressure)   (predict)     (single writer)
//! ```
//!
//! The producer blocks once workers are saturated; exactly one loop drains
//! the results queue and writes predictions, so the store never sees
//! concurrent writers. Workers hold the only result senders: when the last
//! one exits, the results queue disconnects and the writer observes
//! end-of-stream only after draining everything already enqueued, so no
//! computed verdict is dropped.
//!
//! Verdicts may land in any order. The only cross-run guarantee is the
//! per-(statement, oracle, dialect) uniqueness upheld by pending selection.

use std::num::NonZeroUsize;
use std::thread;

use anyhow::Result;
use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use sqlverdict_core::{Dialect, Oracle, OracleError, Prediction};
use sqlverdict_store_sqlite::SqliteCorpusStore;

/// Floor keeping the producer/worker/writer stages meaningfully concurrent
/// even for tiny batches.
pub const MIN_WORKERS: usize = 2;

/// Worker-count policy: bound parallelism to the hardware while never
/// allocating more workers than there is work to hand out.
#[must_use]
pub fn worker_count(available_parallelism: usize, pending: usize) -> usize {
    (2 * available_parallelism)
        .saturating_sub(1)
        .min(pending.saturating_sub(1))
        .max(MIN_WORKERS)
}

fn default_worker_count(pending: usize) -> usize {
    let available = thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    worker_count(available, pending)
}

/// Observer invoked once per **persisted** prediction, so observable
/// progress reflects durable state rather than computed-but-unwritten
/// verdicts.
pub type ProgressFn = Box<dyn FnMut(usize, usize)>;

#[derive(Default)]
pub struct PredictOptions {
    /// Overrides the worker-count policy; clamped to at least one worker.
    pub workers: Option<usize>,
    pub progress: Option<ProgressFn>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The pending set was empty; nothing was executed. Not an error.
    NothingPending,
    Completed,
}

/// Report of one bulk-prediction run, serialized by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PredictReport {
    pub oracle_id: i64,
    pub oracle_name: String,
    pub dialect: Dialect,
    pub outcome: RunOutcome,
    pub pending: usize,
    pub persisted: usize,
    pub workers: usize,
}

/// Runs one oracle over every statement of `dialect` that it has not yet
/// predicted.
///
/// Infrastructure failures (an [`OracleError::Engine`] from a worker, a
/// failed write) abort the whole run: skipping the failing statement would
/// silently under-report verdicts. Predictions persisted before the abort
/// stay persisted; the next run resumes from the shrunken pending set.
/// There is no retry policy for any failure class.
///
/// # Errors
/// Returns the first oracle or store error encountered; the worker pool is
/// fully unwound before this function returns.
pub fn bulk_predict(
    store: &SqliteCorpusStore,
    oracle: &(dyn Oracle + Sync),
    dialect: Dialect,
    mut options: PredictOptions,
) -> Result<PredictReport> {
    let identity = oracle.identity().clone();
    store.register_oracle(&identity)?;

    let pending = store.pending_statements(dialect, identity.id)?;
    let total = pending.len();
    if pending.is_empty() {
        info!(oracle = %identity.name, dialect = %dialect, "no pending statements");
        return Ok(PredictReport {
            oracle_id: identity.id,
            oracle_name: identity.name,
            dialect,
            outcome: RunOutcome::NothingPending,
            pending: 0,
            persisted: 0,
            workers: 0,
        });
    }

    let workers = options
        .workers
        .unwrap_or_else(|| default_worker_count(total))
        .max(1);
    info!(
        oracle = %identity.name,
        dialect = %dialect,
        pending = total,
        workers,
        "starting bulk prediction"
    );

    let (input_tx, input_rx) = bounded(workers);
    let (result_tx, result_rx) = bounded::<Result<Prediction, OracleError>>(workers);

    let mut persisted = 0_usize;
    let mut first_error: Option<anyhow::Error> = None;

    thread::scope(|scope| {
        scope.spawn(move || {
            for statement in pending {
                // A send failure means every worker is gone: the run is
                // already aborting.
                if input_tx.send(statement).is_err() {
                    break;
                }
            }
        });

        for worker in 0..workers {
            let input_rx = input_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for statement in input_rx.iter() {
                    let outcome = oracle.predict(&statement);
                    let failed = outcome.is_err();
                    if result_tx.send(outcome).is_err() || failed {
                        break;
                    }
                }
                debug!(worker, "worker drained");
            });
        }
        drop(input_rx);
        drop(result_tx);

        loop {
            match result_rx.recv() {
                Ok(Ok(prediction)) => {
                    if let Err(err) = store.insert_prediction(&prediction) {
                        first_error = Some(err);
                        break;
                    }
                    persisted += 1;
                    if let Some(progress) = options.progress.as_mut() {
                        progress(persisted, total);
                    }
                }
                Ok(Err(err)) => {
                    first_error = Some(anyhow::Error::new(err));
                    break;
                }
                // All workers done and every enqueued result drained.
                Err(_) => break,
            }
        }
        // Unblocks any worker still parked on a full results queue.
        drop(result_rx);
    });

    if let Some(err) = first_error {
        return Err(err.context(format!(
            "bulk prediction aborted after {persisted}/{total} persisted"
        )));
    }

    info!(
        oracle = %identity.name,
        dialect = %dialect,
        persisted,
        "bulk prediction complete"
    );
    Ok(PredictReport {
        oracle_id: identity.id,
        oracle_name: identity.name,
        dialect,
        outcome: RunOutcome::Completed,
        pending: total,
        persisted,
        workers,
    })
}
