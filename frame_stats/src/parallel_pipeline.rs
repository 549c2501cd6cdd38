// THEORY:
// The parallel layer turns a list of units into a stream of unit outcomes and
// folds that stream into a `Report`.
//
// Key architectural principles:
// 1.  **Fire And Forget, Bounded**: Every unit is submitted up front as its own
//     task. A counting semaphore sized by the `WorkerPool` bounds how many of them
//     are actually decoding at once in a run. Decoding runs on the blocking pool.
// 2.  **Single-Owner Aggregation**: Workers send outcomes over an unbounded
//     channel to one aggregation task that owns the `Aggregator`. The running
//     moments are never touched by two tasks and need no lock.
// 3.  **Exactly One Outcome Per Unit**: Every worker sends exactly one outcome,
//     even when cancelled, so the aggregation task can account for every
//     dispatched unit and emit one progress event per unit.
// 4.  **Abort Closes The Gate**: Each run opens its own gate, a stop flag (seen
//     by running units at their next frame) and a semaphore (queued units never
//     start once it is closed). A fail-fast failure closes only its own run's
//     gate; an external abort closes the gates of every run in progress. Nothing
//     folded after an abort is ever reported.

use crate::core_modules::aggregator::Aggregator;
use crate::core_modules::moments::ChannelMoments;
use crate::core_modules::unit::{Unit, UnitProcessor};
use crate::error::{StatsError, UnitError};
use crate::pipeline::{FailurePolicy, PipelineConfig, Report, UnitFailure, VarianceConvention};
use crate::progress::{ProgressEvent, ProgressSink, UnitStatus};
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;

/// What a worker reports for its unit.
#[derive(Debug)]
pub enum UnitOutcome {
    Completed { unit: String, moments: ChannelMoments },
    Failed(UnitError),
}

/// The stop flag and semaphore of a single run. Every run gets a fresh gate, so a
/// run that was stopped never leaks into the next one.
#[derive(Debug)]
pub(crate) struct RunGate {
    stop: Arc<AtomicBool>,
    permits: Arc<Semaphore>,
}

impl RunGate {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            stop: Arc::new(AtomicBool::new(false)),
            permits: Arc::new(Semaphore::new(capacity)),
        })
    }

    fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.permits.close();
    }

    fn is_closed(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Stops the runs in progress: queued units are cancelled, running units stop at
/// their next frame. Runs started after the abort are unaffected.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    runs: Arc<Mutex<Vec<Weak<RunGate>>>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        for gate in self.live_runs() {
            gate.close();
        }
    }

    /// Whether any run currently in progress has been stopped.
    pub fn is_aborted(&self) -> bool {
        self.live_runs().iter().any(|gate| gate.is_closed())
    }

    fn register(&self, gate: &Arc<RunGate>) {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.retain(|run| run.strong_count() > 0);
        runs.push(Arc::downgrade(gate));
    }

    fn live_runs(&self) -> Vec<Arc<RunGate>> {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Runs `UnitProcessor` over units with at most `capacity` units in flight.
pub struct WorkerPool {
    processor: Arc<UnitProcessor>,
    capacity: usize,
    abort: AbortHandle,
    unit_timeout: Option<Duration>,
}

impl WorkerPool {
    pub fn new(
        processor: Arc<UnitProcessor>,
        capacity: usize,
        unit_timeout: Option<Duration>,
    ) -> Self {
        Self {
            processor,
            capacity: capacity.max(1),
            abort: AbortHandle::default(),
            unit_timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Opens the gate for a new run and registers it with the abort handle.
    pub(crate) fn open_gate(&self) -> Arc<RunGate> {
        let gate = RunGate::new(self.capacity);
        self.abort.register(&gate);
        gate
    }

    /// Spawns one task per unit behind `gate`. The returned channel closes once
    /// every task has sent its outcome.
    pub(crate) fn dispatch(
        &self,
        units: Vec<Unit>,
        gate: &Arc<RunGate>,
    ) -> (mpsc::UnboundedReceiver<UnitOutcome>, Vec<JoinHandle<()>>) {
        let (sender, receiver) = mpsc::unbounded_channel::<UnitOutcome>();

        let workers = units
            .into_iter()
            .map(|unit| {
                let sender = sender.clone();
                let permits = gate.permits.clone();
                let processor = self.processor.clone();
                let stop = gate.stop.clone();
                let unit_timeout = self.unit_timeout;

                tokio::spawn(async move {
                    let outcome = match permits.acquire_owned().await {
                        Ok(permit) => {
                            Self::process_unit(processor, unit, permit, stop, unit_timeout).await
                        }
                        // The semaphore is only closed when the run is stopped.
                        Err(_) => UnitOutcome::Failed(UnitError::Cancelled { unit: unit.id }),
                    };
                    let _ = sender.send(outcome);
                })
            })
            .collect();

        (receiver, workers)
    }

    async fn process_unit(
        processor: Arc<UnitProcessor>,
        unit: Unit,
        permit: OwnedSemaphorePermit,
        stop: Arc<AtomicBool>,
        unit_timeout: Option<Duration>,
    ) -> UnitOutcome {
        let id = unit.id.clone();
        let abandoned = Arc::new(AtomicBool::new(false));

        let mut task = {
            let abandoned = abandoned.clone();
            tokio::task::spawn_blocking(move || {
                let should_stop =
                    || stop.load(Ordering::Relaxed) || abandoned.load(Ordering::Relaxed);
                processor.process(&unit, &should_stop)
            })
        };

        let joined = match unit_timeout {
            None => task.await,
            Some(limit) => {
                let waited = tokio::time::timeout(limit, &mut task).await;
                match waited {
                    Ok(joined) => joined,
                    Err(_) => {
                        abandoned.store(true, Ordering::Relaxed);
                        tracing::warn!("Unit '{}' exceeded {:?}, abandoning it", id, limit);
                        // The permit is held until the blocking decode returns, so an
                        // abandoned unit still counts against the cap.
                        tokio::spawn(async move {
                            let _ = task.await;
                            drop(permit);
                        });
                        return UnitOutcome::Failed(UnitError::Timeout {
                            unit: id,
                            after: limit,
                        });
                    }
                }
            }
        };
        drop(permit);

        match joined {
            Ok(Ok(moments)) => UnitOutcome::Completed { unit: id, moments },
            Ok(Err(error)) => UnitOutcome::Failed(error),
            Err(join_error) => UnitOutcome::Failed(UnitError::Panicked {
                unit: id,
                message: join_error.to_string(),
            }),
        }
    }
}

/// Everything the aggregation task learned from the outcome stream.
struct Tally {
    aggregator: Aggregator,
    observed: usize,
    empty_units: Vec<String>,
    failed_units: Vec<UnitFailure>,
    cancelled: usize,
    first_error: Option<UnitError>,
}

/// Owns the `Aggregator` for the length of a run and folds outcomes as they arrive.
async fn aggregate(
    mut outcomes: mpsc::UnboundedReceiver<UnitOutcome>,
    total: usize,
    channels: usize,
    policy: FailurePolicy,
    mut progress: Box<dyn ProgressSink>,
    gate: Arc<RunGate>,
) -> Tally {
    let mut tally = Tally {
        aggregator: Aggregator::new(channels),
        observed: 0,
        empty_units: Vec::new(),
        failed_units: Vec::new(),
        cancelled: 0,
        first_error: None,
    };

    progress.on_start(total);

    while let Some(outcome) = outcomes.recv().await {
        tally.observed += 1;

        let (unit, status) = match outcome {
            UnitOutcome::Completed { unit, moments } => {
                if moments.is_empty() {
                    tracing::warn!("Unit '{}' has no frames and contributes nothing", unit);
                    tally.empty_units.push(unit.clone());
                } else {
                    tracing::debug!("Unit '{}' folded ({} pixels)", unit, moments.weight);
                }
                tally.aggregator.fold(&moments);
                (unit, UnitStatus::Completed)
            }
            UnitOutcome::Failed(UnitError::Cancelled { unit }) => {
                tally.cancelled += 1;
                (unit, UnitStatus::Cancelled)
            }
            UnitOutcome::Failed(error) => {
                let unit = error.unit().to_string();
                match policy {
                    FailurePolicy::FailFast => {
                        if tally.first_error.is_none() {
                            tracing::error!("{}; aborting run", error);
                            gate.close();
                            tally.first_error = Some(error);
                        }
                    }
                    FailurePolicy::BestEffort => {
                        tracing::warn!("{}; excluding unit", error);
                        tally.failed_units.push(UnitFailure {
                            unit: unit.clone(),
                            reason: error.to_string(),
                        });
                    }
                }
                (unit, UnitStatus::Failed)
            }
        };

        progress.on_unit(&ProgressEvent {
            unit,
            status,
            finished: tally.observed,
            total,
        });
    }

    progress.on_finish();
    tally
}

/// Drives a `WorkerPool` and an aggregation task to a `Report`.
pub struct Scheduler {
    pool: WorkerPool,
    channels: usize,
    policy: FailurePolicy,
    variance: VarianceConvention,
}

impl Scheduler {
    pub fn new(config: &PipelineConfig, processor: Arc<UnitProcessor>) -> Self {
        Self::with_pool(
            WorkerPool::new(processor, config.worker_cap(), config.unit_timeout()),
            config,
        )
    }

    /// Uses a pool built by the caller, e.g. with an exact capacity.
    pub fn with_pool(pool: WorkerPool, config: &PipelineConfig) -> Self {
        Self {
            pool,
            channels: config.channels,
            policy: config.failure_policy,
            variance: config.variance,
        }
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.pool.abort_handle()
    }

    /// Processes every unit and returns the dataset statistics. No statistics are
    /// returned unless every dispatched unit reported an outcome and the run was
    /// not aborted.
    pub async fn run(
        &self,
        units: Vec<Unit>,
        progress: Box<dyn ProgressSink>,
    ) -> Result<Report, StatsError> {
        let started = Instant::now();
        let total = units.len();
        if total == 0 {
            return Err(StatsError::EmptyDataset("no units discovered".to_string()));
        }

        tracing::info!(
            "Scheduling {} units for processing ({} concurrent)",
            total,
            self.pool.capacity()
        );

        let gate = self.pool.open_gate();
        let (outcomes, workers) = self.pool.dispatch(units, &gate);
        let aggregation = tokio::spawn(aggregate(
            outcomes,
            total,
            self.channels,
            self.policy,
            progress,
            gate.clone(),
        ));

        let tally = aggregation
            .await
            .map_err(|e| StatsError::Aggregation(e.to_string()))?;

        let lost = join_all(workers)
            .await
            .into_iter()
            .filter(|joined| joined.is_err())
            .count();
        if lost > 0 {
            tracing::error!("{} worker tasks ended without reporting", lost);
        }

        if let Some(error) = tally.first_error {
            return Err(error.into());
        }
        if gate.is_closed() {
            tracing::warn!("Run aborted after {} of {} units", tally.observed, total);
            return Err(StatsError::Aborted);
        }
        if tally.observed != total {
            return Err(StatsError::LostUnits {
                observed: tally.observed,
                dispatched: total,
            });
        }
        debug_assert_eq!(tally.cancelled, 0);

        let units_processed = tally.aggregator.folded() - tally.empty_units.len();
        let statistics = tally.aggregator.finalize(self.variance)?;
        let report = Report {
            statistics,
            units_total: total,
            units_processed,
            empty_units: tally.empty_units,
            failed_units: tally.failed_units,
            elapsed: started.elapsed(),
        };

        tracing::info!("{}", report);
        Ok(report)
    }
}
