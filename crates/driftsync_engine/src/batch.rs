//! Batch execution strategies.

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

/// How a batch of operations is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    /// One at a time, in order.
    Sequential,
    /// All at once, up to `max_parallel` in flight.
    Parallel,
    /// Parallel sub-batches of `chunk_size`.
    Chunked,
    /// Picks one of the above from recent results.
    #[default]
    Adaptive,
}

/// Batch executor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Strategy to use.
    pub strategy: BatchStrategy,
    /// Sub-batch size for chunked execution.
    pub chunk_size: usize,
    /// Maximum operations in flight for parallel execution.
    pub max_parallel: usize,
    /// Batches this small run sequentially under the adaptive strategy.
    pub sequential_threshold: usize,
    /// Recent failure rate above which the adaptive strategy chunks.
    pub error_rate_threshold: f64,
    /// Batches remembered for adaptive decisions.
    pub sample_window: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            strategy: BatchStrategy::Adaptive,
            chunk_size: 10,
            max_parallel: 8,
            sequential_threshold: 2,
            error_rate_threshold: 0.25,
            sample_window: 10,
        }
    }
}

impl BatchConfig {
    /// Sets the strategy.
    pub fn with_strategy(mut self, strategy: BatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Sets the parallelism bound.
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max;
        self
    }
}

/// Whether an operation result counts as a failure.
pub trait BatchOutcome {
    /// Returns true for failures.
    fn is_failure(&self) -> bool;
}

impl<T, E> BatchOutcome for Result<T, E> {
    fn is_failure(&self) -> bool {
        self.is_err()
    }
}

/// Results of one batch, in input order.
#[derive(Debug, Clone)]
pub struct BatchReport<R> {
    /// Strategy actually used.
    pub strategy: BatchStrategy,
    /// Per-operation results, in input order.
    pub results: Vec<R>,
    /// Number of failed operations.
    pub failures: usize,
    /// Wall time.
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy)]
struct BatchSample {
    strategy: BatchStrategy,
    items: usize,
    failures: usize,
    duration: Duration,
}

/// Runs batches of independent operations.
///
/// One failing operation never aborts its siblings; every operation gets
/// its own result.
#[derive(Debug)]
pub struct BatchExecutor {
    config: BatchConfig,
    samples: Mutex<VecDeque<BatchSample>>,
}

impl BatchExecutor {
    /// Creates an executor.
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Failure rate over recent batches.
    pub fn recent_error_rate(&self) -> Option<f64> {
        let samples = self.samples.lock();
        let items: usize = samples.iter().map(|s| s.items).sum();
        if items == 0 {
            return None;
        }
        let failures: usize = samples.iter().map(|s| s.failures).sum();
        Some(failures as f64 / items as f64)
    }

    /// Recent throughput of `strategy` in operations per second.
    pub fn throughput(&self, strategy: BatchStrategy) -> Option<f64> {
        let samples = self.samples.lock();
        let (items, elapsed) = samples
            .iter()
            .filter(|s| s.strategy == strategy && !s.duration.is_zero())
            .fold((0usize, Duration::ZERO), |(items, elapsed), s| {
                (items + s.items, elapsed + s.duration)
            });
        if items == 0 || elapsed.is_zero() {
            return None;
        }
        Some(items as f64 / elapsed.as_secs_f64())
    }

    /// Strategy for a batch of `len` operations.
    pub fn choose(&self, len: usize) -> BatchStrategy {
        if self.config.strategy != BatchStrategy::Adaptive {
            return self.config.strategy;
        }
        if len <= self.config.sequential_threshold {
            return BatchStrategy::Sequential;
        }
        if self
            .recent_error_rate()
            .is_some_and(|rate| rate > self.config.error_rate_threshold)
        {
            return BatchStrategy::Chunked;
        }
        match (
            self.throughput(BatchStrategy::Parallel),
            self.throughput(BatchStrategy::Chunked),
        ) {
            (Some(parallel), Some(chunked)) if chunked > parallel * 1.1 => BatchStrategy::Chunked,
            _ => BatchStrategy::Parallel,
        }
    }

    /// Runs `run` over every item.
    pub async fn execute<T, R, F, Fut>(&self, items: Vec<T>, run: F) -> BatchReport<R>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = R>,
        R: BatchOutcome,
    {
        let strategy = self.choose(items.len());
        let count = items.len();
        let started = Instant::now();

        let results = match strategy {
            BatchStrategy::Parallel => {
                stream::iter(items)
                    .map(&run)
                    .buffered(self.config.max_parallel.max(1))
                    .collect::<Vec<R>>()
                    .await
            }
            BatchStrategy::Chunked => {
                let size = self.config.chunk_size.max(1);
                let mut results = Vec::with_capacity(count);
                let mut items = items.into_iter();
                loop {
                    let chunk: Vec<T> = items.by_ref().take(size).collect();
                    if chunk.is_empty() {
                        break;
                    }
                    results.extend(join_all(chunk.into_iter().map(&run)).await);
                }
                results
            }
            BatchStrategy::Sequential | BatchStrategy::Adaptive => {
                let mut results = Vec::with_capacity(count);
                for item in items {
                    results.push(run(item).await);
                }
                results
            }
        };

        let duration = started.elapsed();
        let failures = results.iter().filter(|r| r.is_failure()).count();
        self.record(BatchSample {
            strategy,
            items: count,
            failures,
            duration,
        });
        tracing::debug!(
            ?strategy,
            items = count,
            failures,
            duration_ms = duration.as_millis() as u64,
            "batch executed"
        );

        BatchReport {
            strategy,
            results,
            failures,
            duration,
        }
    }

    fn record(&self, sample: BatchSample) {
        if sample.items == 0 {
            return;
        }
        let mut samples = self.samples.lock();
        if samples.len() >= self.config.sample_window.max(1) {
            samples.pop_front();
        }
        samples.push_back(sample);
    }
}

impl Default for BatchExecutor {
    fn default() -> Self {
        Self::new(BatchConfig::default())
    }
}
