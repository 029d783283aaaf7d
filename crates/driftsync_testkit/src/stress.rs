//! Stress utilities for the priority queue.
//!
//! Worker threads hammer a shared queue while the run records peak
//! concurrency per tier and the order operations on each record complete in.

use driftsync_queue::{OperationKind, OperationPayload, Priority, PriorityQueue, QueueConfig, QueueItem};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Configuration for a queue stress run.
#[derive(Debug, Clone)]
pub struct QueueStressConfig {
    /// Operations to enqueue.
    pub operations: usize,
    /// Worker threads.
    pub workers: usize,
    /// Distinct records the operations are spread over.
    pub records: usize,
    /// Simulated work per operation.
    pub work: Duration,
    /// Queue configuration.
    pub queue: QueueConfig,
}

impl Default for QueueStressConfig {
    fn default() -> Self {
        Self {
            operations: 400,
            workers: 8,
            records: 40,
            work: Duration::from_micros(50),
            queue: QueueConfig::default(),
        }
    }
}

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressResult {
    /// Operations accepted by the queue.
    pub accepted: usize,
    /// Operations rejected at capacity.
    pub rejected: usize,
    /// Operations completed.
    pub completed: usize,
    /// Peak in-flight operations per tier, in tier order.
    pub peak_in_flight: [usize; 4],
    /// Records whose operations completed out of enqueue order.
    pub order_violations: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressResult {
    /// Peak in-flight operations for `priority`.
    pub fn peak(&self, priority: Priority) -> usize {
        self.peak_in_flight[priority.index()]
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Accepted: {}", self.accepted);
        println!("Rejected: {}", self.rejected);
        println!("Completed: {}", self.completed);
        println!("Peak in flight: {:?}", self.peak_in_flight);
        println!("Order violations: {}", self.order_violations);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Runs a queue stress test.
///
/// Operations cycle through the tiers and records, so every record sees
/// operations at several priorities.
pub fn run_queue_stress(config: &QueueStressConfig) -> StressResult {
    let queue = Arc::new(PriorityQueue::new(config.queue.clone()));
    let records = config.records.max(1);

    let mut accepted = 0;
    let mut rejected = 0;
    for n in 0..config.operations {
        let record = format!("r{}", n % records);
        let priority = Priority::ALL[n % Priority::ALL.len()];
        let item = QueueItem::new("stress", record, OperationKind::Delete, OperationPayload::Empty)
            .with_priority(priority);
        match queue.enqueue(item) {
            Ok(_) => accepted += 1,
            Err(err) if err.is_capacity() => rejected += 1,
            Err(err) => panic!("unexpected enqueue error: {err}"),
        }
    }

    let in_flight: Arc<[AtomicUsize; 4]> = Arc::new(Default::default());
    let peaks: Arc<[AtomicUsize; 4]> = Arc::new(Default::default());
    let completed = Arc::new(AtomicUsize::new(0));
    let observed: Arc<Mutex<HashMap<String, Vec<u64>>>> = Arc::new(Mutex::new(HashMap::new()));

    let start = Instant::now();
    let handles: Vec<_> = (0..config.workers.max(1))
        .map(|_| {
            let queue = Arc::clone(&queue);
            let in_flight = Arc::clone(&in_flight);
            let peaks = Arc::clone(&peaks);
            let completed = Arc::clone(&completed);
            let observed = Arc::clone(&observed);
            let work = config.work;
            thread::spawn(move || {
                while completed.load(Ordering::SeqCst) < accepted {
                    let Some(item) = queue.dequeue(Instant::now()) else {
                        thread::yield_now();
                        continue;
                    };
                    let tier = item.priority.index();
                    let now = in_flight[tier].fetch_add(1, Ordering::SeqCst) + 1;
                    peaks[tier].fetch_max(now, Ordering::SeqCst);
                    // Record before completing so the next item for the
                    // record cannot overtake this one in the log.
                    observed
                        .lock()
                        .expect("Order log poisoned")
                        .entry(item.record_id.clone())
                        .or_default()
                        .push(item.sequence);
                    if !work.is_zero() {
                        thread::sleep(work);
                    }
                    in_flight[tier].fetch_sub(1, Ordering::SeqCst);
                    queue.complete(item.id).expect("Failed to complete item");
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("Stress worker panicked");
    }
    let duration = start.elapsed();

    let observed = observed.lock().expect("Order log poisoned");
    let order_violations = observed
        .values()
        .filter(|sequences| sequences.windows(2).any(|pair| pair[0] >= pair[1]))
        .count();
    let completed = completed.load(Ordering::SeqCst);
    let ops_per_second = if duration.as_secs_f64() > 0.0 {
        completed as f64 / duration.as_secs_f64()
    } else {
        0.0
    };

    StressResult {
        accepted,
        rejected,
        completed,
        peak_in_flight: [
            peaks[0].load(Ordering::SeqCst),
            peaks[1].load(Ordering::SeqCst),
            peaks[2].load(Ordering::SeqCst),
            peaks[3].load(Ordering::SeqCst),
        ],
        order_violations,
        duration,
        ops_per_second,
    }
}
