//! Client-side throughput sampler. Samples a shared byte counter on a
//! fixed interval and records `(Mbps, cumulativeSeconds)` pairs. See
//! SPEC_FULL.md §4.6.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use tokio::time::sleep;

use crate::analyzer_io::ThroughputSample;

/// Shared byte counter the TCP/UDP receive paths increment on every
/// successful read, and the sampler reads deltas from.
#[derive(Default)]
pub struct ByteCounter(AtomicU64);

impl ByteCounter {
    /// Adds `n` bytes to the running total.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Background throughput sampler. `run` samples until `done` is set.
pub struct Sampler {
    counter: Arc<ByteCounter>,
    done: Arc<AtomicBool>,
}

impl Sampler {
    /// Creates a sampler reading from `counter`, stopping once `done` is
    /// set true by the send loop.
    #[must_use]
    pub fn new(counter: Arc<ByteCounter>, done: Arc<AtomicBool>) -> Self {
        Self { counter, done }
    }

    /// Samples every `sleep_time` (typically `duration/bucketCount`,
    /// ≈0.22s by default) and returns the accumulated sample once `done`
    /// is observed.
    pub async fn run(self, sleep_time: Duration) -> ThroughputSample {
        let mut xput = Vec::new();
        let mut t = Vec::new();
        let origin = Instant::now();
        let mut last = 0_u64;

        while !self.done.load(Ordering::Relaxed) {
            sleep(sleep_time).await;
            let now = self.counter.snapshot();
            let delta_bytes = now.saturating_sub(last);
            last = now;
            let mbps = (delta_bytes as f64 * 8.0) / sleep_time.as_secs_f64() / 1_000_000.0;
            xput.push(mbps);
            t.push(origin.elapsed().as_secs_f64());
        }

        ThroughputSample { xput, t }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", start_paused = true)]
    async fn samples_until_done() {
        let counter = Arc::new(ByteCounter::default());
        let done = Arc::new(AtomicBool::new(false));
        let sampler = Sampler::new(Arc::clone(&counter), Arc::clone(&done));

        let handle = tokio::spawn(sampler.run(Duration::from_millis(10)));

        counter.add(1_000_000);
        tokio::time::advance(Duration::from_millis(30)).await;
        done.store(true, Ordering::Relaxed);
        tokio::time::advance(Duration::from_millis(10)).await;

        let sample = handle.await.unwrap();
        assert!(sample.is_well_formed());
        assert!(!sample.xput.is_empty());
    }
}
