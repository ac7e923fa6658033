use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// One sliding-window entry: a fetched pass and the samples it yielded.
#[derive(Debug, Clone, Copy)]
struct Entry {
    at: Instant,
    bytes: usize,
    samples: u64,
}

/// Throughput accounting for a running acquisition: all-time totals plus
/// wire and sample rates over a 1 s sliding window.
#[derive(Debug)]
pub struct Counter {
    /// All-time total bytes fetched over the wire
    pub total_bytes: usize,
    /// All-time number of block passes
    pub n_passes: usize,
    /// All-time number of samples handed to the sink
    pub total_samples: u64,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    window: Duration,
    entries: VecDeque<Entry>,
    bytes_in_window: usize,
    samples_in_window: u64,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_bytes: 0,
            n_passes: 0,
            total_samples: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            entries: VecDeque::new(),
            bytes_in_window: 0,
            samples_in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average wire rate since t_begin, in MB/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.total_bytes as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Wire rate over the sliding window, in MB/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Delivered sample rate over the sliding window, in samples/s
    pub fn sample_rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        self.samples_in_window as f64 / secs
    }

    /// Record one fetched pass of `size` bytes.
    pub fn record_pass(&mut self, size: usize) {
        self.total_bytes += size;
        self.n_passes += 1;
        self.push(Entry {
            at: Instant::now(),
            bytes: size,
            samples: 0,
        });
    }

    /// Record samples handed to the sink.
    pub fn record_samples(&mut self, n: u64) {
        self.total_samples += n;
        self.push(Entry {
            at: Instant::now(),
            bytes: 0,
            samples: n,
        });
    }

    fn push(&mut self, entry: Entry) {
        let now = entry.at;
        self.bytes_in_window += entry.bytes;
        self.samples_in_window += entry.samples;
        self.entries.push_back(entry);

        // Evict anything older than `window`.
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.at) > self.window {
                self.bytes_in_window -= front.bytes;
                self.samples_in_window -= front.samples;
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Reset both all-time counters and the sliding window.
    pub fn reset(&mut self) {
        self.total_bytes = 0;
        self.n_passes = 0;
        self.total_samples = 0;
        self.t_begin = Instant::now();

        self.entries.clear();
        self.bytes_in_window = 0;
        self.samples_in_window = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate_and_reset() {
        let mut counter = Counter::new();
        counter.record_pass(1038);
        counter.record_pass(1038);
        counter.record_samples(640);
        assert_eq!(counter.n_passes, 2);
        assert_eq!(counter.total_bytes, 2076);
        assert_eq!(counter.total_samples, 640);
        assert!(counter.rate() > 0.0);

        counter.reset();
        assert_eq!(counter.n_passes, 0);
        assert_eq!(counter.total_bytes, 0);
        assert_eq!(counter.total_samples, 0);
        assert_eq!(counter.sample_rate(), 0.0);
    }

    #[test]
    fn window_rates_track_both_streams() {
        let mut counter = Counter::new();
        counter.record_pass(16 * 1038);
        counter.record_samples(1000);
        counter.record_samples(24);
        // 1 s window: rates equal the windowed totals.
        assert_eq!(counter.sample_rate(), 1024.0);
        assert!((counter.rate() - (16.0 * 1038.0) / (1024.0 * 1024.0)).abs() < 1e-9);
    }
}
