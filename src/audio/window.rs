//! # Streaming Window Buffer
//!
//! Fixed-capacity ring buffer holding the most recent `sample_rate × window_seconds`
//! samples of a session's audio stream.
//!
//! ## Key Features:
//! - **Fixed capacity**: Decided at construction, never re-derived
//! - **O(chunk) appends**: New samples overwrite the oldest in place; nothing is
//!   shifted, so cost depends on the chunk size only
//! - **Chronological snapshots**: `snapshot()` unrolls the ring oldest-first
//!
//! ## Layout:
//! While filling, samples are appended to the backing `Vec` and `head` stays at 0.
//! Once full, `head` marks both the oldest sample and the next write position.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WindowBuffer {
    /// Backing storage, grows up to `capacity` and then stays that length
    samples: Vec<f32>,

    capacity: usize,

    /// Oldest sample / next write index once the buffer is full
    head: usize,

    sample_rate: u32,
}

impl WindowBuffer {
    /// Create a buffer holding `window_seconds` of audio at `sample_rate`.
    ///
    /// ## Example:
    /// 3 seconds at 16kHz gives a 48,000 sample window.
    pub fn new(sample_rate: u32, window_seconds: f32) -> Self {
        let capacity = (sample_rate as f64 * window_seconds as f64).round().max(0.0) as usize;
        Self::with_capacity(sample_rate, capacity)
    }

    pub fn with_capacity(sample_rate: u32, capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            head: 0,
            sample_rate,
        }
    }

    /// Append a chunk, evicting the oldest samples beyond capacity.
    pub fn add_chunk(&mut self, chunk: &[f32]) {
        if self.capacity == 0 || chunk.is_empty() {
            return;
        }

        // A chunk that alone fills the window replaces everything.
        if chunk.len() >= self.capacity {
            self.samples.clear();
            self.samples.extend_from_slice(&chunk[chunk.len() - self.capacity..]);
            self.head = 0;
            return;
        }

        let mut chunk = chunk;

        if self.samples.len() < self.capacity {
            let take = (self.capacity - self.samples.len()).min(chunk.len());
            self.samples.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
        }

        if chunk.is_empty() {
            return;
        }

        // Full: overwrite from head, wrapping at most once (chunk < capacity).
        let first = (self.capacity - self.head).min(chunk.len());
        self.samples[self.head..self.head + first].copy_from_slice(&chunk[..first]);
        let rest = chunk.len() - first;
        self.samples[..rest].copy_from_slice(&chunk[first..]);
        self.head = (self.head + chunk.len()) % self.capacity;
    }

    /// Current contents, oldest first. Does not modify the buffer.
    pub fn snapshot(&self) -> Vec<f32> {
        if self.samples.len() < self.capacity || self.head == 0 {
            return self.samples.clone();
        }

        let mut ordered = Vec::with_capacity(self.capacity);
        ordered.extend_from_slice(&self.samples[self.head..]);
        ordered.extend_from_slice(&self.samples[..self.head]);
        ordered
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Duration of audio currently buffered.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}
