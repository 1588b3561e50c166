use std::collections::VecDeque;

use tokio::time::Instant;

/// Number of most recent intervals the average is taken over.
const SAMPLES: usize = 2;

/// Measures the time between consecutive marks of a polling loop.
#[derive(Debug, Default)]
pub struct TimeCounter {
    reference: Option<Instant>,
    intervals_ms: VecDeque<u64>,
}

impl TimeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_start(&mut self) {
        self.reference = Some(Instant::now());
    }

    /// Records the time elapsed since the previous mark and moves the reference here.
    pub fn add_time_mark(&mut self) {
        let now = Instant::now();
        if let Some(reference) = self.reference {
            let elapsed = now.saturating_duration_since(reference).as_millis() as u64;
            if self.intervals_ms.len() == SAMPLES {
                self.intervals_ms.pop_front();
            }
            self.intervals_ms.push_back(elapsed);
        }
        self.reference = Some(now);
    }

    /// Average of the last two intervals in milliseconds, `0` before any interval.
    pub fn average_time_between_marks(&self) -> u64 {
        if self.intervals_ms.is_empty() {
            return 0;
        }
        self.intervals_ms.iter().sum::<u64>() / self.intervals_ms.len() as u64
    }
}
