//! Lead-tracking outbound audio pacer (spec §4.B).
//!
//! Fixed-interval sleeps accumulate drift and produce bursts; instead we
//! track how far ahead of the wall clock the stream already is and only
//! sleep the difference. Keeps at most `target_lead_ms` of buffer ahead of
//! real time.

use tokio::time::{Duration, Instant};

pub struct AudioPacer {
    start: Instant,
    sent_duration_ms: u64,
    target_lead_ms: u64,
    hysteresis_ms: u64,
    max_wait_ms: u64,
}

impl AudioPacer {
    pub fn new(target_lead_ms: u64, hysteresis_ms: u64, max_wait_ms: u64) -> Self {
        Self {
            start: Instant::now(),
            sent_duration_ms: 0,
            target_lead_ms,
            hysteresis_ms,
            max_wait_ms,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Sleep if the stream has gotten more than `target_lead_ms - hysteresis_ms`
    /// ahead of the wall clock.
    pub async fn pace(&mut self) {
        let elapsed = self.elapsed_ms();
        let lead = self.sent_duration_ms as i64 - elapsed as i64;
        let threshold = self.target_lead_ms as i64 - self.hysteresis_ms as i64;
        if lead > threshold {
            let wait = (lead - self.target_lead_ms as i64).max(0) as u64;
            let wait = wait.min(self.max_wait_ms);
            if wait > 0 {
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }
        }
    }

    /// Record that a chunk of `duration_ms` was just sent.
    pub fn on_sent(&mut self, duration_ms: u64) {
        self.sent_duration_ms += duration_ms;
    }

    /// Restart a new utterance: zero the lead without touching the wall
    /// clock origin, so pacing stays consistent across utterances within
    /// the same call.
    pub fn reset(&mut self) {
        self.sent_duration_ms = self.elapsed_ms();
    }

    pub fn lead_ms(&self) -> i64 {
        self.sent_duration_ms as i64 - self.elapsed_ms() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stays_within_lead_bound_over_n_chunks() {
        let mut pacer = AudioPacer::new(60, 10, 100);
        let chunk_ms = 20u64;
        let n = 50;
        for _ in 0..n {
            pacer.pace().await;
            pacer.on_sent(chunk_ms);
        }
        let elapsed = pacer.elapsed_ms() as i64;
        let target = (n * chunk_ms) as i64;
        assert!(
            (elapsed - target).abs() <= 60,
            "elapsed {elapsed} too far from target {target}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reset_keeps_wall_clock_and_zeroes_lead() {
        let mut pacer = AudioPacer::new(60, 10, 100);
        pacer.on_sent(500);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(pacer.lead_ms(), 400);
        pacer.reset();
        assert_eq!(pacer.lead_ms(), 0);
        assert!(pacer.elapsed_ms() >= 100);
    }
}
