//! Adaptive, sequence-ordered RTP jitter buffer (spec §4.C).
//!
//! Only instantiated when `SessionConfig::transport` selects RTP; the
//! WebSocket transport used for FreeSWITCH's `mod_audio_stream` does not
//! need sequence reordering.

use std::collections::VecDeque;

/// An RTP packet as seen by the jitter buffer: sequence number, arrival
/// instant (ms since an arbitrary epoch) and nominal send timestamp.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub sequence: u16,
    pub arrival_ms: u64,
    pub rtp_timestamp: u32,
    pub payload: Vec<u8>,
}

/// `true` if `a` is sequence-earlier than `b` under 16-bit wraparound.
fn serial_lt(a: u16, b: u16) -> bool {
    let diff = a.wrapping_sub(b);
    diff > 0x8000
}

pub struct JitterBuffer {
    min_packets: usize,
    max_packets: usize,
    queue: VecDeque<RtpPacket>,
    started: bool,
    dropped_overflow: u64,
    underruns: u64,
    /// EMA jitter estimate per RFC 3550 §A.8, units: RTP timestamp clocks.
    jitter: f64,
    last_arrival_ms: Option<u64>,
    last_rtp_timestamp: Option<u32>,
    clock_rate: u32,
}

impl JitterBuffer {
    pub fn new(min_packets: usize, max_packets: usize, clock_rate: u32) -> Self {
        Self {
            min_packets,
            max_packets,
            queue: VecDeque::new(),
            started: false,
            dropped_overflow: 0,
            underruns: 0,
            jitter: 0.0,
            last_arrival_ms: None,
            last_rtp_timestamp: None,
            clock_rate,
        }
    }

    pub fn jitter_estimate(&self) -> f64 {
        self.jitter
    }

    pub fn dropped_overflow(&self) -> u64 {
        self.dropped_overflow
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    /// Insert a packet in sequence order, updating the jitter EMA and
    /// dropping the oldest packet on overflow.
    pub fn push(&mut self, packet: RtpPacket) {
        self.update_jitter(&packet);

        if self.queue.len() >= self.max_packets {
            self.queue.pop_front();
            self.dropped_overflow += 1;
        }

        let pos = self
            .queue
            .iter()
            .position(|p| serial_lt(packet.sequence, p.sequence))
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, packet);

        if !self.started && self.queue.len() >= self.min_packets {
            self.started = true;
        }
    }

    fn update_jitter(&mut self, packet: &RtpPacket) {
        if let (Some(last_arrival), Some(last_rtp)) =
            (self.last_arrival_ms, self.last_rtp_timestamp)
        {
            let arrival_diff_clocks =
                ((packet.arrival_ms as i64 - last_arrival as i64) * self.clock_rate as i64) / 1000;
            let rtp_diff = packet.rtp_timestamp as i64 - last_rtp as i64;
            let d = (arrival_diff_clocks - rtp_diff).unsigned_abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_arrival_ms = Some(packet.arrival_ms);
        self.last_rtp_timestamp = Some(packet.rtp_timestamp);
    }

    /// Pop the next packet in sequence order if the buffer has started and
    /// is non-empty; otherwise signals underrun and resets to not-started.
    pub fn pop(&mut self) -> Option<RtpPacket> {
        if !self.started {
            return None;
        }
        match self.queue.pop_front() {
            Some(p) => Some(p),
            None => {
                self.underruns += 1;
                self.started = false;
                None
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(seq: u16) -> RtpPacket {
        RtpPacket {
            sequence: seq,
            arrival_ms: seq as u64 * 20,
            rtp_timestamp: seq as u32 * 160,
            payload: vec![0; 160],
        }
    }

    #[test]
    fn sequence_wraparound_pop_order() {
        let mut jb = JitterBuffer::new(1, 100, 8000);
        for seq in [65534u16, 65535, 0, 1] {
            jb.push(pkt(seq));
        }
        let order: Vec<u16> = std::iter::from_fn(|| jb.pop().map(|p| p.sequence)).collect();
        assert_eq!(order, vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn warmup_gates_delivery_until_min_packets() {
        let mut jb = JitterBuffer::new(3, 100, 8000);
        jb.push(pkt(0));
        assert!(jb.pop().is_none());
        jb.push(pkt(1));
        jb.push(pkt(2));
        assert!(jb.is_started());
        assert!(jb.pop().is_some());
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut jb = JitterBuffer::new(1, 2, 8000);
        jb.push(pkt(0));
        jb.push(pkt(1));
        jb.push(pkt(2));
        assert_eq!(jb.dropped_overflow(), 1);
        assert_eq!(jb.len(), 2);
    }

    #[test]
    fn underrun_marks_not_started() {
        let mut jb = JitterBuffer::new(1, 100, 8000);
        jb.push(pkt(0));
        assert!(jb.pop().is_some());
        assert!(jb.pop().is_none());
        assert_eq!(jb.underruns(), 1);
        assert!(!jb.is_started());
    }
}
