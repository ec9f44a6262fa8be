use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Serial number order of frame numbers: `a` comes before `b` if it is less than half the number
///  space behind it, so streams keep working when frame numbers wrap around.
fn precedes(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

struct UnackedFrame {
    payload: Bytes,
    last_sent: Instant,
}

/// Send side of one peer's reliable stream. Frame numbers are contiguous across transports:
///  frames sent directly are kept until acknowledged, frames handed to the (reliable) relay are
///  only counted.
pub struct ReliableSender {
    next_frame: u32,
    unacked: BTreeMap<u32, UnackedFrame>,
}

impl ReliableSender {
    pub fn new(first_frame: u32) -> ReliableSender {
        ReliableSender {
            next_frame: first_frame,
            unacked: BTreeMap::default(),
        }
    }

    pub fn next_frame_number(&self) -> u32 {
        self.next_frame
    }

    /// registers a frame sent over direct UDP, returning its frame number
    pub fn push_direct(&mut self, payload: Bytes, now: Instant) -> u32 {
        let frame_number = self.allocate();
        self.unacked.insert(frame_number, UnackedFrame { payload, last_sent: now });
        frame_number
    }

    /// allocates a frame number for a frame sent through the server relay
    pub fn push_relayed(&mut self) -> u32 {
        self.allocate()
    }

    fn allocate(&mut self) -> u32 {
        let frame_number = self.next_frame;
        self.next_frame = self.next_frame.wrapping_add(1);
        frame_number
    }

    /// cumulative ack: everything before `next_expected` arrived
    pub fn on_ack(&mut self, next_expected: u32) {
        let num_before = self.unacked.len();
        self.unacked.retain(|&frame_number, _| !precedes(frame_number, next_expected));
        trace!("ack up to {}: removed {} frames", next_expected, num_before - self.unacked.len());
    }

    pub fn num_unacked(&self) -> usize {
        self.unacked.len()
    }

    /// frames that were not acknowledged within `resend_interval` of their last transmission
    pub fn due_for_resend(&mut self, now: Instant, resend_interval: Duration) -> Vec<(u32, Bytes)> {
        let mut result = Vec::new();
        for (&frame_number, frame) in self.unacked.iter_mut() {
            if now.saturating_duration_since(frame.last_sent) >= resend_interval {
                frame.last_sent = now;
                result.push((frame_number, frame.payload.clone()));
            }
        }
        self.sort_oldest_first(&mut result);
        result
    }

    /// Hands over all unacknowledged frames in order, for re-sending through the relay with
    ///  their original frame numbers when the direct link is lost.
    pub fn take_unacked(&mut self) -> Vec<(u32, Bytes)> {
        let unacked = std::mem::take(&mut self.unacked);
        if !unacked.is_empty() {
            debug!("moving {} unacknowledged frames to the relay", unacked.len());
        }
        let mut result = unacked.into_iter()
            .map(|(frame_number, frame)| (frame_number, frame.payload))
            .collect::<Vec<_>>();
        self.sort_oldest_first(&mut result);
        result
    }

    /// map order differs from send order once frame numbers wrapped
    fn sort_oldest_first(&self, frames: &mut [(u32, Bytes)]) {
        let next_frame = self.next_frame;
        frames.sort_by_key(|(frame_number, _)| frame_number.wrapping_sub(next_frame));
    }
}

/// Receive side of one peer's reliable stream: frames may arrive out of order, twice, or on two
///  different paths; they are delivered exactly once and in frame number order.
pub struct ReliableReceiver {
    next_expected: u32,
    pending: BTreeMap<u32, Bytes>,
}

impl ReliableReceiver {
    /// upper bound for frames buffered ahead of a gap
    pub const MAX_PENDING: usize = 4096;

    pub fn new(first_frame: u32) -> ReliableReceiver {
        ReliableReceiver {
            next_expected: first_frame,
            pending: BTreeMap::default(),
        }
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub fn on_frame(&mut self, frame_number: u32, payload: Bytes) -> Vec<Bytes> {
        if precedes(frame_number, self.next_expected) {
            trace!("discarding duplicate frame {}", frame_number);
            return Vec::new();
        }

        if frame_number != self.next_expected && self.pending.len() >= Self::MAX_PENDING {
            debug!("receive buffer full - discarding frame {}, it will be resent", frame_number);
            return Vec::new();
        }

        match self.pending.entry(frame_number) {
            Entry::Occupied(_) => {
                trace!("discarding duplicate frame {}", frame_number);
                return Vec::new();
            }
            Entry::Vacant(e) => {
                e.insert(payload);
            }
        }

        let mut result = Vec::new();
        while let Some(payload) = self.pending.remove(&self.next_expected) {
            result.push(payload);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        result
    }
}
