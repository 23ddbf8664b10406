//! Silence-based RTU frame assembly.
//!
//! Bytes are fed in as they arrive together with their arrival time. A frame
//! ends when the line has been quiet for t3.5; a gap above t1.5 in the middle
//! of a frame corrupts it. The assembler never looks at CRCs; that is the
//! dispatcher's job.

use crate::pdu::{MAX_FRAME_LEN, MIN_FRAME_LEN};
use crate::serial::FrameTiming;
use std::mem;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Idle,
    Receiving,
    /// An oversized frame was dropped; bytes are ignored until the next silence.
    Discarding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Oversized,
    InterCharGap,
    Runt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// Candidate frame, CRC not yet checked.
    Frame(Vec<u8>),
    Dropped { reason: DropReason, len: usize },
}

#[derive(Debug)]
pub struct FrameAssembler {
    timing: FrameTiming,
    state: AssemblerState,
    buffer: Vec<u8>,
    last_byte: Option<Instant>,
}

impl FrameAssembler {
    pub fn new(timing: FrameTiming) -> Self {
        Self {
            timing,
            state: AssemblerState::Idle,
            buffer: Vec::with_capacity(MAX_FRAME_LEN),
            last_byte: None,
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn timing(&self) -> FrameTiming {
        self.timing
    }

    /// Drop any partial frame and go back to idle.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = AssemblerState::Idle;
        self.last_byte = None;
    }

    /// When the current frame will be complete if no more bytes arrive.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            AssemblerState::Idle => None,
            _ => self.last_byte.map(|last| last + self.timing.inter_frame),
        }
    }

    /// Accept `bytes` received at `now`.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) -> Vec<Assembled> {
        let mut out = Vec::new();
        if bytes.is_empty() {
            return out;
        }

        if let Some(last) = self.last_byte {
            let gap = now.saturating_duration_since(last);
            if gap >= self.timing.inter_frame {
                out.extend(self.complete());
            } else if gap > self.timing.inter_char && self.state == AssemblerState::Receiving {
                tracing::debug!(
                    gap_us = gap.as_micros() as u64,
                    len = self.buffer.len(),
                    "Inter-character gap, dropping partial frame"
                );
                out.push(Assembled::Dropped {
                    reason: DropReason::InterCharGap,
                    len: self.buffer.len(),
                });
                self.buffer.clear();
                self.state = AssemblerState::Idle;
            }
        }
        self.last_byte = Some(now);

        match self.state {
            AssemblerState::Discarding => return out,
            AssemblerState::Idle => self.state = AssemblerState::Receiving,
            AssemblerState::Receiving => {}
        }

        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_FRAME_LEN {
            out.push(Assembled::Dropped {
                reason: DropReason::Oversized,
                len: self.buffer.len(),
            });
            self.buffer.clear();
            self.state = AssemblerState::Discarding;
        }
        out
    }

    /// Check for end-of-frame silence at `now`.
    pub fn poll(&mut self, now: Instant) -> Option<Assembled> {
        let last = self.last_byte?;
        if now.saturating_duration_since(last) < self.timing.inter_frame {
            return None;
        }
        self.complete()
    }

    fn complete(&mut self) -> Option<Assembled> {
        let state = mem::replace(&mut self.state, AssemblerState::Idle);
        self.last_byte = None;
        let buffer = mem::take(&mut self.buffer);
        match state {
            AssemblerState::Receiving if buffer.len() >= MIN_FRAME_LEN => {
                Some(Assembled::Frame(buffer))
            }
            AssemblerState::Receiving => Some(Assembled::Dropped {
                reason: DropReason::Runt,
                len: buffer.len(),
            }),
            AssemblerState::Idle | AssemblerState::Discarding => None,
        }
    }
}
