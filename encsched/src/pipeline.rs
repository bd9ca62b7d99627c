//! Per-frame recycle slots.
//!
//! A fixed ring of slots lets several frames be in flight at once. A slot is
//! claimed by the submitter, released once its work has been handed to the
//! kernel side, and may only be claimed again after the fence reports that
//! its previous frame retired.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::block_qp::{BlockStats, QpMap};
use crate::error::{ConfigError, PipelineError};
use crate::rc::FrameDecision;

pub const MIN_RECYCLE_SLOTS: usize = 2;
pub const MAX_RECYCLE_SLOTS: usize = 8;
pub const DEFAULT_RECYCLE_SLOTS: usize = 2;

pub trait RetireFence {
    /// Blocks until `frame` has retired or `timeout` elapses. Returns whether
    /// the frame retired.
    fn wait_retired(&mut self, frame: u64, timeout: Duration) -> bool;
}

/// Fence for software-only pipelines where work retires on submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateFence;

impl RetireFence for ImmediateFence {
    fn wait_retired(&mut self, _frame: u64, _timeout: Duration) -> bool {
        true
    }
}

/// Fence fed with retired frame numbers over a channel.
#[derive(Debug)]
pub struct ChannelFence {
    rx: Receiver<u64>,
    watermark: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FenceSignal {
    tx: Sender<u64>,
}

impl FenceSignal {
    /// Reports `frame` (and every frame before it) as retired. Returns false
    /// once the fence has been dropped.
    pub fn retire(&self, frame: u64) -> bool {
        self.tx.send(frame).is_ok()
    }
}

impl ChannelFence {
    pub fn new() -> (Self, FenceSignal) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Self {
                rx,
                watermark: None,
            },
            FenceSignal { tx },
        )
    }

    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    fn is_retired(&self, frame: u64) -> bool {
        self.watermark.is_some_and(|w| w >= frame)
    }

    fn observe(&mut self, frame: u64) {
        self.watermark = Some(self.watermark.map_or(frame, |w| w.max(frame)));
    }
}

impl RetireFence for ChannelFence {
    fn wait_retired(&mut self, frame: u64, timeout: Duration) -> bool {
        while let Ok(retired) = self.rx.try_recv() {
            self.observe(retired);
        }
        if self.is_retired(frame) {
            return true;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(retired) => {
                    self.observe(retired);
                    if self.is_retired(frame) {
                        return true;
                    }
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return false,
            }
        }
    }
}

/// Transient per-frame state. Reused across frames; History never lives here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameSlot {
    pub block_stats: Vec<BlockStats>,
    pub decision: Option<FrameDecision>,
    pub qp_map: QpMap,
}

impl FrameSlot {
    fn clear(&mut self) {
        self.block_stats.clear();
        self.decision = None;
        self.qp_map.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Claimed { frame: u64, generation: u64 },
    InFlight { frame: u64 },
}

/// Claim on one slot. Not `Clone`: it is consumed by `release` or `abandon`.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotHandle {
    index: usize,
    frame: u64,
    generation: u64,
}

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }
}

#[derive(Debug)]
pub struct RecyclePool<F> {
    slots: Vec<FrameSlot>,
    states: Vec<SlotState>,
    next: usize,
    generation: u64,
    fence: F,
    timeout: Duration,
    stalled: Option<PipelineError>,
}

impl<F: RetireFence> RecyclePool<F> {
    pub fn new(slots: usize, fence: F, timeout: Duration) -> Result<Self, ConfigError> {
        if !(MIN_RECYCLE_SLOTS..=MAX_RECYCLE_SLOTS).contains(&slots) {
            return Err(ConfigError::RecycleSlots(slots));
        }
        Ok(Self {
            slots: vec![FrameSlot::default(); slots],
            states: vec![SlotState::Free; slots],
            next: 0,
            generation: 0,
            fence,
            timeout,
            stalled: None,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.is_some()
    }

    pub fn fence_mut(&mut self) -> &mut F {
        &mut self.fence
    }

    pub fn acquire(&mut self, frame: u64) -> Result<SlotHandle, PipelineError> {
        if let Some(err) = &self.stalled {
            return Err(err.clone());
        }

        let index = self.next;
        match self.states[index] {
            SlotState::Claimed { .. } => {
                return Err(PipelineError::Exhausted {
                    slots: self.slots.len(),
                });
            }
            SlotState::InFlight { frame: previous } => {
                if !self.fence.wait_retired(previous, self.timeout) {
                    warn!(
                        slot = index,
                        frame = previous,
                        timeout = ?self.timeout,
                        "recycle slot did not retire in time, pipeline stalled"
                    );
                    let err = PipelineError::Stalled {
                        slot: index,
                        frame: previous,
                        timeout: self.timeout,
                    };
                    self.stalled = Some(err.clone());
                    return Err(err);
                }
            }
            SlotState::Free => {}
        }

        self.slots[index].clear();
        self.generation += 1;
        self.states[index] = SlotState::Claimed {
            frame,
            generation: self.generation,
        };
        self.next = (index + 1) % self.slots.len();
        debug!(slot = index, frame, "claimed recycle slot");

        Ok(SlotHandle {
            index,
            frame,
            generation: self.generation,
        })
    }

    pub fn slot(&self, handle: &SlotHandle) -> Result<&FrameSlot, PipelineError> {
        self.check(handle)?;
        Ok(&self.slots[handle.index])
    }

    pub fn slot_mut(&mut self, handle: &SlotHandle) -> Result<&mut FrameSlot, PipelineError> {
        self.check(handle)?;
        Ok(&mut self.slots[handle.index])
    }

    /// Hands the slot to the kernel side; it stays busy until its frame retires.
    pub fn release(&mut self, handle: SlotHandle) -> Result<(), PipelineError> {
        self.check(&handle)?;
        self.states[handle.index] = SlotState::InFlight {
            frame: handle.frame,
        };
        Ok(())
    }

    /// Returns a claim that was never submitted and rewinds the ring to it.
    pub fn abandon(&mut self, handle: SlotHandle) -> Result<(), PipelineError> {
        self.check(&handle)?;
        self.slots[handle.index].clear();
        self.states[handle.index] = SlotState::Free;
        if (handle.index + 1) % self.slots.len() == self.next {
            self.next = handle.index;
        }
        debug!(slot = handle.index, frame = handle.frame, "abandoned recycle slot");
        Ok(())
    }

    /// Forgets every in-flight frame and clears a stall.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.states.fill(SlotState::Free);
        self.next = 0;
        self.stalled = None;
        debug!(slots = self.slots.len(), "recycle pool reset");
    }

    fn check(&self, handle: &SlotHandle) -> Result<(), PipelineError> {
        let expected = SlotState::Claimed {
            frame: handle.frame,
            generation: handle.generation,
        };
        match self.states.get(handle.index) {
            Some(state) if *state == expected => Ok(()),
            _ => Err(PipelineError::ForeignHandle),
        }
    }
}
