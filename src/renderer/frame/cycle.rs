use crate::renderer::error::{HriError, Result};

/// Lifecycle of the frame currently being produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    Idle,
    FrameAcquired,
    Recording,
    Submitted,
    Presented,
}

/// Round-robin bookkeeping over a fixed number of frame slots.
///
/// A slot can only be handed out again after its fence has been observed signaled, so two
/// frames never share a slot while the first one may still be executing on the GPU.
#[derive(Debug)]
pub struct FrameCycle {
    stage: FrameStage,
    current: usize,
    in_flight: Vec<bool>,
    frames_started: u64,
}

impl FrameCycle {
    pub fn new(depth: usize) -> Result<Self> {
        if !(2..=3).contains(&depth) {
            return Err(HriError::precondition(format!(
                "Frame buffering depth must be 2 or 3, got {depth}",
            )));
        }

        Ok(Self {
            stage: FrameStage::Idle,
            current: 0,
            in_flight: vec![false; depth],
            frames_started: 0,
        })
    }

    pub fn depth(&self) -> usize {
        self.in_flight.len()
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn previous_slot(&self) -> usize {
        (self.current + self.depth() - 1) % self.depth()
    }

    pub fn stage(&self) -> FrameStage {
        self.stage
    }

    pub fn frames_started(&self) -> u64 {
        self.frames_started
    }

    pub fn is_in_flight(&self, slot: usize) -> bool {
        self.in_flight.get(slot).copied().unwrap_or(false)
    }

    /// Record that the fence of `slot` was observed signaled
    pub fn mark_retired(&mut self, slot: usize) -> Result<()> {
        let in_flight = self
            .in_flight
            .get_mut(slot)
            .ok_or_else(|| HriError::precondition(format!("Frame slot {slot} does not exist")))?;
        *in_flight = false;
        Ok(())
    }

    /// Idle -> FrameAcquired, only once the current slot has retired
    pub fn acquire(&mut self) -> Result<usize> {
        self.expect_stage(FrameStage::Idle, "begin a frame")?;
        if self.in_flight[self.current] {
            return Err(HriError::precondition(format!(
                "Frame slot {} is still in flight",
                self.current,
            )));
        }
        self.stage = FrameStage::FrameAcquired;
        self.frames_started += 1;
        Ok(self.current)
    }

    /// FrameAcquired -> Recording
    pub fn start_recording(&mut self) -> Result<()> {
        self.expect_stage(FrameStage::FrameAcquired, "start recording")?;
        self.stage = FrameStage::Recording;
        Ok(())
    }

    /// Recording -> Submitted, the slot stays in flight until its fence retires
    pub fn submit(&mut self) -> Result<usize> {
        self.expect_stage(FrameStage::Recording, "submit a frame")?;
        self.in_flight[self.current] = true;
        self.stage = FrameStage::Submitted;
        Ok(self.current)
    }

    /// Submitted -> Presented
    pub fn present(&mut self) -> Result<()> {
        self.expect_stage(FrameStage::Submitted, "present a frame")?;
        self.stage = FrameStage::Presented;
        Ok(())
    }

    /// Presented -> Idle, advancing to the next slot
    pub fn finish(&mut self) -> Result<usize> {
        self.expect_stage(FrameStage::Presented, "finish a frame")?;
        self.current = (self.current + 1) % self.depth();
        self.stage = FrameStage::Idle;
        Ok(self.current)
    }

    /// Drop back to Idle after an acquired frame could not be recorded; the slot is reused
    pub fn abandon(&mut self) {
        if matches!(self.stage, FrameStage::FrameAcquired | FrameStage::Recording) {
            self.stage = FrameStage::Idle;
        }
    }

    fn expect_stage(&self, expected: FrameStage, action: &str) -> Result<()> {
        if self.stage != expected {
            return Err(HriError::precondition(format!(
                "Cannot {action} while the frame is {:?}",
                self.stage,
            )));
        }
        Ok(())
    }
}
