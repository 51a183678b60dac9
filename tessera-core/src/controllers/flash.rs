use std::time::Duration;

use tessera_types::{FlashPattern, Timestamp};

use super::ControllerState;
use crate::device::hardware::{CapabilityError, Torch};

/// How the torch should pulse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlashMode {
    /// On and off for half the period each.
    Periodic(Duration),
    Pattern(FlashPattern),
}

/// One torch state held for a duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashStep {
    pub lit: bool,
    pub hold: Duration,
}

const fn step(lit: bool, ms: u64) -> FlashStep {
    FlashStep {
        lit,
        hold: Duration::from_millis(ms),
    }
}

const SLOW: [FlashStep; 2] = [step(true, 1_000), step(false, 1_000)];
const FAST: [FlashStep; 2] = [step(true, 150), step(false, 150)];

const DOT: u64 = 200;
const DASH: u64 = 600;
const GAP: u64 = 200;
const WORD_GAP: u64 = 1_400;

fn sos() -> Vec<FlashStep> {
    let mut steps = Vec::with_capacity(18);
    for on in [DOT, DASH, DOT] {
        for _ in 0..3 {
            steps.push(step(true, on));
            steps.push(step(false, GAP));
        }
    }
    if let Some(last) = steps.last_mut() {
        last.hold = Duration::from_millis(WORD_GAP);
    }
    steps
}

impl FlashMode {
    /// The repeating step sequence for this mode.
    pub fn steps(self) -> Vec<FlashStep> {
        match self {
            FlashMode::Periodic(period) => {
                let half = (period / 2).max(Duration::from_millis(20));
                vec![
                    FlashStep { lit: true, hold: half },
                    FlashStep { lit: false, hold: half },
                ]
            }
            FlashMode::Pattern(FlashPattern::Slow) => SLOW.to_vec(),
            FlashMode::Pattern(FlashPattern::Fast) => FAST.to_vec(),
            FlashMode::Pattern(FlashPattern::Sos) => sos(),
        }
    }
}

/// Drives the torch through a step sequence while holding its handle.
pub struct FlashController {
    state: ControllerState,
    mode: Option<FlashMode>,
    steps: Vec<FlashStep>,
    index: usize,
    next_change: Timestamp,
    acquired: bool,
}

impl FlashController {
    pub fn new() -> Self {
        Self {
            state: ControllerState::Idle,
            mode: None,
            steps: Vec::new(),
            index: 0,
            next_change: Timestamp::ZERO,
            acquired: false,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn mode(&self) -> Option<FlashMode> {
        self.mode
    }

    /// Acquire the torch and start the sequence. A running controller in the
    /// same mode is left alone; a different mode restarts the sequence.
    pub fn start(
        &mut self,
        mode: FlashMode,
        now: Timestamp,
        torch: &mut dyn Torch,
    ) -> Result<(), CapabilityError> {
        if self.state == ControllerState::Active && self.mode == Some(mode) {
            return Ok(());
        }
        self.state = ControllerState::Starting;

        if !self.acquired {
            if !torch.supported() {
                self.state = ControllerState::Idle;
                return Err(CapabilityError::Unsupported);
            }
            if let Err(e) = torch.acquire() {
                self.state = ControllerState::Idle;
                return Err(e);
            }
            self.acquired = true;
        }

        self.mode = Some(mode);
        self.steps = mode.steps();
        self.index = 0;
        let first = self.steps[0];
        if let Err(e) = torch.set_lit(first.lit) {
            self.stop(torch);
            return Err(e);
        }
        self.next_change = now + first.hold;
        self.state = ControllerState::Active;
        Ok(())
    }

    pub fn tick(&mut self, now: Timestamp, torch: &mut dyn Torch) {
        if self.state != ControllerState::Active {
            return;
        }
        // A stalled loop skips ahead rather than strobing through the backlog.
        let mut advanced = false;
        while now >= self.next_change {
            self.index = (self.index + 1) % self.steps.len();
            self.next_change = self.next_change + self.steps[self.index].hold;
            advanced = true;
        }
        if advanced {
            if let Err(e) = torch.set_lit(self.steps[self.index].lit) {
                log::warn!(target: "controllers", "torch write failed: {}", e);
            }
        }
    }

    /// Force the light off and release the handle. Never fails.
    pub fn stop(&mut self, torch: &mut dyn Torch) {
        if self.state == ControllerState::Idle && !self.acquired {
            return;
        }
        self.state = ControllerState::Stopping;
        if self.acquired {
            if let Err(e) = torch.set_lit(false) {
                log::warn!(target: "controllers", "could not switch torch off: {}", e);
            }
            torch.release();
            self.acquired = false;
        }
        self.mode = None;
        self.steps.clear();
        self.index = 0;
        self.state = ControllerState::Idle;
    }
}

impl Default for FlashController {
    fn default() -> Self {
        Self::new()
    }
}
