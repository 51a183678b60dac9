use std::time::Duration;

use tessera_types::Timestamp;

use super::ControllerState;
use crate::device::hardware::Surface;
use crate::timer::Ticker;

/// Shows the cell's assigned text one character at a time.
///
/// Text of length 0 or 1 is shown statically. Longer text cycles with
/// wraparound and restarts from the first character when it changes.
pub struct TextController {
    state: ControllerState,
    chars: Vec<char>,
    index: usize,
    ticker: Ticker,
}

impl TextController {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: ControllerState::Idle,
            chars: Vec::new(),
            index: 0,
            ticker: Ticker::new(interval),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn start(&mut self, text: &str, now: Timestamp, surface: &mut dyn Surface) {
        let chars: Vec<char> = text.chars().collect();
        if self.state == ControllerState::Active && chars == self.chars {
            return;
        }
        self.state = ControllerState::Starting;
        self.chars = chars;
        self.index = 0;

        if self.chars.len() <= 1 {
            self.ticker.stop();
            surface.set_text(Some(text));
        } else {
            self.show(surface);
            self.ticker.start_at(now + self.ticker.period());
        }
        self.state = ControllerState::Active;
    }

    pub fn tick(&mut self, now: Timestamp, surface: &mut dyn Surface) {
        if self.state != ControllerState::Active || !self.ticker.due(now) {
            return;
        }
        self.index = (self.index + 1) % self.chars.len();
        self.show(surface);
    }

    pub fn stop(&mut self, surface: &mut dyn Surface) {
        if self.state == ControllerState::Idle {
            return;
        }
        self.state = ControllerState::Stopping;
        self.ticker.stop();
        self.chars.clear();
        self.index = 0;
        surface.set_text(None);
        self.state = ControllerState::Idle;
    }

    /// The character (or static text) currently shown.
    pub fn current(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn show(&self, surface: &mut dyn Surface) {
        if let Some(c) = self.current() {
            let mut buf = [0u8; 4];
            surface.set_text(Some(c.encode_utf8(&mut buf)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::hardware::{HardwareOp, TestHardware};

    fn ms(v: i64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn texts(hw: &TestHardware) -> Vec<Option<String>> {
        hw.operations()
            .into_iter()
            .filter_map(|op| match op {
                HardwareOp::Text(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn two_letters_cycle_at_interval() {
        let hw = TestHardware::new();
        let mut surface = hw.build().surface;
        let mut text = TextController::new(Duration::from_millis(800));

        text.start("HI", ms(0), surface.as_mut());
        for t in [400, 800, 1_200, 1_600, 2_400] {
            text.tick(ms(t), surface.as_mut());
        }
        let shown: Vec<Option<String>> = ["H", "I", "H", "I"].iter().map(|s| Some(s.to_string())).collect();
        assert_eq!(texts(&hw), shown);
    }

    #[test]
    fn single_letter_is_static() {
        let hw = TestHardware::new();
        let mut surface = hw.build().surface;
        let mut text = TextController::new(Duration::from_millis(800));

        text.start("A", ms(0), surface.as_mut());
        for t in [800, 1_600, 2_400] {
            text.tick(ms(t), surface.as_mut());
        }
        assert_eq!(texts(&hw), vec![Some("A".to_string())]);
    }

    #[test]
    fn same_text_keeps_phase_new_text_restarts() {
        let hw = TestHardware::new();
        let mut surface = hw.build().surface;
        let mut text = TextController::new(Duration::from_millis(800));

        text.start("ABC", ms(0), surface.as_mut());
        text.tick(ms(800), surface.as_mut());
        text.start("ABC", ms(900), surface.as_mut());
        assert_eq!(text.current(), Some('B'));

        text.start("XY", ms(1_000), surface.as_mut());
        assert_eq!(text.current(), Some('X'));
    }

    #[test]
    fn stop_clears_display() {
        let hw = TestHardware::new();
        let mut surface = hw.build().surface;
        let mut text = TextController::new(Duration::from_millis(800));
        text.start("HI", ms(0), surface.as_mut());
        text.stop(surface.as_mut());
        assert_eq!(hw.last_text(), None);
        assert_eq!(text.state(), ControllerState::Idle);
    }
}
