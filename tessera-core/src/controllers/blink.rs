use std::time::Duration;

use tessera_types::{Rgb, Timestamp};

use super::ControllerState;
use crate::device::hardware::{Surface, VisualMode};

/// Shortest period accepted; anything below is clamped.
const MIN_PERIOD: Duration = Duration::from_millis(100);

/// A cyclic color animation: each color held for `period / n`.
#[derive(Debug, Clone, PartialEq)]
pub struct BlinkAnimation {
    colors: Vec<Rgb>,
    period: Duration,
    started_at: Timestamp,
}

impl BlinkAnimation {
    /// `None` with fewer than two colors.
    pub fn new(colors: Vec<Rgb>, period: Duration, started_at: Timestamp) -> Option<Self> {
        if colors.len() < 2 {
            return None;
        }
        Some(Self {
            colors,
            period: period.max(MIN_PERIOD),
            started_at,
        })
    }

    /// How long each color is held.
    pub fn hold(&self) -> Duration {
        self.period / self.colors.len() as u32
    }

    pub fn color_at(&self, now: Timestamp) -> Rgb {
        let hold_ms = (self.hold().as_millis() as u64).max(1);
        let elapsed = now.saturating_since(self.started_at).as_millis() as u64;
        let index = (elapsed / hold_ms) as usize % self.colors.len();
        self.colors[index]
    }
}

pub struct BlinkController {
    state: ControllerState,
    animation: Option<BlinkAnimation>,
    shown: Option<Rgb>,
}

impl BlinkController {
    pub fn new() -> Self {
        Self {
            state: ControllerState::Idle,
            animation: None,
            shown: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Replace any running animation. Returns `false` (and stays idle) with
    /// fewer than two colors.
    pub fn start(
        &mut self,
        colors: &[Rgb],
        period: Duration,
        now: Timestamp,
        surface: &mut dyn Surface,
    ) -> bool {
        self.state = ControllerState::Starting;
        self.shown = None;
        self.animation = BlinkAnimation::new(colors.to_vec(), period, now);
        if self.animation.is_none() {
            log::debug!(target: "controllers", "custom blink needs two colors, got {}", colors.len());
            self.state = ControllerState::Idle;
            return false;
        }
        self.state = ControllerState::Active;
        self.tick(now, surface);
        true
    }

    pub fn tick(&mut self, now: Timestamp, surface: &mut dyn Surface) {
        let Some(animation) = &self.animation else {
            return;
        };
        let color = animation.color_at(now);
        if self.shown != Some(color) {
            self.shown = Some(color);
            surface.set_mode(&VisualMode::Color(color));
        }
    }

    pub fn stop(&mut self) {
        self.state = ControllerState::Idle;
        self.animation = None;
        self.shown = None;
    }
}

impl Default for BlinkController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::hardware::TestHardware;

    const RED: Rgb = Rgb::new(255, 0, 0);
    const BLUE: Rgb = Rgb::new(0, 0, 255);

    fn ms(v: i64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    #[test]
    fn two_colors_half_period_each() {
        let blink = BlinkAnimation::new(vec![RED, BLUE], Duration::from_secs(1), ms(1_000)).unwrap();
        assert_eq!(blink.hold(), Duration::from_millis(500));
        assert_eq!(blink.color_at(ms(1_000)), RED);
        assert_eq!(blink.color_at(ms(1_499)), RED);
        assert_eq!(blink.color_at(ms(1_500)), BLUE);
        assert_eq!(blink.color_at(ms(1_999)), BLUE);
        assert_eq!(blink.color_at(ms(2_000)), RED);
    }

    #[test]
    fn fewer_than_two_colors_is_inactive() {
        assert!(BlinkAnimation::new(vec![RED], Duration::from_secs(1), ms(0)).is_none());

        let hw = TestHardware::new();
        let mut surface = hw.build().surface;
        let mut blink = BlinkController::new();
        assert!(!blink.start(&[RED], Duration::from_secs(1), ms(0), surface.as_mut()));
        assert_eq!(blink.state(), ControllerState::Idle);
        assert!(hw.operations().is_empty());
    }

    #[test]
    fn controller_paints_only_on_change() {
        let hw = TestHardware::new();
        let mut surface = hw.build().surface;
        let mut blink = BlinkController::new();
        blink.start(&[RED, BLUE], Duration::from_secs(1), ms(0), surface.as_mut());
        for t in (0..1_000).step_by(50) {
            blink.tick(ms(t), surface.as_mut());
        }
        assert_eq!(hw.operations().len(), 2);
        assert_eq!(hw.last_mode(), Some(VisualMode::Color(BLUE)));
    }

    #[test]
    fn regenerating_restarts_from_first_color() {
        let hw = TestHardware::new();
        let mut surface = hw.build().surface;
        let mut blink = BlinkController::new();
        blink.start(&[RED, BLUE], Duration::from_secs(1), ms(0), surface.as_mut());
        blink.tick(ms(600), surface.as_mut());
        blink.start(&[RED, BLUE], Duration::from_secs(2), ms(700), surface.as_mut());
        assert_eq!(hw.last_mode(), Some(VisualMode::Color(RED)));
    }
}
