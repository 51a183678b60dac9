//! Full-screen terminal surface for a device.
//!
//! The controller bank writes into a shared `ScreenState` through
//! `TerminalSurface`; the device loop paints that state with `DeviceScreen`
//! at its own frame rate. Preset animations are computed from wall time at
//! paint time, so every device running the same preset shows the same phase.

use std::f32::consts::TAU;
use std::io::{self, Stdout};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    buffer::Buffer,
    layout::{Alignment, Constraint, Layout, Rect},
    style::{Color, Style},
    text::Line,
    widgets::{Block, Paragraph, Widget},
    Terminal,
};

use tessera_core::device::hardware::{Surface, VisualMode};
use tessera_types::{keys, Rgb, Timestamp};

const NEUTRAL: Rgb = Rgb::new(0x14, 0x14, 0x1e);
const PULSE_RED: Rgb = Rgb::new(0xdc, 0x14, 0x14);
const PULSE_PERIOD_MS: i64 = 1_000;
const RAINBOW_PERIOD_MS: i64 = 3_000;
const STROBE_HALF_MS: i64 = 100;

/// What the device screen should currently show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenState {
    pub mode: VisualMode,
    pub text: Option<String>,
    pub wave: Option<Rgb>,
}

impl Default for ScreenState {
    fn default() -> Self {
        Self {
            mode: VisualMode::Neutral,
            text: None,
            wave: None,
        }
    }
}

pub type SharedScreen = Arc<Mutex<ScreenState>>;

/// `Surface` handed to the controller bank.
pub struct TerminalSurface {
    state: SharedScreen,
}

impl TerminalSurface {
    pub fn new(state: SharedScreen) -> Self {
        Self { state }
    }

    fn update(&self, f: impl FnOnce(&mut ScreenState)) {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
    }
}

impl Surface for TerminalSurface {
    fn set_mode(&mut self, mode: &VisualMode) {
        self.update(|s| s.mode = mode.clone());
    }

    fn set_text(&mut self, text: Option<&str>) {
        self.update(|s| s.text = text.map(str::to_string));
    }

    fn set_wave(&mut self, color: Option<Rgb>) {
        self.update(|s| s.wave = color);
    }
}

/// Background color for `state` at `now`. A wave highlight covers everything.
pub fn background(state: &ScreenState, now: Timestamp) -> Rgb {
    if let Some(color) = state.wave {
        return color;
    }
    match &state.mode {
        VisualMode::Neutral => NEUTRAL,
        VisualMode::Color(color) => *color,
        VisualMode::Preset(key) => preset_color(key.as_str(), now),
    }
}

fn preset_color(key: &str, now: Timestamp) -> Rgb {
    let t = now.as_millis();
    match key {
        keys::BLACKOUT => Rgb::BLACK,
        keys::RED_PULSE => {
            let phase = t.rem_euclid(PULSE_PERIOD_MS) as f32 / PULSE_PERIOD_MS as f32;
            let level = 0.5 - 0.5 * (TAU * phase).cos();
            scale(PULSE_RED, level)
        }
        keys::RAINBOW => {
            hue((t.rem_euclid(RAINBOW_PERIOD_MS) * 360 / RAINBOW_PERIOD_MS) as f32)
        }
        keys::STROBE => {
            if (t.rem_euclid(2 * STROBE_HALF_MS)) < STROBE_HALF_MS {
                Rgb::WHITE
            } else {
                Rgb::BLACK
            }
        }
        _ => NEUTRAL,
    }
}

fn scale(color: Rgb, level: f32) -> Rgb {
    let level = level.clamp(0.0, 1.0);
    Rgb::new(
        (color.r as f32 * level).round() as u8,
        (color.g as f32 * level).round() as u8,
        (color.b as f32 * level).round() as u8,
    )
}

/// Fully saturated color at `degrees` on the hue wheel.
fn hue(degrees: f32) -> Rgb {
    let h = degrees.rem_euclid(360.0) / 60.0;
    let x = 1.0 - (h % 2.0 - 1.0).abs();
    let (r, g, b) = match h as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    Rgb::new(
        (r * 255.0f32).round() as u8,
        (g * 255.0f32).round() as u8,
        (b * 255.0f32).round() as u8,
    )
}

fn contrast(bg: Rgb) -> Rgb {
    let luma = 0.299 * bg.r as f32 + 0.587 * bg.g as f32 + 0.114 * bg.b as f32;
    if luma > 140.0 {
        Rgb::BLACK
    } else {
        Rgb::WHITE
    }
}

fn color(rgb: Rgb) -> Color {
    Color::Rgb(rgb.r, rgb.g, rgb.b)
}

/// Paint the screen: full-area background, centered text, status on the last row.
pub fn render_screen(state: &ScreenState, status: &str, now: Timestamp, area: Rect, buf: &mut Buffer) {
    let bg = background(state, now);
    let fg = contrast(bg);
    let style = Style::default().bg(color(bg)).fg(color(fg));

    let [body, footer] = Layout::vertical([Constraint::Min(1), Constraint::Length(1)]).areas(area);
    Block::default().style(style).render(area, buf);

    if let Some(text) = state.text.as_deref() {
        let [_, middle, _] = Layout::vertical([
            Constraint::Fill(1),
            Constraint::Length(1),
            Constraint::Fill(1),
        ])
        .areas(body);
        Paragraph::new(Line::from(text.to_string()))
            .alignment(Alignment::Center)
            .style(style)
            .render(middle, buf);
    }

    Paragraph::new(Line::from(status.to_string()))
        .style(style)
        .render(footer, buf);
}

/// Owns the terminal for the lifetime of device mode.
pub struct DeviceScreen {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl DeviceScreen {
    pub fn new() -> io::Result<Self> {
        let backend = CrosstermBackend::new(io::stdout());
        Ok(Self {
            terminal: Terminal::new(backend)?,
        })
    }

    /// Enter raw mode and the alternate screen.
    pub fn start(&mut self) -> io::Result<()> {
        enable_raw_mode()?;
        execute!(io::stdout(), EnterAlternateScreen)?;
        self.terminal.hide_cursor()?;
        self.terminal.clear()
    }

    pub fn stop(&mut self) -> io::Result<()> {
        self.terminal.show_cursor()?;
        disable_raw_mode()?;
        execute!(io::stdout(), LeaveAlternateScreen)
    }

    pub fn draw(&mut self, state: &ScreenState, status: &str, now: Timestamp) -> io::Result<()> {
        self.terminal.draw(|f| {
            let area = f.area();
            render_screen(state, status, now, area, f.buffer_mut());
        })?;
        Ok(())
    }

    /// Wait up to `timeout` for a key press.
    pub fn poll_key(&self, timeout: Duration) -> io::Result<Option<KeyCode>> {
        if !event::poll(timeout)? {
            return Ok(None);
        }
        match event::read()? {
            Event::Key(key) if key.kind == KeyEventKind::Press => Ok(Some(key.code)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::EffectKey;

    fn ms(v: i64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn preset(key: &str) -> ScreenState {
        ScreenState {
            mode: VisualMode::Preset(EffectKey::new(key)),
            ..ScreenState::default()
        }
    }

    #[test]
    fn surface_writes_through_to_shared_state() {
        let shared = SharedScreen::default();
        let mut surface = TerminalSurface::new(shared.clone());

        surface.set_mode(&VisualMode::Color(Rgb::new(1, 2, 3)));
        surface.set_text(Some("HI"));
        surface.set_wave(Some(Rgb::WHITE));

        let state = shared.lock().unwrap().clone();
        assert_eq!(state.mode, VisualMode::Color(Rgb::new(1, 2, 3)));
        assert_eq!(state.text.as_deref(), Some("HI"));
        assert_eq!(state.wave, Some(Rgb::WHITE));
    }

    #[test]
    fn wave_highlight_covers_the_mode() {
        let mut state = preset(keys::BLACKOUT);
        assert_eq!(background(&state, ms(0)), Rgb::BLACK);
        state.wave = Some(Rgb::new(0xc6, 0x2b, 0x28));
        assert_eq!(background(&state, ms(0)), Rgb::new(0xc6, 0x2b, 0x28));
    }

    #[test]
    fn red_pulse_breathes_over_a_second() {
        let state = preset(keys::RED_PULSE);
        assert_eq!(background(&state, ms(0)), Rgb::BLACK);
        assert_eq!(background(&state, ms(500)), PULSE_RED);
        assert_eq!(background(&state, ms(1_000)), Rgb::BLACK);
    }

    #[test]
    fn strobe_alternates_white_and_black() {
        let state = preset(keys::STROBE);
        assert_eq!(background(&state, ms(50)), Rgb::WHITE);
        assert_eq!(background(&state, ms(150)), Rgb::BLACK);
        assert_eq!(background(&state, ms(250)), Rgb::WHITE);
    }

    #[test]
    fn rainbow_walks_the_hue_wheel() {
        let state = preset(keys::RAINBOW);
        assert_eq!(background(&state, ms(0)), Rgb::new(255, 0, 0));
        assert_eq!(background(&state, ms(1_000)), Rgb::new(0, 255, 0));
        assert_eq!(background(&state, ms(2_000)), Rgb::new(0, 0, 255));
    }

    #[test]
    fn unknown_preset_is_neutral() {
        assert_eq!(background(&preset("no-such"), ms(0)), NEUTRAL);
    }

    #[test]
    fn renders_background_text_and_status() {
        let state = ScreenState {
            mode: VisualMode::Color(Rgb::WHITE),
            text: Some("A".to_string()),
            wave: None,
        };
        let area = Rect::new(0, 0, 9, 4);
        let mut buf = Buffer::empty(area);
        render_screen(&state, "grid 1", ms(0), area, &mut buf);

        let corner = buf.cell((0, 0)).unwrap();
        assert_eq!(corner.bg, Color::Rgb(255, 255, 255));
        assert_eq!(buf.cell((4, 1)).unwrap().symbol(), "A");
        assert_eq!(buf.cell((4, 1)).unwrap().fg, Color::Rgb(0, 0, 0));
        assert_eq!(buf.cell((0, 3)).unwrap().symbol(), "g");
    }
}
