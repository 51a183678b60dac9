//! The effect controller bank.
//!
//! An effect key plus parameters becomes an `ActivationPlan`: exactly one
//! visual mode, optional text, optional torch mode, optional audio source.
//! Applying a plan stops every controller the plan does not use and starts
//! (or updates) the rest. Capability failures are reported and logged,
//! never retried.

mod audio;
mod beat;
mod blink;
mod flash;
mod text;

pub use audio::{resolve_media_url, AudioController};
pub use beat::{BeatController, BeatDetector};
pub use blink::{BlinkAnimation, BlinkController};
pub use flash::{FlashController, FlashMode, FlashStep};
pub use text::TextController;

use std::time::Duration;

use tessera_types::{EffectKey, EffectKind, EffectParams, Rgb, Timestamp, DEFAULT_BEAT_PALETTE};

use crate::config::{BeatSettings, DeviceSettings};
use crate::device::hardware::{CapabilityError, Hardware, VisualMode};

/// Lifecycle of a single controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Idle,
    Starting,
    Active,
    Stopping,
}

/// The single visual mode of a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum VisualPlan {
    Neutral,
    Preset(EffectKey),
    CustomBlink { colors: Vec<Rgb>, period: Duration },
    Beat { palette: Vec<Rgb> },
}

/// What the device should be doing for one resolved effect.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationPlan {
    pub visual: VisualPlan,
    pub text: Option<String>,
    pub flash: Option<FlashMode>,
    /// Unresolved media reference.
    pub audio: Option<String>,
}

impl ActivationPlan {
    pub fn neutral() -> Self {
        Self {
            visual: VisualPlan::Neutral,
            text: None,
            flash: None,
            audio: None,
        }
    }

    /// Build the plan for `key`. Text is overlaid on any visual mode.
    ///
    /// `combinado` composes its components in order: the first visual and
    /// the first torch mode win, audio and beat coloring are allowed, and
    /// nested combinations are ignored.
    pub fn build(key: &EffectKey, params: &EffectParams, text: Option<&str>) -> Self {
        let mut plan = Self::neutral();
        plan.text = text.filter(|t| !t.is_empty()).map(str::to_string);

        if key.kind() == EffectKind::Combined {
            for component in &params.combined {
                plan.add(component, params);
            }
        } else {
            plan.add(key, params);
        }
        plan
    }

    fn add(&mut self, key: &EffectKey, params: &EffectParams) {
        let kind = key.kind();
        if kind.is_visual() && self.visual != VisualPlan::Neutral {
            return;
        }
        match kind {
            EffectKind::Idle | EffectKind::Wave | EffectKind::Combined => {}
            EffectKind::Preset => self.visual = VisualPlan::Preset(key.clone()),
            EffectKind::CustomBlink => {
                self.visual = VisualPlan::CustomBlink {
                    colors: params.blink_colors.clone(),
                    period: secs(params.blink_period_secs),
                }
            }
            EffectKind::BeatReactive => {
                let palette = if params.beat_palette.is_empty() {
                    DEFAULT_BEAT_PALETTE.to_vec()
                } else {
                    params.beat_palette.clone()
                };
                self.visual = VisualPlan::Beat { palette }
            }
            EffectKind::Flash(pattern) => {
                if self.flash.is_none() {
                    self.flash = Some(match pattern {
                        Some(p) => FlashMode::Pattern(p),
                        None => FlashMode::Periodic(secs(params.flash_period_secs)),
                    });
                }
            }
            EffectKind::LoopAudio => {
                if self.audio.is_none() {
                    self.audio = params.loop_audio_ref.clone();
                }
            }
        }
    }
}

fn secs(value: f32) -> Duration {
    match Duration::try_from_secs_f32(value) {
        Ok(d) if !d.is_zero() => d,
        _ => Duration::from_secs(1),
    }
}

/// A controller that could not start, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationFailure {
    pub controller: &'static str,
    pub error: CapabilityError,
}

/// Owns the hardware and every controller of one device.
pub struct ControllerBank {
    hw: Hardware,
    visual: Option<VisualMode>,
    text: TextController,
    blink: BlinkController,
    flash: FlashController,
    audio: AudioController,
    beat: BeatController,
    plan: Option<ActivationPlan>,
}

impl ControllerBank {
    pub fn new(hw: Hardware, device: &DeviceSettings, beat: &BeatSettings) -> Self {
        Self {
            hw,
            visual: None,
            text: TextController::new(device.text_interval),
            blink: BlinkController::new(),
            flash: FlashController::new(),
            audio: AudioController::new(device.media_origin.clone()),
            beat: BeatController::new(beat.clone()),
            plan: None,
        }
    }

    pub fn plan(&self) -> Option<&ActivationPlan> {
        self.plan.as_ref()
    }

    pub fn flash_state(&self) -> ControllerState {
        self.flash.state()
    }

    pub fn audio_state(&self) -> ControllerState {
        self.audio.state()
    }

    pub fn beat_state(&self) -> ControllerState {
        self.beat.state()
    }

    pub fn blink_state(&self) -> ControllerState {
        self.blink.state()
    }

    pub fn text_state(&self) -> ControllerState {
        self.text.state()
    }

    /// Apply `plan`, stopping whatever it does not include.
    pub fn activate(&mut self, plan: ActivationPlan, now: Timestamp) -> Vec<ActivationFailure> {
        let mut failures = Vec::new();
        let hw = &mut self.hw;

        // Visual: stop the drivers the new plan does not use, then start one.
        if !matches!(plan.visual, VisualPlan::CustomBlink { .. }) {
            self.blink.stop();
        }
        if !matches!(plan.visual, VisualPlan::Beat { .. }) {
            self.beat.stop(hw.microphone.as_mut(), hw.surface.as_mut());
        }
        match &plan.visual {
            VisualPlan::Neutral => set_visual(&mut self.visual, hw, VisualMode::Neutral),
            VisualPlan::Preset(key) => {
                set_visual(&mut self.visual, hw, VisualMode::Preset(key.clone()))
            }
            VisualPlan::CustomBlink { colors, period } => {
                self.visual = None;
                if !self.blink.start(colors, *period, now, hw.surface.as_mut()) {
                    set_visual(&mut self.visual, hw, VisualMode::Neutral);
                }
            }
            VisualPlan::Beat { palette } => {
                self.visual = None;
                if let Err(error) =
                    self.beat
                        .start(palette, hw.microphone.as_mut(), hw.surface.as_mut())
                {
                    log::warn!(target: "controllers", "beat coloring unavailable: {}", error);
                    set_visual(&mut self.visual, hw, VisualMode::Neutral);
                    failures.push(ActivationFailure {
                        controller: "beat",
                        error,
                    });
                }
            }
        }

        match &plan.text {
            Some(text) => self.text.start(text, now, hw.surface.as_mut()),
            None => self.text.stop(hw.surface.as_mut()),
        }

        match plan.flash {
            Some(mode) => {
                if let Err(error) = self.flash.start(mode, now, hw.torch.as_mut()) {
                    log::warn!(target: "controllers", "flash unavailable: {}", error);
                    failures.push(ActivationFailure {
                        controller: "flash",
                        error,
                    });
                }
            }
            None => self.flash.stop(hw.torch.as_mut()),
        }

        match &plan.audio {
            Some(reference) => {
                if let Err(error) = self.audio.start(reference, hw.audio.as_mut()) {
                    log::warn!(target: "controllers", "loop audio unavailable: {}", error);
                    failures.push(ActivationFailure {
                        controller: "audio",
                        error,
                    });
                }
            }
            None => self.audio.stop(hw.audio.as_mut()),
        }

        self.plan = Some(plan);
        failures
    }

    /// Advance every running animation.
    pub fn tick(&mut self, now: Timestamp) {
        let hw = &mut self.hw;
        self.text.tick(now, hw.surface.as_mut());
        self.blink.tick(now, hw.surface.as_mut());
        self.flash.tick(now, hw.torch.as_mut());
        self.beat.tick(now, hw.microphone.as_mut(), hw.surface.as_mut());
    }

    pub fn set_wave(&mut self, color: Option<Rgb>) {
        self.hw.surface.set_wave(color);
    }

    /// Stop everything and release every handle.
    pub fn stop_all(&mut self) {
        let hw = &mut self.hw;
        self.text.stop(hw.surface.as_mut());
        self.blink.stop();
        self.beat.stop(hw.microphone.as_mut(), hw.surface.as_mut());
        self.flash.stop(hw.torch.as_mut());
        self.audio.stop(hw.audio.as_mut());
        hw.surface.set_wave(None);
        set_visual(&mut self.visual, hw, VisualMode::Neutral);
        self.plan = None;
    }
}

fn set_visual(current: &mut Option<VisualMode>, hw: &mut Hardware, mode: VisualMode) {
    if current.as_ref() != Some(&mode) {
        hw.surface.set_mode(&mode);
        *current = Some(mode);
    }
}
