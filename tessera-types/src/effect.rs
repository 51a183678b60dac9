//! Effect catalog entries, effect keys and the global effect row.

use serde::{Deserialize, Serialize};

use crate::{EffectId, Rgb, Timestamp};

/// Well-known effect keys of the predefined catalog.
pub mod keys {
    /// Neutral state. Per-cell overrides apply while the global effect is idle.
    pub const IDLE: &str = "inicial";
    pub const BLACKOUT: &str = "apagon";
    pub const RED_PULSE: &str = "rojo-pulsante";
    pub const RAINBOW: &str = "arcoiris";
    pub const STROBE: &str = "parpadeo";
    pub const CUSTOM_BLINK: &str = "parpadeo-custom";
    pub const FLASH: &str = "flash";
    pub const FLASH_SLOW: &str = "flash-lento";
    pub const FLASH_FAST: &str = "flash-rapido";
    pub const FLASH_SOS: &str = "flash-sos";
    pub const LOOP_AUDIO: &str = "audio";
    pub const BEAT: &str = "ritmo";
    pub const COMBINED: &str = "combinado";
    /// Column sweep driven by the wave channel rather than polled state.
    pub const WAVE: &str = "ola";
}

/// The abstract effect identifier consumed by device controllers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectKey(String);

impl EffectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn idle() -> Self {
        Self(keys::IDLE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_idle(&self) -> bool {
        self.0 == keys::IDLE
    }

    pub fn is_wave(&self) -> bool {
        self.0 == keys::WAVE
    }

    /// Classify the key into the controller behavior it selects.
    pub fn kind(&self) -> EffectKind {
        match self.0.as_str() {
            keys::IDLE => EffectKind::Idle,
            keys::CUSTOM_BLINK => EffectKind::CustomBlink,
            keys::FLASH => EffectKind::Flash(None),
            keys::FLASH_SLOW => EffectKind::Flash(Some(FlashPattern::Slow)),
            keys::FLASH_FAST => EffectKind::Flash(Some(FlashPattern::Fast)),
            keys::FLASH_SOS => EffectKind::Flash(Some(FlashPattern::Sos)),
            keys::LOOP_AUDIO => EffectKind::LoopAudio,
            keys::BEAT => EffectKind::BeatReactive,
            keys::COMBINED => EffectKind::Combined,
            keys::WAVE => EffectKind::Wave,
            _ => EffectKind::Preset,
        }
    }
}

impl Default for EffectKey {
    fn default() -> Self {
        Self::idle()
    }
}

impl std::fmt::Display for EffectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EffectKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Fixed torch on/off sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlashPattern {
    Slow,
    Fast,
    /// Morse "SOS": three short, three long, three short, then a word gap.
    Sos,
}

/// What an effect key asks the device to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectKind {
    Idle,
    /// A named visual mode rendered directly from the key (blackout, rainbow, ...).
    Preset,
    CustomBlink,
    /// Torch pulsing; `None` means periodic with the configured flash period.
    Flash(Option<FlashPattern>),
    LoopAudio,
    BeatReactive,
    Combined,
    Wave,
}

impl EffectKind {
    /// Whether the kind selects the device's single visual mode.
    pub fn is_visual(self) -> bool {
        matches!(
            self,
            EffectKind::Preset | EffectKind::CustomBlink | EffectKind::BeatReactive
        )
    }
}

/// A catalog entry as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    pub id: EffectId,
    pub display_name: String,
    pub css_key: EffectKey,
    #[serde(default)]
    pub description: String,
}

/// A catalog entry before it has been assigned an id (upsert input).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectSpec {
    pub display_name: String,
    pub css_key: EffectKey,
    #[serde(default)]
    pub description: String,
}

/// Colors `ritmo` steps through until an operator sets its own palette.
pub const DEFAULT_BEAT_PALETTE: [Rgb; 4] = [
    Rgb::new(0xff, 0x00, 0x55),
    Rgb::new(0x00, 0xc8, 0xff),
    Rgb::new(0xff, 0xd0, 0x00),
    Rgb::new(0x7a, 0x00, 0xff),
];

/// Per-effect-kind parameters carried by the global effect row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectParams {
    /// Ordered colors of the custom blink animation.
    pub blink_colors: Vec<Rgb>,
    /// Total period of one blink cycle, in seconds.
    pub blink_period_secs: f32,
    /// Torch on+off period, in seconds.
    pub flash_period_secs: f32,
    /// Looped audio source; relative references resolve against the media origin.
    pub loop_audio_ref: Option<String>,
    /// Palette the beat-reactive controller steps through.
    pub beat_palette: Vec<Rgb>,
    /// Component keys of the combined effect.
    pub combined: Vec<EffectKey>,
}

impl Default for EffectParams {
    fn default() -> Self {
        Self {
            blink_colors: Vec::new(),
            blink_period_secs: 1.0,
            flash_period_secs: 1.0,
            loop_audio_ref: None,
            beat_palette: DEFAULT_BEAT_PALETTE.to_vec(),
            combined: Vec::new(),
        }
    }
}

/// The singleton row holding the operator's current global effect.
///
/// Consumers detect change by `publish_timestamp`, never by comparing
/// content: two publishes may carry identical parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GlobalEffectState {
    pub current_effect: EffectKey,
    pub publish_timestamp: Timestamp,
    #[serde(default)]
    pub params: EffectParams,
}
