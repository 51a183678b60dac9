use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use tessera_types::{EffectSpec, Rgb};

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    sync: SyncConfig,
    #[serde(default)]
    device: DeviceConfig,
    #[serde(default)]
    wave: WaveConfig,
    #[serde(default)]
    beat: BeatConfig,
    #[serde(default)]
    catalog: Vec<EffectSpec>,
}

#[derive(Deserialize, Default)]
struct SyncConfig {
    synch_delay_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    reconnect_after_failures: Option<u32>,
}

#[derive(Deserialize, Default)]
struct DeviceConfig {
    text_interval_ms: Option<u64>,
    media_origin: Option<String>,
}

#[derive(Deserialize, Default)]
struct WaveConfig {
    tick_ms: Option<u64>,
    render_buffer_ms: Option<u64>,
    palette: Option<Vec<Rgb>>,
}

#[derive(Deserialize, Default)]
struct BeatConfig {
    threshold: Option<f32>,
    cooldown_ms: Option<u64>,
    history_frames: Option<usize>,
    frame_size: Option<usize>,
    band_low_hz: Option<f32>,
    band_high_hz: Option<f32>,
}

/// Timing settings for the device-side poll/schedule loop.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    pub synch_delay: Duration,
    pub poll_interval: Duration,
    pub reconnect_after_failures: u32,
    pub text_interval: Duration,
    pub media_origin: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            synch_delay: Duration::from_millis(2_500),
            poll_interval: Duration::from_millis(500),
            reconnect_after_failures: 3,
            text_interval: Duration::from_millis(800),
            media_origin: "http://localhost:3000".to_string(),
        }
    }
}

/// Server-side sweep settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveSettings {
    pub tick: Duration,
    pub render_buffer: Duration,
    pub palette: Vec<Rgb>,
}

impl Default for WaveSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(1_000),
            render_buffer: Duration::from_millis(200),
            palette: vec![Rgb::new(0xc6, 0x2b, 0x28), Rgb::new(0x16, 0x70, 0x9f)],
        }
    }
}

/// Beat detector tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatSettings {
    /// Energy must exceed baseline × threshold to count as a beat.
    pub threshold: f32,
    pub cooldown: Duration,
    /// Frames in the moving-average baseline.
    pub history_frames: usize,
    /// Samples per analysis frame (FFT size).
    pub frame_size: usize,
    pub band_low_hz: f32,
    pub band_high_hz: f32,
}

impl Default for BeatSettings {
    fn default() -> Self {
        Self {
            threshold: 1.5,
            cooldown: Duration::from_millis(150),
            history_frames: 43,
            frame_size: 1024,
            band_low_hz: 20.0,
            band_high_hz: 150.0,
        }
    }
}

pub struct Config {
    sync: SyncConfig,
    device: DeviceConfig,
    wave: WaveConfig,
    beat: BeatConfig,
    catalog: Vec<EffectSpec>,
}

impl Config {
    pub fn load() -> Self {
        let mut base: ConfigFile =
            toml::from_str(DEFAULT_CONFIG).expect("Failed to parse embedded config.toml");

        if let Some(path) = user_config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(contents) => match Self::merge_user(&mut base, &contents) {
                        Ok(()) => {
                            log::info!(target: "config", "loaded user config {}", path.display())
                        }
                        Err(e) => {
                            log::warn!(target: "config", "ignoring malformed config {}: {}", path.display(), e)
                        }
                    },
                    Err(e) => {
                        log::warn!(target: "config", "could not read config {}: {}", path.display(), e)
                    }
                }
            }
        }

        Self::from_file(base)
    }

    /// Parse the embedded defaults overlaid with `contents` (tests, explicit files).
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        let mut base: ConfigFile =
            toml::from_str(DEFAULT_CONFIG).expect("Failed to parse embedded config.toml");
        Self::merge_user(&mut base, contents)?;
        Ok(Self::from_file(base))
    }

    fn merge_user(base: &mut ConfigFile, contents: &str) -> Result<(), toml::de::Error> {
        let user = toml::from_str::<ConfigFile>(contents)?;
        merge_sync(&mut base.sync, user.sync);
        merge_device(&mut base.device, user.device);
        merge_wave(&mut base.wave, user.wave);
        merge_beat(&mut base.beat, user.beat);
        // A user catalog replaces the predefined list wholesale.
        if !user.catalog.is_empty() {
            base.catalog = user.catalog;
        }
        Ok(())
    }

    fn from_file(file: ConfigFile) -> Self {
        Config {
            sync: file.sync,
            device: file.device,
            wave: file.wave,
            beat: file.beat,
            catalog: file.catalog,
        }
    }

    /// Device timing (synch delay clamped to 1–3.5 s, poll cadence to 0.3–1 s).
    pub fn device(&self) -> DeviceSettings {
        let fallback = DeviceSettings::default();
        DeviceSettings {
            synch_delay: self
                .sync
                .synch_delay_ms
                .map(|ms| Duration::from_millis(ms.clamp(1_000, 3_500)))
                .unwrap_or(fallback.synch_delay),
            poll_interval: self
                .sync
                .poll_interval_ms
                .map(|ms| Duration::from_millis(ms.clamp(300, 1_000)))
                .unwrap_or(fallback.poll_interval),
            reconnect_after_failures: self
                .sync
                .reconnect_after_failures
                .map(|n| n.max(1))
                .unwrap_or(fallback.reconnect_after_failures),
            text_interval: self
                .device
                .text_interval_ms
                .map(|ms| Duration::from_millis(ms.max(50)))
                .unwrap_or(fallback.text_interval),
            media_origin: self
                .device
                .media_origin
                .clone()
                .unwrap_or(fallback.media_origin),
        }
    }

    pub fn wave(&self) -> WaveSettings {
        let fallback = WaveSettings::default();
        WaveSettings {
            tick: self
                .wave
                .tick_ms
                .map(|ms| Duration::from_millis(ms.max(50)))
                .unwrap_or(fallback.tick),
            render_buffer: self
                .wave
                .render_buffer_ms
                .map(Duration::from_millis)
                .unwrap_or(fallback.render_buffer),
            palette: self
                .wave
                .palette
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or(fallback.palette),
        }
    }

    pub fn beat(&self) -> BeatSettings {
        let fallback = BeatSettings::default();
        BeatSettings {
            threshold: self.beat.threshold.map(|t| t.max(1.0)).unwrap_or(fallback.threshold),
            // Shorter cooldowns double-trigger on a single percussive hit.
            cooldown: self
                .beat
                .cooldown_ms
                .map(|ms| Duration::from_millis(ms.max(150)))
                .unwrap_or(fallback.cooldown),
            history_frames: self
                .beat
                .history_frames
                .map(|n| n.clamp(4, 512))
                .unwrap_or(fallback.history_frames),
            frame_size: self
                .beat
                .frame_size
                .map(|n| n.clamp(256, 8192))
                .unwrap_or(fallback.frame_size),
            band_low_hz: self.beat.band_low_hz.unwrap_or(fallback.band_low_hz),
            band_high_hz: self.beat.band_high_hz.unwrap_or(fallback.band_high_hz),
        }
    }

    /// The predefined effect catalog reconciled by `SyncCatalog`.
    pub fn catalog(&self) -> &[EffectSpec] {
        &self.catalog
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tessera").join("config.toml"))
}

fn merge_sync(base: &mut SyncConfig, user: SyncConfig) {
    if user.synch_delay_ms.is_some() {
        base.synch_delay_ms = user.synch_delay_ms;
    }
    if user.poll_interval_ms.is_some() {
        base.poll_interval_ms = user.poll_interval_ms;
    }
    if user.reconnect_after_failures.is_some() {
        base.reconnect_after_failures = user.reconnect_after_failures;
    }
}

fn merge_device(base: &mut DeviceConfig, user: DeviceConfig) {
    if user.text_interval_ms.is_some() {
        base.text_interval_ms = user.text_interval_ms;
    }
    if user.media_origin.is_some() {
        base.media_origin = user.media_origin;
    }
}

fn merge_wave(base: &mut WaveConfig, user: WaveConfig) {
    if user.tick_ms.is_some() {
        base.tick_ms = user.tick_ms;
    }
    if user.render_buffer_ms.is_some() {
        base.render_buffer_ms = user.render_buffer_ms;
    }
    if user.palette.is_some() {
        base.palette = user.palette;
    }
}

fn merge_beat(base: &mut BeatConfig, user: BeatConfig) {
    if user.threshold.is_some() {
        base.threshold = user.threshold;
    }
    if user.cooldown_ms.is_some() {
        base.cooldown_ms = user.cooldown_ms;
    }
    if user.history_frames.is_some() {
        base.history_frames = user.history_frames;
    }
    if user.frame_size.is_some() {
        base.frame_size = user.frame_size;
    }
    if user.band_low_hz.is_some() {
        base.band_low_hz = user.band_low_hz;
    }
    if user.band_high_hz.is_some() {
        base.band_high_hz = user.band_high_hz;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_embedded_config() {
        let config = Config::from_toml("").unwrap();
        let device = config.device();
        assert_eq!(device.synch_delay, Duration::from_millis(2_500));
        assert_eq!(device.poll_interval, Duration::from_millis(500));
        assert_eq!(device.reconnect_after_failures, 3);
        assert_eq!(device.text_interval, Duration::from_millis(800));

        let wave = config.wave();
        assert_eq!(wave.tick, Duration::from_millis(1_000));
        assert_eq!(wave.render_buffer, Duration::from_millis(200));
        assert_eq!(wave.palette.len(), 2);

        assert_eq!(config.beat().cooldown, Duration::from_millis(150));
        assert!(config.catalog().iter().any(|e| e.css_key.is_idle()));
        assert!(config.catalog().iter().any(|e| e.css_key.is_wave()));
    }

    #[test]
    fn test_user_values_override_and_clamp() {
        let config = Config::from_toml(
            r#"
            [sync]
            synch_delay_ms = 9000
            poll_interval_ms = 100

            [beat]
            cooldown_ms = 20
            "#,
        )
        .unwrap();
        let device = config.device();
        assert_eq!(device.synch_delay, Duration::from_millis(3_500));
        assert_eq!(device.poll_interval, Duration::from_millis(300));
        // untouched sections keep their defaults
        assert_eq!(device.text_interval, Duration::from_millis(800));
        assert_eq!(config.beat().cooldown, Duration::from_millis(150));
    }

    #[test]
    fn test_user_catalog_replaces_defaults() {
        let config = Config::from_toml(
            r#"
            [[catalog]]
            display_name = "Solo"
            css_key = "solo"
            "#,
        )
        .unwrap();
        assert_eq!(config.catalog().len(), 1);
        assert_eq!(config.catalog()[0].css_key.as_str(), "solo");
    }

    #[test]
    fn test_malformed_user_config_is_an_error() {
        assert!(Config::from_toml("[sync]\nsynch_delay_ms = \"soon\"").is_err());
    }
}
