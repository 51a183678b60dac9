//! Hardware capabilities driven by the controller bank.
//!
//! Each capability is a trait object so the binary can plug in real
//! devices (terminal, cpal) while tests use `TestHardware`. The torch and
//! microphone are exclusive handles: acquire before use, release when done.
//! Every capability reports `supported()` and has a no-op fallback in
//! `NullHardware`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tessera_types::{EffectKey, Rgb};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// The platform has no such capability.
    Unsupported,
    /// The capability exists but permission was refused.
    Denied,
    Failed(String),
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityError::Unsupported => write!(f, "capability not supported"),
            CapabilityError::Denied => write!(f, "permission denied"),
            CapabilityError::Failed(why) => write!(f, "capability failed: {}", why),
        }
    }
}

impl std::error::Error for CapabilityError {}

pub type CapabilityResult<T = ()> = Result<T, CapabilityError>;

/// What the screen shows underneath text and wave overlays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisualMode {
    Neutral,
    /// A named preset animation (blackout, rainbow, ...), rendered by the surface.
    Preset(EffectKey),
    Color(Rgb),
}

/// The screen.
pub trait Surface: Send {
    fn set_mode(&mut self, mode: &VisualMode);
    fn set_text(&mut self, text: Option<&str>);
    /// Wave highlight overlay for this device's column.
    fn set_wave(&mut self, color: Option<Rgb>);
}

/// The camera torch.
pub trait Torch: Send {
    fn supported(&self) -> bool;
    fn acquire(&mut self) -> CapabilityResult;
    fn set_lit(&mut self, lit: bool) -> CapabilityResult;
    fn release(&mut self);
}

/// A looping audio player with a single source.
pub trait AudioSink: Send {
    /// The currently loaded source, if any.
    fn source(&self) -> Option<String>;
    fn load(&mut self, url: &str) -> CapabilityResult;
    fn play_looped(&mut self) -> CapabilityResult;
    fn pause(&mut self);
    fn clear(&mut self);
}

/// A mono microphone stream.
pub trait Microphone: Send {
    fn supported(&self) -> bool;
    /// Open the stream and return its sample rate.
    fn open(&mut self) -> CapabilityResult<u32>;
    /// Append whatever samples arrived since the last call.
    fn read(&mut self, out: &mut Vec<f32>);
    fn close(&mut self);
}

/// The full set of capabilities of one device.
pub struct Hardware {
    pub surface: Box<dyn Surface>,
    pub torch: Box<dyn Torch>,
    pub audio: Box<dyn AudioSink>,
    pub microphone: Box<dyn Microphone>,
}

/// Capabilities that do nothing. Torch and microphone report unsupported.
pub struct NullHardware;

impl NullHardware {
    pub fn build() -> Hardware {
        Hardware {
            surface: Box::new(NullHardware),
            torch: Box::new(NullHardware),
            audio: Box::new(NullAudio::default()),
            microphone: Box::new(NullHardware),
        }
    }
}

impl Surface for NullHardware {
    fn set_mode(&mut self, _mode: &VisualMode) {}
    fn set_text(&mut self, _text: Option<&str>) {}
    fn set_wave(&mut self, _color: Option<Rgb>) {}
}

impl Torch for NullHardware {
    fn supported(&self) -> bool {
        false
    }
    fn acquire(&mut self) -> CapabilityResult {
        Err(CapabilityError::Unsupported)
    }
    fn set_lit(&mut self, _lit: bool) -> CapabilityResult {
        Err(CapabilityError::Unsupported)
    }
    fn release(&mut self) {}
}

impl Microphone for NullHardware {
    fn supported(&self) -> bool {
        false
    }
    fn open(&mut self) -> CapabilityResult<u32> {
        Err(CapabilityError::Unsupported)
    }
    fn read(&mut self, _out: &mut Vec<f32>) {}
    fn close(&mut self) {}
}

/// Remembers the source but plays nothing.
#[derive(Default)]
pub struct NullAudio {
    source: Option<String>,
}

impl AudioSink for NullAudio {
    fn source(&self) -> Option<String> {
        self.source.clone()
    }
    fn load(&mut self, url: &str) -> CapabilityResult {
        self.source = Some(url.to_string());
        Ok(())
    }
    fn play_looped(&mut self) -> CapabilityResult {
        Ok(())
    }
    fn pause(&mut self) {}
    fn clear(&mut self) {
        self.source = None;
    }
}

/// An operation recorded by `TestHardware` for assertion in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareOp {
    Mode(VisualMode),
    Text(Option<String>),
    Wave(Option<Rgb>),
    TorchAcquire,
    TorchLit(bool),
    TorchRelease,
    AudioLoad(String),
    AudioPlay,
    AudioPause,
    AudioClear,
    MicOpen,
    MicClose,
}

#[derive(Default)]
struct TestState {
    ops: Vec<HardwareOp>,
    deny_torch: bool,
    deny_microphone: bool,
    fail_torch_writes: bool,
    samples: VecDeque<f32>,
    audio_source: Option<String>,
}

/// Recording hardware double.
///
/// `build()` hands out boxed capabilities sharing one log, so a test keeps
/// the `TestHardware` handle and inspects what the controllers did.
#[derive(Clone, Default)]
pub struct TestHardware {
    state: Arc<Mutex<TestState>>,
}

impl TestHardware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(&self) -> Hardware {
        Hardware {
            surface: Box::new(self.clone()),
            torch: Box::new(self.clone()),
            audio: Box::new(self.clone()),
            microphone: Box::new(self.clone()),
        }
    }

    /// Refuse torch acquisition with `CapabilityError::Denied`.
    pub fn deny_torch(&self) {
        self.state.lock().unwrap().deny_torch = true;
    }

    pub fn deny_microphone(&self) {
        self.state.lock().unwrap().deny_microphone = true;
    }

    /// Make every `set_lit` call report failure (after still recording it).
    pub fn fail_torch_writes(&self) {
        self.state.lock().unwrap().fail_torch_writes = true;
    }

    /// Queue microphone samples for the next `read`.
    pub fn feed(&self, samples: &[f32]) {
        self.state.lock().unwrap().samples.extend(samples.iter().copied());
    }

    pub fn operations(&self) -> Vec<HardwareOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clear_operations(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    pub fn count<F: Fn(&HardwareOp) -> bool>(&self, f: F) -> usize {
        self.state.lock().unwrap().ops.iter().filter(|op| f(op)).count()
    }

    /// Last torch state written, `false` if never lit.
    pub fn torch_lit(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .rev()
            .find_map(|op| match op {
                HardwareOp::TorchLit(lit) => Some(*lit),
                _ => None,
            })
            .unwrap_or(false)
    }

    pub fn last_mode(&self) -> Option<VisualMode> {
        self.state.lock().unwrap().ops.iter().rev().find_map(|op| match op {
            HardwareOp::Mode(mode) => Some(mode.clone()),
            _ => None,
        })
    }

    pub fn last_text(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .rev()
            .find_map(|op| match op {
                HardwareOp::Text(text) => Some(text.clone()),
                _ => None,
            })
            .flatten()
    }

    fn record(&self, op: HardwareOp) {
        self.state.lock().unwrap().ops.push(op);
    }
}

impl Surface for TestHardware {
    fn set_mode(&mut self, mode: &VisualMode) {
        self.record(HardwareOp::Mode(mode.clone()));
    }
    fn set_text(&mut self, text: Option<&str>) {
        self.record(HardwareOp::Text(text.map(str::to_string)));
    }
    fn set_wave(&mut self, color: Option<Rgb>) {
        self.record(HardwareOp::Wave(color));
    }
}

impl Torch for TestHardware {
    fn supported(&self) -> bool {
        true
    }
    fn acquire(&mut self) -> CapabilityResult {
        if self.state.lock().unwrap().deny_torch {
            return Err(CapabilityError::Denied);
        }
        self.record(HardwareOp::TorchAcquire);
        Ok(())
    }
    fn set_lit(&mut self, lit: bool) -> CapabilityResult {
        self.record(HardwareOp::TorchLit(lit));
        if self.state.lock().unwrap().fail_torch_writes {
            return Err(CapabilityError::Failed("torch write failed".into()));
        }
        Ok(())
    }
    fn release(&mut self) {
        self.record(HardwareOp::TorchRelease);
    }
}

impl AudioSink for TestHardware {
    fn source(&self) -> Option<String> {
        self.state.lock().unwrap().audio_source.clone()
    }
    fn load(&mut self, url: &str) -> CapabilityResult {
        let mut state = self.state.lock().unwrap();
        state.audio_source = Some(url.to_string());
        state.ops.push(HardwareOp::AudioLoad(url.to_string()));
        Ok(())
    }
    fn play_looped(&mut self) -> CapabilityResult {
        self.record(HardwareOp::AudioPlay);
        Ok(())
    }
    fn pause(&mut self) {
        self.record(HardwareOp::AudioPause);
    }
    fn clear(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.audio_source = None;
        state.ops.push(HardwareOp::AudioClear);
    }
}

impl Microphone for TestHardware {
    fn supported(&self) -> bool {
        true
    }
    fn open(&mut self) -> CapabilityResult<u32> {
        if self.state.lock().unwrap().deny_microphone {
            return Err(CapabilityError::Denied);
        }
        self.record(HardwareOp::MicOpen);
        Ok(44_100)
    }
    fn read(&mut self, out: &mut Vec<f32>) {
        out.extend(self.state.lock().unwrap().samples.drain(..));
    }
    fn close(&mut self) {
        self.record(HardwareOp::MicClose);
    }
}
