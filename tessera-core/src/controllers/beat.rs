use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;

use realfft::{RealFftPlanner, RealToComplex};
use tessera_types::{Rgb, Timestamp};

use super::ControllerState;
use crate::config::BeatSettings;
use crate::device::hardware::{CapabilityError, Microphone, Surface, VisualMode};

/// Low-band energy beat detector.
///
/// Each frame is windowed and transformed; the magnitudes of the bins that
/// fall inside the configured band are summed. A beat is an energy above
/// `baseline × threshold`, where the baseline is the moving average of the
/// last `history_frames` energies, outside the cooldown of the previous beat.
pub struct BeatDetector {
    settings: BeatSettings,
    plan: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    input: Vec<f32>,
    spectrum: Vec<realfft::num_complex::Complex<f32>>,
    bins: std::ops::Range<usize>,
    history: VecDeque<f32>,
    last_beat: Option<Timestamp>,
}

impl BeatDetector {
    pub fn new(settings: BeatSettings, sample_rate: u32) -> Self {
        let size = settings.frame_size;
        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(size);
        let input = plan.make_input_vec();
        let spectrum = plan.make_output_vec();

        let bin_hz = sample_rate.max(1) as f32 / size as f32;
        let low = ((settings.band_low_hz / bin_hz).floor() as usize).clamp(1, spectrum.len() - 2);
        let high = ((settings.band_high_hz / bin_hz).ceil() as usize)
            .clamp(low + 1, spectrum.len());

        Self {
            window: hann_window(size),
            plan,
            input,
            spectrum,
            bins: low..high,
            history: VecDeque::with_capacity(settings.history_frames),
            last_beat: None,
            settings,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.settings.frame_size
    }

    /// Band energy of one frame of `frame_size` samples.
    pub fn energy(&mut self, frame: &[f32]) -> f32 {
        for ((dst, &src), &w) in self.input.iter_mut().zip(frame).zip(&self.window) {
            *dst = src * w;
        }
        if self.plan.process(&mut self.input, &mut self.spectrum).is_err() {
            return 0.0;
        }
        self.spectrum[self.bins.clone()].iter().map(|c| c.norm_sqr()).sum()
    }

    /// Feed one frame observed at `now`. Returns whether it is a beat.
    pub fn process(&mut self, frame: &[f32], now: Timestamp) -> bool {
        let energy = self.energy(frame);
        let warmed_up = self.history.len() >= self.settings.history_frames;
        let baseline = if self.history.is_empty() {
            0.0
        } else {
            self.history.iter().sum::<f32>() / self.history.len() as f32
        };

        if self.history.len() >= self.settings.history_frames {
            self.history.pop_front();
        }
        self.history.push_back(energy);

        let cooled = self
            .last_beat
            .map_or(true, |at| now.saturating_since(at) >= self.settings.cooldown);
        let beat = warmed_up && energy > f32::EPSILON && energy > baseline * self.settings.threshold && cooled;
        if beat {
            self.last_beat = Some(now);
        }
        beat
    }
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let angle = 2.0 * PI * i as f32 / (size as f32 - 1.0);
            0.5 * (1.0 - angle.cos())
        })
        .collect()
}

/// Steps through a palette on every detected beat.
pub struct BeatController {
    state: ControllerState,
    settings: BeatSettings,
    palette: Vec<Rgb>,
    index: usize,
    detector: Option<BeatDetector>,
    pending: Vec<f32>,
}

impl BeatController {
    pub fn new(settings: BeatSettings) -> Self {
        Self {
            state: ControllerState::Idle,
            settings,
            palette: Vec::new(),
            index: 0,
            detector: None,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Open the microphone and show the first palette color. An already
    /// running controller keeps its stream and only swaps the palette.
    pub fn start(
        &mut self,
        palette: &[Rgb],
        microphone: &mut dyn Microphone,
        surface: &mut dyn Surface,
    ) -> Result<(), CapabilityError> {
        if palette.is_empty() {
            return Err(CapabilityError::Failed("beat palette is empty".into()));
        }
        if self.state != ControllerState::Active {
            self.state = ControllerState::Starting;
            if !microphone.supported() {
                self.state = ControllerState::Idle;
                return Err(CapabilityError::Unsupported);
            }
            let sample_rate = match microphone.open() {
                Ok(rate) => rate,
                Err(e) => {
                    self.state = ControllerState::Idle;
                    return Err(e);
                }
            };
            self.detector = Some(BeatDetector::new(self.settings.clone(), sample_rate));
            self.pending.clear();
        }
        self.palette = palette.to_vec();
        self.index = 0;
        surface.set_mode(&VisualMode::Color(self.palette[0]));
        self.state = ControllerState::Active;
        Ok(())
    }

    pub fn tick(&mut self, now: Timestamp, microphone: &mut dyn Microphone, surface: &mut dyn Surface) {
        let Some(detector) = self.detector.as_mut() else {
            return;
        };
        microphone.read(&mut self.pending);
        let size = detector.frame_size();
        let mut beats = 0;
        let mut consumed = 0;
        while self.pending.len() - consumed >= size {
            if detector.process(&self.pending[consumed..consumed + size], now) {
                beats += 1;
            }
            consumed += size;
        }
        self.pending.drain(..consumed);

        if beats > 0 {
            self.index = (self.index + 1) % self.palette.len();
            surface.set_mode(&VisualMode::Color(self.palette[self.index]));
        }
    }

    /// Release the microphone and fall back to neutral.
    pub fn stop(&mut self, microphone: &mut dyn Microphone, surface: &mut dyn Surface) {
        if self.state == ControllerState::Idle {
            return;
        }
        self.state = ControllerState::Stopping;
        microphone.close();
        self.detector = None;
        self.pending.clear();
        self.palette.clear();
        self.index = 0;
        surface.set_mode(&VisualMode::Neutral);
        self.state = ControllerState::Idle;
    }
}
