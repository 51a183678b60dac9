//! cpal-backed microphone and loop player.
//!
//! cpal streams are not `Send` on every host, so each stream lives on its own
//! thread for as long as it runs. The capability handles only keep a stop
//! flag and the channel the stream thread feeds.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};

use tessera_core::device::hardware::{AudioSink, CapabilityError, CapabilityResult, Microphone};

const STREAM_POLL: Duration = Duration::from_millis(20);

/// Stop flag plus the thread that owns the stream.
struct StreamThread {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl StreamThread {
    /// Spawn `body` and wait for it to report whether its stream started.
    fn spawn<T, F>(name: &str, body: F) -> CapabilityResult<(Self, T)>
    where
        T: Send + 'static,
        F: FnOnce(Arc<AtomicBool>, Sender<CapabilityResult<T>>) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = bounded(1);
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag, ready_tx))
            .map_err(|e| CapabilityError::Failed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(value)) => Ok((Self { running, handle }, value)),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CapabilityError::Failed("audio thread exited".to_string()))
            }
        }
    }

    fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

/// Keep the stream alive until the flag drops.
fn hold(stream: cpal::Stream, running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        thread::sleep(STREAM_POLL);
    }
    drop(stream);
}

fn failed(context: &str, e: impl std::fmt::Display) -> CapabilityError {
    CapabilityError::Failed(format!("{}: {}", context, e))
}

/// Default input device, downmixed to mono.
pub struct CpalMicrophone {
    available: bool,
    stream: Option<StreamThread>,
    samples: Option<Receiver<Vec<f32>>>,
}

impl CpalMicrophone {
    pub fn new() -> Self {
        let available = cpal::default_host().default_input_device().is_some();
        if !available {
            log::info!(target: "audio", "no input device; beat effects unavailable");
        }
        Self {
            available,
            stream: None,
            samples: None,
        }
    }
}

impl Microphone for CpalMicrophone {
    fn supported(&self) -> bool {
        self.available
    }

    fn open(&mut self) -> CapabilityResult<u32> {
        if !self.available {
            return Err(CapabilityError::Unsupported);
        }
        self.close();

        let (sample_tx, sample_rx) = crossbeam_channel::unbounded();
        let (stream, sample_rate) = StreamThread::spawn("tessera-mic", move |running, ready| {
            match build_input(sample_tx) {
                Ok((stream, rate)) => {
                    let _ = ready.send(Ok(rate));
                    hold(stream, &running);
                }
                Err(e) => {
                    let _ = ready.send(Err(e));
                }
            }
        })?;

        log::info!(target: "audio", "microphone open at {} Hz", sample_rate);
        self.stream = Some(stream);
        self.samples = Some(sample_rx);
        Ok(sample_rate)
    }

    fn read(&mut self, out: &mut Vec<f32>) {
        if let Some(rx) = &self.samples {
            for chunk in rx.try_iter() {
                out.extend_from_slice(&chunk);
            }
        }
    }

    fn close(&mut self) {
        self.samples = None;
        if let Some(stream) = self.stream.take() {
            stream.stop();
            log::info!(target: "audio", "microphone closed");
        }
    }
}

fn build_input(sample_tx: Sender<Vec<f32>>) -> CapabilityResult<(cpal::Stream, u32)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or(CapabilityError::Unsupported)?;
    let config = device
        .default_input_config()
        .map_err(|e| failed("input config", e))?;
    if config.sample_format() != SampleFormat::F32 {
        return Err(CapabilityError::Failed(format!(
            "unsupported input format {}",
            config.sample_format()
        )));
    }
    let channels = config.channels() as usize;
    let sample_rate = config.sample_rate().0;
    let stream_config: StreamConfig = config.into();

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = sample_tx.send(downmix(data, channels));
            },
            |err| log::error!(target: "audio", "input stream error: {}", err),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => CapabilityError::Denied,
            other => failed("input stream", other),
        })?;
    stream.play().map_err(|e| failed("start input", e))?;
    Ok((stream, sample_rate))
}

/// Average interleaved frames into one channel.
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// A decoded WAV file.
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl Clip {
    fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Sample for output channel `ch` of `frame`; mono clips feed every channel.
    fn sample(&self, frame: usize, ch: usize) -> f32 {
        let channels = self.channels.max(1) as usize;
        let ch = ch.min(channels - 1);
        self.samples.get(frame * channels + ch).copied().unwrap_or(0.0)
    }
}

/// Local path for a media URL. Only `file://` URLs and bare paths are playable.
pub fn local_path(url: &str) -> CapabilityResult<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if url.contains("://") {
        return Err(CapabilityError::Failed(format!("cannot stream {}", url)));
    }
    Ok(PathBuf::from(url))
}

pub fn decode_wav(path: &std::path::Path) -> CapabilityResult<Clip> {
    let mut reader = hound::WavReader::open(path).map_err(|e| failed("open wav", e))?;
    let spec = reader.spec();
    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| failed("decode wav", e))?,
        hound::SampleFormat::Int => {
            let full_scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / full_scale))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| failed("decode wav", e))?
        }
    };
    if samples.is_empty() {
        return Err(CapabilityError::Failed(format!("{} is empty", path.display())));
    }
    Ok(Clip {
        samples,
        channels: spec.channels,
        sample_rate: spec.sample_rate,
    })
}

/// Loops one WAV clip on the default output device.
#[derive(Default)]
pub struct LoopPlayer {
    source: Option<String>,
    clip: Option<Arc<Clip>>,
    stream: Option<StreamThread>,
}

impl LoopPlayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioSink for LoopPlayer {
    fn source(&self) -> Option<String> {
        self.source.clone()
    }

    fn load(&mut self, url: &str) -> CapabilityResult {
        self.clear();
        let clip = decode_wav(&local_path(url)?)?;
        log::debug!(
            target: "audio",
            "loaded {} ({} frames, {} ch, {} Hz)",
            url,
            clip.frames(),
            clip.channels,
            clip.sample_rate
        );
        self.clip = Some(Arc::new(clip));
        self.source = Some(url.to_string());
        Ok(())
    }

    fn play_looped(&mut self) -> CapabilityResult {
        if self.stream.is_some() {
            return Ok(());
        }
        let clip = self
            .clip
            .clone()
            .ok_or_else(|| CapabilityError::Failed("nothing loaded".to_string()))?;
        let (stream, ()) = StreamThread::spawn("tessera-loop", move |running, ready| {
            match build_output(clip) {
                Ok(stream) => {
                    let _ = ready.send(Ok(()));
                    hold(stream, &running);
                }
                Err(e) => {
                    let _ = ready.send(Err(e));
                }
            }
        })?;
        self.stream = Some(stream);
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
        }
    }

    fn clear(&mut self) {
        self.pause();
        self.clip = None;
        self.source = None;
    }
}

fn build_output(clip: Arc<Clip>) -> CapabilityResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or(CapabilityError::Unsupported)?;
    let config = device
        .default_output_config()
        .map_err(|e| failed("output config", e))?;
    if config.sample_format() != SampleFormat::F32 {
        return Err(CapabilityError::Failed(format!(
            "unsupported output format {}",
            config.sample_format()
        )));
    }
    if config.sample_rate().0 != clip.sample_rate {
        log::warn!(
            target: "audio",
            "clip is {} Hz, output is {} Hz; playing unresampled",
            clip.sample_rate,
            config.sample_rate().0
        );
    }
    let channels = config.channels() as usize;
    let stream_config: StreamConfig = config.into();

    let mut cursor = LoopCursor::new(clip);
    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| cursor.fill(data, channels),
            |err| log::error!(target: "audio", "output stream error: {}", err),
            None,
        )
        .map_err(|e| failed("output stream", e))?;
    stream.play().map_err(|e| failed("start output", e))?;
    Ok(stream)
}

/// Read position that wraps to the start of the clip.
struct LoopCursor {
    clip: Arc<Clip>,
    frame: usize,
}

impl LoopCursor {
    fn new(clip: Arc<Clip>) -> Self {
        Self { clip, frame: 0 }
    }

    fn fill(&mut self, out: &mut [f32], channels: usize) {
        let frames = self.clip.frames();
        if frames == 0 || channels == 0 {
            out.fill(0.0);
            return;
        }
        for frame in out.chunks_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample = self.clip.sample(self.frame, ch);
            }
            self.frame = (self.frame + 1) % frames;
        }
    }
}
