use super::ControllerState;
use crate::device::hardware::{AudioSink, CapabilityError};

/// Resolve a media reference against the configured origin.
///
/// Absolute URLs (anything with a scheme) pass through unchanged.
pub fn resolve_media_url(origin: &str, reference: &str) -> String {
    let reference = reference.trim();
    if reference.contains("://") {
        return reference.to_string();
    }
    let origin = origin.trim_end_matches('/');
    let path = reference.trim_start_matches('/');
    format!("{}/{}", origin, path)
}

/// Loops a single audio source.
pub struct AudioController {
    state: ControllerState,
    origin: String,
}

impl AudioController {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            state: ControllerState::Idle,
            origin: origin.into(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Play `reference` looped. The sink only reloads when the resolved URL
    /// differs from what it already holds.
    pub fn start(&mut self, reference: &str, sink: &mut dyn AudioSink) -> Result<(), CapabilityError> {
        let url = resolve_media_url(&self.origin, reference);
        let same_source = sink.source().as_deref() == Some(url.as_str());
        if self.state == ControllerState::Active && same_source {
            return Ok(());
        }
        self.state = ControllerState::Starting;

        if !same_source {
            if let Err(e) = sink.load(&url) {
                self.state = ControllerState::Idle;
                return Err(e);
            }
            log::info!(target: "controllers", "loop audio source: {}", url);
        }
        if let Err(e) = sink.play_looped() {
            sink.clear();
            self.state = ControllerState::Idle;
            return Err(e);
        }
        self.state = ControllerState::Active;
        Ok(())
    }

    pub fn stop(&mut self, sink: &mut dyn AudioSink) {
        if self.state == ControllerState::Idle {
            return;
        }
        self.state = ControllerState::Stopping;
        sink.pause();
        sink.clear();
        self.state = ControllerState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::hardware::{HardwareOp, TestHardware};

    #[test]
    fn resolves_relative_references() {
        let origin = "http://localhost:3000/";
        assert_eq!(resolve_media_url(origin, "/media/loop.mp3"), "http://localhost:3000/media/loop.mp3");
        assert_eq!(resolve_media_url(origin, "loop.mp3"), "http://localhost:3000/loop.mp3");
        assert_eq!(resolve_media_url(origin, "https://cdn.example/a.mp3"), "https://cdn.example/a.mp3");
        assert_eq!(resolve_media_url(origin, "file:///tmp/a.wav"), "file:///tmp/a.wav");
    }

    #[test]
    fn same_source_is_not_reloaded() {
        let hw = TestHardware::new();
        let mut sink = hw.build().audio;
        let mut audio = AudioController::new("http://localhost:3000");

        audio.start("/a.mp3", sink.as_mut()).unwrap();
        audio.start("/a.mp3", sink.as_mut()).unwrap();
        assert_eq!(hw.count(|op| matches!(op, HardwareOp::AudioLoad(_))), 1);

        audio.start("/b.mp3", sink.as_mut()).unwrap();
        assert_eq!(hw.count(|op| matches!(op, HardwareOp::AudioLoad(_))), 2);
    }

    #[test]
    fn stop_pauses_and_clears() {
        let hw = TestHardware::new();
        let mut sink = hw.build().audio;
        let mut audio = AudioController::new("http://localhost:3000");
        audio.start("/a.mp3", sink.as_mut()).unwrap();
        audio.stop(sink.as_mut());

        let ops = hw.operations();
        assert_eq!(&ops[ops.len() - 2..], &[HardwareOp::AudioPause, HardwareOp::AudioClear]);
        assert_eq!(sink.source(), None);
        assert_eq!(audio.state(), ControllerState::Idle);
    }
}
