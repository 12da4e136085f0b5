use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

pub const SAMPLE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamQuality {
    Excellent,
    Good,
    Poor,
}

impl StreamQuality {
    pub fn for_fps(fps: f64) -> Self {
        if fps >= 25.0 {
            StreamQuality::Excellent
        } else if fps >= 15.0 {
            StreamQuality::Good
        } else {
            StreamQuality::Poor
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameRateSample {
    pub fps: f64,
    pub quality: StreamQuality,
}

/// Counts frames and yields one sample per elapsed window.
#[derive(Debug)]
pub struct FrameRateMeter {
    window: Duration,
    started: Instant,
    frames: u32,
}

impl FrameRateMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            window: SAMPLE_WINDOW,
            started: now,
            frames: 0,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.started = now;
        self.frames = 0;
    }

    pub fn frame(&mut self, now: Instant) -> Option<FrameRateSample> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed < self.window {
            return None;
        }
        let fps = f64::from(self.frames) / elapsed.as_secs_f64();
        self.reset(now);
        Some(FrameRateSample {
            fps,
            quality: StreamQuality::for_fps(fps),
        })
    }
}
