//! Synthetic frame source for `stub://` camera URLs.
//!
//! Produces a slowly moving gradient at a capped frame rate so demos behave
//! like a real camera without hardware.

use std::time::{Duration, Instant};

use anyhow::Result;

use super::{FrameSource, SourceStats};
use crate::error::AttendanceError;
use crate::frame::{Frame, PixelFormat};

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub url: String,
    pub width: u32,
    pub height: u32,
    /// Frame rate cap (frames per second). 0 disables pacing.
    pub target_fps: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            width: 640,
            height: 480,
            target_fps: 15,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    open: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            open: false,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    fn pace(&self) {
        if self.config.target_fps == 0 {
            return;
        }
        let interval = Duration::from_millis(1000 / self.config.target_fps as u64);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let (w, h) = (self.config.width as u64, self.config.height as u64);
        let shift = self.frame_count * 2;
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                pixels.push(((x + shift) % 256) as u8);
                pixels.push(((y + shift / 2) % 256) as u8);
                pixels.push(128);
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("{} (synthetic)", self.config.url)
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>, AttendanceError> {
        if !self.open {
            return Err(AttendanceError::ConnectionFailure(anyhow::anyhow!(
                "synthetic source not open"
            )));
        }
        self.pace();
        let pixels = self.generate_pixels();
        let frame = Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            PixelFormat::Rgb24,
        )
        .map_err(AttendanceError::DecodeFailure)?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(frame))
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.url.clone(),
            healthy: self.open,
        }
    }
}
