//! Encode settings planning for the relay agent
//!
//! Maps a live probe of the source plus the hardware-acceleration switch to a
//! concrete encode profile. Everything in here is pure and deterministic.

use crate::analyzer::ProbeResult;
use crate::config::EncodeConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest output frame the planner will emit.
pub const MAX_WIDTH: u32 = 2560;
pub const MAX_HEIGHT: u32 = 1440;

/// Frame-rate bounds every profile must respect.
pub const MIN_FPS: u32 = 15;
pub const MAX_FPS: u32 = 120;

/// Ceiling applied by the fps bucketing.
const FPS_CEILING: u32 = 60;

/// Output codec chosen by the planner.
const PLANNED_CODEC: &str = "h264";

const PIXELS_1440P: u64 = 2560 * 1440;
const PIXELS_1080P: u64 = 1920 * 1080;
const PIXELS_720P: u64 = 1280 * 720;

/// Errors raised when a profile violates its invariants.
#[derive(Debug, Error, PartialEq)]
pub enum ProfileError {
    #[error("dimensions {width}x{height} must be non-zero and even")]
    OddDimensions { width: u32, height: u32 },

    #[error("fps {0} outside [15, 120]")]
    FpsOutOfRange(u32),

    #[error("max bitrate {max_bitrate_kbps}k below target {bitrate_kbps}k")]
    MaxBelowTarget {
        bitrate_kbps: u32,
        max_bitrate_kbps: u32,
    },
}

/// Concrete parameters for one encoding run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub codec: String,
    pub hardware_accel: bool,
}

impl EncodeProfile {
    /// Check the profile invariants: even non-zero dimensions, fps within
    /// bounds and a max bitrate no lower than the target.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(ProfileError::OddDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if !(MIN_FPS..=MAX_FPS).contains(&self.fps) {
            return Err(ProfileError::FpsOutOfRange(self.fps));
        }
        if self.max_bitrate_kbps < self.bitrate_kbps {
            return Err(ProfileError::MaxBelowTarget {
                bitrate_kbps: self.bitrate_kbps,
                max_bitrate_kbps: self.max_bitrate_kbps,
            });
        }
        Ok(())
    }

    /// Build the configured default profile, used whenever probing is
    /// disabled or fails before any profile has been planned.
    pub fn from_config(cfg: &EncodeConfig) -> Result<Self, ProfileError> {
        let profile = Self {
            width: cfg.width,
            height: cfg.height,
            fps: cfg.fps,
            bitrate_kbps: cfg.bitrate_kbps,
            max_bitrate_kbps: cfg.max_bitrate_kbps,
            codec: cfg.codec.clone(),
            hardware_accel: cfg.hardware_acceleration,
        };
        profile.validate()?;
        Ok(profile)
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Plan an encode profile from a probe result.
///
/// Rules:
/// - Resolution above 1440p is scaled down into 2560x1440 keeping the aspect
///   ratio; anything at or below is kept. Dimensions are floored to even.
/// - FPS is bucketed: >=50 -> 60, >40 -> 50, 30..=40 -> unchanged, >25 -> 30,
///   otherwise 25.
/// - Bitrate comes from a pixel-count tier (higher bases with hardware
///   acceleration), scaled by 1.6 at >=50 fps and 1.3 above 30 fps. The max
///   bitrate is 1.3x the target.
pub fn plan(probe: &ProbeResult, hw_accel: bool) -> EncodeProfile {
    let (width, height) = plan_resolution(probe.width, probe.height);
    let fps = bucket_fps(probe.fps);

    let base = base_bitrate_kbps(width as u64 * height as u64, hw_accel);
    let bitrate_kbps = (base as f64 * fps_factor(fps)).round() as u32;
    let max_bitrate_kbps = (bitrate_kbps as f64 * 1.3).round() as u32;

    EncodeProfile {
        width,
        height,
        fps,
        bitrate_kbps,
        max_bitrate_kbps,
        codec: PLANNED_CODEC.to_string(),
        hardware_accel: hw_accel,
    }
}

/// Cap to 2560x1440 and force even dimensions.
fn plan_resolution(width: u32, height: u32) -> (u32, u32) {
    let (width, height) = if width == 0 || height == 0 {
        (1280, 720)
    } else {
        (width, height)
    };

    if width <= MAX_WIDTH && height <= MAX_HEIGHT {
        return (floor_even(width), floor_even(height));
    }

    // Integer scaling keeps exact 16:9 sources exact.
    let (w, h) = (width as u64, height as u64);
    let (scaled_w, scaled_h) = if w * MAX_HEIGHT as u64 >= h * MAX_WIDTH as u64 {
        (MAX_WIDTH as u64, h * MAX_WIDTH as u64 / w)
    } else {
        (w * MAX_HEIGHT as u64 / h, MAX_HEIGHT as u64)
    };

    (floor_even(scaled_w as u32), floor_even(scaled_h as u32))
}

fn floor_even(value: u32) -> u32 {
    (value & !1).max(2)
}

/// Bucket a probed frame rate into an output frame rate.
pub fn bucket_fps(fps: f64) -> u32 {
    let bucketed = if fps >= 50.0 {
        60
    } else if fps > 40.0 {
        50
    } else if fps >= 30.0 {
        fps.round() as u32
    } else if fps > 25.0 {
        30
    } else {
        25
    };
    bucketed.clamp(MIN_FPS, FPS_CEILING)
}

fn base_bitrate_kbps(pixels: u64, hw_accel: bool) -> u32 {
    match (pixels, hw_accel) {
        (p, true) if p >= PIXELS_1440P => 6000,
        (p, false) if p >= PIXELS_1440P => 4500,
        (p, true) if p >= PIXELS_1080P => 4500,
        (p, false) if p >= PIXELS_1080P => 3500,
        (p, true) if p >= PIXELS_720P => 3000,
        (p, false) if p >= PIXELS_720P => 2500,
        (_, true) => 1800,
        (_, false) => 1500,
    }
}

fn fps_factor(fps: u32) -> f64 {
    if fps >= 50 {
        1.6
    } else if fps > 30 {
        1.3
    } else {
        1.0
    }
}
