// Auto-exposure / auto-white-balance control. A discrete-time feedback
// controller: one correction step per frame, open loop between frames.
// Skewness of the pixel-value distribution is the exposure error signal;
// per-channel percentiles drive the white-balance gains that the decimator
// picks up at the next frame start.

use canonical_error::CanonicalError;
use log::{debug, warn};
use tokio::sync::watch;

use crate::config::{CameraConfig, CHAN_BLUE, CHAN_GREEN, CHAN_RED, CHANNEL_COUNT};
use crate::statistics::ChannelStats;

/// Per-channel gains applied by the decimation filters. Published here once
/// per frame, after frame end; sampled by the decimator at the next frame
/// start. The frame boundary is the synchronization point.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct IspParams {
    pub channel_gain: [f32; CHANNEL_COUNT],
}

/// White-balance correction factors for one frame, relative to the gains the
/// frame was captured with.
#[derive(Copy, Clone, Debug)]
pub struct AwbGains {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
}

/// Channel gains are kept within this range regardless of what the
/// statistics suggest.
const GAIN_MIN: f32 = 0.25;
const GAIN_MAX: f32 = 4.0;

/// Writes exposure values to the sensor's control interface. Fire-and-forget
/// from the controller's perspective; the transport (register write, SPI,
/// simulation) is the implementer's concern.
pub trait SensorControl: Send {
    fn set_exposure(&mut self, exposure: u8) -> Result<(), CanonicalError>;
}

/// Scalar exposure error: skewness averaged across the color channels.
pub fn mean_skewness(stats: &[ChannelStats; CHANNEL_COUNT]) -> f32 {
    let sum: f32 = stats.iter().map(|s| s.skewness).sum();
    sum / CHANNEL_COUNT as f32
}

/// Default exposure policy: proportional correction. A bright-skewed
/// distribution (positive skewness) pulls exposure down, a dark-skewed one
/// pushes it up. The controller clamps the result to the sensor's 8-bit
/// range; swap this factory out to change the convergence shape.
pub fn proportional_exposure(loop_gain: f32) -> impl Fn(f32, f32) -> f32 {
    move |exposure, skewness| exposure * (1.0 - loop_gain * skewness)
}

pub struct ExposureController {
    exposure: u8,
    band: f32,
    loop_gain: f32,
}

impl ExposureController {
    pub fn new(config: &CameraConfig) -> ExposureController {
        ExposureController {
            exposure: config.initial_exposure,
            band: config.skewness_band,
            loop_gain: config.ae_loop_gain,
        }
    }

    /// True iff the distribution is already balanced enough that no
    /// correction should be made.
    pub fn is_adjusted(&self, skewness: f32) -> bool {
        skewness.abs() <= self.band
    }

    pub fn exposure(&self) -> u8 {
        self.exposure
    }

    /// One control step. Returns the new exposure to write, or None when the
    /// current exposure is already acceptable.
    pub fn update(&mut self, skewness: f32) -> Option<u8> {
        if self.is_adjusted(skewness) {
            return None;
        }
        let proposed = proportional_exposure(self.loop_gain)(self.exposure as f32, skewness);
        self.exposure = proposed.round().clamp(1.0, 255.0) as u8;
        Some(self.exposure)
    }
}

/// Derives white-balance correction factors from per-channel percentiles,
/// referenced to green: channels whose bright end falls short of green's are
/// boosted proportionally.
pub fn compute_awb_gains(stats: &[ChannelStats; CHANNEL_COUNT]) -> AwbGains {
    let reference = stats[CHAN_GREEN].percentile.max(1) as f32;
    AwbGains {
        red: reference / stats[CHAN_RED].percentile.max(1) as f32,
        green: 1.0,
        blue: reference / stats[CHAN_BLUE].percentile.max(1) as f32,
    }
}

/// Per-frame controller: applies the exposure step through the sensor
/// interface and publishes corrected channel gains for the next frame.
pub struct AutoController {
    exposure: ExposureController,
    sensor: Box<dyn SensorControl>,
    gains: watch::Sender<IspParams>,
}

impl AutoController {
    pub fn new(config: &CameraConfig,
               sensor: Box<dyn SensorControl>,
               gains: watch::Sender<IspParams>) -> AutoController {
        AutoController {
            exposure: ExposureController::new(config),
            sensor,
            gains,
        }
    }

    /// Consumes one frame's finalized statistics.
    pub fn end_of_frame(&mut self, stats: &[ChannelStats; CHANNEL_COUNT]) {
        let skewness = mean_skewness(stats);
        match self.exposure.update(skewness) {
            None => {
                debug!("mean skewness {:.4}: exposure adjusted", skewness);
            }
            Some(exposure) => {
                debug!("mean skewness {:.4}: new exposure {}", skewness, exposure);
                if let Err(e) = self.sensor.set_exposure(exposure) {
                    warn!("failed to write exposure: {}", e);
                }
            }
        }

        let corrections = compute_awb_gains(stats);
        let current = *self.gains.borrow();
        let updated = IspParams {
            channel_gain: [
                (current.channel_gain[CHAN_RED] * corrections.red)
                    .clamp(GAIN_MIN, GAIN_MAX),
                (current.channel_gain[CHAN_GREEN] * corrections.green)
                    .clamp(GAIN_MIN, GAIN_MAX),
                (current.channel_gain[CHAN_BLUE] * corrections.blue)
                    .clamp(GAIN_MIN, GAIN_MAX),
            ],
        };
        debug!("awb gains {:.3}/{:.3}/{:.3}",
               updated.channel_gain[CHAN_RED],
               updated.channel_gain[CHAN_GREEN],
               updated.channel_gain[CHAN_BLUE]);
        // The decimator samples these at the next frame start. If it is gone
        // the pipeline is shutting down; nothing to do.
        let _ = self.gains.send(updated);
    }
}
