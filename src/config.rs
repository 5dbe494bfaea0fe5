use canonical_error::{CanonicalError, invalid_argument_error};

/// Color channel indices used throughout the pipeline. Rows with even index
/// carry {R, G} samples and rows with odd index carry {G, B} samples (RGGB
/// Bayer layout), so blue is always the last channel to complete a row.
pub const CHAN_RED: usize = 0;
pub const CHAN_GREEN: usize = 1;
pub const CHAN_BLUE: usize = 2;
pub const CHANNEL_COUNT: usize = 3;

/// Histograms quantize 8-bit pixel values down to this many bits' worth of
/// bins. Fixed rather than configurable: the skewness z-score table has one
/// entry per bin.
pub const HISTOGRAM_QUANTIZATION_BITS: u32 = 2;
pub const HISTOGRAM_BIN_COUNT: usize = 1 << (8 - HISTOGRAM_QUANTIZATION_BITS);

// Build defaults. A given build targets one fixed sensor geometry; tests
// construct alternate CameraConfig values directly.
pub const SENSOR_WIDTH: usize = 640;
pub const SENSOR_HEIGHT: usize = 480;
pub const DECIMATION_FACTOR: usize = 4;
pub const HISTOGRAM_SAMPLE_STEP: usize = 1;
pub const PKT_BUFFER_COUNT: usize = 4;

/// Initial channel scales.
pub const AWB_GAIN_RED: f32 = 1.3;
pub const AWB_GAIN_GREEN: f32 = 0.8;
pub const AWB_GAIN_BLUE: f32 = 1.3;

pub const INITIAL_EXPOSURE: u8 = 35;
pub const SKEWNESS_BAND: f32 = 0.05;
pub const AE_LOOP_GAIN: f32 = 0.5;
pub const WB_PERCENTILE: f32 = 0.94;

/// Camera pipeline configuration. All values are fixed for the lifetime of a
/// pipeline; `Default` reflects the build constants above.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Sensor active-array width in pixels; also the RAW8 line width in bytes.
    pub sensor_width: usize,
    /// Sensor active-array height in lines.
    pub sensor_height: usize,
    /// Combined horizontal/vertical decimation factor. Power of two, >= 2.
    pub decimation_factor: usize,
    /// Histogram sampling stride along a decimated row.
    pub histogram_sample_step: usize,
    /// Number of packet buffers ping-ponged with the receiver. Power of two.
    pub pkt_buffer_count: usize,
    /// |mean skewness| at or below this is considered adjusted; no exposure
    /// write is issued.
    pub skewness_band: f32,
    /// Proportional gain of the exposure correction step.
    pub ae_loop_gain: f32,
    /// Fraction of samples below the per-channel reference value used for
    /// white balance.
    pub wb_percentile: f32,
    /// Channel gains applied until the white-balance loop publishes its own.
    pub initial_gains: [f32; CHANNEL_COUNT],
    /// Exposure value assumed at startup.
    pub initial_exposure: u8,
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig {
            sensor_width: SENSOR_WIDTH,
            sensor_height: SENSOR_HEIGHT,
            decimation_factor: DECIMATION_FACTOR,
            histogram_sample_step: HISTOGRAM_SAMPLE_STEP,
            pkt_buffer_count: PKT_BUFFER_COUNT,
            skewness_band: SKEWNESS_BAND,
            ae_loop_gain: AE_LOOP_GAIN,
            wb_percentile: WB_PERCENTILE,
            initial_gains: [AWB_GAIN_RED, AWB_GAIN_GREEN, AWB_GAIN_BLUE],
            initial_exposure: INITIAL_EXPOSURE,
        }
    }
}

impl CameraConfig {
    /// Width of the decimated working image.
    pub fn image_width(&self) -> usize {
        self.sensor_width / self.decimation_factor
    }

    /// Height of the decimated working image.
    pub fn image_height(&self) -> usize {
        self.sensor_height / self.decimation_factor
    }

    /// Bytes per RAW8 sensor line.
    pub fn line_bytes(&self) -> usize {
        self.sensor_width
    }

    /// Sensor rows of one Bayer parity accumulated per decimated output row.
    pub fn rows_per_output(&self) -> usize {
        self.decimation_factor / 2
    }

    /// Histogram samples taken from each decimated row.
    pub fn samples_per_row(&self) -> usize {
        (self.image_width() + self.histogram_sample_step - 1) / self.histogram_sample_step
    }

    /// Histogram samples taken from one frame, per channel.
    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_row() * self.image_height()
    }

    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.decimation_factor < 2 || !self.decimation_factor.is_power_of_two() {
            return Err(invalid_argument_error(
                format!("decimation_factor {} must be a power of two >= 2",
                        self.decimation_factor).as_str()));
        }
        if self.sensor_width == 0 || self.sensor_width % self.decimation_factor != 0 {
            return Err(invalid_argument_error(
                format!("sensor_width {} must be a non-zero multiple of decimation_factor {}",
                        self.sensor_width, self.decimation_factor).as_str()));
        }
        if self.sensor_height == 0 || self.sensor_height % self.decimation_factor != 0 {
            return Err(invalid_argument_error(
                format!("sensor_height {} must be a non-zero multiple of decimation_factor {}",
                        self.sensor_height, self.decimation_factor).as_str()));
        }
        if self.histogram_sample_step == 0 {
            return Err(invalid_argument_error("histogram_sample_step must be non-zero"));
        }
        if !self.pkt_buffer_count.is_power_of_two() {
            return Err(invalid_argument_error(
                format!("pkt_buffer_count {} must be a power of two",
                        self.pkt_buffer_count).as_str()));
        }
        if !(0.0..=1.0).contains(&self.wb_percentile) {
            return Err(invalid_argument_error(
                format!("wb_percentile {} must be within 0..=1", self.wb_percentile).as_str()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CameraConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.image_width(), SENSOR_WIDTH / DECIMATION_FACTOR);
        assert_eq!(config.image_height(), SENSOR_HEIGHT / DECIMATION_FACTOR);
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut config = CameraConfig::default();
        config.decimation_factor = 3;
        assert!(config.validate().is_err());

        let mut config = CameraConfig::default();
        config.sensor_width = 641;
        assert!(config.validate().is_err());

        let mut config = CameraConfig::default();
        config.pkt_buffer_count = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn derived_quantities() {
        let config = CameraConfig {
            sensor_width: 64,
            sensor_height: 64,
            decimation_factor: 2,
            ..CameraConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.image_width(), 32);
        assert_eq!(config.image_height(), 32);
        assert_eq!(config.rows_per_output(), 1);
        assert_eq!(config.samples_per_frame(), 32 * 32);
    }
}
