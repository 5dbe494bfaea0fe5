// Per-frame image statistics. An independent task consumes the decimated row
// stream; rows accumulate into per-channel histograms until the end-of-frame
// sentinel, at which point skewness, simple stats and the white-balance
// percentile are computed and handed to the controller.

use log::debug;
use tokio::sync::mpsc;

use crate::auto_control::AutoController;
use crate::config::{CameraConfig, CHANNEL_COUNT, HISTOGRAM_BIN_COUNT,
                    HISTOGRAM_QUANTIZATION_BITS};
use crate::decimator::{OutputRow, RowMessage};

/// Z-score of the standard normal distribution at the center of each
/// histogram bin. The skewness of a frame is the histogram's dot product
/// with this table.
const ZK_VALUES: [f32; HISTOGRAM_BIN_COUNT] = [
    -1.000000, -0.907753, -0.821362, -0.740633, -0.665375, -0.595396,
    -0.530504, -0.470508, -0.415214, -0.364431, -0.317968, -0.275632,
    -0.237231, -0.202574, -0.171468, -0.143721, -0.119142, -0.097538,
    -0.078717, -0.062488, -0.048659, -0.037037, -0.027431, -0.019648,
    -0.013497, -0.008786, -0.005323, -0.002915, -0.001372, -0.000005,
    -0.000108,    -4e-06,     4e-06,  0.000108,    0.0005,  0.001372,
     0.002915,  0.005323,  0.008786,  0.013497,  0.019648,  0.027431,
     0.037037,  0.048659,  0.062488,  0.078717,  0.097538,  0.119142,
     0.143721,  0.171468,  0.202574,  0.237231,  0.275632,  0.317968,
     0.364431,  0.415214,  0.470508,  0.530504,  0.595396,  0.665375,
     0.740633,  0.821362,  0.907753,  1.0];

#[derive(Clone, Debug)]
pub struct ChannelHistogram {
    pub bins: [u32; HISTOGRAM_BIN_COUNT],
}

impl Default for ChannelHistogram {
    fn default() -> Self {
        ChannelHistogram { bins: [0; HISTOGRAM_BIN_COUNT] }
    }
}

/// One channel's statistics for one frame. Histogram plus derived values;
/// re-created fresh at every frame start.
#[derive(Clone, Debug, Default)]
pub struct ChannelStats {
    pub histogram: ChannelHistogram,
    /// Mean pixel value, in raw (unsigned, unquantized) units.
    pub mean: f32,
    /// Smallest and largest observed values, reconstructed to raw units from
    /// their quantized bins.
    pub min: u8,
    pub max: u8,
    pub skewness: f32,
    pub percentile: u8,
}

/// Accumulates one decimated row into the histogram, sampling every
/// `sample_step`-th pixel. Written without early exits: run time must not
/// depend on image content.
pub fn update_histogram(hist: &mut ChannelHistogram, pix: &[i8], sample_step: usize) {
    for k in (0..pix.len()).step_by(sample_step) {
        let val = (pix[k] as i32 + 128) >> HISTOGRAM_QUANTIZATION_BITS;
        hist.bins[val as usize] += 1;
    }
}

/// Computes channel skewness, the auto-exposure error signal.
///
/// The dot product assumes a histogram normalized into a probability
/// distribution summing to 1.0. Every bin shares the same scale factor, so
/// the normalization is deferred to this single point.
pub fn compute_skewness(stats: &mut ChannelStats, norm_factor: f32) {
    let mut skew = 0.0f32;
    for (k, &count) in stats.histogram.bins.iter().enumerate() {
        skew += ZK_VALUES[k] * count as f32;
    }
    stats.skewness = skew * norm_factor;
}

/// Computes mean, min and max over the histogram in one pass. Min and max
/// are reported in raw pixel units; reconstruction from the quantized bin
/// index biases them downwards by up to the quantization step.
pub fn compute_simple_stats(stats: &mut ChannelStats, norm_factor: f32) {
    let mut weighted: u64 = 0;
    let mut lowest = HISTOGRAM_BIN_COUNT;
    let mut highest = 0usize;
    for (k, &count) in stats.histogram.bins.iter().enumerate() {
        weighted += count as u64 * k as u64;
        if count != 0 {
            if lowest == HISTOGRAM_BIN_COUNT {
                lowest = k;
            }
            highest = k;
        }
    }
    if lowest == HISTOGRAM_BIN_COUNT {
        // Empty histogram.
        lowest = 0;
    }
    stats.min = (lowest << HISTOGRAM_QUANTIZATION_BITS) as u8;
    stats.max = (highest << HISTOGRAM_QUANTIZATION_BITS) as u8;
    stats.mean = weighted as f32 * (1 << HISTOGRAM_QUANTIZATION_BITS) as f32 * norm_factor;
}

/// Finds the value below which `fraction` of the samples fall. Single
/// forward pass; ties resolve to the first bin that crosses the threshold.
/// Could exit early once the threshold is crossed, but that would make run
/// time depend on the image itself, which is undesirable on this path.
pub fn find_percentile(stats: &mut ChannelStats, fraction: f32, total_samples: u32) {
    let threshold = (fraction * total_samples as f32) as u32;
    let mut result = 0u8;
    let mut total = 0u32;
    for (k, &count) in stats.histogram.bins.iter().enumerate() {
        let new_total = total + count;
        if total < threshold && new_total >= threshold {
            result = (k << HISTOGRAM_QUANTIZATION_BITS) as u8;
        }
        total = new_total;
    }
    stats.percentile = result;
}

/// Statistics task entry point. Consumes the row stream frame by frame and
/// drives the AE/AWB controller at each frame end. Exits when the row stream
/// closes.
pub async fn statistics_task(mut rows: mpsc::Receiver<RowMessage>,
                             returned: mpsc::Sender<Box<OutputRow>>,
                             mut controller: AutoController,
                             config: CameraConfig) {
    let total_samples = config.samples_per_frame() as u32;
    let norm_factor = 1.0 / total_samples as f32;

    // Outer loop iterates over frames.
    'frames: loop {
        let mut stats: [ChannelStats; CHANNEL_COUNT] = Default::default();

        // Inner loop accumulates rows until the end-of-frame sentinel.
        loop {
            match rows.recv().await {
                None => break 'frames,
                Some(RowMessage::FrameEnd) => break,
                Some(RowMessage::Row(row)) => {
                    for (c, channel_stats) in stats.iter_mut().enumerate() {
                        update_histogram(&mut channel_stats.histogram,
                                         row.channel(c),
                                         config.histogram_sample_step);
                    }
                    // Give the slot back so the decimator can refill it.
                    if returned.send(row).await.is_err() {
                        break 'frames;
                    }
                }
            }
        }

        for channel_stats in stats.iter_mut() {
            compute_skewness(channel_stats, norm_factor);
            compute_simple_stats(channel_stats, norm_factor);
            find_percentile(channel_stats, config.wb_percentile, total_samples);
        }
        debug!("skewness {:.4}/{:.4}/{:.4}",
               stats[0].skewness, stats[1].skewness, stats[2].skewness);

        controller.end_of_frame(&stats);
    }
    debug!("row stream closed; statistics task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auto_control::{IspParams, SensorControl};
    use canonical_error::CanonicalError;
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;

    #[test]
    fn histogram_maps_signed_values_to_bins() {
        let mut hist = ChannelHistogram::default();
        update_histogram(&mut hist, &[-128, 0, 127], 1);
        assert_eq!(hist.bins[0], 1);    // Raw 0.
        assert_eq!(hist.bins[32], 1);   // Mid gray.
        assert_eq!(hist.bins[63], 1);   // Raw 255.
        assert_eq!(hist.bins.iter().sum::<u32>(), 3);
    }

    #[test]
    fn histogram_honors_sample_stride() {
        let mut hist = ChannelHistogram::default();
        update_histogram(&mut hist, &[0i8; 16], 4);
        assert_eq!(hist.bins[32], 4);
    }

    #[test]
    fn simple_stats_bracket_the_mean() {
        let mut stats = ChannelStats::default();
        stats.histogram.bins[10] = 30;
        stats.histogram.bins[50] = 70;
        compute_simple_stats(&mut stats, 1.0 / 100.0);

        assert_eq!(stats.min, 10 << HISTOGRAM_QUANTIZATION_BITS);
        assert_eq!(stats.max, 50 << HISTOGRAM_QUANTIZATION_BITS);
        assert!((stats.mean - 152.0).abs() < 1e-3);
        assert!(stats.min as f32 <= stats.mean);
        assert!(stats.mean <= stats.max as f32);
        // Reconstructed bounds are multiples of the quantization step.
        assert_eq!(stats.min % (1 << HISTOGRAM_QUANTIZATION_BITS), 0);
        assert_eq!(stats.max % (1 << HISTOGRAM_QUANTIZATION_BITS), 0);
    }

    #[test]
    fn skewness_of_mirrored_histogram_is_zero() {
        let mut stats = ChannelStats::default();
        for (k, count) in [(3usize, 40u32), (10, 25), (20, 100), (28, 7)] {
            stats.histogram.bins[k] = count;
            stats.histogram.bins[HISTOGRAM_BIN_COUNT - 1 - k] = count;
        }
        let total: u32 = stats.histogram.bins.iter().sum();
        compute_skewness(&mut stats, 1.0 / total as f32);
        assert!(stats.skewness.abs() < 1e-3, "skewness {}", stats.skewness);
    }

    #[test]
    fn skewness_sign_follows_the_heavy_tail() {
        let mut bright = ChannelStats::default();
        bright.histogram.bins[60] = 90;
        bright.histogram.bins[10] = 10;
        compute_skewness(&mut bright, 1.0 / 100.0);
        assert!(bright.skewness > 0.0);

        let mut dark = ChannelStats::default();
        dark.histogram.bins[3] = 90;
        dark.histogram.bins[50] = 10;
        compute_skewness(&mut dark, 1.0 / 100.0);
        assert!(dark.skewness < 0.0);
    }

    #[test]
    fn percentile_is_monotonic_in_the_fraction() {
        let mut stats = ChannelStats::default();
        stats.histogram.bins[5] = 25;
        stats.histogram.bins[20] = 50;
        stats.histogram.bins[40] = 25;

        let mut previous = 0u8;
        for percent in 1..=100 {
            find_percentile(&mut stats, percent as f32 / 100.0, 100);
            assert!(stats.percentile >= previous,
                    "fraction {} regressed {} -> {}",
                    percent, previous, stats.percentile);
            previous = stats.percentile;
        }
        // The last crossing is the top occupied bin.
        assert_eq!(previous, 40 << HISTOGRAM_QUANTIZATION_BITS);
    }

    #[test]
    fn percentile_ties_resolve_to_first_crossing() {
        let mut stats = ChannelStats::default();
        stats.histogram.bins[12] = 100;
        find_percentile(&mut stats, 0.5, 100);
        assert_eq!(stats.percentile, 12 << HISTOGRAM_QUANTIZATION_BITS);
    }

    #[test]
    fn mid_gray_frame_concentrates_and_balances() {
        // A uniform mid-gray frame lands in the bin containing value zero
        // and carries (numerically) no skew.
        let mut stats = ChannelStats::default();
        let row = [0i8; 32];
        for _ in 0..32 {
            update_histogram(&mut stats.histogram, &row, 1);
        }
        assert_eq!(stats.histogram.bins[32], 32 * 32);
        assert_eq!(stats.histogram.bins.iter().sum::<u32>(), 32 * 32);
        compute_skewness(&mut stats, 1.0 / (32.0 * 32.0));
        assert!(stats.skewness.abs() < 1e-4);
    }

    struct RecordingSensor {
        writes: Arc<Mutex<Vec<u8>>>,
    }

    impl SensorControl for RecordingSensor {
        fn set_exposure(&mut self, exposure: u8) -> Result<(), CanonicalError> {
            self.writes.lock().unwrap().push(exposure);
            Ok(())
        }
    }

    #[tokio::test]
    async fn task_finalizes_a_frame_and_drives_the_controller() {
        let config = CameraConfig {
            sensor_width: 64,
            sensor_height: 64,
            decimation_factor: 2,
            ..CameraConfig::default()
        };
        let width = config.image_width();

        let (row_tx, row_rx) = mpsc::channel(4);
        let (rtn_tx, mut rtn_rx) = mpsc::channel(4);
        let (gains_tx, _gains_rx) = watch::channel(
            IspParams { channel_gain: config.initial_gains });
        let writes = Arc::new(Mutex::new(Vec::new()));
        let controller = AutoController::new(
            &config, Box::new(RecordingSensor { writes: writes.clone() }), gains_tx);

        let task = tokio::spawn(statistics_task(row_rx, rtn_tx, controller, config));

        // A run of very dark rows, then end of frame: heavy low-end skew,
        // well outside the acceptance band.
        for _ in 0..8 {
            let mut row = OutputRow::new(0, width);
            for c in 0..CHANNEL_COUNT {
                row.channel_mut(c).fill(-128);
            }
            row_tx.send(RowMessage::Row(Box::new(row))).await.unwrap();
            // Each row buffer comes back for reuse.
            let returned = rtn_rx.recv().await.unwrap();
            assert_eq!(returned.slot, 0);
        }
        row_tx.send(RowMessage::FrameEnd).await.unwrap();

        drop(row_tx);
        task.await.unwrap();

        // Dark frame: the controller pushed exposure up, once.
        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert!(writes[0] > CameraConfig::default().initial_exposure);
    }
}
