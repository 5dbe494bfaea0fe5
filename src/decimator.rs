// Decimated capture path. Each Bayer line is horizontally filtered per
// channel and fed to the vertical accumulators; completed rows of the
// low-resolution working image travel to the statistics task through a
// two-slot buffer exchange. The slot being filled is never the slot being
// read downstream: a completed row is sent away and the other slot taken
// back before filling resumes.

use async_trait::async_trait;
use canonical_error::{CanonicalError, failed_precondition_error};
use tokio::sync::{mpsc, watch};

use crate::auto_control::IspParams;
use crate::capture_gate::{CaptureGate, ImageBuffer};
use crate::config::{CameraConfig, CHAN_BLUE, CHAN_GREEN, CHAN_RED, CHANNEL_COUNT};
use crate::filter::{pixel_hfilter, HFilterState, VFilterAcc};
use crate::packet_handler::{FrameSink, PacketHandlerState};

/// One row of the decimated working image, channel-major. Tagged with its
/// buffer slot so the alternation between "being filled" and "being read"
/// stays observable.
pub struct OutputRow {
    pub slot: usize,
    width: usize,
    pixels: Vec<i8>,
}

impl OutputRow {
    pub fn new(slot: usize, width: usize) -> OutputRow {
        OutputRow { slot, width, pixels: vec![0; CHANNEL_COUNT * width] }
    }

    pub fn channel(&self, channel: usize) -> &[i8] {
        &self.pixels[channel * self.width..(channel + 1) * self.width]
    }

    pub fn channel_mut(&mut self, channel: usize) -> &mut [i8] {
        &mut self.pixels[channel * self.width..(channel + 1) * self.width]
    }
}

/// What travels over the row channel: completed rows in emission order, then
/// one end-of-frame sentinel.
pub enum RowMessage {
    Row(Box<OutputRow>),
    FrameEnd,
}

pub struct DecimatingSink {
    stride: usize,
    hfilter: [HFilterState; CHANNEL_COUNT],
    vfilter: [VFilterAcc; CHANNEL_COUNT],
    /// Scratch row between the horizontal and vertical filters. Holds one
    /// color plane at a time; the horizontal filter separates color planes.
    hfilt_row: Vec<i8>,
    gains: watch::Receiver<IspParams>,
    /// The slot currently being filled.
    active: Box<OutputRow>,
    rows: mpsc::Sender<RowMessage>,
    returned: mpsc::Receiver<Box<OutputRow>>,
    gate: CaptureGate<ImageBuffer>,
}

impl DecimatingSink {
    pub fn new(config: &CameraConfig,
               gains: watch::Receiver<IspParams>,
               rows: mpsc::Sender<RowMessage>,
               returned: mpsc::Receiver<Box<OutputRow>>,
               active: Box<OutputRow>,
               gate: CaptureGate<ImageBuffer>) -> DecimatingSink {
        let width = config.image_width();
        let taps = config.decimation_factor / 2;
        let rows_per_output = config.rows_per_output();
        DecimatingSink {
            stride: config.decimation_factor,
            // Within a Bayer line red sits at even byte offsets; green and
            // blue are sampled from the odd offsets of their lines.
            hfilter: [HFilterState::new(taps, 0),
                      HFilterState::new(taps, 1),
                      HFilterState::new(taps, 1)],
            vfilter: [VFilterAcc::new(width, rows_per_output),
                      VFilterAcc::new(width, rows_per_output),
                      VFilterAcc::new(width, rows_per_output)],
            hfilt_row: vec![0; width],
            gains,
            active,
            rows,
            returned,
            gate,
        }
    }

    /// Sends the completed row downstream and swaps in the other slot.
    async fn emit_row(&mut self, state: &mut PacketHandlerState)
                      -> Result<(), CanonicalError> {
        let row_index = state.out_line_number as usize;

        // Copy into a waiting consumer's image before the row leaves our
        // ownership.
        if let Some(image) = self.gate.active_mut() {
            if row_index < image.height {
                for c in 0..CHANNEL_COUNT {
                    image.fill_row(c, row_index, self.active.channel(c));
                }
            }
        }

        let next = self.returned.recv().await
            .ok_or_else(|| failed_precondition_error("row return channel closed"))?;
        let filled = std::mem::replace(&mut self.active, next);
        self.rows.send(RowMessage::Row(filled)).await
            .map_err(|_| failed_precondition_error("row channel closed"))?;

        state.out_line_number += 1;
        Ok(())
    }
}

#[async_trait]
impl FrameSink for DecimatingSink {
    async fn frame_start(&mut self, _state: &PacketHandlerState) {
        // New frame: refresh filter scales from the current ISP gains and
        // reset the vertical accumulators.
        let gains = *self.gains.borrow();
        for c in 0..CHANNEL_COUNT {
            self.hfilter[c].update_scale(gains.channel_gain[c]);
            self.vfilter[c].frame_init();
        }
        self.gate.request_begin();
    }

    async fn pixel_line(&mut self, state: &mut PacketHandlerState, line: &[u8])
                        -> Result<(), CanonicalError> {
        // Bayer pattern is RGGB; even-index lines carry RG data, odd-index
        // lines carry GB data.
        if state.in_line_number % 2 == 0 {
            pixel_hfilter(&mut self.hfilt_row, line, &self.hfilter[CHAN_RED], self.stride);
            self.vfilter[CHAN_RED].process_row(
                self.active.channel_mut(CHAN_RED), &self.hfilt_row);

            pixel_hfilter(&mut self.hfilt_row, line, &self.hfilter[CHAN_GREEN], self.stride);
            self.vfilter[CHAN_GREEN].process_row(
                self.active.channel_mut(CHAN_GREEN), &self.hfilt_row);
        } else {
            pixel_hfilter(&mut self.hfilt_row, line, &self.hfilter[CHAN_BLUE], self.stride);
            // Blue is the last channel through the accumulator, so a
            // completed blue row means all three channels completed.
            if self.vfilter[CHAN_BLUE].process_row(
                self.active.channel_mut(CHAN_BLUE), &self.hfilt_row) {
                self.emit_row(state).await?;
            }
        }
        Ok(())
    }

    async fn frame_end(&mut self, state: &mut PacketHandlerState)
                       -> Result<(), CanonicalError> {
        // Flush whatever the vertical accumulators still hold.
        self.vfilter[CHAN_RED].drain(self.active.channel_mut(CHAN_RED));
        self.vfilter[CHAN_GREEN].drain(self.active.channel_mut(CHAN_GREEN));
        if self.vfilter[CHAN_BLUE].drain(self.active.channel_mut(CHAN_BLUE)) {
            self.emit_row(state).await?;
        }

        self.rows.send(RowMessage::FrameEnd).await
            .map_err(|_| failed_precondition_error("row channel closed"))?;

        // A waiting consumer now has its complete image.
        self.gate.request_complete();
        Ok(())
    }
}
