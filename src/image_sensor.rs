// Fake sensor that streams frames of a fixed image as MIPI packets. For
// testing and the demo binary; it honors the same buffer ping-pong cadence a
// real packet receiver would.

use canonical_error::{CanonicalError, invalid_argument_error};
use image::RgbImage;
use log::info;

use crate::auto_control::SensorControl;
use crate::config::CameraConfig;
use crate::mipi::{pack_header, DT_FRAME_END, DT_FRAME_START, DT_RAW8};
use crate::pipeline::PacketIo;

pub struct SyntheticSensor {
    width: usize,
    height: usize,
    /// RGGB Bayer field, one byte per photosite, row major.
    raw: Vec<u8>,
}

impl SyntheticSensor {
    /// A sensor whose every photosite reads `raw_value`.
    pub fn uniform(raw_value: u8, config: &CameraConfig) -> SyntheticSensor {
        SyntheticSensor {
            width: config.sensor_width,
            height: config.sensor_height,
            raw: vec![raw_value; config.sensor_width * config.sensor_height],
        }
    }

    /// Mosaics an RGB image into the RGGB Bayer field the sensor will
    /// replay. Image dimensions must match the configured geometry.
    pub fn from_rgb(image: &RgbImage, config: &CameraConfig)
                    -> Result<SyntheticSensor, CanonicalError> {
        let (width, height) = image.dimensions();
        if width as usize != config.sensor_width || height as usize != config.sensor_height {
            return Err(invalid_argument_error(
                format!("image is {}x{} but the sensor is {}x{}",
                        width, height, config.sensor_width, config.sensor_height).as_str()));
        }
        let mut raw = Vec::with_capacity(config.sensor_width * config.sensor_height);
        for y in 0..height {
            for x in 0..width {
                let pixel = image.get_pixel(x, y).0;
                // RGGB: even rows alternate R,G; odd rows alternate G,B.
                let value = match (y % 2, x % 2) {
                    (0, 0) => pixel[0],
                    (1, 1) => pixel[2],
                    _ => pixel[1],
                };
                raw.push(value);
            }
        }
        Ok(SyntheticSensor { width: config.sensor_width, height: config.sensor_height, raw })
    }

    /// Streams `frames` frames through the packet interface, swapping
    /// buffers with the processor one packet at a time. Returns early if the
    /// pipeline goes away.
    pub async fn stream_frames(self, mut io: PacketIo, frames: usize) {
        for _ in 0..frames {
            if !self.send_packet(&mut io, pack_header(DT_FRAME_START, 0), &[]).await {
                return;
            }
            for line in 0..self.height {
                let row = &self.raw[line * self.width..(line + 1) * self.width];
                if !self.send_packet(&mut io,
                                     pack_header(DT_RAW8, self.width as u16), row).await {
                    return;
                }
            }
            if !self.send_packet(&mut io, pack_header(DT_FRAME_END, 0), &[]).await {
                return;
            }
        }
    }

    async fn send_packet(&self, io: &mut PacketIo, header: u32, payload: &[u8]) -> bool {
        let Some(mut pkt) = io.free.recv().await else {
            return false;
        };
        pkt.header = header;
        pkt.payload[..payload.len()].copy_from_slice(payload);
        io.filled.send(pkt).await.is_ok()
    }
}

/// Sensor control endpoint with no register transport behind it; exposure
/// writes are just logged. Useful with `SyntheticSensor`, which has no
/// exposure to change.
pub struct LoggingSensorControl;

impl SensorControl for LoggingSensorControl {
    fn set_exposure(&mut self, exposure: u8) -> Result<(), CanonicalError> {
        info!("sensor exposure set to {}", exposure);
        Ok(())
    }
}
