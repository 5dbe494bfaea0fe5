// Pipeline assembly. Builds every channel, seeds the buffer pools and spawns
// the cooperating tasks. The caller keeps the PacketIo end and feeds it from
// the packet receiver; dropping it shuts the whole pipeline down, each task
// observing the closure at its blocking point.

use canonical_error::CanonicalError;
use log::info;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::auto_control::{AutoController, IspParams, SensorControl};
use crate::capture_gate::{CaptureClient, CaptureGate, RawCaptureClient};
use crate::config::CameraConfig;
use crate::decimator::{DecimatingSink, OutputRow};
use crate::mipi::MipiPacket;
use crate::packet_handler::PacketHandler;
use crate::raw_capture::RawSink;
use crate::statistics::statistics_task;

/// The packet receiver's side of the buffer exchange: take a free buffer,
/// fill it, send it back. One buffer is outstanding at a time.
pub struct PacketIo {
    pub free: mpsc::Receiver<Box<MipiPacket>>,
    pub filled: mpsc::Sender<Box<MipiPacket>>,
}

/// A running decimated-capture pipeline.
pub struct CameraPipeline {
    pub capture: CaptureClient,
    handler: JoinHandle<()>,
    statistics: JoinHandle<()>,
}

impl CameraPipeline {
    /// Waits for both tasks to finish. They exit once the packet stream
    /// closes (the `PacketIo` end is dropped).
    pub async fn join(self) {
        let _ = self.handler.await;
        let _ = self.statistics.await;
    }
}

/// Starts the decimated pipeline: packet handler plus statistics/control
/// tasks, wired by bounded channels. Must be called within a tokio runtime.
pub fn start(config: CameraConfig, sensor: Box<dyn SensorControl>)
             -> Result<(CameraPipeline, PacketIo), CanonicalError> {
    config.validate()?;
    let width = config.image_width();
    info!("starting decimated pipeline: {}x{} sensor -> {}x{} working image",
          config.sensor_width, config.sensor_height, width, config.image_height());

    let (filled_tx, filled_rx) = mpsc::channel(config.pkt_buffer_count);
    let (free_tx, free_rx) = mpsc::channel(config.pkt_buffer_count);
    let (row_tx, row_rx) = mpsc::channel(1);
    let (returned_tx, returned_rx) = mpsc::channel(2);
    let (request_tx, request_rx) = mpsc::channel(1);
    let (gains_tx, gains_rx) = watch::channel(
        IspParams { channel_gain: config.initial_gains });

    // Slot 0 starts in the decimator's hands, slot 1 waits in the return
    // channel; from then on the two alternate through the exchange.
    returned_tx.try_send(Box::new(OutputRow::new(1, width)))
        .expect("row return channel empty at startup");

    let sink = DecimatingSink::new(&config, gains_rx, row_tx, returned_rx,
                                   Box::new(OutputRow::new(0, width)),
                                   CaptureGate::new(request_rx));
    let handler = PacketHandler::new(sink, config.sensor_height, config.line_bytes());
    let controller = AutoController::new(&config, sensor, gains_tx);

    let pkt_buffer_count = config.pkt_buffer_count;
    let capture = CaptureClient::new(request_tx, width, config.image_height());
    let handler_task = tokio::spawn(handler.run(filled_rx, free_tx, pkt_buffer_count));
    let statistics = tokio::spawn(statistics_task(row_rx, returned_tx, controller, config));

    Ok((CameraPipeline { capture, handler: handler_task, statistics },
        PacketIo { free: free_rx, filled: filled_tx }))
}

/// A running raw-capture pipeline. No statistics or control loop; frames go
/// verbatim to whoever asked for one.
pub struct RawCameraPipeline {
    pub capture: RawCaptureClient,
    handler: JoinHandle<()>,
}

impl RawCameraPipeline {
    pub async fn join(self) {
        let _ = self.handler.await;
    }
}

/// Starts the raw-capture variant of the pipeline. Must be called within a
/// tokio runtime.
pub fn start_raw(config: CameraConfig)
                 -> Result<(RawCameraPipeline, PacketIo), CanonicalError> {
    config.validate()?;
    info!("starting raw pipeline: {}x{} sensor",
          config.sensor_width, config.sensor_height);

    let (filled_tx, filled_rx) = mpsc::channel(config.pkt_buffer_count);
    let (free_tx, free_rx) = mpsc::channel(config.pkt_buffer_count);
    let (request_tx, request_rx) = mpsc::channel(1);

    let sink = RawSink::new(config.line_bytes(), CaptureGate::new(request_rx));
    let handler = PacketHandler::new(sink, config.sensor_height, config.line_bytes());

    let capture = RawCaptureClient::new(
        request_tx, config.sensor_height * config.line_bytes());
    let handler_task = tokio::spawn(
        handler.run(filled_rx, free_tx, config.pkt_buffer_count));

    Ok((RawCameraPipeline { capture, handler: handler_task }, PacketIo {
        free: free_rx,
        filled: filled_tx,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_sensor::LoggingSensorControl;

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let mut config = CameraConfig::default();
        config.decimation_factor = 3;
        assert!(start(config, Box::new(LoggingSensorControl)).is_err());

        let mut config = CameraConfig::default();
        config.pkt_buffer_count = 5;
        assert!(start_raw(config).is_err());
    }

    #[tokio::test]
    async fn pipeline_shuts_down_when_packet_io_drops() {
        let (pipeline, io) = start(CameraConfig::default(),
                                   Box::new(LoggingSensorControl)).unwrap();
        drop(io);
        pipeline.join().await;
    }
}
