// Packet-handling state machine. Classifies each received MIPI packet,
// tracks frame/line position, and forwards pixel data to a FrameSink. The
// sink decides what a frame becomes: a decimated working image or a verbatim
// raw copy. Frame and line bookkeeping lives here; everything that interprets
// packet contents lives in the sinks.

use std::collections::VecDeque;

use async_trait::async_trait;
use canonical_error::{CanonicalError, invalid_argument_error, out_of_range_error};
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::mipi::{DataType, MipiPacket};

/// Position of the packet handler within the input and output frames. Reset
/// at every frame start; counters are monotonic within a frame.
#[derive(Clone, Debug)]
pub struct PacketHandlerState {
    pub wait_for_frame_start: bool,
    pub frame_number: u32,
    pub in_line_number: u32,
    pub out_line_number: u32,
}

impl Default for PacketHandlerState {
    fn default() -> Self {
        PacketHandlerState {
            wait_for_frame_start: true,
            frame_number: 0,
            in_line_number: 0,
            out_line_number: 0,
        }
    }
}

/// Consumer of classified frame events. One implementation decimates into
/// the working image, the other copies raw lines; both share the dispatch
/// and bookkeeping in `PacketHandler`.
#[async_trait]
pub trait FrameSink: Send {
    /// A new frame is starting. Per-frame state (filter scales, capture
    /// latch) is refreshed here.
    async fn frame_start(&mut self, state: &PacketHandlerState);

    /// One line of expected-format pixel data. May emit completed output
    /// rows downstream, advancing `state.out_line_number`.
    async fn pixel_line(&mut self, state: &mut PacketHandlerState, line: &[u8])
                        -> Result<(), CanonicalError>;

    /// The frame is complete. Partial decimation state is flushed and any
    /// active capture request completed.
    async fn frame_end(&mut self, state: &mut PacketHandlerState)
                       -> Result<(), CanonicalError>;
}

pub struct PacketHandler<S: FrameSink> {
    state: PacketHandlerState,
    sink: S,
    sensor_height: usize,
    line_bytes: usize,
    unknown_packets: u32,
}

impl<S: FrameSink> PacketHandler<S> {
    pub fn new(sink: S, sensor_height: usize, line_bytes: usize) -> PacketHandler<S> {
        PacketHandler {
            state: PacketHandlerState::default(),
            sink,
            sensor_height,
            line_bytes,
            unknown_packets: 0,
        }
    }

    /// Processes a single packet. Errors are recoverable: the packet is
    /// dropped, bookkeeping stays coherent, and the next packet is handled
    /// normally.
    pub async fn handle_packet(&mut self, pkt: &MipiPacket) -> Result<(), CanonicalError> {
        let data_type = pkt.data_type();

        // At startup, wait for a clean frame boundary before processing
        // anything.
        if self.state.wait_for_frame_start && data_type != DataType::FrameStart {
            return Ok(());
        }

        match data_type {
            DataType::FrameStart => {
                self.state.wait_for_frame_start = false;
                self.state.in_line_number = 0;
                self.state.out_line_number = 0;
                self.state.frame_number += 1;
                self.sink.frame_start(&self.state).await;
            }
            DataType::FrameEnd => {
                self.sink.frame_end(&mut self.state).await?;
            }
            DataType::PixelLine => {
                let result = self.forward_pixel_line(pkt).await;
                // Every received line counts, even one we refused to forward.
                self.state.in_line_number += 1;
                result?;
            }
            DataType::Unknown(dt) => {
                // Sensor-specific or error packets; ignored for now.
                self.unknown_packets += 1;
                debug!("ignoring packet with unknown data type {:#04x}", dt);
            }
        }
        Ok(())
    }

    async fn forward_pixel_line(&mut self, pkt: &MipiPacket) -> Result<(), CanonicalError> {
        if self.state.in_line_number >= self.sensor_height as u32 {
            // More lines of image data than the sensor declared.
            if cfg!(feature = "strict-overrun") {
                panic!("frame {}: pixel line {} exceeds sensor height {}",
                       self.state.frame_number, self.state.in_line_number,
                       self.sensor_height);
            }
            return Err(out_of_range_error(
                format!("frame {}: pixel line {} exceeds sensor height {}",
                        self.state.frame_number, self.state.in_line_number,
                        self.sensor_height).as_str()));
        }
        let len = pkt.word_count() as usize;
        if len != self.line_bytes || len > pkt.payload.len() {
            return Err(invalid_argument_error(
                format!("pixel packet carries {} bytes, expected {}",
                        len, self.line_bytes).as_str()));
        }
        self.sink.pixel_line(&mut self.state, &pkt.payload[..len]).await
    }

    /// Top level of the packet-handling task. Swaps packet buffers with the
    /// receiver over the fill/free channel pair and dispatches each packet.
    /// The receiver always has a buffer in hand: the next spare goes out
    /// before the packet just taken is processed. Exits when the packet
    /// stream closes.
    pub async fn run(mut self,
                     mut filled: mpsc::Receiver<Box<MipiPacket>>,
                     free: mpsc::Sender<Box<MipiPacket>>,
                     pkt_buffer_count: usize) {
        let mut spares: VecDeque<Box<MipiPacket>> = (0..pkt_buffer_count)
            .map(|_| Box::new(MipiPacket::new(self.line_bytes)))
            .collect();

        // Give the receiver its first buffer.
        let first = spares.pop_front().expect("pkt_buffer_count must be non-zero");
        if free.send(first).await.is_err() {
            return;
        }

        while let Some(pkt) = filled.recv().await {
            if let Some(spare) = spares.pop_front() {
                if free.send(spare).await.is_err() {
                    break;
                }
            }
            if let Err(e) = self.handle_packet(&pkt).await {
                warn!("packet dropped: {}", e);
            }
            spares.push_back(pkt);
        }
        debug!("packet stream closed after frame {} ({} unknown packets)",
               self.state.frame_number, self.unknown_packets);
    }
}
