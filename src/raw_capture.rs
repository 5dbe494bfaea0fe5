// Raw capture path. Same packet dispatch as the decimated path, but each
// expected-format line is copied verbatim into the consumer's flat buffer at
// its absolute line offset. No filter state, so frame end has nothing to
// drain.

use async_trait::async_trait;
use canonical_error::CanonicalError;

use crate::capture_gate::CaptureGate;
use crate::packet_handler::{FrameSink, PacketHandlerState};

pub struct RawSink {
    line_bytes: usize,
    gate: CaptureGate<Vec<u8>>,
}

impl RawSink {
    pub fn new(line_bytes: usize, gate: CaptureGate<Vec<u8>>) -> RawSink {
        RawSink { line_bytes, gate }
    }
}

#[async_trait]
impl FrameSink for RawSink {
    async fn frame_start(&mut self, _state: &PacketHandlerState) {
        self.gate.request_begin();
    }

    async fn pixel_line(&mut self, state: &mut PacketHandlerState, line: &[u8])
                        -> Result<(), CanonicalError> {
        let line_bytes = self.line_bytes;
        if let Some(buffer) = self.gate.active_mut() {
            let pos = state.in_line_number as usize * line_bytes;
            buffer[pos..pos + line_bytes].copy_from_slice(line);
        }
        Ok(())
    }

    async fn frame_end(&mut self, _state: &mut PacketHandlerState)
                       -> Result<(), CanonicalError> {
        self.gate.request_complete();
        Ok(())
    }
}
