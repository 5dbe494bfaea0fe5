// User-facing capture handshake. A consumer sends an owned buffer with its
// request; the gate latches at most one request per frame at frame start,
// fills it row by row, and returns the buffer at frame end. A consumer that
// isn't waiting costs the pipeline nothing.

use canonical_error::{CanonicalError, failed_precondition_error};
use image::RgbImage;
use tokio::sync::{mpsc, oneshot};

use crate::config::CHANNEL_COUNT;

/// A decimated working image in channel-major layout: all of red's rows, then
/// green's, then blue's. Pixel values are signed, centered on mid gray.
pub struct ImageBuffer {
    pub width: usize,
    pub height: usize,
    pixels: Vec<i8>,
}

impl ImageBuffer {
    pub fn new(width: usize, height: usize) -> ImageBuffer {
        ImageBuffer { width, height, pixels: vec![0; CHANNEL_COUNT * width * height] }
    }

    pub fn channel(&self, channel: usize) -> &[i8] {
        let plane = self.width * self.height;
        &self.pixels[channel * plane..(channel + 1) * plane]
    }

    /// Writes one row of one channel.
    pub fn fill_row(&mut self, channel: usize, row: usize, data: &[i8]) {
        let start = (channel * self.height + row) * self.width;
        self.pixels[start..start + self.width].copy_from_slice(data);
    }

    pub fn row(&self, channel: usize, row: usize) -> &[i8] {
        let start = (channel * self.height + row) * self.width;
        &self.pixels[start..start + self.width]
    }

    /// Converts to an 8-bit RGB image for display or saving.
    pub fn to_rgb(&self) -> RgbImage {
        let mut rgb = RgbImage::new(self.width as u32, self.height as u32);
        for y in 0..self.height {
            for x in 0..self.width {
                let mut pix = [0u8; CHANNEL_COUNT];
                for (c, out) in pix.iter_mut().enumerate() {
                    *out = (self.row(c, y)[x] as i16 + 128) as u8;
                }
                rgb.put_pixel(x as u32, y as u32, image::Rgb(pix));
            }
        }
        rgb
    }
}

/// One in-flight capture request: the buffer to fill plus the channel on
/// which the filled buffer travels back to the requester.
pub struct CaptureRequest<B> {
    pub buffer: B,
    pub done: oneshot::Sender<B>,
}

/// The pipeline side of the handshake. Generic over the buffer type: the
/// decimated path fills an `ImageBuffer` by row index, the raw path fills a
/// flat byte buffer by line offset.
pub struct CaptureGate<B> {
    requests: mpsc::Receiver<CaptureRequest<B>>,
    active: Option<CaptureRequest<B>>,
}

impl<B> CaptureGate<B> {
    pub fn new(requests: mpsc::Receiver<CaptureRequest<B>>) -> CaptureGate<B> {
        CaptureGate { requests, active: None }
    }

    /// Non-blocking poll for a pending request, called at frame start. A
    /// request already active (frame restarted without a frame end) stays
    /// latched and is refilled from the top of the new frame.
    pub fn request_begin(&mut self) {
        if self.active.is_none() {
            if let Ok(request) = self.requests.try_recv() {
                self.active = Some(request);
            }
        }
    }

    /// The buffer being filled this frame, if a request is active.
    pub fn active_mut(&mut self) -> Option<&mut B> {
        self.active.as_mut().map(|request| &mut request.buffer)
    }

    /// Completes the active request, if any, by sending the filled buffer
    /// back to the requester. The gate holds no reference afterwards.
    pub fn request_complete(&mut self) {
        if let Some(CaptureRequest { buffer, done }) = self.active.take() {
            // A requester that gave up just drops the buffer.
            let _ = done.send(buffer);
        }
    }
}

/// Consumer handle for decimated image capture.
#[derive(Clone)]
pub struct CaptureClient {
    requests: mpsc::Sender<CaptureRequest<ImageBuffer>>,
    width: usize,
    height: usize,
}

impl CaptureClient {
    pub(crate) fn new(requests: mpsc::Sender<CaptureRequest<ImageBuffer>>,
                      width: usize, height: usize) -> CaptureClient {
        CaptureClient { requests, width, height }
    }

    /// Captures the next complete decimated image. Blocks (asynchronously)
    /// until a frame that began after the request was latched has fully
    /// arrived.
    pub async fn capture_image(&self) -> Result<ImageBuffer, CanonicalError> {
        let (done, filled) = oneshot::channel();
        let request = CaptureRequest {
            buffer: ImageBuffer::new(self.width, self.height),
            done,
        };
        self.requests.send(request).await
            .map_err(|_| failed_precondition_error("capture pipeline is not running"))?;
        filled.await
            .map_err(|_| failed_precondition_error("capture pipeline stopped mid-frame"))
    }

    /// Synchronous convenience wrapper for non-async callers.
    pub fn capture_image_blocking(&self) -> Result<ImageBuffer, CanonicalError> {
        futures::executor::block_on(self.capture_image())
    }
}

/// Consumer handle for raw (unfiltered) frame capture. The buffer is flat:
/// `sensor_height * line_bytes` wire bytes.
#[derive(Clone)]
pub struct RawCaptureClient {
    requests: mpsc::Sender<CaptureRequest<Vec<u8>>>,
    frame_bytes: usize,
}

impl RawCaptureClient {
    pub(crate) fn new(requests: mpsc::Sender<CaptureRequest<Vec<u8>>>,
                      frame_bytes: usize) -> RawCaptureClient {
        RawCaptureClient { requests, frame_bytes }
    }

    pub async fn capture_raw(&self) -> Result<Vec<u8>, CanonicalError> {
        let (done, filled) = oneshot::channel();
        let request = CaptureRequest { buffer: vec![0u8; self.frame_bytes], done };
        self.requests.send(request).await
            .map_err(|_| failed_precondition_error("capture pipeline is not running"))?;
        filled.await
            .map_err(|_| failed_precondition_error("capture pipeline stopped mid-frame"))
    }

    pub fn capture_raw_blocking(&self) -> Result<Vec<u8>, CanonicalError> {
        futures::executor::block_on(self.capture_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_pending_request_is_zero_cost() {
        let (_tx, rx) = mpsc::channel::<CaptureRequest<ImageBuffer>>(1);
        let mut gate = CaptureGate::new(rx);
        gate.request_begin();
        assert!(gate.active_mut().is_none());
        // Completing with nothing active must not signal anyone or panic.
        gate.request_complete();
    }

    #[tokio::test]
    async fn request_is_latched_filled_and_returned() {
        let (tx, rx) = mpsc::channel(1);
        let mut gate = CaptureGate::new(rx);

        let (done, filled) = oneshot::channel();
        tx.send(CaptureRequest { buffer: ImageBuffer::new(4, 2), done }).await.unwrap();

        gate.request_begin();
        let image = gate.active_mut().expect("request should be latched");
        image.fill_row(0, 0, &[1, 2, 3, 4]);
        image.fill_row(2, 1, &[5, 6, 7, 8]);
        gate.request_complete();

        let image = filled.await.unwrap();
        assert_eq!(image.row(0, 0), &[1, 2, 3, 4]);
        assert_eq!(image.row(2, 1), &[5, 6, 7, 8]);
        // Gate must not retain the request.
        assert!(gate.active_mut().is_none());
    }

    #[tokio::test]
    async fn request_arriving_mid_frame_waits_for_next_begin() {
        let (tx, rx) = mpsc::channel(1);
        let mut gate = CaptureGate::new(rx);
        gate.request_begin();
        assert!(gate.active_mut().is_none());

        let (done, _filled) = oneshot::channel();
        tx.send(CaptureRequest { buffer: vec![0u8; 8], done }).await.unwrap();
        // Not latched until the next frame start.
        assert!(gate.active_mut().is_none());
        gate.request_begin();
        assert!(gate.active_mut().is_some());
    }

    #[test]
    fn image_buffer_channel_major_layout() {
        let mut image = ImageBuffer::new(3, 2);
        image.fill_row(1, 0, &[10, 11, 12]);
        assert_eq!(image.channel(1), &[10, 11, 12, 0, 0, 0]);
        let rgb = image.to_rgb();
        assert_eq!(rgb.get_pixel(0, 0).0, [128, 138, 128]);
    }
}
