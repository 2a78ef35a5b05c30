// H.264/HEVC encoder wrapper.

use super::{check_geometry, strip_class_prefix, AvError, MIN_BIT_RATE};
use std::collections::VecDeque;
use tracing::{error, info};

/// An open video encoder.
///
/// Frames are accepted in the contiguous YUV 4:2:0 layout (full Y plane,
/// then quarter-size U and V planes); produced packets are appended to
/// the caller's buffer as raw elementary-stream bytes.
pub struct VideoEncoder {
    encoder: ffmpeg::encoder::video::Encoder,
    frame: ffmpeg::frame::Video,
    width: usize,
    height: usize,
    /// Monotonic frame index, used as the presentation timestamp.
    frame_idx: i64,
    name: String,
}

impl VideoEncoder {
    /// Open an encoder by name.
    ///
    /// Width and height must be positive and even, `bps` at least
    /// [`MIN_BIT_RATE`], `fps` at least 1. A leading `sw-`/`hw-` class
    /// prefix on `name` is stripped before lookup.
    pub fn open(name: &str, width: u16, height: u16, fps: u8, bps: u32) -> Result<VideoEncoder, AvError> {
        check_geometry(width, height)?;
        if bps < MIN_BIT_RATE {
            return Err(AvError::BadBitRate(bps));
        }
        if fps < 1 {
            return Err(AvError::BadFrameRate);
        }

        let bare = strip_class_prefix(name);
        let codec = ffmpeg::codec::encoder::find_by_name(bare)
            .ok_or_else(|| AvError::NotFound(name.to_string()))?;

        let mut video = ffmpeg::codec::Context::new().encoder().video()?;
        video.set_width(width.into());
        video.set_height(height.into());
        video.set_format(ffmpeg::format::Pixel::YUV420P);
        video.set_time_base(ffmpeg::Rational(1, fps.into()));
        video.set_frame_rate(Some(ffmpeg::Rational(fps.into(), 1)));
        video.set_bit_rate(bps as usize);
        // One intra frame every ten; the encoder may still promote
        // frames to I on its own.
        video.set_gop(10);
        video.set_max_b_frames(1);

        let mut options = ffmpeg::Dictionary::new();
        if matches!(codec.id(), ffmpeg::codec::Id::H264 | ffmpeg::codec::Id::HEVC) {
            // Low-latency stream: no reordering delay.
            video.set_max_b_frames(0);
            options.set("preset", "medium");
        }

        let encoder = video.open_as_with(codec, options)?;
        let frame =
            ffmpeg::frame::Video::new(ffmpeg::format::Pixel::YUV420P, width.into(), height.into());

        info!(codec = bare, width, height, fps, bps, "encoder opened");

        Ok(VideoEncoder {
            encoder,
            frame,
            width: width.into(),
            height: height.into(),
            frame_idx: 0,
            name: bare.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encode every queued frame, or drain the pipeline when `frames`
    /// is absent.
    ///
    /// Consumed frames are removed from the queue; every produced
    /// packet's bytes are appended to `packets`. Draining to end of
    /// stream is success only for a flush.
    pub fn process(
        &mut self,
        frames: Option<&mut VecDeque<Vec<u8>>>,
        packets: &mut Vec<u8>,
    ) -> Result<(), AvError> {
        let flushing = frames.is_none();

        match frames {
            Some(frames) => {
                // Validate the whole batch up front; a mismatched buffer
                // is removed from the queue so it cannot poison later
                // calls.
                let expected = self.width * self.height * 3 / 2;
                if let Some(bad) = frames.iter().position(|data| data.len() != expected) {
                    let got = frames.remove(bad).map(|data| data.len()).unwrap_or(0);
                    return Err(AvError::BadFrameSize { got, expected });
                }

                for data in frames.iter() {
                    self.load_frame(data);
                    self.frame.set_pts(Some(self.frame_idx));
                    self.frame_idx += 1;
                    self.encoder.send_frame(&self.frame)?;
                }
                frames.clear();
            }
            None => match self.encoder.send_eof() {
                // A second flush finds the pipeline already drained.
                Ok(()) | Err(ffmpeg::Error::Eof) => {}
                Err(e) => return Err(e.into()),
            },
        }

        self.drain(packets, flushing)
    }

    fn drain(&mut self, packets: &mut Vec<u8>, flushing: bool) -> Result<(), AvError> {
        let mut packet = ffmpeg::Packet::empty();
        loop {
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    if let Some(data) = packet.data() {
                        packets.extend_from_slice(data);
                    }
                }
                Err(ffmpeg::Error::Other { errno }) if errno == libc::EAGAIN => return Ok(()),
                Err(ffmpeg::Error::Eof) if flushing => return Ok(()),
                Err(e) => {
                    error!(error = %e, "encoding failed");
                    return Err(e.into());
                }
            }
        }
    }

    /// Gather a contiguous YUV buffer into the codec frame, honoring
    /// the frame's per-plane stride.
    fn load_frame(&mut self, data: &[u8]) {
        let (w, h) = (self.width, self.height);
        let mut offset = 0;

        let stride = self.frame.stride(0);
        let plane = self.frame.data_mut(0);
        for y in 0..h {
            plane[y * stride..y * stride + w].copy_from_slice(&data[offset..offset + w]);
            offset += w;
        }

        for p in 1..3 {
            let stride = self.frame.stride(p);
            let plane = self.frame.data_mut(p);
            for y in 0..h / 2 {
                plane[y * stride..y * stride + w / 2]
                    .copy_from_slice(&data[offset..offset + w / 2]);
                offset += w / 2;
            }
        }
    }
}
