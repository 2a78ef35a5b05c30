// H.264/HEVC decoder wrapper.

use super::{check_geometry, strip_class_prefix, AvError};
use ffmpeg::ffi;
use std::collections::VecDeque;
use tracing::{error, info};

/// An open video decoder.
///
/// Compressed bytes arrive as arbitrary slices of an elementary stream;
/// a codec parser finds packet boundaries, each complete packet is
/// decoded, and every produced frame is appended to the caller's queue
/// as a contiguous YUV 4:2:0 buffer.
pub struct VideoDecoder {
    decoder: ffmpeg::decoder::Video,
    parser: Parser,
    frame: ffmpeg::frame::Video,
    name: String,
}

impl VideoDecoder {
    /// Open a decoder by name for the given geometry. A leading
    /// `sw-`/`hw-` class prefix on `name` is stripped before lookup.
    pub fn open(name: &str, width: u16, height: u16) -> Result<VideoDecoder, AvError> {
        check_geometry(width, height)?;

        let bare = strip_class_prefix(name);
        let codec = ffmpeg::codec::decoder::find_by_name(bare)
            .ok_or_else(|| AvError::NotFound(name.to_string()))?;

        let parser =
            Parser::new(codec.id()).ok_or_else(|| AvError::NoParser(bare.to_string()))?;

        let mut ctx = ffmpeg::codec::Context::new();
        // The elementary stream carries no container metadata; seed the
        // context with the caller's geometry.
        unsafe {
            (*ctx.as_mut_ptr()).width = i32::from(width);
            (*ctx.as_mut_ptr()).height = i32::from(height);
        }

        let decoder = ctx.decoder().open_as(codec)?.video()?;
        let frame = ffmpeg::frame::Video::empty();

        info!(codec = bare, width, height, "decoder opened");

        Ok(VideoDecoder { decoder, parser, frame, name: bare.to_string() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decode the bytes currently in `packets`, or flush the pipeline
    /// when `packets` is absent.
    ///
    /// On success the packet buffer is left empty and every produced
    /// frame has been appended to `frames` in decode order.
    pub fn process(
        &mut self,
        frames: &mut VecDeque<Vec<u8>>,
        packets: Option<&mut Vec<u8>>,
    ) -> Result<(), AvError> {
        match packets {
            Some(packets) => {
                self.parse(frames, packets)?;
                packets.clear();
                Ok(())
            }
            None => self.flush(frames),
        }
    }

    /// Advance the parser over `data`, decoding each complete packet it
    /// cuts out.
    fn parse(&mut self, frames: &mut VecDeque<Vec<u8>>, data: &[u8]) -> Result<(), AvError> {
        let mut rest = data;
        loop {
            let (consumed, packet) = self.parser.next_packet(&mut self.decoder, rest)?;
            rest = &rest[consumed..];
            if let Some(packet) = packet {
                self.decode_packet(&packet, frames)?;
            }
            if rest.is_empty() {
                break;
            }
        }
        Ok(())
    }

    fn flush(&mut self, frames: &mut VecDeque<Vec<u8>>) -> Result<(), AvError> {
        // The parser may still hold an unterminated packet; an empty
        // parse run forces it out before the codec itself drains.
        let (_, packet) = self.parser.next_packet(&mut self.decoder, &[])?;
        if let Some(packet) = packet {
            self.decode_packet(&packet, frames)?;
        }

        match self.decoder.send_eof() {
            // A second flush finds the pipeline already drained.
            Ok(()) | Err(ffmpeg::Error::Eof) => {}
            Err(e) => return Err(e.into()),
        }
        self.drain(frames, true)
    }

    fn decode_packet(
        &mut self,
        packet: &ffmpeg::Packet,
        frames: &mut VecDeque<Vec<u8>>,
    ) -> Result<(), AvError> {
        self.decoder.send_packet(packet)?;
        self.drain(frames, false)
    }

    fn drain(&mut self, frames: &mut VecDeque<Vec<u8>>, flushing: bool) -> Result<(), AvError> {
        loop {
            match self.decoder.receive_frame(&mut self.frame) {
                Ok(()) => {
                    let stored = self.store_frame();
                    frames.push_back(stored);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == libc::EAGAIN => return Ok(()),
                Err(ffmpeg::Error::Eof) if flushing => return Ok(()),
                Err(e) => {
                    error!(error = %e, "decoding failed");
                    return Err(e.into());
                }
            }
        }
    }

    /// Scatter the decoded frame into a contiguous YUV buffer, honoring
    /// the frame's per-plane stride.
    fn store_frame(&self) -> Vec<u8> {
        let w = self.frame.width() as usize;
        let h = self.frame.height() as usize;
        let mut out = Vec::with_capacity(w * h * 3 / 2);

        let stride = self.frame.stride(0);
        let plane = self.frame.data(0);
        for y in 0..h {
            out.extend_from_slice(&plane[y * stride..y * stride + w]);
        }

        for p in 1..3 {
            let stride = self.frame.stride(p);
            let plane = self.frame.data(p);
            for y in 0..h / 2 {
                out.extend_from_slice(&plane[y * stride..y * stride + w / 2]);
            }
        }

        out
    }
}

/// Minimal wrapper over the libav packet parser; the safe crate API
/// does not expose `av_parser_*`.
struct Parser {
    ctx: *mut ffi::AVCodecParserContext,
}

impl Parser {
    fn new(id: ffmpeg::codec::Id) -> Option<Parser> {
        let ctx = unsafe { ffi::av_parser_init(ffi::AVCodecID::from(id) as i32) };
        if ctx.is_null() { None } else { Some(Parser { ctx }) }
    }

    /// Feed `data` to the parser. Returns how many input bytes were
    /// consumed and, when a packet boundary was found, the complete
    /// packet. An empty `data` flushes the parser.
    fn next_packet(
        &mut self,
        decoder: &mut ffmpeg::decoder::Video,
        data: &[u8],
    ) -> Result<(usize, Option<ffmpeg::Packet>), AvError> {
        let mut out_data: *mut u8 = std::ptr::null_mut();
        let mut out_size: std::ffi::c_int = 0;

        // NULL input is the parser's flush convention.
        let input = if data.is_empty() { std::ptr::null() } else { data.as_ptr() };
        let consumed = unsafe {
            ffi::av_parser_parse2(
                self.ctx,
                decoder.as_mut_ptr(),
                &mut out_data,
                &mut out_size,
                input,
                data.len() as std::ffi::c_int,
                ffi::AV_NOPTS_VALUE,
                ffi::AV_NOPTS_VALUE,
                0,
            )
        };
        if consumed < 0 {
            error!("packet parse failed");
            return Err(ffmpeg::Error::from(consumed).into());
        }

        let packet = if out_size > 0 {
            let bytes = unsafe { std::slice::from_raw_parts(out_data, out_size as usize) };
            Some(ffmpeg::Packet::copy(bytes))
        } else {
            None
        };

        Ok((consumed as usize, packet))
    }
}

impl Drop for Parser {
    fn drop(&mut self) {
        unsafe { ffi::av_parser_close(self.ctx) };
    }
}

// The parser context is only ever touched by the session that owns the
// decoder.
unsafe impl Send for Parser {}
