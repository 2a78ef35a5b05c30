// Wire codec for the avpipe command protocol.
//
// Every exchange on the transport is built from two fixed-layout records:
// a 40-byte command record sent by the client and a 9-byte response frame
// sent by the service. Bulk payloads (raw frames, encoded packets, codec
// names) travel as untyped byte runs whose length is declared by the
// record that precedes them.

use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;
use std::io::Cursor;
use thiserror::Error;

/// Default transport buffer size requested by the service (128 MiB).
pub const PIPE_BUFFER_SIZE: usize = 128 * 1024 * 1024;

/// Upper bound accepted for a declared bulk payload. Anything larger is
/// rejected before a single payload byte is read.
pub const MAX_BULK_SIZE: u64 = PIPE_BUFFER_SIZE as u64;

/// Capacity of the NUL-padded codec name field in [`InitInfo`].
pub const CODEC_NAME_LEN: usize = 30;

/// Command kinds understood by the service.
///
/// The discriminants are the on-wire byte values; they must not be
/// reordered.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmdType {
    Unknown = 0,

    GetEncoderCount,
    GetEncoderName,
    GetDecoderCount,
    GetDecoderName,

    OpenEncoder,
    OpenDecoder,
    Close,
    Encode,
    Decode,
    Flush,
    GetPacket,
    GetFrame,

    StopService,

    KeepAlive,
}

/// Single-byte command result.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdResult {
    Ack = 0,
    Nack = 1,
}

/// Parameters carried by `OpenEncoder` / `OpenDecoder`.
///
/// Wire layout (packed, little-endian, 39 bytes):
///
/// | offset | size | field       |
/// |--------|------|-------------|
/// | 0      | 4    | `bps`       |
/// | 4      | 2    | `width`     |
/// | 6      | 2    | `height`    |
/// | 8      | 1    | `fps`       |
/// | 9      | 30   | `codec_name` (NUL-padded) |
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InitInfo {
    pub bps: u32,
    pub width: u16,
    pub height: u16,
    pub fps: u8,
    pub codec_name: String,
}

impl InitInfo {
    /// Packed size of the init arm.
    pub const SIZE: usize = 4 + 2 + 2 + 1 + CODEC_NAME_LEN;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.bps);
        buf.put_u16_le(self.width);
        buf.put_u16_le(self.height);
        buf.put_u8(self.fps);

        let name = self.codec_name.as_bytes();
        let n = name.len().min(CODEC_NAME_LEN);
        buf.put_slice(&name[..n]);
        buf.put_bytes(0, CODEC_NAME_LEN - n);
    }

    fn decode(src: &mut Cursor<&[u8]>) -> Self {
        let bps = src.get_u32_le();
        let width = src.get_u16_le();
        let height = src.get_u16_le();
        let fps = src.get_u8();

        let mut name = [0u8; CODEC_NAME_LEN];
        src.copy_to_slice(&mut name);
        let end = name.iter().position(|&b| b == 0).unwrap_or(CODEC_NAME_LEN);
        let codec_name = String::from_utf8_lossy(&name[..end]).into_owned();

        InitInfo { bps, width, height, fps, codec_name }
    }
}

/// Payload arm of a command record. Which arm is valid is determined by
/// the command type; the arms share the same 39 bytes on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    None,
    Init(InitInfo),
    Size(u64),
}

/// A single command record.
///
/// Records are exactly [`Cmd::WIRE_SIZE`] bytes: a one-byte type followed
/// by the payload union area, zero-padded so that both arms fit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cmd {
    pub ty: CmdType,
    pub payload: Payload,
}

impl Cmd {
    /// On-wire size of every command record.
    pub const WIRE_SIZE: usize = 1 + InitInfo::SIZE;

    /// A command that carries no payload (`KeepAlive`, `Close`, ...).
    pub fn bare(ty: CmdType) -> Cmd {
        Cmd { ty, payload: Payload::None }
    }

    /// A command whose payload is a 64-bit size or index
    /// (`Encode`, `Decode`, `GetEncoderName`, `GetDecoderName`).
    pub fn sized(ty: CmdType, size: u64) -> Cmd {
        Cmd { ty, payload: Payload::Size(size) }
    }

    pub fn open_encoder(init: InitInfo) -> Cmd {
        Cmd { ty: CmdType::OpenEncoder, payload: Payload::Init(init) }
    }

    pub fn open_decoder(init: InitInfo) -> Cmd {
        Cmd { ty: CmdType::OpenDecoder, payload: Payload::Init(init) }
    }

    /// The size arm, or 0 when the command carries none.
    pub fn size(&self) -> u64 {
        match self.payload {
            Payload::Size(n) => n,
            _ => 0,
        }
    }

    /// The init arm, when present.
    pub fn init(&self) -> Option<&InitInfo> {
        match &self.payload {
            Payload::Init(init) => Some(init),
            _ => None,
        }
    }

    /// Encode the record into `buf`, appending exactly
    /// [`Cmd::WIRE_SIZE`] bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u8(self.ty as u8);
        match &self.payload {
            Payload::None => {}
            Payload::Init(init) => init.encode(buf),
            Payload::Size(n) => buf.put_u64_le(*n),
        }
        buf.put_bytes(0, Self::WIRE_SIZE - (buf.len() - start));
    }

    /// Decode one record from `src`.
    ///
    /// A type byte outside the known range decodes as [`CmdType::Unknown`]
    /// so the session can answer it with a Nack; the only decode error is
    /// an undersized buffer.
    pub fn decode(src: &mut Cursor<&[u8]>) -> Result<Cmd, CodecError> {
        if src.remaining() < Self::WIRE_SIZE {
            return Err(CodecError::Incomplete);
        }

        let start = src.position();
        let ty = CmdType::try_from(src.get_u8()).unwrap_or(CmdType::Unknown);

        let payload = match ty {
            CmdType::OpenEncoder | CmdType::OpenDecoder => {
                Payload::Init(InitInfo::decode(src))
            }
            CmdType::Encode
            | CmdType::Decode
            | CmdType::GetEncoderName
            | CmdType::GetDecoderName => Payload::Size(src.get_u64_le()),
            _ => Payload::None,
        };

        // Skip whatever is left of the union area.
        src.set_position(start + Self::WIRE_SIZE as u64);
        Ok(Cmd { ty, payload })
    }
}

/// Response frame answering every command: `{ result, size }`.
///
/// When `result` is [`CmdResult::Ack`] and `size > 0`, exactly `size`
/// bytes of bulk payload follow on the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Response {
    pub result: CmdResult,
    pub size: u64,
}

impl Response {
    /// On-wire size of the response frame.
    pub const WIRE_SIZE: usize = 1 + 8;

    pub fn ack(size: u64) -> Response {
        Response { result: CmdResult::Ack, size }
    }

    pub fn nack() -> Response {
        Response { result: CmdResult::Nack, size: 0 }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.result as u8);
        buf.put_u64_le(self.size);
    }

    /// Decode one response frame. An unrecognized result byte is treated
    /// as a Nack rather than a protocol abort.
    pub fn decode(src: &mut Cursor<&[u8]>) -> Result<Response, CodecError> {
        if src.remaining() < Self::WIRE_SIZE {
            return Err(CodecError::Incomplete);
        }
        let result = CmdResult::try_from(src.get_u8()).unwrap_or(CmdResult::Nack);
        let size = src.get_u64_le();
        Ok(Response { result, size })
    }
}

/// Wire-layer decode errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("incomplete record: need more data")]
    Incomplete,

    #[error("declared bulk payload of {0} bytes exceeds the {MAX_BULK_SIZE} byte limit")]
    OversizedPayload(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cmd: &Cmd) -> Cmd {
        let mut buf = BytesMut::new();
        cmd.encode(&mut buf);
        assert_eq!(buf.len(), Cmd::WIRE_SIZE);
        Cmd::decode(&mut Cursor::new(&buf[..])).unwrap()
    }

    #[test]
    fn record_sizes_are_fixed() {
        assert_eq!(InitInfo::SIZE, 39);
        assert_eq!(Cmd::WIRE_SIZE, 40);
        assert_eq!(Response::WIRE_SIZE, 9);
    }

    #[test]
    fn bare_command_roundtrip() {
        let cmd = Cmd::bare(CmdType::KeepAlive);
        assert_eq!(roundtrip(&cmd), cmd);
        assert_eq!(cmd.size(), 0);
        assert!(cmd.init().is_none());
    }

    #[test]
    fn sized_command_roundtrip() {
        let cmd = Cmd::sized(CmdType::Encode, 3_110_400);
        let back = roundtrip(&cmd);
        assert_eq!(back.ty, CmdType::Encode);
        assert_eq!(back.size(), 3_110_400);
    }

    #[test]
    fn open_encoder_roundtrip() {
        let cmd = Cmd::open_encoder(InitInfo {
            bps: 5_000_000,
            width: 1920,
            height: 1080,
            fps: 30,
            codec_name: "h264".into(),
        });
        let back = roundtrip(&cmd);
        let init = back.init().unwrap();
        assert_eq!(init.bps, 5_000_000);
        assert_eq!(init.width, 1920);
        assert_eq!(init.height, 1080);
        assert_eq!(init.fps, 30);
        assert_eq!(init.codec_name, "h264");
    }

    #[test]
    fn codec_name_is_truncated_to_field_width() {
        let long = "x".repeat(CODEC_NAME_LEN + 10);
        let cmd = Cmd::open_decoder(InitInfo { codec_name: long, ..Default::default() });
        let back = roundtrip(&cmd);
        assert_eq!(back.init().unwrap().codec_name.len(), CODEC_NAME_LEN);
    }

    #[test]
    fn unknown_type_byte_decodes_as_unknown() {
        let mut raw = vec![0u8; Cmd::WIRE_SIZE];
        raw[0] = 0xEE;
        let cmd = Cmd::decode(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(cmd.ty, CmdType::Unknown);
    }

    #[test]
    fn short_buffer_is_incomplete() {
        let raw = [0u8; Cmd::WIRE_SIZE - 1];
        assert!(matches!(
            Cmd::decode(&mut Cursor::new(&raw[..])),
            Err(CodecError::Incomplete)
        ));
        let raw = [0u8; Response::WIRE_SIZE - 1];
        assert!(matches!(
            Response::decode(&mut Cursor::new(&raw[..])),
            Err(CodecError::Incomplete)
        ));
    }

    #[test]
    fn response_roundtrip() {
        let mut buf = BytesMut::new();
        Response::ack(1234).encode(&mut buf);
        assert_eq!(buf.len(), Response::WIRE_SIZE);
        let back = Response::decode(&mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(back.result, CmdResult::Ack);
        assert_eq!(back.size, 1234);

        buf.clear();
        Response::nack().encode(&mut buf);
        let back = Response::decode(&mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(back.result, CmdResult::Nack);
        assert_eq!(back.size, 0);
    }

    #[test]
    fn unrecognized_result_byte_reads_as_nack() {
        let mut raw = vec![0u8; Response::WIRE_SIZE];
        raw[0] = 7;
        let back = Response::decode(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(back.result, CmdResult::Nack);
    }
}
