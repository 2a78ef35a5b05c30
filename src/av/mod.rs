// Codec adapter over libavcodec (via the `ffmpeg` crate).
//
// The service treats a codec as an opaque capability: enumerate the
// H.264/HEVC family, open an encoder or decoder for a fixed geometry,
// feed it frames or packets, drain what it produces. Everything else
// (rate control, parsing, hardware selection) stays inside the backend.

pub mod decoder;
pub mod encoder;

pub use decoder::VideoDecoder;
pub use encoder::VideoEncoder;

use ffmpeg::ffi;
use std::collections::BTreeSet;
use std::ffi::CStr;
use thiserror::Error;
use tracing::debug;

/// Name fragments selecting the codec families the service exposes.
const FAMILY_MARKS: [&str; 4] = ["avc", "h264", "hevc", "h265"];

/// Minimum encoder bit rate accepted by [`VideoEncoder::open`].
pub const MIN_BIT_RATE: u32 = 1_000_000;

/// Codec adapter errors.
#[derive(Debug, Error)]
pub enum AvError {
    #[error("no codec matches \"{0}\"")]
    NotFound(String),

    #[error("invalid geometry {width}x{height}: dimensions must be positive and even")]
    BadGeometry { width: u32, height: u32 },

    #[error("bit rate {0} is below the {MIN_BIT_RATE} bit/s minimum")]
    BadBitRate(u32),

    #[error("frame rate must be at least 1")]
    BadFrameRate,

    #[error("frame payload is {got} bytes, expected {expected}")]
    BadFrameSize { got: usize, expected: usize },

    #[error("no packet parser for codec \"{0}\"")]
    NoParser(String),

    #[error(transparent)]
    Codec(#[from] ffmpeg::Error),
}

/// Initialize the codec backend. Safe to call more than once.
pub fn init() -> Result<(), AvError> {
    ffmpeg::init().map_err(AvError::from)
}

/// Enumerate the available H.264/HEVC encoders, sorted and deduplicated.
///
/// Names carry an `sw-` or `hw-` prefix depending on whether the codec
/// advertises a hardware configuration.
pub fn list_encoders() -> BTreeSet<String> {
    list_codecs(true)
}

/// Enumerate the available H.264/HEVC decoders. See [`list_encoders`].
pub fn list_decoders() -> BTreeSet<String> {
    list_codecs(false)
}

fn list_codecs(encoders: bool) -> BTreeSet<String> {
    let mut names = BTreeSet::new();

    // The safe wrapper has no codec enumeration; walk the registered
    // codec table through the sys layer.
    unsafe {
        let mut opaque: *mut std::ffi::c_void = std::ptr::null_mut();
        loop {
            let codec = ffi::av_codec_iterate(&mut opaque);
            if codec.is_null() {
                break;
            }
            let matches_kind = if encoders {
                ffi::av_codec_is_encoder(codec) != 0
            } else {
                ffi::av_codec_is_decoder(codec) != 0
            };
            if !matches_kind {
                continue;
            }

            let name = CStr::from_ptr((*codec).name).to_string_lossy();
            if !FAMILY_MARKS.iter().any(|mark| name.contains(mark)) {
                continue;
            }

            let class = if ffi::avcodec_get_hw_config(codec, 0).is_null() {
                "sw-"
            } else {
                "hw-"
            };
            names.insert(format!("{class}{name}"));
        }
    }

    names
}

/// Resolve a requested codec name against the enumerated set.
///
/// An exact match wins outright; otherwise every enumerated name that
/// contains the request as a substring is a candidate, in sorted order.
/// The caller tries candidates until one constructs.
pub fn resolve_candidates<'a>(available: &'a BTreeSet<String>, requested: &str) -> Vec<&'a str> {
    if let Some(exact) = available.get(requested) {
        return vec![exact.as_str()];
    }
    available
        .iter()
        .filter(|name| name.contains(requested))
        .map(|name| {
            debug!(candidate = %name, requested, "codec name match");
            name.as_str()
        })
        .collect()
}

/// Drop the `sw-` / `hw-` class prefix the enumeration adds; the
/// backend looks codecs up by their bare name.
pub(crate) fn strip_class_prefix(name: &str) -> &str {
    name.strip_prefix("sw-")
        .or_else(|| name.strip_prefix("hw-"))
        .unwrap_or(name)
}

// The original validated evenness with `width & 2`, which lets 2-mod-4
// widths through; the chroma layout requires plain evenness.
pub(crate) fn check_geometry(width: u16, height: u16) -> Result<(), AvError> {
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        return Err(AvError::BadGeometry { width: width.into(), height: height.into() });
    }
    Ok(())
}

/// An open codec. The variant fixes which of `Encode`/`Decode` the
/// session accepts, so a state mismatch cannot reach the backend.
pub enum CodecHandle {
    Encoder(VideoEncoder),
    Decoder(VideoDecoder),
}

impl CodecHandle {
    pub fn is_encoder(&self) -> bool {
        matches!(self, CodecHandle::Encoder(_))
    }

    /// Bare backend name of the open codec.
    pub fn name(&self) -> &str {
        match self {
            CodecHandle::Encoder(enc) => enc.name(),
            CodecHandle::Decoder(dec) => dec.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn exact_name_wins_over_substring() {
        let set = names(&["sw-h264", "sw-h264_v4l2m2m", "hw-h264_nvenc"]);
        assert_eq!(resolve_candidates(&set, "sw-h264"), vec!["sw-h264"]);
    }

    #[test]
    fn substring_candidates_come_back_sorted() {
        let set = names(&["sw-h264_v4l2m2m", "hw-h264_nvenc", "sw-hevc"]);
        assert_eq!(
            resolve_candidates(&set, "h264"),
            vec!["hw-h264_nvenc", "sw-h264_v4l2m2m"]
        );
    }

    #[test]
    fn unrelated_request_has_no_candidates() {
        let set = names(&["sw-h264", "sw-hevc"]);
        assert!(resolve_candidates(&set, "vp9").is_empty());
    }

    #[test]
    fn class_prefix_is_stripped_once() {
        assert_eq!(strip_class_prefix("sw-h264"), "h264");
        assert_eq!(strip_class_prefix("hw-hevc_nvenc"), "hevc_nvenc");
        assert_eq!(strip_class_prefix("h264"), "h264");
    }

    #[test]
    fn geometry_must_be_positive_and_even() {
        assert!(check_geometry(1920, 1080).is_ok());
        assert!(check_geometry(0, 1080).is_err());
        assert!(check_geometry(1920, 0).is_err());
        assert!(check_geometry(1919, 1080).is_err());
        assert!(check_geometry(1920, 1081).is_err());
        // 2-mod-4 geometry is valid YUV 4:2:0.
        assert!(check_geometry(1922, 1082).is_ok());
    }
}
