// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Playback-side plumbing for hardware video decoders: a decoder session
//! state machine over an opaque platform codec, a refcounted output
//! picture pool, and the presentation timing engine (frame rate
//! estimation, pulldown correction, frame drop policy) that feeds a
//! render sink.

pub mod backend;
pub mod buffer_pool;
pub mod clock;
pub mod presentation;
pub mod renderer;
pub mod session;
pub mod timing;

use std::str::FromStr;

use bytes::Bytes;

/// Timestamps and durations are expressed in microseconds throughout.
pub const TIME_BASE_US: i64 = 1_000_000;

/// Formats that the compressed input stream can be in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecKind {
    Mpeg2,
    H264,
    H265,
    VP8,
    VP9,
    AV1,
}

impl FromStr for CodecKind {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mpeg2" => Ok(CodecKind::Mpeg2),
            "h264" => Ok(CodecKind::H264),
            "h265" => Ok(CodecKind::H265),
            "vp8" => Ok(CodecKind::VP8),
            "vp9" => Ok(CodecKind::VP9),
            "av1" => Ok(CodecKind::AV1),
            _ => Err("unrecognized codec. Valid values: mpeg2, h264, h265, vp8, vp9, av1"),
        }
    }
}

/// Memory layout a decoder produces its pictures in. `Opaque` covers
/// protected or tiled buffers that only the render path can interpret.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    NV12,
    I420,
    Opaque,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

/// Everything the session needs to know about a stream before probing
/// codec candidates for it.
#[derive(Clone, Debug)]
pub struct StreamParams {
    pub codec: CodecKind,
    pub size: Resolution,
    /// Out-of-band configuration blob (SPS/PPS or equivalent). May be
    /// empty for self-describing streams.
    pub extradata: Bytes,
    /// Frames per second declared by container metadata, if any.
    pub declared_fps: Option<f64>,
    /// Stream requires a protected (DRM) decode path.
    pub secure: bool,
    pub layout: PixelLayout,
}

impl StreamParams {
    pub fn new(codec: CodecKind, size: Resolution) -> Self {
        Self {
            codec,
            size,
            extradata: Bytes::new(),
            declared_fps: None,
            secure: false,
            layout: PixelLayout::NV12,
        }
    }

    /// Nominal frame interval from declared metadata, in microseconds.
    pub fn declared_interval_us(&self) -> Option<i64> {
        match self.declared_fps {
            Some(fps) if fps > 0.0 => Some((TIME_BASE_US as f64 / fps) as i64),
            _ => None,
        }
    }
}

/// One demuxed compressed unit, as handed to the pipeline.
#[derive(Clone, Debug, Default)]
pub struct EncodedAccessUnit {
    pub data: Bytes,
    /// Decode timestamp in microseconds, if the container carries one.
    pub dts: Option<i64>,
    /// Presentation timestamp in microseconds, if the container carries one.
    pub pts: Option<i64>,
    /// Marks the final unit of the stream.
    pub eos: bool,
}

impl EncodedAccessUnit {
    pub fn new(data: Bytes, pts: Option<i64>) -> Self {
        Self { data, dts: None, pts, eos: false }
    }

    pub fn end_of_stream() -> Self {
        Self { data: Bytes::new(), dts: None, pts: None, eos: true }
    }
}

/// Per-picture presentation attributes, carried as a bitmask.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureFlags(u32);

impl PictureFlags {
    /// The decoder skipped actual reconstruction of this picture.
    pub const DROPPED: PictureFlags = PictureFlags(1 << 0);
    pub const INTERLACED: PictureFlags = PictureFlags(1 << 1);
    pub const TOP_FIELD_FIRST: PictureFlags = PictureFlags(1 << 2);
    /// The decoder returned this picture interlaced, without weaving it.
    pub const DEINTERLACE_SKIPPED: PictureFlags = PictureFlags(1 << 3);

    pub fn contains(&self, other: PictureFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PictureFlags {
    type Output = PictureFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        PictureFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PictureFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_kind_from_str() {
        assert_eq!(CodecKind::from_str("h264"), Ok(CodecKind::H264));
        assert_eq!(CodecKind::from_str("av1"), Ok(CodecKind::AV1));
        assert!(CodecKind::from_str("mjpeg").is_err());
    }

    #[test]
    fn declared_interval() {
        let mut params = StreamParams::new(CodecKind::H264, (1920, 1080).into());
        assert_eq!(params.declared_interval_us(), None);
        params.declared_fps = Some(25.0);
        assert_eq!(params.declared_interval_us(), Some(40_000));
    }

    #[test]
    fn picture_flags_combine() {
        let flags = PictureFlags::INTERLACED | PictureFlags::TOP_FIELD_FIRST;
        assert!(flags.contains(PictureFlags::INTERLACED));
        assert!(flags.contains(PictureFlags::TOP_FIELD_FIRST));
        assert!(!flags.contains(PictureFlags::DROPPED));
    }
}
