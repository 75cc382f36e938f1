//! Resampling kernels
//!
//! Each kernel reads taps through a [`SampleView`], which resolves indices
//! outside the sample the way playback would reach them: wrapped into a
//! forward loop, mirrored in a ping-pong loop, or held at the edge. That
//! keeps interpolation continuous across loop points without padding the
//! sample data.

use nether_tracker::SampleData;

use crate::tables::{CUBIC_SPLINE_LUT, SPLINE_QUANT_BITS, WFIR_QUANT_BITS, WFIR_WIDTH, WINDOWED_FIR_LUT};

/// Sample data plus the loop a voice is currently playing
#[derive(Debug, Clone, Copy)]
pub(crate) struct SampleView<'a> {
    pub data: &'a SampleData,
    /// Playable frames (loop end while looping)
    pub length: i64,
    pub loop_start: i64,
    pub looping: bool,
    pub pingpong: bool,
    pub stereo: bool,
}

impl SampleView<'_> {
    /// One tap, 16-bit scaled. `side` selects the channel of a stereo sample.
    #[inline]
    pub fn at(&self, idx: i64, side: usize) -> i32 {
        let frame = self.resolve(idx);
        if self.stereo {
            self.data.get(frame as usize * 2 + side)
        } else {
            self.data.get(frame as usize)
        }
    }

    #[inline]
    fn resolve(&self, idx: i64) -> i64 {
        if idx < 0 {
            return 0;
        }
        if idx < self.length {
            return idx;
        }
        let last = (self.length - 1).max(0);
        let loop_len = self.length - self.loop_start;
        if !self.looping || loop_len <= 0 {
            return last;
        }
        let over = idx - self.length;
        if self.pingpong {
            (last - over % loop_len).max(self.loop_start)
        } else {
            self.loop_start + over % loop_len
        }
    }
}

/// One interpolation strategy
pub(crate) trait Resampler {
    /// Interpolated value at 32.32 position `pos`
    fn fetch(view: &SampleView<'_>, pos: i64, side: usize) -> i32;
}

/// Nearest neighbour (no interpolation)
pub(crate) struct Nearest;

/// Two-point linear interpolation with an 8-bit fraction
pub(crate) struct Linear;

/// Four-tap cubic spline from a 1024-phase table
pub(crate) struct Spline;

/// Eight-tap windowed sinc from a 2049-phase table
pub(crate) struct Fir;

impl Resampler for Nearest {
    #[inline]
    fn fetch(view: &SampleView<'_>, pos: i64, side: usize) -> i32 {
        view.at(pos >> 32, side)
    }
}

impl Resampler for Linear {
    #[inline]
    fn fetch(view: &SampleView<'_>, pos: i64, side: usize) -> i32 {
        let whole = pos >> 32;
        let frac = ((pos as u64 & 0xFFFF_FFFF) >> 24) as i32;
        let src = view.at(whole, side);
        let dst = view.at(whole + 1, side);
        src + ((frac * (dst - src)) >> 8)
    }
}

impl Resampler for Spline {
    #[inline]
    fn fetch(view: &SampleView<'_>, pos: i64, side: usize) -> i32 {
        let whole = pos >> 32;
        let idx = (((pos >> 16) >> 4) & 0xFFC) as usize;
        let lut = &CUBIC_SPLINE_LUT[idx..idx + 4];
        let sum: i64 = (0..4)
            .map(|k| lut[k] as i64 * view.at(whole - 1 + k as i64, side) as i64)
            .sum();
        (sum >> SPLINE_QUANT_BITS) as i32
    }
}

impl Resampler for Fir {
    #[inline]
    fn fetch(view: &SampleView<'_>, pos: i64, side: usize) -> i32 {
        let whole = pos >> 32;
        let frac = ((pos as u64 & 0xFFFF_FFFF) >> 16) as usize;
        let idx = ((frac + 16) >> 2) & 0x7FF8;
        let lut = &WINDOWED_FIR_LUT[idx..idx + WFIR_WIDTH];
        let tap = |k: usize| lut[k] as i64 * view.at(whole - 3 + k as i64, side) as i64;
        let lo: i64 = (0..4).map(tap).sum();
        let hi: i64 = (4..8).map(tap).sum();
        (((lo >> 1) + (hi >> 1)) >> (WFIR_QUANT_BITS - 1)) as i32
    }
}
