//! Clip the accumulation buffer and convert it to the output format

/// Mix headroom: the accumulator carries this many bits above 16-bit output
pub(crate) const MIXING_ATTENUATION: u32 = 5;
pub(crate) const MIXING_CLIP_MIN: i32 = -0x0400_0000;
pub(crate) const MIXING_CLIP_MAX: i32 = 0x03FF_FFFF;

/// Running peak tracking for the output VU meter, per interleaved side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PeakTracker {
    pub mins: [i32; 2],
    pub maxs: [i32; 2],
}

impl Default for PeakTracker {
    fn default() -> Self {
        Self {
            mins: [i32::MAX; 2],
            maxs: [-i32::MAX; 2],
        }
    }
}

impl PeakTracker {
    #[inline]
    fn track(&mut self, i: usize, n: i32) {
        let side = i & 1;
        if n < self.mins[side] {
            self.mins[side] = n;
        } else if n > self.maxs[side] {
            self.maxs[side] = n;
        }
    }

    /// Peak-to-peak reading per side, 0..=255
    pub fn meters(&self) -> [u32; 2] {
        std::array::from_fn(|side| {
            let min = self.mins[side] >> 18;
            let max = (self.maxs[side] >> 18).max(min);
            (max - min).min(0xFF) as u32
        })
    }
}

/// Clip `samples` and write them to `out` as little-endian PCM of `bits`
/// bits (8-bit output is unsigned). Returns the bytes written.
pub(crate) fn clip_and_convert(
    out: &mut [u8],
    samples: &[i32],
    bits: u32,
    peaks: &mut PeakTracker,
) -> usize {
    let width = (bits / 8) as usize;
    let mut written = 0;
    for (i, (&s, dst)) in samples.iter().zip(out.chunks_exact_mut(width)).enumerate() {
        let n = s.clamp(MIXING_CLIP_MIN, MIXING_CLIP_MAX);
        peaks.track(i, n);
        match bits {
            8 => dst[0] = ((n >> (24 - MIXING_ATTENUATION)) as u8) ^ 0x80,
            16 => dst.copy_from_slice(&((n >> (16 - MIXING_ATTENUATION)) as i16).to_le_bytes()),
            24 => dst.copy_from_slice(&(n >> (8 - MIXING_ATTENUATION)).to_le_bytes()[..3]),
            _ => dst.copy_from_slice(&(n << MIXING_ATTENUATION).to_le_bytes()),
        }
        written += width;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_16bit_conversion_and_clipping() {
        let mut out = [0u8; 6];
        let mut peaks = PeakTracker::default();
        let n = clip_and_convert(&mut out, &[1 << 11, i32::MAX, i32::MIN], 16, &mut peaks);
        assert_eq!(n, 6);
        assert_eq!(i16::from_le_bytes([out[0], out[1]]), 1);
        assert_eq!(i16::from_le_bytes([out[2], out[3]]), i16::MAX, "clips high");
        assert_eq!(i16::from_le_bytes([out[4], out[5]]), i16::MIN, "clips low");
    }

    #[test]
    fn test_8bit_is_unsigned() {
        let mut out = [0u8; 2];
        let mut peaks = PeakTracker::default();
        clip_and_convert(&mut out, &[0, MIXING_CLIP_MIN], 8, &mut peaks);
        assert_eq!(out, [0x80, 0x00]);
    }

    #[test]
    fn test_24_and_32_bit_widths() {
        let mut out = [0u8; 3];
        let mut peaks = PeakTracker::default();
        assert_eq!(clip_and_convert(&mut out, &[-8], 24, &mut peaks), 3);
        assert_eq!(out, [0xFF, 0xFF, 0xFF], "-1 in 24-bit");

        let mut out = [0u8; 4];
        clip_and_convert(&mut out, &[1], 32, &mut peaks);
        assert_eq!(i32::from_le_bytes(out), 32);
    }

    #[test]
    fn test_peak_meter() {
        let mut peaks = PeakTracker::default();
        let mut out = [0u8; 8];
        clip_and_convert(&mut out, &[0, 0, 0x0100_0000, 0], 16, &mut peaks);
        assert_eq!(peaks.meters(), [0x40, 0]);
        assert_eq!(PeakTracker::default().meters(), [0, 0], "nothing converted reads zero");
    }
}
