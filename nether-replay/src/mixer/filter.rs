//! Two-pole resonant low-pass filter

use crate::tables::RESONANCE_TABLE;
use crate::voice::{Voice, VoiceFlags};

/// Coefficient precision in bits
const FILTER_PRECISION: u32 = 24;

/// History values fed back into the filter are clipped to this range;
/// without the clip a resonant filter can run away.
const FILTER_CLIP_MIN: i32 = -65536;
const FILTER_CLIP_MAX: i32 = 65534;

impl Voice {
    /// Recalculate filter coefficients from cutoff and resonance.
    ///
    /// `modifier` comes from a filter envelope (-256..=256, 0 for none).
    /// A wide open filter with no resonance is switched off, but only when
    /// a note was just triggered; otherwise the current coefficients stay.
    pub(crate) fn setup_filter(&mut self, reset: bool, modifier: i32, mix_rate: u32) {
        let cutoff = (self.cutoff as i32 * (modifier + 256) / 256).clamp(0, 255);
        let resonance = self.resonance.min(255) as usize;

        if resonance == 0 && cutoff >= 254 {
            if self.flags.contains(VoiceFlags::NEW_NOTE) {
                self.flags.remove(VoiceFlags::FILTER);
            }
            return;
        }
        self.flags.insert(VoiceFlags::FILTER);

        let rate = mix_rate as f32;
        let frequency = (110.0 * 2f32.powf(cutoff as f32 * (128.0 / (24.0 * 256.0)) + 0.25)).min(rate / 2.0);
        let r = rate / (2.0 * std::f32::consts::PI * frequency);

        let damping = RESONANCE_TABLE[resonance.min(127)];
        let d = damping * r + damping - 1.0;
        let e = r * r;
        let denom = 1.0 + d + e;

        let scale = (1u32 << FILTER_PRECISION) as f32;
        self.filter_a0 = (scale / denom) as i32;
        self.filter_b0 = ((d + e + e) / denom * scale) as i32;
        self.filter_b1 = (-e / denom * scale) as i32;

        if reset {
            self.filter_y = [[0; 2]; 2];
        }
    }

    /// Run one sample through the filter history of `side`.
    #[inline]
    pub(crate) fn filter_sample(&mut self, side: usize, input: i32) -> i32 {
        let [y1, y2] = self.filter_y[side];
        let acc = input as i64 * self.filter_a0 as i64
            + y1.clamp(FILTER_CLIP_MIN, FILTER_CLIP_MAX) as i64 * self.filter_b0 as i64
            + y2.clamp(FILTER_CLIP_MIN, FILTER_CLIP_MAX) as i64 * self.filter_b1 as i64
            + (1i64 << (FILTER_PRECISION - 1));
        let out = (acc >> FILTER_PRECISION) as i32;
        self.filter_y[side] = [out, y1];
        out
    }
}
