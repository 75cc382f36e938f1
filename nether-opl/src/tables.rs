//! Lookup tables shared by every chip instance.
//!
//! The fixed tables are transcribed from measurements of a real YM3812. The
//! logarithmic sine and exponential total-level tables are computed once on
//! first use and shared read-only afterwards.

use std::sync::LazyLock;

/// 16.16 fixed point phase counters.
pub(crate) const FREQ_SH: u32 = 16;
pub(crate) const FREQ_MASK: u32 = (1 << FREQ_SH) - 1;
/// 16.16 fixed point envelope timer.
pub(crate) const EG_SH: u32 = 16;
/// 8.24 fixed point LFO counters.
pub(crate) const LFO_SH: u32 = 24;

pub(crate) const ENV_BITS: u32 = 10;
pub(crate) const ENV_LEN: u32 = 1 << ENV_BITS;
pub(crate) const ENV_STEP: f64 = 128.0 / ENV_LEN as f64;
pub(crate) const MAX_ATT_INDEX: i32 = (1 << (ENV_BITS - 1)) - 1;
pub(crate) const MIN_ATT_INDEX: i32 = 0;

pub(crate) const SIN_BITS: u32 = 10;
pub(crate) const SIN_LEN: usize = 1 << SIN_BITS;
pub(crate) const SIN_MASK: u32 = (SIN_LEN as u32) - 1;

const TL_RES_LEN: usize = 256;
pub(crate) const TL_TAB_LEN: usize = 12 * 2 * TL_RES_LEN;
/// Envelope attenuation at or above which an operator is silent.
pub(crate) const ENV_QUIET: u32 = (TL_TAB_LEN >> 4) as u32;

pub(crate) const RATE_STEPS: u8 = 8;

/// Register offset (low 5 bits) to operator slot index. `-1` marks holes.
pub(crate) const SLOT_ARRAY: [i8; 32] = [
    0, 2, 4, 1, 3, 5, -1, -1, //
    6, 8, 10, 7, 9, 11, -1, -1, //
    12, 14, 16, 13, 15, 17, -1, -1, //
    -1, -1, -1, -1, -1, -1, -1, -1,
];

/// Key scale level attenuation for the top octave, in 0.09375 dB units.
/// Each lower octave is 32 units (3 dB) quieter, floored at zero.
const KSL_TOP_OCTAVE: [u32; 16] = [
    0, 96, 128, 148, 160, 172, 180, 188, 192, 200, 204, 208, 212, 216, 220, 224,
];

const fn build_ksl_tab() -> [u32; 128] {
    let mut tab = [0u32; 128];
    let mut oct = 0;
    while oct < 8 {
        let mut i = 0;
        while i < 16 {
            let drop = 32 * (7 - oct as u32);
            let top = KSL_TOP_OCTAVE[i];
            tab[oct * 16 + i] = if top > drop { top - drop } else { 0 };
            i += 1;
        }
        oct += 1;
    }
    tab
}

/// Key scale level base per (block, fnum high bits).
pub(crate) const KSL_TAB: [u32; 128] = build_ksl_tab();

/// 0 / 3.0 / 1.5 / 6.0 dB per octave.
pub(crate) const KSL_SHIFT: [u8; 4] = [31, 1, 2, 0];

/// Sustain level in envelope units, 3 dB per step; the last step is 93 dB.
pub(crate) const SL_TAB: [u32; 16] = [
    0, 16, 32, 48, 64, 80, 96, 112, 128, 144, 160, 176, 192, 208, 224, 496,
];

#[rustfmt::skip]
pub(crate) const EG_INC: [u8; 15 * RATE_STEPS as usize] = [
    0,1, 0,1, 0,1, 0,1, // rates 00..12 0
    0,1, 0,1, 1,1, 0,1, // rates 00..12 1
    0,1, 1,1, 0,1, 1,1, // rates 00..12 2
    0,1, 1,1, 1,1, 1,1, // rates 00..12 3
    1,1, 1,1, 1,1, 1,1, // rate 13 0
    1,1, 1,2, 1,1, 1,2, // rate 13 1
    1,2, 1,2, 1,2, 1,2, // rate 13 2
    1,2, 2,2, 1,2, 2,2, // rate 13 3
    2,2, 2,2, 2,2, 2,2, // rate 14 0
    2,2, 2,4, 2,2, 2,4, // rate 14 1
    2,4, 2,4, 2,4, 2,4, // rate 14 2
    2,4, 4,4, 2,4, 4,4, // rate 14 3
    4,4, 4,4, 4,4, 4,4, // rates 15 0..3
    8,8, 8,8, 8,8, 8,8, // rates 15 2, 15 3 for attack
    0,0, 0,0, 0,0, 0,0, // infinite rates
];

const fn build_rate_select() -> [u8; 96] {
    let mut tab = [0u8; 96];
    let mut i = 0;
    while i < 96 {
        let row = if i < 16 {
            14
        } else if i < 16 + 52 {
            ((i - 16) % 4) as u8
        } else if i < 16 + 56 {
            4 + ((i - 16 - 52) % 4) as u8
        } else if i < 16 + 60 {
            8 + ((i - 16 - 56) % 4) as u8
        } else {
            12
        };
        tab[i] = row * RATE_STEPS;
        i += 1;
    }
    tab
}

const fn build_rate_shift() -> [u8; 96] {
    let mut tab = [0u8; 96];
    let mut i = 16;
    while i < 16 + 52 {
        tab[i] = 12 - ((i - 16) / 4) as u8;
        i += 1;
    }
    tab
}

/// Row offset into [`EG_INC`] per effective rate (16 infinite + 64 + 16 RKS).
pub(crate) const EG_RATE_SELECT: [u8; 96] = build_rate_select();
/// Counter shift per effective rate.
pub(crate) const EG_RATE_SHIFT: [u8; 96] = build_rate_shift();

/// Frequency multiplier, doubled so that 1/2 is representable.
pub(crate) const MUL_TAB: [u8; 16] = [1, 2, 4, 6, 8, 10, 12, 14, 16, 18, 20, 20, 24, 24, 30, 30];

pub(crate) const LFO_AM_TAB_ELEMENTS: u32 = 210;

/// LFO phase modulation per (fnum bits 7..9, depth, step).
#[rustfmt::skip]
pub(crate) const LFO_PM_TABLE: [i8; 8 * 8 * 2] = [
    0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,

    0, 0, 0, 0, 0, 0, 0, 0,
    1, 0, 0, 0,-1, 0, 0, 0,

    1, 0, 0, 0,-1, 0, 0, 0,
    2, 1, 0,-1,-2,-1, 0, 1,

    1, 0, 0, 0,-1, 0, 0, 0,
    3, 1, 0,-1,-3,-1, 0, 1,

    2, 1, 0,-1,-2,-1, 0, 1,
    4, 2, 0,-2,-4,-2, 0, 2,

    2, 1, 0,-1,-2,-1, 0, 1,
    5, 2, 0,-2,-5,-2, 0, 2,

    3, 1, 0,-1,-3,-1, 0, 1,
    6, 3, 0,-3,-6,-3, 0, 3,

    3, 1, 0,-1,-3,-1, 0, 1,
    7, 3, 0,-3,-7,-3, 0, 3,
];

/// Computed tables: logarithmic sine, exponential attenuation and the
/// tremolo triangle.
pub(crate) struct Tables {
    pub tl: Vec<i32>,
    pub sin: Vec<u32>,
    pub lfo_am: Vec<u8>,
}

pub(crate) static TABLES: LazyLock<Tables> = LazyLock::new(Tables::build);

impl Tables {
    fn build() -> Self {
        let mut tl = vec![0i32; TL_TAB_LEN];
        for x in 0..TL_RES_LEN {
            let m = ((1u32 << 16) as f64 / 2f64.powf((x + 1) as f64 * (ENV_STEP / 4.0) / 8.0)).floor();
            let mut n = m as i32;
            n >>= 4;
            n = if n & 1 != 0 { (n >> 1) + 1 } else { n >> 1 };
            n <<= 1;
            tl[x * 2] = n;
            tl[x * 2 + 1] = -n;
            for i in 1..12 {
                tl[x * 2 + i * 2 * TL_RES_LEN] = n >> i;
                tl[x * 2 + 1 + i * 2 * TL_RES_LEN] = -(n >> i);
            }
        }

        let mut sin = vec![0u32; SIN_LEN * 4];
        for (i, entry) in sin.iter_mut().take(SIN_LEN).enumerate() {
            let m = (((i * 2) + 1) as f64 * std::f64::consts::PI / SIN_LEN as f64).sin();
            let o = if m > 0.0 {
                8.0 * (1.0 / m).log2()
            } else {
                8.0 * (-1.0 / m).log2()
            };
            let o = o / (ENV_STEP / 4.0);
            let mut n = (2.0 * o) as i32;
            n = if n & 1 != 0 { (n >> 1) + 1 } else { n >> 1 };
            *entry = (n * 2) as u32 + if m >= 0.0 { 0 } else { 1 };
        }
        for i in 0..SIN_LEN {
            // Half sine
            sin[SIN_LEN + i] = if i & (1 << (SIN_BITS - 1)) != 0 {
                TL_TAB_LEN as u32
            } else {
                sin[i]
            };
            // Absolute sine
            sin[2 * SIN_LEN + i] = sin[i & (SIN_MASK as usize >> 1)];
            // Pulse sine (first quarter, repeated)
            sin[3 * SIN_LEN + i] = if i & (1 << (SIN_BITS - 2)) != 0 {
                TL_TAB_LEN as u32
            } else {
                sin[i & (SIN_MASK as usize >> 2)]
            };
        }

        // 27-level triangle: rise 0..=26 then fall back to 1
        let mut lfo_am = Vec::with_capacity(LFO_AM_TAB_ELEMENTS as usize);
        lfo_am.extend(std::iter::repeat_n(0u8, 7));
        for level in 1..=25u8 {
            lfo_am.extend(std::iter::repeat_n(level, 4));
        }
        lfo_am.extend(std::iter::repeat_n(26u8, 3));
        for level in (1..=25u8).rev() {
            lfo_am.extend(std::iter::repeat_n(level, 4));
        }

        Self { tl, sin, lfo_am }
    }

    /// Carrier output: `pm` is a raw operator output shifted into phase units.
    #[inline]
    pub fn op_calc(&self, phase: u32, env: u32, pm: i32, wave_tab: u32) -> i32 {
        let index = ((phase & !FREQ_MASK).wrapping_add(pm.wrapping_shl(16) as u32) >> FREQ_SH) & SIN_MASK;
        self.lookup(env, wave_tab + index)
    }

    /// Modulator output with feedback already in phase units.
    #[inline]
    pub fn op_calc1(&self, phase: u32, env: u32, pm: i32, wave_tab: u32) -> i32 {
        let index = ((phase & !FREQ_MASK).wrapping_add(pm as u32) >> FREQ_SH) & SIN_MASK;
        self.lookup(env, wave_tab + index)
    }

    #[inline]
    fn lookup(&self, env: u32, sin_index: u32) -> i32 {
        let p = (env << 4) + self.sin[sin_index as usize];
        if p as usize >= TL_TAB_LEN {
            0
        } else {
            self.tl[p as usize]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ksl_table_matches_measured_values() {
        assert_eq!(KSL_TAB[16 + 9], 8, "octave 1 index 9 is 0.75 dB");
        assert_eq!(KSL_TAB[2 * 16 + 5], 12, "octave 2 index 5 is 1.125 dB");
        assert_eq!(KSL_TAB[7 * 16 + 15], 224, "top entry is 21 dB");
        assert!(KSL_TAB[..16].iter().all(|&v| v == 0), "octave 0 has no scaling");
    }

    #[test]
    fn test_rate_tables_shape() {
        assert_eq!(EG_RATE_SHIFT[16], 12, "slowest finite rate shifts by 12");
        assert_eq!(EG_RATE_SHIFT[16 + 48], 0, "rate 12 has no shift");
        assert_eq!(EG_RATE_SELECT[0], 14 * RATE_STEPS, "infinite rates select the zero row");
        assert_eq!(EG_RATE_SELECT[16 + 53], 5 * RATE_STEPS, "rate 13 1");
        assert_eq!(EG_RATE_SELECT[95], 12 * RATE_STEPS, "dummy rates equal 15 3");
    }

    #[test]
    fn test_lfo_am_triangle() {
        let t = &TABLES.lfo_am;
        assert_eq!(t.len(), LFO_AM_TAB_ELEMENTS as usize);
        assert_eq!(t.iter().copied().max(), Some(26), "peak level is 26");
        assert_eq!(t[t.len() - 1], 1, "falls back to 1");
    }

    #[test]
    fn test_sine_table_is_symmetric() {
        let t = &*TABLES;
        assert_eq!(t.sin[0] & 1, 0, "first half is positive");
        assert_eq!(t.sin[SIN_LEN / 2] & 1, 1, "second half carries the sign bit");
        assert!(t.tl[0] > 0 && t.tl[1] == -t.tl[0], "positive/negative pairs");
        assert_eq!(t.sin[SIN_LEN + SIN_LEN / 2], TL_TAB_LEN as u32, "half sine silences the negative half");
    }
}
