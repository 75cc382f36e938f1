//! Lookup tables and fixed-point pitch helpers
//!
//! Waveform and slide tables match Impulse Tracker's so that vibrato depth,
//! portamento speed and retrigger volume steps come out identical. The
//! resampling kernels (cubic spline, windowed FIR) and the filter resonance
//! curve are generated once on first use.

use std::sync::LazyLock;

// =============================================================================
// Effect tables
// =============================================================================

/// Volume-column portamento speeds (`Gx` in the volume column)
pub(crate) const VC_PORTAMENTO: [u8; 16] = [
    0x00, 0x01, 0x04, 0x08, 0x10, 0x20, 0x40, 0x60, 0x80, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// Sine waveform, 256 steps
pub(crate) const SINE_TABLE: [i8; 256] = [
    0, 2, 3, 5, 6, 8, 9, 11, 12, 14, 16, 17, 19, 20, 22, 23,
    24, 26, 27, 29, 30, 32, 33, 34, 36, 37, 38, 39, 41, 42, 43, 44,
    45, 46, 47, 48, 49, 50, 51, 52, 53, 54, 55, 56, 56, 57, 58, 59,
    59, 60, 60, 61, 61, 62, 62, 62, 63, 63, 63, 64, 64, 64, 64, 64,
    64, 64, 64, 64, 64, 64, 63, 63, 63, 62, 62, 62, 61, 61, 60, 60,
    59, 59, 58, 57, 56, 56, 55, 54, 53, 52, 51, 50, 49, 48, 47, 46,
    45, 44, 43, 42, 41, 39, 38, 37, 36, 34, 33, 32, 30, 29, 27, 26,
    24, 23, 22, 20, 19, 17, 16, 14, 12, 11, 9, 8, 6, 5, 3, 2,
    0, -2, -3, -5, -6, -8, -9, -11, -12, -14, -16, -17, -19, -20, -22, -23,
    -24, -26, -27, -29, -30, -32, -33, -34, -36, -37, -38, -39, -41, -42, -43, -44,
    -45, -46, -47, -48, -49, -50, -51, -52, -53, -54, -55, -56, -56, -57, -58, -59,
    -59, -60, -60, -61, -61, -62, -62, -62, -63, -63, -63, -64, -64, -64, -64, -64,
    -64, -64, -64, -64, -64, -64, -63, -63, -63, -62, -62, -62, -61, -61, -60, -60,
    -59, -59, -58, -57, -56, -56, -55, -54, -53, -52, -51, -50, -49, -48, -47, -46,
    -45, -44, -43, -42, -41, -39, -38, -37, -36, -34, -33, -32, -30, -29, -27, -26,
    -24, -23, -22, -20, -19, -17, -16, -14, -12, -11, -9, -8, -6, -5, -3, -2,
];

/// Ramp-down waveform, 256 steps
pub(crate) const RAMP_DOWN_TABLE: [i8; 256] = [
    64, 63, 63, 62, 62, 61, 61, 60, 60, 59, 59, 58, 58, 57, 57, 56,
    56, 55, 55, 54, 54, 53, 53, 52, 52, 51, 51, 50, 50, 49, 49, 48,
    48, 47, 47, 46, 46, 45, 45, 44, 44, 43, 43, 42, 42, 41, 41, 40,
    40, 39, 39, 38, 38, 37, 37, 36, 36, 35, 35, 34, 34, 33, 33, 32,
    32, 31, 31, 30, 30, 29, 29, 28, 28, 27, 27, 26, 26, 25, 25, 24,
    24, 23, 23, 22, 22, 21, 21, 20, 20, 19, 19, 18, 18, 17, 17, 16,
    16, 15, 15, 14, 14, 13, 13, 12, 12, 11, 11, 10, 10, 9, 9, 8,
    8, 7, 7, 6, 6, 5, 5, 4, 4, 3, 3, 2, 2, 1, 1, 0,
    0, -1, -1, -2, -2, -3, -3, -4, -4, -5, -5, -6, -6, -7, -7, -8,
    -8, -9, -9, -10, -10, -11, -11, -12, -12, -13, -13, -14, -14, -15, -15, -16,
    -16, -17, -17, -18, -18, -19, -19, -20, -20, -21, -21, -22, -22, -23, -23, -24,
    -24, -25, -25, -26, -26, -27, -27, -28, -28, -29, -29, -30, -30, -31, -31, -32,
    -32, -33, -33, -34, -34, -35, -35, -36, -36, -37, -37, -38, -38, -39, -39, -40,
    -40, -41, -41, -42, -42, -43, -43, -44, -44, -45, -45, -46, -46, -47, -47, -48,
    -48, -49, -49, -50, -50, -51, -51, -52, -52, -53, -53, -54, -54, -55, -55, -56,
    -56, -57, -57, -58, -58, -59, -59, -60, -60, -61, -61, -62, -62, -63, -63, -64,
];

/// Square waveform, 256 steps
pub(crate) const SQUARE_TABLE: [i8; 256] = [
    64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64,
    64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64,
    64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64,
    64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64,
    64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64,
    64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64,
    64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64,
    64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64, 64,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Retrigger volume multipliers (x/16), selected by the high nibble
pub(crate) const RETRIG_TABLE_1: [i8; 16] = [0, 0, 0, 0, 0, 0, 10, 8, 0, 0, 0, 0, 0, 0, 24, 32];

/// Retrigger volume offsets, used where the multiplier table is zero
pub(crate) const RETRIG_TABLE_2: [i8; 16] = [0, -1, -2, -4, -8, -16, 0, 0, 0, 1, 2, 4, 8, 16, 0, 0];

/// 2^(i/768) in 16.16, fine slides up
pub(crate) const FINE_LINEAR_SLIDE_UP_TABLE: [u32; 16] = [
    65536, 65595, 65654, 65714, 65773, 65832, 65892, 65951,
    66011, 66071, 66130, 66190, 66250, 66309, 66369, 66429,
];

/// 2^(-i/768) in 16.16, fine slides down
pub(crate) const FINE_LINEAR_SLIDE_DOWN_TABLE: [u32; 16] = [
    65535, 65477, 65418, 65359, 65300, 65241, 65182, 65123,
    65065, 65006, 64947, 64888, 64830, 64772, 64713, 64645,
];

/// 2^(i/192) in 16.16, coarse slides up
pub(crate) const LINEAR_SLIDE_UP_TABLE: [u32; 256] = [
    65536, 65773, 66010, 66249, 66489, 66729, 66971, 67213,
    67456, 67700, 67945, 68190, 68437, 68685, 68933, 69182,
    69432, 69684, 69936, 70189, 70442, 70697, 70953, 71209,
    71467, 71725, 71985, 72245, 72507, 72769, 73032, 73296,
    73561, 73827, 74094, 74362, 74631, 74901, 75172, 75444,
    75717, 75991, 76265, 76541, 76818, 77096, 77375, 77655,
    77935, 78217, 78500, 78784, 79069, 79355, 79642, 79930,
    80219, 80509, 80800, 81093, 81386, 81680, 81976, 82272,
    82570, 82868, 83168, 83469, 83771, 84074, 84378, 84683,
    84989, 85297, 85605, 85915, 86225, 86537, 86850, 87164,
    87480, 87796, 88113, 88432, 88752, 89073, 89395, 89718,
    90043, 90369, 90695, 91023, 91353, 91683, 92015, 92347,
    92681, 93017, 93353, 93691, 94029, 94370, 94711, 95053,
    95397, 95742, 96088, 96436, 96785, 97135, 97486, 97839,
    98193, 98548, 98904, 99262, 99621, 99981, 100343, 100706,
    101070, 101435, 101802, 102170, 102540, 102911, 103283, 103657,
    104031, 104408, 104785, 105164, 105545, 105926, 106309, 106694,
    107080, 107467, 107856, 108246, 108637, 109030, 109425, 109820,
    110217, 110616, 111016, 111418, 111821, 112225, 112631, 113038,
    113447, 113857, 114269, 114682, 115097, 115514, 115931, 116351,
    116771, 117194, 117618, 118043, 118470, 118898, 119328, 119760,
    120193, 120628, 121064, 121502, 121941, 122382, 122825, 123269,
    123715, 124162, 124611, 125062, 125514, 125968, 126424, 126881,
    127340, 127801, 128263, 128727, 129192, 129660, 130129, 130599,
    131072, 131546, 132021, 132499, 132978, 133459, 133942, 134426,
    134912, 135400, 135890, 136381, 136875, 137370, 137866, 138365,
    138865, 139368, 139872, 140378, 140885, 141395, 141906, 142419,
    142935, 143451, 143970, 144491, 145014, 145538, 146064, 146593,
    147123, 147655, 148189, 148725, 149263, 149803, 150344, 150888,
    151434, 151982, 152531, 153083, 153637, 154192, 154750, 155310,
    155871, 156435, 157001, 157569, 158138, 158710, 159284, 159860,
    160439, 161019, 161601, 162186, 162772, 163361, 163952, 164545,
];

/// 2^(-i/192) in 16.16, coarse slides down
pub(crate) const LINEAR_SLIDE_DOWN_TABLE: [u32; 256] = [
    65536, 65299, 65064, 64830, 64596, 64363, 64131, 63900,
    63670, 63440, 63212, 62984, 62757, 62531, 62305, 62081,
    61857, 61634, 61412, 61191, 60970, 60751, 60532, 60314,
    60096, 59880, 59664, 59449, 59235, 59021, 58809, 58597,
    58385, 58175, 57965, 57757, 57548, 57341, 57134, 56928,
    56723, 56519, 56315, 56112, 55910, 55709, 55508, 55308,
    55108, 54910, 54712, 54515, 54318, 54123, 53928, 53733,
    53540, 53347, 53154, 52963, 52772, 52582, 52392, 52204,
    52015, 51828, 51641, 51455, 51270, 51085, 50901, 50717,
    50535, 50353, 50171, 49990, 49810, 49631, 49452, 49274,
    49096, 48919, 48743, 48567, 48392, 48218, 48044, 47871,
    47698, 47526, 47355, 47185, 47014, 46845, 46676, 46508,
    46340, 46173, 46007, 45841, 45676, 45511, 45347, 45184,
    45021, 44859, 44697, 44536, 44376, 44216, 44056, 43898,
    43740, 43582, 43425, 43268, 43112, 42957, 42802, 42648,
    42494, 42341, 42189, 42037, 41885, 41734, 41584, 41434,
    41285, 41136, 40988, 40840, 40693, 40546, 40400, 40254,
    40109, 39965, 39821, 39677, 39534, 39392, 39250, 39108,
    38967, 38827, 38687, 38548, 38409, 38270, 38132, 37995,
    37858, 37722, 37586, 37450, 37315, 37181, 37047, 36913,
    36780, 36648, 36516, 36384, 36253, 36122, 35992, 35862,
    35733, 35604, 35476, 35348, 35221, 35094, 34968, 34842,
    34716, 34591, 34466, 34342, 34218, 34095, 33972, 33850,
    33728, 33606, 33485, 33364, 33244, 33124, 33005, 32886,
    32768, 32649, 32532, 32415, 32298, 32181, 32065, 31950,
    31835, 31720, 31606, 31492, 31378, 31265, 31152, 31040,
    30928, 30817, 30706, 30595, 30485, 30375, 30266, 30157,
    30048, 29940, 29832, 29724, 29617, 29510, 29404, 29298,
    29192, 29087, 28982, 28878, 28774, 28670, 28567, 28464,
    28361, 28259, 28157, 28056, 27955, 27854, 27754, 27654,
    27554, 27455, 27356, 27257, 27159, 27061, 26964, 26866,
    26770, 26673, 26577, 26481, 26386, 26291, 26196, 26102,
];

/// Volume (0..=16384 scale) at which each MIDI velocity step begins
pub(crate) const GM_VOLUME_TRANSITION: [u16; 128] = [
    0, 2031, 4039, 5214, 6048, 6694, 7222, 7669,
    8056, 8397, 8702, 8978, 9230, 9462, 9677, 9877,
    10064, 10239, 10405, 10562, 10710, 10852, 10986, 11115,
    11239, 11357, 11470, 11580, 11685, 11787, 11885, 11980,
    12072, 12161, 12248, 12332, 12413, 12493, 12570, 12645,
    12718, 12790, 12860, 12928, 12995, 13060, 13123, 13186,
    13247, 13306, 13365, 13422, 13479, 13534, 13588, 13641,
    13693, 13745, 13795, 13844, 13893, 13941, 13988, 14034,
    14080, 14125, 14169, 14213, 14256, 14298, 14340, 14381,
    14421, 14461, 14501, 14540, 14578, 14616, 14653, 14690,
    14727, 14763, 14798, 14833, 14868, 14902, 14936, 14970,
    15003, 15035, 15068, 15100, 15131, 15163, 15194, 15224,
    15255, 15285, 15315, 15344, 15373, 15402, 15430, 15459,
    15487, 15514, 15542, 15569, 15596, 15623, 15649, 15675,
    15701, 15727, 15753, 15778, 15803, 15828, 15853, 15877,
    15901, 15925, 15949, 15973, 15996, 16020, 16043, 16065,
];

/// First MIDI volume step whose transition point is at or above `vol`
pub(crate) fn find_gm_volume(vol: u16) -> u32 {
    GM_VOLUME_TRANSITION.partition_point(|&p| p < vol) as u32
}

/// Waveform sample for vibrato-style effects. `Random` is resolved by the
/// caller since it needs the song's generator; unknown kinds play as sine.
pub(crate) fn waveform(kind: u8, pos: u8) -> i32 {
    let pos = pos as usize;
    match kind {
        1 => RAMP_DOWN_TABLE[pos] as i32,
        2 => SQUARE_TABLE[pos] as i32,
        _ => SINE_TABLE[pos] as i32,
    }
}

// =============================================================================
// Resampling kernels
// =============================================================================

/// Spline coefficients are scaled to this many bits
pub(crate) const SPLINE_QUANT_BITS: u32 = 14;
const SPLINE_FRAC_BITS: u32 = 10;
const SPLINE_LUT_LEN: usize = 1 << SPLINE_FRAC_BITS;

/// FIR coefficients are scaled to this many bits
pub(crate) const WFIR_QUANT_BITS: u32 = 15;
const WFIR_FRAC_BITS: u32 = 10;
const WFIR_LOG2_WIDTH: u32 = 3;
/// Taps per FIR phase
pub(crate) const WFIR_WIDTH: usize = 1 << WFIR_LOG2_WIDTH;
const WFIR_LUT_LEN: usize = (1 << (WFIR_FRAC_BITS + 1)) + 1;
const WFIR_CUTOFF: f64 = 0.90;

/// Four taps per phase for `p[-1]`, `p[0]`, `p[1]`, `p[2]`
pub(crate) static CUBIC_SPLINE_LUT: LazyLock<Box<[i32]>> = LazyLock::new(|| {
    let scale = (1i32 << SPLINE_QUANT_BITS) as f64;
    let clamp = |v: f64| v.clamp(-scale, scale) as i32;
    let mut lut = vec![0i32; 4 * SPLINE_LUT_LEN];

    for (i, taps) in lut.chunks_exact_mut(4).enumerate() {
        let x = i as f64 / SPLINE_LUT_LEN as f64;
        let (x2, x3) = (x * x, x * x * x);
        taps[0] = clamp((0.5 + scale * (-0.5 * x3 + x2 - 0.5 * x)).floor());
        taps[1] = clamp((0.5 + scale * (1.5 * x3 - 2.5 * x2 + 1.0)).floor());
        taps[2] = clamp((0.5 + scale * (-1.5 * x3 + 2.0 * x2 + 0.5 * x)).floor());
        taps[3] = clamp((0.5 + scale * (0.5 * x3 - 0.5 * x2)).floor());

        // Force unity gain by nudging the largest tap.
        let sum: i32 = taps.iter().sum();
        if sum != 1 << SPLINE_QUANT_BITS {
            let mut max = 0;
            for k in 1..4 {
                if taps[k] > taps[max] {
                    max = k;
                }
            }
            taps[max] += (1 << SPLINE_QUANT_BITS) - sum;
        }
    }
    lut.into_boxed_slice()
});

/// Blackman-windowed sinc, one coefficient
fn wfir_coef(tap: usize, offset: f64) -> f64 {
    let width_m1 = (WFIR_WIDTH - 1) as f64;
    let pos_u = tap as f64 - offset;
    let pos = pos_u - 0.5 * width_m1;
    if pos.abs() < 1e-8 {
        return WFIR_CUTOFF;
    }
    let idl = 2.0 * std::f64::consts::PI / width_m1;
    let window = 0.42 - 0.50 * (idl * pos_u).cos() + 0.08 * (2.0 * idl * pos_u).cos();
    let pos = pos * std::f64::consts::PI;
    window * (WFIR_CUTOFF * pos).sin() / pos
}

/// Eight taps per phase, 2049 phases
pub(crate) static WINDOWED_FIR_LUT: LazyLock<Box<[i32]>> = LazyLock::new(|| {
    let phases = (1 << WFIR_FRAC_BITS) as f64;
    let norm = 1.0 / (2.0 * phases);
    let scale = (1i32 << WFIR_QUANT_BITS) as f64;
    let mut lut = vec![0i32; WFIR_LUT_LEN * WFIR_WIDTH];

    for (pcl, taps) in lut.chunks_exact_mut(WFIR_WIDTH).enumerate() {
        let offset = (pcl as f64 - phases) * norm;
        let mut coefs = [0f64; WFIR_WIDTH];
        for (cc, c) in coefs.iter_mut().enumerate() {
            *c = wfir_coef(cc, offset);
        }
        let gain = 1.0 / coefs.iter().sum::<f64>();
        for (tap, c) in taps.iter_mut().zip(coefs) {
            *tap = (0.5 + scale * c * gain).floor().clamp(-scale, scale) as i32;
        }
    }
    lut.into_boxed_slice()
});

/// Twice the damping factor for each resonance step
pub(crate) static RESONANCE_TABLE: LazyLock<[f32; 128]> =
    LazyLock::new(|| std::array::from_fn(|i| 10f64.powf(-(i as f64) * 24.0 / 2560.0) as f32));

// =============================================================================
// Pitch helpers
// =============================================================================

/// `a * b / c` with a 64-bit intermediate
#[inline]
pub(crate) fn muldiv(a: i64, b: i64, c: i64) -> i32 {
    if c == 0 {
        return 0;
    }
    (a * b / c) as i32
}

/// `(a * b + c / 2) / c` with a 64-bit intermediate
#[inline]
pub(crate) fn muldivr(a: i64, b: i64, c: i64) -> i32 {
    if c == 0 {
        return 0;
    }
    ((a * b + (c >> 1)) / c) as i32
}

/// Playback frequency of `note` (1..=120) for a sample tuned to `c5speed`.
/// Control notes and note 0 have no frequency.
pub fn frequency_from_note(note: i32, c5speed: u32) -> i32 {
    if note <= 0 || note > 0xF0 {
        return 0;
    }
    let n = (note - 1) as u32;
    let step = (LINEAR_SLIDE_UP_TABLE[((n % 12) * 16) as usize] as i64) << (n / 12);
    muldiv(c5speed as i64, step, 65536 << 5)
}

/// Lowest note whose frequency is at or above `frequency`
pub fn note_from_frequency(frequency: i32, c5speed: u32) -> i32 {
    if frequency == 0 {
        return 0;
    }
    (0..=120)
        .find(|&n| frequency <= frequency_from_note(n + 1, c5speed))
        .map_or(120, |n| n + 1)
}

/// `hz` raised by `rel` semitones, rounded
pub(crate) fn calc_halftone(hz: i32, rel: i32) -> i32 {
    ((2f64).powf(rel as f64 / 12.0) * hz as f64 + 0.5) as i32
}
