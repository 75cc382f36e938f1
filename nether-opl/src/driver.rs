//! Tracker-facing adapter over the chip.
//!
//! Maps logical tracker voices onto the chip's 9 melodic channels and turns
//! musical events (patch, frequency, volume, pan, key-off) into register
//! writes. Every call on a voice that owns no chip channel is a no-op.

use tracing::debug;

use crate::chip::{OPL_CHANNELS, Opl};

/// Reference rate of the chip; the clock is this times 72.
pub const OPL_RATE_BASE: u32 = 49716;

/// Scale from 16-bit chip output into the 27-bit mix accumulator.
pub const OPL_VOLUME: i32 = 2274;

/// Highest logical voice index the driver tracks.
pub const MAX_LOGICAL_VOICES: usize = 256;

// Register groups
const TEST_REGISTER: u8 = 0x01;
const ENABLE_WAVE_SELECT: u8 = 0x20;
const TIMER1_REGISTER: u8 = 0x02;
const TIMER_CONTROL_REGISTER: u8 = 0x04;
const IRQ_RESET: u8 = 0x80;
const TIMER1_MASK: u8 = 0x40;
const TIMER2_MASK: u8 = 0x20;
const TIMER1_START: u8 = 0x01;
const AM_VIB: u8 = 0x20;
const KSL_LEVEL: u8 = 0x40;
const KSL_MASK: u8 = 0xc0;
const TOTAL_LEVEL_MASK: u8 = 0x3f;
const ATTACK_DECAY: u8 = 0x60;
const SUSTAIN_RELEASE: u8 = 0x80;
const WAVE_SELECT: u8 = 0xe0;
const FNUM_LOW: u8 = 0xa0;
const KEYON_BLOCK: u8 = 0xb0;
const KEYON_BIT: u8 = 0x20;
const FNUM_HIGH_MASK: u32 = 0x03;
const FEEDBACK_CONNECTION: u8 = 0xc0;
const CONNECTION_BIT: u8 = 0x01;
const STEREO_BITS: u8 = 0x30;
const VOICE_TO_LEFT: u8 = 0x10;
const VOICE_TO_RIGHT: u8 = 0x20;

/// Operator register offset of each melodic channel.
const PORT_BASES: [u8; OPL_CHANNELS] = [0, 1, 2, 8, 9, 10, 16, 17, 18];

/// Convert an f-number and block to milli-Hertz.
pub fn fnum_to_millihertz(fnum: u32, block: u32, conversion_factor: u32) -> u32 {
    ((1000u64 * conversion_factor as u64 * fnum as u64) >> (20 - block.min(7))) as u32
}

/// Convert milli-Hertz to an f-number (0..=1023) and block (0..=7),
/// preferring the lowest block that can represent the frequency.
pub fn millihertz_to_fnum(millihertz: u32, conversion_factor: u32) -> (u32, u32) {
    if millihertz == 0 {
        return (0, 0);
    }
    if millihertz > 6_208_431 {
        return (1023, 7);
    }

    let mut block = match millihertz {
        m if m > 3_104_215 => 7,
        m if m > 1_552_107 => 6,
        m if m > 776_053 => 5,
        m if m > 388_026 => 4,
        m if m > 194_013 => 3,
        m if m > 97_006 => 2,
        m if m > 48_503 => 1,
        _ => 0,
    };

    let calc = |block: u32| -> u32 {
        (((millihertz as u64) << (20 - block)) as f64 / (conversion_factor as f64 * 1000.0) + 0.5)
            as u32
    };
    let mut fnum = calc(block);
    if fnum > 1023 {
        block += 1;
        fnum = calc(block);
    }
    (fnum, block)
}

/// Channel assignment and register shadowing for one chip.
#[derive(Debug, Clone)]
pub struct OplDriver {
    chip: Opl,
    /// Value the fake status port returns during detection
    detect_status: u8,
    /// Last latched register number
    register: u8,
    /// Set once any voice has been given a frequency
    active: bool,
    patches: [Option<[u8; 12]>; OPL_CHANNELS],
    keyon: [u8; OPL_CHANNELS],
    pans: Box<[i32; MAX_LOGICAL_VOICES]>,
    opl_to_voice: [Option<usize>; OPL_CHANNELS],
    voice_to_opl: Box<[Option<usize>; MAX_LOGICAL_VOICES]>,
    scratch: Vec<i16>,
}

impl OplDriver {
    /// Create a driver whose chip renders at `mix_rate` Hz.
    pub fn new(mix_rate: u32) -> Self {
        let mut driver = Self {
            chip: Opl::new(OPL_RATE_BASE * 72, mix_rate),
            detect_status: 0,
            register: 0,
            active: false,
            patches: [None; OPL_CHANNELS],
            keyon: [0; OPL_CHANNELS],
            pans: Box::new([128; MAX_LOGICAL_VOICES]),
            opl_to_voice: [None; OPL_CHANNELS],
            voice_to_opl: Box::new([None; MAX_LOGICAL_VOICES]),
            scratch: Vec::new(),
        };
        driver.reset();
        driver
    }

    /// Replace the chip with one rendering at a new mix rate.
    pub fn set_mix_rate(&mut self, mix_rate: u32) {
        if self.chip.rate() != mix_rate {
            debug!(mix_rate, "recreating OPL chip");
            self.chip = Opl::new(OPL_RATE_BASE * 72, mix_rate);
        }
        self.reset();
    }

    pub fn chip(&self) -> &Opl {
        &self.chip
    }

    /// True once any voice has been given a frequency since the last reset.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Chip channel currently owned by `voice`.
    pub fn voice_channel(&self, voice: usize) -> Option<usize> {
        self.voice_to_opl.get(voice).copied().flatten()
    }

    fn out_port(&mut self, port: u8, value: u8) {
        self.chip.write(port, value);
        if port & 1 != 0 {
            if self.register == TIMER_CONTROL_REGISTER {
                if value == IRQ_RESET {
                    self.detect_status = 0x02;
                } else if value == 0x21 {
                    self.detect_status = 0xC0;
                }
            }
        } else {
            self.register = value;
        }
    }

    fn write_byte(&mut self, index: u8, data: u8) {
        self.out_port(0, index);
        self.out_port(1, data);
    }

    fn feedback_byte(&self, voice: usize, patch: &[u8; 12]) -> u8 {
        let pan = self.pans[voice];
        let stereo = if pan < 85 {
            VOICE_TO_LEFT
        } else if pan > 170 {
            VOICE_TO_RIGHT
        } else {
            VOICE_TO_LEFT | VOICE_TO_RIGHT
        };
        (patch[10] & !STEREO_BITS) | stereo
    }

    /// Claim a chip channel for `voice`: a free one first, then one whose
    /// key is released.
    fn assign_voice(&mut self, voice: usize) -> Option<usize> {
        if self.voice_to_opl[voice].is_none() {
            let slot = (0..OPL_CHANNELS)
                .find(|&a| self.opl_to_voice[a].is_none())
                .or_else(|| (0..OPL_CHANNELS).find(|&a| self.keyon[a] & KEYON_BIT == 0));
            if let Some(a) = slot {
                if let Some(previous) = self.opl_to_voice[a] {
                    self.voice_to_opl[previous] = None;
                }
                self.opl_to_voice[a] = Some(voice);
                self.voice_to_opl[voice] = Some(a);
            }
        }
        self.voice_to_opl[voice]
    }

    /// Release the key on `voice`.
    pub fn note_off(&mut self, voice: usize) {
        let Some(oplc) = self.voice_channel(voice) else { return };
        self.keyon[oplc] &= !KEYON_BIT;
        self.write_byte(KEYON_BLOCK + oplc as u8, self.keyon[oplc]);
    }

    /// Set the frequency of `voice`, keying it on unless `keyoff` is set.
    /// Does not retrigger an already keyed note.
    pub fn hertz_touch(&mut self, voice: usize, millihertz: u32, keyoff: bool) {
        let Some(oplc) = self.voice_channel(voice) else { return };
        self.active = true;

        let (fnum, block) = millihertz_to_fnum(millihertz, OPL_RATE_BASE);
        self.keyon[oplc] = (if keyoff { 0 } else { KEYON_BIT })
            | ((block as u8) << 2)
            | ((fnum >> 8) & FNUM_HIGH_MASK) as u8;
        self.write_byte(FNUM_LOW + oplc as u8, (fnum & 0xff) as u8);
        self.write_byte(KEYON_BLOCK + oplc as u8, self.keyon[oplc]);
    }

    /// Set the level of `voice` from a 0..=63 volume. The modulator level
    /// is only touched for additive patches.
    pub fn touch(&mut self, voice: usize, volume: u32) {
        let Some(oplc) = self.voice_channel(voice) else { return };
        let Some(patch) = self.patches[oplc] else { return };
        let vol = volume.min(63);
        let ope = PORT_BASES[oplc];
        let scaled = |reg: u8| -> u8 {
            let level = (reg & TOTAL_LEVEL_MASK) as u32;
            (reg & KSL_MASK) | ((63 + level * vol / 63 - vol) as u8 & TOTAL_LEVEL_MASK)
        };

        if patch[10] & CONNECTION_BIT != 0 {
            self.write_byte(KSL_LEVEL + ope, scaled(patch[2]));
        }
        self.write_byte(KSL_LEVEL + 3 + ope, scaled(patch[3]));
    }

    /// Pan `voice` (0..=256). Only the stereo bits of the feedback register
    /// change.
    pub fn pan(&mut self, voice: usize, value: i32) {
        let Some(pan) = self.pans.get_mut(voice) else { return };
        *pan = value.clamp(0, 256);
        let Some(oplc) = self.voice_channel(voice) else { return };
        let Some(patch) = self.patches[oplc] else { return };
        let fb = self.feedback_byte(voice, &patch);
        self.write_byte(FEEDBACK_CONNECTION + oplc as u8, fb);
    }

    /// Load an 11-byte operator image (padded to 12) onto `voice`,
    /// assigning it a chip channel if needed.
    pub fn patch(&mut self, voice: usize, patch: &[u8; 12]) {
        if voice >= MAX_LOGICAL_VOICES {
            return;
        }
        let Some(oplc) = self.assign_voice(voice) else { return };
        self.patches[oplc] = Some(*patch);
        let ope = PORT_BASES[oplc];

        self.write_byte(AM_VIB + ope, patch[0]);
        self.write_byte(KSL_LEVEL + ope, patch[2]);
        self.write_byte(ATTACK_DECAY + ope, patch[4]);
        self.write_byte(SUSTAIN_RELEASE + ope, patch[6]);
        self.write_byte(WAVE_SELECT + ope, patch[8] & 7);
        self.write_byte(AM_VIB + 3 + ope, patch[1]);
        self.write_byte(KSL_LEVEL + 3 + ope, patch[3]);
        self.write_byte(ATTACK_DECAY + 3 + ope, patch[5]);
        self.write_byte(SUSTAIN_RELEASE + 3 + ope, patch[7]);
        self.write_byte(WAVE_SELECT + 3 + ope, patch[9] & 7);

        let fb = self.feedback_byte(voice, patch);
        self.write_byte(FEEDBACK_CONNECTION + oplc as u8, fb);
    }

    /// Reset the chip and forget every channel assignment.
    pub fn reset(&mut self) {
        self.chip.reset();
        let detected = self.detect();
        debug!(detected, "OPL reset");

        self.voice_to_opl.fill(None);
        self.opl_to_voice = [None; OPL_CHANNELS];
        self.patches = [None; OPL_CHANNELS];
        self.keyon = [0; OPL_CHANNELS];

        self.write_byte(TEST_REGISTER, ENABLE_WAVE_SELECT);
        self.active = false;
    }

    /// Timer-based presence check, run through the same port protocol a
    /// real card would see.
    pub fn detect(&mut self) -> bool {
        self.write_byte(TIMER_CONTROL_REGISTER, TIMER1_MASK | TIMER2_MASK);
        self.write_byte(TIMER_CONTROL_REGISTER, IRQ_RESET);
        let st1 = self.detect_status;
        self.write_byte(TIMER1_REGISTER, 255);
        self.write_byte(TIMER_CONTROL_REGISTER, TIMER2_MASK | TIMER1_START);
        let st2 = self.detect_status;
        self.write_byte(TIMER_CONTROL_REGISTER, TIMER1_MASK | TIMER2_MASK);
        self.write_byte(TIMER_CONTROL_REGISTER, IRQ_RESET);
        (st2 & 0xE0) == 0xC0 && (st1 & 0xE0) == 0
    }

    /// Render `frames` mono chip samples and add them to both sides of an
    /// interleaved stereo accumulator.
    pub fn mix_to(&mut self, target: &mut [i32], frames: usize) {
        if !self.active {
            return;
        }
        let frames = frames.min(target.len() / 2);
        self.scratch.clear();
        self.scratch.resize(frames, 0);
        self.chip.update(&mut self.scratch);
        for (frame, &sample) in target.chunks_exact_mut(2).zip(self.scratch.iter()) {
            let value = sample as i32 * OPL_VOLUME;
            frame[0] += value;
            frame[1] += value;
        }
    }
}
