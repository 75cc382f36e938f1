//! YM3812 chip state and register interface.
//!
//! # Architecture
//!
//! ```text
//! write(port 0) ──► address latch
//! write(port 1) ──► write_register(address, value)
//!                        │
//!                        ├─ 0x20..0x95  per-operator (mul/ksl/tl/ar/dr/sl/rr)
//!                        ├─ 0xA0..0xB8  per-channel fnum/block/key-on
//!                        ├─ 0xBD        LFO depth + rhythm mode
//!                        ├─ 0xC0..0xC8  feedback/connection
//!                        └─ 0xE0..0xF5  waveform select
//!
//! update(buf) ──► per sample: advance LFO, calc 9 channels (or 6 + rhythm),
//!                  clamp to i16, advance envelope/phase/noise
//! ```
//!
//! Only the coefficients that depend on a written register are recomputed.

use crate::tables::{
    EG_INC, EG_RATE_SELECT, EG_RATE_SHIFT, EG_SH, ENV_BITS, ENV_QUIET, FREQ_MASK, FREQ_SH,
    KSL_SHIFT, KSL_TAB, LFO_AM_TAB_ELEMENTS, LFO_PM_TABLE, LFO_SH, MAX_ATT_INDEX, MIN_ATT_INDEX,
    MUL_TAB, RATE_STEPS, SIN_LEN, SL_TAB, SLOT_ARRAY, TABLES, Tables,
};

/// Number of melodic channels on an OPL2.
pub const OPL_CHANNELS: usize = 9;

const SLOT1: usize = 0;
const SLOT2: usize = 1;

/// Envelope generator phase of one operator.
///
/// Ordered so that "anything above `Release`" means the key is still held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum EnvelopePhase {
    #[default]
    Off = 0,
    Release = 1,
    Sustain = 2,
    Decay = 3,
    Attack = 4,
}

/// One FM operator.
#[derive(Debug, Clone, Default)]
struct Slot {
    /// Attack rate: AR<<2
    ar: u32,
    /// Decay rate: DR<<2
    dr: u32,
    /// Release rate: RR<<2
    rr: u32,
    /// Key scale rate shift (0 or 2)
    ksr_shift: u8,
    /// Key scale level shift
    ksl: u8,
    /// kcode >> ksr_shift
    ksr: u8,
    mul: u8,

    cnt: u32,
    incr: u32,
    /// Feedback shift (0 = none)
    fb: u8,
    op1_out: [i32; 2],
    /// Connection: 0 = FM, 1 = additive
    con: u8,

    /// Non-zero for sustained (non-percussive) envelopes
    eg_type: u8,
    state: EnvelopePhase,
    tl: u32,
    tll: i32,
    volume: i32,
    sl: u32,
    eg_sh_ar: u8,
    eg_sel_ar: u8,
    eg_sh_dr: u8,
    eg_sel_dr: u8,
    eg_sh_rr: u8,
    eg_sel_rr: u8,
    /// Key sources ORed: 1 = FM, 2 = rhythm, 4 = CSM
    key: u32,

    am_mask: u32,
    vib: bool,
    wavetable: u32,
}

impl Slot {
    fn key_on(&mut self, key_set: u32) {
        if self.key == 0 {
            self.cnt = 0;
            self.state = EnvelopePhase::Attack;
        }
        self.key |= key_set;
    }

    fn key_off(&mut self, key_clr: u32) {
        if self.key != 0 {
            self.key &= key_clr;
            if self.key == 0 && self.state > EnvelopePhase::Release {
                self.state = EnvelopePhase::Release;
            }
        }
    }

    #[inline]
    fn volume_calc(&self, lfo_am: u32) -> u32 {
        (self.tll as u32)
            .wrapping_add(self.volume as u32)
            .wrapping_add(lfo_am & self.am_mask)
    }

    fn update_attack_rate(&mut self) {
        let rate = (self.ar + self.ksr as u32) as usize;
        if rate < 16 + 62 {
            self.eg_sh_ar = EG_RATE_SHIFT[rate];
            self.eg_sel_ar = EG_RATE_SELECT[rate];
        } else {
            self.eg_sh_ar = 0;
            self.eg_sel_ar = 13 * RATE_STEPS;
        }
    }

    fn update_decay_rate(&mut self) {
        let rate = (self.dr + self.ksr as u32) as usize;
        self.eg_sh_dr = EG_RATE_SHIFT[rate];
        self.eg_sel_dr = EG_RATE_SELECT[rate];
    }

    fn update_release_rate(&mut self) {
        let rate = (self.rr + self.ksr as u32) as usize;
        self.eg_sh_rr = EG_RATE_SHIFT[rate];
        self.eg_sel_rr = EG_RATE_SELECT[rate];
    }
}

#[derive(Debug, Clone, Default)]
struct Channel {
    slots: [Slot; 2],
    block_fnum: u32,
    /// Frequency increment base
    fc: u32,
    ksl_base: u32,
    kcode: u8,
}

impl Channel {
    /// Refresh the phase increment of one operator and, if the key scale
    /// changed, its envelope rates.
    fn calc_fcslot(&mut self, slot: usize) {
        let fc = self.fc;
        let kcode = self.kcode;
        let op = &mut self.slots[slot];
        op.incr = fc.wrapping_mul(op.mul as u32);
        let ksr = kcode >> op.ksr_shift;
        if op.ksr != ksr {
            op.ksr = ksr;
            op.update_attack_rate();
            op.update_decay_rate();
            op.update_release_rate();
        }
    }
}

/// A single emulated YM3812.
#[derive(Debug, Clone)]
pub struct Opl {
    channels: [Channel; OPL_CHANNELS],

    eg_cnt: u32,
    eg_timer: u32,
    eg_timer_add: u32,
    eg_timer_overflow: u32,

    rhythm: u8,
    fn_tab: Box<[u32; 1024]>,

    lfo_am: u32,
    lfo_pm: i32,
    lfo_am_depth: u8,
    lfo_pm_depth_range: u8,
    lfo_am_cnt: u32,
    lfo_am_inc: u32,
    lfo_pm_cnt: u32,
    lfo_pm_inc: u32,

    /// 23-bit noise shift register
    noise_rng: u32,
    noise_p: u32,
    noise_f: u32,

    wavesel: u8,
    timers: [u32; 2],
    timer_enable: [u8; 2],

    address: u8,
    status: u8,
    status_mask: u8,
    /// Register 0x08: CSM, note select
    mode: u8,

    clock: u32,
    rate: u32,

    phase_modulation: i32,
    output: i32,
}

impl Opl {
    /// Create a chip running at `clock` Hz, rendering at `rate` Hz, already reset.
    pub fn new(clock: u32, rate: u32) -> Self {
        let mut opl = Self {
            channels: Default::default(),
            eg_cnt: 0,
            eg_timer: 0,
            eg_timer_add: 0,
            eg_timer_overflow: 0,
            rhythm: 0,
            fn_tab: Box::new([0; 1024]),
            lfo_am: 0,
            lfo_pm: 0,
            lfo_am_depth: 0,
            lfo_pm_depth_range: 0,
            lfo_am_cnt: 0,
            lfo_am_inc: 0,
            lfo_pm_cnt: 0,
            lfo_pm_inc: 0,
            noise_rng: 0,
            noise_p: 0,
            noise_f: 0,
            wavesel: 0,
            timers: [0; 2],
            timer_enable: [0; 2],
            address: 0,
            status: 0,
            status_mask: 0,
            mode: 0,
            clock,
            rate,
            phase_modulation: 0,
            output: 0,
        };
        opl.initialize();
        opl.reset();
        opl
    }

    pub fn clock(&self) -> u32 {
        self.clock
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    fn initialize(&mut self) {
        let freqbase = if self.rate != 0 {
            (self.clock as f64 / 72.0) / self.rate as f64
        } else {
            0.0
        };

        for (i, entry) in self.fn_tab.iter_mut().enumerate() {
            // Chip counts in 10.10, we count in 16.16
            *entry = (i as f64 * 64.0 * freqbase * (1u32 << (FREQ_SH - 10)) as f64) as u32;
        }

        // One tremolo step lasts 64 samples, one vibrato step 1024
        self.lfo_am_inc = ((1.0 / 64.0) * (1u32 << LFO_SH) as f64 * freqbase) as u32;
        self.lfo_pm_inc = ((1.0 / 1024.0) * (1u32 << LFO_SH) as f64 * freqbase) as u32;
        self.noise_f = ((1u32 << FREQ_SH) as f64 * freqbase) as u32;
        self.eg_timer_add = ((1u32 << EG_SH) as f64 * freqbase) as u32;
        self.eg_timer_overflow = 1 << EG_SH;
    }

    /// Reset every register and operator to power-on state.
    pub fn reset(&mut self) {
        self.eg_timer = 0;
        self.eg_cnt = 0;
        self.noise_rng = 1;
        self.mode = 0;
        self.status_reset(0x7f);

        self.write_register(0x01, 0);
        self.write_register(0x02, 0);
        self.write_register(0x03, 0);
        self.write_register(0x04, 0);
        for reg in (0x20..=0xffu8).rev() {
            self.write_register(reg, 0);
        }

        for channel in &mut self.channels {
            for slot in &mut channel.slots {
                slot.wavetable = 0;
                slot.state = EnvelopePhase::Off;
                slot.volume = MAX_ATT_INDEX;
            }
        }
    }

    /// Port write: even ports latch the address, odd ports write data.
    /// Returns the IRQ line state.
    pub fn write(&mut self, port: u8, value: u8) -> bool {
        if port & 1 == 0 {
            self.address = value;
        } else {
            self.write_register(self.address, value);
        }
        self.status >> 7 != 0
    }

    /// Port read: even ports return status, odd ports return open bus.
    pub fn read(&self, port: u8) -> u8 {
        let value = if port & 1 == 0 {
            self.status & (self.status_mask | 0x80)
        } else {
            0xff
        };
        // YM3812 always reports bits 1 and 2 high
        value | 0x06
    }

    /// Signal timer `c` (0 = A, 1 = B) overflow. Returns the IRQ line state.
    pub fn timer_over(&mut self, c: usize) -> bool {
        if c != 0 {
            self.status_set(0x20);
        } else {
            self.status_set(0x40);
            if self.mode & 0x80 != 0 {
                // CSM: key every channel on and off again
                for channel in &mut self.channels {
                    channel.slots[SLOT1].key_on(4);
                    channel.slots[SLOT2].key_on(4);
                    channel.slots[SLOT1].key_off(!4);
                    channel.slots[SLOT2].key_off(!4);
                }
            }
        }
        self.status >> 7 != 0
    }

    /// Timer period in chip cycles for timer `c`, if running.
    pub fn timer_period(&self, c: usize) -> Option<u32> {
        (self.timer_enable[c & 1] != 0).then_some(self.timers[c & 1] * 72)
    }

    /// Envelope phase of `operator` (0 = modulator, 1 = carrier) on `channel`.
    pub fn envelope_phase(&self, channel: usize, operator: usize) -> EnvelopePhase {
        self.channels
            .get(channel)
            .map(|ch| ch.slots[operator & 1].state)
            .unwrap_or_default()
    }

    /// Current attenuation of an operator (0 = loudest, 511 = silent).
    pub fn envelope_level(&self, channel: usize, operator: usize) -> i32 {
        self.channels
            .get(channel)
            .map(|ch| ch.slots[operator & 1].volume)
            .unwrap_or(MAX_ATT_INDEX)
    }

    fn status_set(&mut self, flag: u8) {
        self.status |= flag;
        if self.status & 0x80 == 0 && self.status & self.status_mask != 0 {
            self.status |= 0x80;
        }
    }

    fn status_reset(&mut self, flag: u8) {
        self.status &= !flag;
        if self.status & 0x80 != 0 && self.status & self.status_mask == 0 {
            self.status &= 0x7f;
        }
    }

    fn status_mask_set(&mut self, flag: u8) {
        self.status_mask = flag;
        self.status_set(0);
        self.status_reset(0);
    }

    fn slot_for(reg: u8) -> Option<(usize, usize)> {
        let slot = SLOT_ARRAY[(reg & 0x1f) as usize];
        (slot >= 0).then(|| (slot as usize / 2, slot as usize & 1))
    }

    /// Write `value` to chip register `reg`.
    pub fn write_register(&mut self, reg: u8, value: u8) {
        let v = value as u32;
        match reg & 0xe0 {
            0x00 => match reg & 0x1f {
                0x01 => {
                    // Waveform select enable; the selected waveform is kept
                    self.wavesel = value & 0x20;
                }
                0x02 => self.timers[0] = (256 - v) * 4,
                0x03 => self.timers[1] = (256 - v) * 16,
                0x04 => {
                    if value & 0x80 != 0 {
                        self.status_reset(0x7f - 0x08);
                    } else {
                        self.status_reset(value & (0x78 - 0x08));
                        self.status_mask_set(!value & 0x78);
                        self.timer_enable[1] = (value >> 1) & 1;
                        self.timer_enable[0] = value & 1;
                    }
                }
                0x08 => self.mode = value,
                _ => {}
            },
            0x20 => {
                let Some((ch, s)) = Self::slot_for(reg) else { return };
                let slot = &mut self.channels[ch].slots[s];
                slot.mul = MUL_TAB[(v & 0x0f) as usize];
                slot.ksr_shift = if v & 0x10 != 0 { 0 } else { 2 };
                slot.eg_type = value & 0x20;
                slot.vib = v & 0x40 != 0;
                slot.am_mask = if v & 0x80 != 0 { !0 } else { 0 };
                self.channels[ch].calc_fcslot(s);
            }
            0x40 => {
                let Some((ch, s)) = Self::slot_for(reg) else { return };
                let ksl_base = self.channels[ch].ksl_base;
                let slot = &mut self.channels[ch].slots[s];
                slot.ksl = KSL_SHIFT[(v >> 6) as usize];
                slot.tl = (v & 0x3f) << (ENV_BITS - 1 - 7);
                slot.tll = (slot.tl + (ksl_base >> slot.ksl)) as i32;
            }
            0x60 => {
                let Some((ch, s)) = Self::slot_for(reg) else { return };
                let slot = &mut self.channels[ch].slots[s];
                slot.ar = if v >> 4 != 0 { 16 + ((v >> 4) << 2) } else { 0 };
                slot.update_attack_rate();
                slot.dr = if v & 0x0f != 0 { 16 + ((v & 0x0f) << 2) } else { 0 };
                slot.update_decay_rate();
            }
            0x80 => {
                let Some((ch, s)) = Self::slot_for(reg) else { return };
                let slot = &mut self.channels[ch].slots[s];
                slot.sl = SL_TAB[(v >> 4) as usize];
                slot.rr = if v & 0x0f != 0 { 16 + ((v & 0x0f) << 2) } else { 0 };
                slot.update_release_rate();
            }
            0xa0 => {
                if reg == 0xbd {
                    self.write_rhythm(value);
                    return;
                }
                let index = (reg & 0x0f) as usize;
                if index >= OPL_CHANNELS {
                    return;
                }
                let mode = self.mode;
                let ch = &mut self.channels[index];
                let block_fnum = if reg & 0x10 == 0 {
                    (ch.block_fnum & 0x1f00) | v
                } else {
                    if v & 0x20 != 0 {
                        ch.slots[SLOT1].key_on(1);
                        ch.slots[SLOT2].key_on(1);
                    } else {
                        ch.slots[SLOT1].key_off(!1);
                        ch.slots[SLOT2].key_off(!1);
                    }
                    ((v & 0x1f) << 8) | (ch.block_fnum & 0xff)
                };

                if ch.block_fnum != block_fnum {
                    let block = block_fnum >> 10;
                    ch.block_fnum = block_fnum;
                    ch.ksl_base = KSL_TAB[(block_fnum >> 6) as usize];
                    ch.fc = self.fn_tab[(block_fnum & 0x03ff) as usize] >> (7 - block);

                    // Block bits become kcode bits 3..1; bit 0 depends on note select
                    ch.kcode = ((ch.block_fnum & 0x1c00) >> 9) as u8;
                    if mode & 0x40 != 0 {
                        ch.kcode |= ((ch.block_fnum & 0x100) >> 8) as u8;
                    } else {
                        ch.kcode |= ((ch.block_fnum & 0x200) >> 9) as u8;
                    }

                    let ksl_base = ch.ksl_base;
                    for slot in &mut ch.slots {
                        slot.tll = (slot.tl + (ksl_base >> slot.ksl)) as i32;
                    }
                    ch.calc_fcslot(SLOT1);
                    ch.calc_fcslot(SLOT2);
                }
            }
            0xc0 => {
                let index = (reg & 0x0f) as usize;
                if index >= OPL_CHANNELS {
                    return;
                }
                let slot = &mut self.channels[index].slots[SLOT1];
                let fb = (v >> 1) & 7;
                slot.fb = if fb != 0 { (fb + 7) as u8 } else { 0 };
                slot.con = value & 1;
            }
            0xe0 => {
                if self.wavesel != 0 {
                    let Some((ch, s)) = Self::slot_for(reg) else { return };
                    self.channels[ch].slots[s].wavetable = (v & 0x03) * SIN_LEN as u32;
                }
            }
            _ => {}
        }
    }

    fn write_rhythm(&mut self, value: u8) {
        self.lfo_am_depth = value & 0x80;
        self.lfo_pm_depth_range = if value & 0x40 != 0 { 8 } else { 0 };
        self.rhythm = value & 0x3f;

        let [.., ch6, ch7, ch8] = &mut self.channels;
        if self.rhythm & 0x20 != 0 {
            let toggle = |slot: &mut Slot, on: bool| {
                if on {
                    slot.key_on(2);
                } else {
                    slot.key_off(!2);
                }
            };
            // Bass drum uses both operators of channel 6
            toggle(&mut ch6.slots[SLOT1], value & 0x10 != 0);
            toggle(&mut ch6.slots[SLOT2], value & 0x10 != 0);
            toggle(&mut ch7.slots[SLOT1], value & 0x01 != 0); // hi-hat
            toggle(&mut ch7.slots[SLOT2], value & 0x08 != 0); // snare
            toggle(&mut ch8.slots[SLOT1], value & 0x04 != 0); // tom
            toggle(&mut ch8.slots[SLOT2], value & 0x02 != 0); // cymbal
        } else {
            for ch in [ch6, ch7, ch8] {
                ch.slots[SLOT1].key_off(!2);
                ch.slots[SLOT2].key_off(!2);
            }
        }
    }

    fn advance_lfo(&mut self, tables: &Tables) {
        self.lfo_am_cnt = self.lfo_am_cnt.wrapping_add(self.lfo_am_inc);
        if self.lfo_am_cnt >= LFO_AM_TAB_ELEMENTS << LFO_SH {
            self.lfo_am_cnt -= LFO_AM_TAB_ELEMENTS << LFO_SH;
        }
        let tmp = tables.lfo_am[(self.lfo_am_cnt >> LFO_SH) as usize] as u32;
        self.lfo_am = if self.lfo_am_depth != 0 { tmp } else { tmp >> 2 };

        self.lfo_pm_cnt = self.lfo_pm_cnt.wrapping_add(self.lfo_pm_inc);
        self.lfo_pm = (((self.lfo_pm_cnt >> LFO_SH) & 7) | self.lfo_pm_depth_range as u32) as i32;
    }

    fn advance(&mut self) {
        self.eg_timer = self.eg_timer.wrapping_add(self.eg_timer_add);
        while self.eg_timer >= self.eg_timer_overflow {
            self.eg_timer -= self.eg_timer_overflow;
            self.eg_cnt = self.eg_cnt.wrapping_add(1);
            let eg_cnt = self.eg_cnt;
            for op in self.channels.iter_mut().flat_map(|ch| ch.slots.iter_mut()) {
                let step = |shift: u8, select: u8| -> Option<i32> {
                    if eg_cnt & ((1u32 << shift) - 1) == 0 {
                        Some(EG_INC[select as usize + ((eg_cnt >> shift) & 7) as usize] as i32)
                    } else {
                        None
                    }
                };
                match op.state {
                    EnvelopePhase::Attack => {
                        if let Some(inc) = step(op.eg_sh_ar, op.eg_sel_ar) {
                            op.volume += (!op.volume * inc) >> 3;
                            if op.volume <= MIN_ATT_INDEX {
                                op.volume = MIN_ATT_INDEX;
                                op.state = EnvelopePhase::Decay;
                            }
                        }
                    }
                    EnvelopePhase::Decay => {
                        if let Some(inc) = step(op.eg_sh_dr, op.eg_sel_dr) {
                            op.volume += inc;
                            if op.volume as u32 >= op.sl {
                                op.state = EnvelopePhase::Sustain;
                            }
                        }
                    }
                    EnvelopePhase::Sustain => {
                        // Percussive envelopes keep releasing while sustained
                        if op.eg_type == 0 {
                            if let Some(inc) = step(op.eg_sh_rr, op.eg_sel_rr) {
                                op.volume = (op.volume + inc).min(MAX_ATT_INDEX);
                            }
                        }
                    }
                    EnvelopePhase::Release => {
                        if let Some(inc) = step(op.eg_sh_rr, op.eg_sel_rr) {
                            op.volume += inc;
                            if op.volume >= MAX_ATT_INDEX {
                                op.volume = MAX_ATT_INDEX;
                                op.state = EnvelopePhase::Off;
                            }
                        }
                    }
                    EnvelopePhase::Off => {}
                }
            }
        }

        let lfo_pm = self.lfo_pm;
        for ch in &mut self.channels {
            let block_fnum = ch.block_fnum;
            for op in &mut ch.slots {
                let offset = if op.vib {
                    let fnum_lfo = ((block_fnum & 0x0380) >> 7) as i32;
                    LFO_PM_TABLE[(lfo_pm + 16 * fnum_lfo) as usize] as i32
                } else {
                    0
                };
                if offset != 0 {
                    let bf = (block_fnum as i32 + offset) as u32;
                    let block = (bf & 0x1c00) >> 10;
                    let inc = (self.fn_tab[(bf & 0x03ff) as usize] >> (7 - block)) * op.mul as u32;
                    op.cnt = op.cnt.wrapping_add(inc);
                } else {
                    op.cnt = op.cnt.wrapping_add(op.incr);
                }
            }
        }

        // 23-bit LFSR, taps 0/14/15/22, output on bit 0
        self.noise_p = self.noise_p.wrapping_add(self.noise_f);
        let mut shifts = self.noise_p >> FREQ_SH;
        self.noise_p &= FREQ_MASK;
        while shifts > 0 {
            if self.noise_rng & 1 != 0 {
                self.noise_rng ^= 0x800302;
            }
            self.noise_rng >>= 1;
            shifts -= 1;
        }
    }

    fn calc_channel(&mut self, tables: &Tables, index: usize) {
        self.phase_modulation = 0;
        let lfo_am = self.lfo_am;

        let slot = &mut self.channels[index].slots[SLOT1];
        let env = slot.volume_calc(lfo_am);
        let mut out = slot.op1_out[0] + slot.op1_out[1];
        slot.op1_out[0] = slot.op1_out[1];
        let carried = slot.op1_out[0];
        slot.op1_out[1] = 0;
        if env < ENV_QUIET {
            if slot.fb == 0 {
                out = 0;
            }
            slot.op1_out[1] = tables.op_calc1(slot.cnt, env, out << slot.fb, slot.wavetable);
        }
        if slot.con != 0 {
            self.output += carried;
        } else {
            self.phase_modulation += carried;
        }

        let slot = &self.channels[index].slots[SLOT2];
        let env = slot.volume_calc(lfo_am);
        if env < ENV_QUIET {
            self.output += tables.op_calc(slot.cnt, env, self.phase_modulation, slot.wavetable);
        }
    }

    fn calc_rhythm(&mut self, tables: &Tables, noise: bool) {
        let lfo_am = self.lfo_am;

        // Bass drum: connection 1 ignores operator 1; output doubled
        self.phase_modulation = 0;
        let slot = &mut self.channels[6].slots[SLOT1];
        let env = slot.volume_calc(lfo_am);
        let mut out = slot.op1_out[0] + slot.op1_out[1];
        slot.op1_out[0] = slot.op1_out[1];
        if slot.con == 0 {
            self.phase_modulation = slot.op1_out[0];
        }
        slot.op1_out[1] = 0;
        if env < ENV_QUIET {
            if slot.fb == 0 {
                out = 0;
            }
            slot.op1_out[1] = tables.op_calc1(slot.cnt, env, out << slot.fb, slot.wavetable);
        }
        let slot = &self.channels[6].slots[SLOT2];
        let env = slot.volume_calc(lfo_am);
        if env < ENV_QUIET {
            self.output += tables.op_calc(slot.cnt, env, self.phase_modulation, slot.wavetable) * 2;
        }

        let s71 = &self.channels[7].slots[SLOT1];
        let s72 = &self.channels[7].slots[SLOT2];
        let s81 = &self.channels[8].slots[SLOT1];
        let s82 = &self.channels[8].slots[SLOT2];
        let bit = |cnt: u32, n: u32| ((cnt >> FREQ_SH) >> n) & 1;

        // Hi-hat and cymbal share a phase derived from ch7 op1 and ch8 op2
        let res1 = (bit(s71.cnt, 2) ^ bit(s71.cnt, 7)) | bit(s71.cnt, 3);
        let res2 = bit(s82.cnt, 3) ^ bit(s82.cnt, 5);

        let env = s71.volume_calc(lfo_am);
        if env < ENV_QUIET {
            let mut phase: u32 = if res1 != 0 { 0x200 | (0xd0 >> 2) } else { 0xd0 };
            if res2 != 0 {
                phase = 0x200 | (0xd0 >> 2);
            }
            if phase & 0x200 != 0 {
                if noise {
                    phase = 0x200 | 0xd0;
                }
            } else if noise {
                phase = 0xd0 >> 2;
            }
            self.output += tables.op_calc(phase << FREQ_SH, env, 0, s71.wavetable) * 2;
        }

        // Snare: ch7 op1 bit 8 with noise XOR
        let env = s72.volume_calc(lfo_am);
        if env < ENV_QUIET {
            let mut phase: u32 = if bit(s71.cnt, 8) != 0 { 0x200 } else { 0x100 };
            if noise {
                phase ^= 0x100;
            }
            self.output += tables.op_calc(phase << FREQ_SH, env, 0, s72.wavetable) * 2;
        }

        // Tom
        let env = s81.volume_calc(lfo_am);
        if env < ENV_QUIET {
            self.output += tables.op_calc(s81.cnt, env, 0, s81.wavetable) * 2;
        }

        // Top cymbal
        let env = s82.volume_calc(lfo_am);
        if env < ENV_QUIET {
            let phase: u32 = if res1 != 0 || res2 != 0 { 0x300 } else { 0x100 };
            self.output += tables.op_calc(phase << FREQ_SH, env, 0, s82.wavetable) * 2;
        }
    }

    /// Render `buffer.len()` mono samples.
    pub fn update(&mut self, buffer: &mut [i16]) {
        let tables: &'static Tables = &TABLES;
        let rhythm = self.rhythm & 0x20 != 0;
        for sample in buffer.iter_mut() {
            self.output = 0;
            self.advance_lfo(tables);

            for index in 0..6 {
                self.calc_channel(tables, index);
            }
            if rhythm {
                self.calc_rhythm(tables, self.noise_rng & 1 != 0);
            } else {
                for index in 6..OPL_CHANNELS {
                    self.calc_channel(tables, index);
                }
            }

            *sample = self.output.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            self.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOCK: u32 = 49716 * 72;

    fn chip() -> Opl {
        Opl::new(CLOCK, 49716)
    }

    fn program_fast_voice(opl: &mut Opl) {
        // Channel 0: operators at register offsets 0 and 3
        for op in [0x00u8, 0x03] {
            opl.write_register(0x20 + op, 0x21); // sustain, mul 1
            opl.write_register(0x40 + op, 0x00); // loudest
            opl.write_register(0x60 + op, 0xF4); // fast attack, moderate decay
            opl.write_register(0x80 + op, 0x2F); // sustain level 2, fast release
        }
        opl.write_register(0xC0, 0x01);
        opl.write_register(0xA0, 0x44);
    }

    #[test]
    fn test_reset_silences_all_operators() {
        let opl = chip();
        for ch in 0..OPL_CHANNELS {
            for op in 0..2 {
                assert_eq!(opl.envelope_phase(ch, op), EnvelopePhase::Off);
                assert_eq!(opl.envelope_level(ch, op), MAX_ATT_INDEX);
            }
        }
        let mut opl = opl;
        let mut buf = [1i16; 64];
        opl.update(&mut buf);
        assert!(buf.iter().all(|&s| s == 0), "reset chip renders silence");
    }

    #[test]
    fn test_envelope_walks_every_phase_in_order() {
        let mut opl = chip();
        program_fast_voice(&mut opl);
        opl.write_register(0xB0, 0x20 | 0x10); // key on, block 4

        let mut seen = vec![opl.envelope_phase(0, 1)];
        let mut buf = [0i16; 1];
        for _ in 0..20_000 {
            opl.update(&mut buf);
            let phase = opl.envelope_phase(0, 1);
            if seen.last() != Some(&phase) {
                seen.push(phase);
            }
            if phase == EnvelopePhase::Sustain {
                break;
            }
        }
        opl.write_register(0xB0, 0x10); // key off
        for _ in 0..20_000 {
            opl.update(&mut buf);
            let phase = opl.envelope_phase(0, 1);
            if seen.last() != Some(&phase) {
                seen.push(phase);
            }
            if phase == EnvelopePhase::Off {
                break;
            }
        }

        assert_eq!(
            seen,
            vec![
                EnvelopePhase::Attack,
                EnvelopePhase::Decay,
                EnvelopePhase::Sustain,
                EnvelopePhase::Release,
                EnvelopePhase::Off
            ],
            "operator must step through every envelope phase"
        );
    }

    #[test]
    fn test_keyed_voice_produces_sound() {
        let mut opl = chip();
        program_fast_voice(&mut opl);
        opl.write_register(0xB0, 0x30);
        let mut buf = [0i16; 2048];
        opl.update(&mut buf);
        assert!(buf.iter().any(|&s| s != 0), "a keyed voice is audible");
    }

    #[test]
    fn test_invalid_registers_are_ignored() {
        let mut opl = chip();
        let before = opl.envelope_level(0, 0);
        opl.write_register(0x26, 0xFF); // hole in the slot map
        opl.write_register(0xA9, 0xFF); // channel 9 does not exist
        opl.write_register(0xC9, 0xFF);
        assert_eq!(opl.envelope_level(0, 0), before);
    }

    #[test]
    fn test_waveform_select_requires_enable() {
        let mut opl = chip();
        opl.write_register(0xE0, 0x02);
        assert_eq!(opl.channels[0].slots[0].wavetable, 0, "ignored while disabled");
        opl.write_register(0x01, 0x20);
        opl.write_register(0xE0, 0x02);
        assert_eq!(opl.channels[0].slots[0].wavetable, 2 * SIN_LEN as u32);
    }

    #[test]
    fn test_port_protocol_latches_address() {
        let mut opl = chip();
        opl.write(0, 0xC0);
        opl.write(1, 0x0F);
        assert_eq!(opl.channels[0].slots[0].fb, 14, "feedback 7 maps to shift 14");
        assert_eq!(opl.channels[0].slots[0].con, 1);
    }

    #[test]
    fn test_timer_status_flags() {
        let mut opl = chip();
        opl.write_register(0x04, 0x80); // clear
        opl.write_register(0x02, 0xFF);
        opl.write_register(0x04, 0x21); // mask timer 2, start timer 1
        opl.timer_over(0);
        assert_eq!(opl.read(0) & 0xE0, 0xC0, "timer 1 flag raises IRQ");
        opl.write_register(0x04, 0x80);
        assert_eq!(opl.read(0) & 0xE0, 0x00, "IRQ reset clears flags");
    }

    #[test]
    fn test_rhythm_mode_keys_drum_operators() {
        let mut opl = chip();
        opl.write_register(0xBD, 0x20 | 0x10 | 0x01);
        assert_eq!(opl.envelope_phase(6, 0), EnvelopePhase::Attack, "bass drum op 1");
        assert_eq!(opl.envelope_phase(6, 1), EnvelopePhase::Attack, "bass drum op 2");
        assert_eq!(opl.envelope_phase(7, 0), EnvelopePhase::Attack, "hi-hat");
        assert_eq!(opl.envelope_phase(7, 1), EnvelopePhase::Off, "snare not keyed");
        opl.write_register(0xBD, 0x00);
        assert_eq!(opl.envelope_phase(6, 0), EnvelopePhase::Release);
    }
}
