//! Volume column and effect column interpretation
//!
//! `process_effects` runs once per tick after the sequencer has loaded the
//! row into each channel. On the row's start tick it triggers notes and
//! instruments (honouring note delay), then both columns are applied. Most
//! effects keep a per-channel memory so a zero parameter repeats the last
//! non-zero one.

use std::sync::Arc;

use nether_tracker::{
    Effect, MAX_CHANNELS, MAX_INSTRUMENTS, MAX_SAMPLES, NewNoteAction, SampleFlags, TrackerNote, VolumeEffect,
};

use super::notes::FADEOUT_FULL;
use super::{PROCESS_NEXT_ORDER, Song};
use crate::MAX_VOICES;
use crate::tables::{
    FINE_LINEAR_SLIDE_DOWN_TABLE, FINE_LINEAR_SLIDE_UP_TABLE, LINEAR_SLIDE_DOWN_TABLE, LINEAR_SLIDE_UP_TABLE,
    RETRIG_TABLE_1, RETRIG_TABLE_2, VC_PORTAMENTO, frequency_from_note, muldiv, muldivr, note_from_frequency,
    waveform,
};
use crate::voice::{TickCommand, Voice, VoiceFlags};

/// Waveform selector value for random modulation
pub(super) const WAVE_RANDOM: u8 = 3;

/// Amiga period clock used for non-linear slides
const AMIGA_CLOCK: i64 = 1712 * 8363;

/// Slide `frequency` by `slide` units: 1/64 semitone with linear slides,
/// Amiga period steps otherwise. Positive slides raise the pitch.
///
/// A linear slide always moves the frequency by at least 1 Hz. An Amiga
/// slide past the top of the period range returns 0 (the note stops)
/// unless it belongs to a tone portamento, which pins it instead.
pub fn do_freq_slide(linear: bool, frequency: i32, slide: i32, tone_porta: bool) -> i32 {
    if frequency == 0 {
        return 0;
    }
    let f = frequency as i64;
    if linear {
        let n = (slide.unsigned_abs() as usize).min(255 * 4);
        if slide > 0 {
            let factor = if n < 16 { FINE_LINEAR_SLIDE_UP_TABLE[n] } else { LINEAR_SLIDE_UP_TABLE[n / 4] };
            let slid = muldivr(f, factor as i64, 65536);
            if slid == frequency { slid + 1 } else { slid }
        } else if slide < 0 {
            let factor = if n < 16 { FINE_LINEAR_SLIDE_DOWN_TABLE[n] } else { LINEAR_SLIDE_DOWN_TABLE[n / 4] };
            let slid = muldivr(f, factor as i64, 65536);
            if slid == frequency { slid - 1 } else { slid }
        } else {
            frequency
        }
    } else if slide < 0 {
        (AMIGA_CLOCK * f / (f * -(slide as i64) + AMIGA_CLOCK)) as i32
    } else if slide > 0 {
        let mut div = AMIGA_CLOCK - f * slide as i64;
        if div <= 0 {
            if !tone_porta {
                return 0;
            }
            div = 1;
        }
        (AMIGA_CLOCK * f / div).min(i32::MAX as i64) as i32
    } else {
        frequency
    }
}

// =============================================================================
// Channel-local effects
// =============================================================================

fn fine_portamento(chan: &mut Voice, first: bool, linear: bool, slide: i32) {
    if first && chan.frequency != 0 && slide != 0 {
        chan.frequency = do_freq_slide(linear, chan.frequency, slide, false);
    }
}

fn reg_portamento(chan: &mut Voice, first: bool, linear: bool, slide: i32) {
    if !first {
        chan.frequency = do_freq_slide(linear, chan.frequency, slide, false);
    }
}

/// Exx/Fxx: `EFx`/`FFx` fine, `EEx`/`FEx` extra fine, otherwise every
/// tick but the first. `sign` is 1 for up, -1 for down.
fn portamento(chan: &mut Voice, first: bool, linear: bool, param: u32, sign: i32) {
    let param = if param == 0 { chan.mem_pitchslide as u32 } else { param };
    let lo = (param & 0x0F) as i32;
    match param & 0xF0 {
        0xE0 => fine_portamento(chan, first, linear, sign * lo),
        0xF0 => fine_portamento(chan, first, linear, sign * lo * 4),
        _ => reg_portamento(chan, first, linear, sign * param as i32 * 4),
    }
}

/// Slide towards `portamento_target`, landing on it exactly
fn tone_portamento(chan: &mut Voice, first: bool, linear: bool, param: i32) {
    chan.flags.insert(VoiceFlags::PORTAMENTO);
    if chan.frequency == 0 || chan.portamento_target == 0 || first {
        return;
    }
    if param == 0 && chan.row_effect == Effect::TonePortaVol {
        if chan.frequency > 1 && linear {
            chan.frequency -= 1;
        }
        if chan.frequency < chan.portamento_target {
            chan.frequency = chan.portamento_target;
            chan.portamento_target = 0;
        }
    } else if param != 0 && chan.frequency < chan.portamento_target {
        chan.frequency = do_freq_slide(linear, chan.frequency, param * 4, true);
        if chan.frequency >= chan.portamento_target {
            chan.frequency = chan.portamento_target;
            chan.portamento_target = 0;
        }
    } else if param != 0 {
        chan.frequency = do_freq_slide(linear, chan.frequency, param * -4, true);
        if chan.frequency < chan.portamento_target {
            chan.frequency = chan.portamento_target;
            chan.portamento_target = 0;
        }
    }
}

/// Step the note by whole semitones every `speed` ticks
fn note_slide(chan: &mut Voice, first: bool, param: u32, sign: i32) {
    if first {
        if param & 0xF0 != 0 {
            chan.note_slide_speed = param >> 4;
        }
        if param & 0x0F != 0 {
            chan.note_slide_step = param & 0x0F;
        }
        chan.note_slide_counter = chan.note_slide_speed;
        return;
    }
    chan.note_slide_counter = chan.note_slide_counter.wrapping_sub(1);
    if chan.note_slide_counter == 0 {
        chan.note_slide_counter = chan.note_slide_speed;
        let note = sign * chan.note_slide_step as i32 + note_from_frequency(chan.frequency, chan.c5speed);
        chan.frequency = frequency_from_note(note, chan.c5speed);
    }
}

fn vibrato(chan: &mut Voice, param: u32) {
    if param & 0x0F != 0 {
        chan.vibrato_depth = (param & 0x0F) * 4;
    }
    if param & 0xF0 != 0 {
        chan.vibrato_speed = (param >> 4) & 0x0F;
    }
    chan.flags.insert(VoiceFlags::VIBRATO);
}

fn fine_vibrato(chan: &mut Voice, param: u32) {
    if param & 0x0F != 0 {
        chan.vibrato_depth = param & 0x0F;
    }
    if param & 0xF0 != 0 {
        chan.vibrato_speed = (param >> 4) & 0x0F;
    }
    chan.flags.insert(VoiceFlags::VIBRATO);
}

fn volume_up(chan: &mut Voice, param: u32) {
    chan.volume = (chan.volume + param as i32 * 4).min(256);
}

fn volume_down(chan: &mut Voice, param: u32) {
    chan.volume = (chan.volume - param as i32 * 4).max(0);
}

/// Dxy, tested in the order Dx0, D0x, DxF, DFx. `DF0` and `D0F` also
/// slide on the first tick.
fn volume_slide(chan: &mut Voice, first: bool, param: u32) {
    let param = if param != 0 {
        chan.mem_volslide = param as u8;
        param
    } else {
        chan.mem_volslide as u32
    };

    if param == param & 0xF0 {
        let x = param >> 4;
        if x == 0xF || !first {
            volume_up(chan, x);
        }
    } else if param == param & 0x0F {
        if param == 0xF || !first {
            volume_down(chan, param);
        }
    } else if param & 0x0F == 0x0F {
        if first {
            volume_up(chan, param >> 4);
        }
    } else if param & 0xF0 == 0xF0 && first {
        volume_down(chan, param & 0x0F);
    }
}

/// Pxy: `PxF`/`PFx` fine on the first tick, otherwise every later tick.
/// Low nibble moves right, high nibble left.
fn panning_slide(chan: &mut Voice, first: bool, param: u32) {
    let param = if param != 0 {
        chan.mem_panslide = param as u8;
        param
    } else {
        chan.mem_panslide as u32
    };

    let mut slide = 0i32;
    if param & 0x0F == 0x0F && param & 0xF0 != 0 {
        if first {
            slide = -(((param & 0xF0) >> 2) as i32);
        }
    } else if param & 0xF0 == 0xF0 && param & 0x0F != 0 {
        if first {
            slide = ((param & 0x0F) << 2) as i32;
        }
    } else if !first {
        slide = if param & 0x0F != 0 {
            ((param & 0x0F) << 2) as i32
        } else {
            -(((param & 0xF0) >> 2) as i32)
        };
    }

    if slide != 0 {
        chan.panning = (chan.panning + slide).clamp(0, 256);
        chan.channel_panning = 0;
    }
    chan.flags.remove(VoiceFlags::SURROUND);
    chan.panbrello_delta = 0;
}

/// Nxy on the channel volume (0..=64)
fn channel_volume_slide(chan: &mut Voice, first: bool, param: u32) {
    let param = if param != 0 {
        chan.mem_channel_volslide = param as u8;
        param
    } else {
        chan.mem_channel_volslide as u32
    };

    let mut slide = 0i32;
    if param & 0x0F == 0x0F && param & 0xF0 != 0 {
        if first {
            slide = (param >> 4) as i32;
        }
    } else if param & 0xF0 == 0xF0 && param & 0x0F != 0 {
        if first {
            slide = -((param & 0x0F) as i32);
        }
    } else if !first {
        slide = if param & 0x0F != 0 {
            -((param & 0x0F) as i32)
        } else {
            ((param & 0xF0) >> 4) as i32
        };
    }

    if slide != 0 {
        chan.global_volume = (chan.global_volume + slide).clamp(0, 64);
    }
}

fn panning_reset(chan: &mut Voice, panning: i32) {
    chan.flags.remove(VoiceFlags::SURROUND);
    chan.panbrello_delta = 0;
    chan.panning = panning;
    chan.channel_panning = 0;
    chan.pan_swing = 0;
    chan.flags.insert(VoiceFlags::FAST_VOLUME_RAMP);
}

// =============================================================================
// Song-level effects
// =============================================================================

impl Song {
    /// Apply both columns of the current row to every channel
    pub(crate) fn process_effects(&mut self, firsttick: bool) {
        let module = Arc::clone(&self.module);
        let instrument_mode = module.uses_instruments();
        let old_effects = module.uses_old_effects();
        let compat_gxx = module.uses_compat_gxx();
        let flag_first = self.first_tick();

        for nchan in 0..MAX_CHANNELS {
            let chan = &mut self.voices[nchan];
            chan.n_command = TickCommand::None;

            let mut instr = chan.row_instr as u32;
            let volcmd = chan.row_vol_effect;
            let vol = chan.row_vol_param as u32;
            let cmd = chan.row_effect;
            let mut param = chan.row_param as u32;
            let porta = cmd.is_tone_portamento() || volcmd == VolumeEffect::TonePortamento;
            let mut start_note = flag_first;

            chan.flags.remove(VoiceFlags::FAST_VOLUME_RAMP | VoiceFlags::NEW_NOTE);
            if instr != 0 && start_note {
                chan.new_instrument = instr as u8;
            }

            // An instrument whose keyboard has no sample for the note swallows
            // the whole cell, global effects included.
            if instrument_mode
                && instr > 0
                && (instr as usize) < MAX_INSTRUMENTS
                && let Some(ins) = module.instrument(instr as usize)
            {
                let note = if chan.row_note != TrackerNote::NOTE_NONE { chan.row_note } else { chan.new_note };
                if TrackerNote::is_note(note) && ins.sample_map[note as usize - 1] == 0 {
                    chan.new_note = note;
                    chan.row_instr = 0;
                    chan.row_vol_effect = VolumeEffect::None;
                    chan.row_effect = Effect::None;
                    continue;
                }
            }

            if cmd == Effect::Special {
                if param != 0 {
                    chan.mem_special = param as u8;
                } else {
                    param = chan.mem_special as u32;
                }
                if param >> 4 == 0xD {
                    // Note delay counts from the sequencer's first tick, not
                    // the (possibly delayed) row start.
                    if firsttick {
                        chan.cd_note_delay = if param & 0x0F != 0 { (param & 0x0F) as i32 } else { 1 };
                        continue;
                    }
                    chan.cd_note_delay -= 1;
                    if chan.cd_note_delay > 0 {
                        continue;
                    }
                    start_note = chan.cd_note_delay == 0;
                }
            }

            if start_note {
                self.trigger_row_note(nchan, &mut instr, porta);
            }

            if firsttick {
                let chan = &mut self.voices[nchan];
                let column_porta = cmd.is_tone_portamento();
                if column_porta {
                    let tp = if cmd != Effect::TonePortaVol { param as i32 } else { 0 };
                    if tp != 0 {
                        chan.mem_portanote = tp;
                    } else if !compat_gxx {
                        chan.mem_portanote = chan.mem_pitchslide as i32;
                    }
                    if !compat_gxx {
                        chan.mem_pitchslide = chan.mem_portanote as u8;
                    }
                }
                if volcmd == VolumeEffect::TonePortamento {
                    if vol != 0 {
                        chan.mem_portanote = VC_PORTAMENTO[(vol & 0x0F) as usize] as i32;
                    }
                    if !compat_gxx {
                        chan.mem_pitchslide = chan.mem_portanote as u8;
                    }
                }
                if vol != 0 && matches!(volcmd, VolumeEffect::PortaUp | VolumeEffect::PortaDown) {
                    chan.mem_pitchslide = (4 * vol) as u8;
                    if !column_porta && !compat_gxx {
                        chan.mem_portanote = chan.mem_pitchslide as i32;
                    }
                }
                if param != 0 && matches!(cmd, Effect::PortamentoUp | Effect::PortamentoDown) {
                    chan.mem_pitchslide = param as u8;
                    if !compat_gxx {
                        chan.mem_portanote = chan.mem_pitchslide as i32;
                    }
                }
            }

            self.handle_volume_effect(nchan, volcmd, vol, firsttick, start_note);
            self.handle_effect(nchan, cmd, param, firsttick, old_effects);
        }
    }

    /// Note, instrument and volume changes on a row's start tick. `instr`
    /// is cleared when the cell's instrument turns out to be unusable.
    fn trigger_row_note(&mut self, nchan: usize, instr: &mut u32, porta: bool) {
        let module = Arc::clone(&self.module);
        let instrument_mode = module.uses_instruments();
        let old_effects = module.uses_old_effects();
        let compat_gxx = module.uses_compat_gxx();

        let mut note = self.voices[nchan].row_note;
        if instrument_mode && (TrackerNote::is_note(note) || note == TrackerNote::NOTE_NONE) {
            let check = if *instr != 0 { *instr } else { self.voices[nchan].last_instrument as u32 };
            if check != 0 && (check as usize > MAX_INSTRUMENTS || module.instrument(check as usize).is_none()) {
                note = TrackerNote::NOTE_NONE;
                *instr = 0;
            }
        }

        if instrument_mode
            && *instr != 0
            && !TrackerNote::is_note(note)
            && ((porta && compat_gxx) || (!porta && old_effects))
        {
            self.env_reset(nchan, true);
            self.voices[nchan].fadeout_volume = FADEOUT_FULL;
        }

        if *instr != 0 && note == TrackerNote::NOTE_NONE {
            let idx = *instr as usize;
            let chan = &mut self.voices[nchan];
            if instrument_mode {
                if let Some(smp) = chan.ptr_sample.and_then(|s| module.sample(s)) {
                    chan.volume = smp.volume as i32;
                }
                if idx < MAX_INSTRUMENTS && (chan.ptr_instrument != Some(idx) || chan.current_sample_data.is_none()) {
                    note = chan.note;
                }
            } else if idx < MAX_SAMPLES {
                if let Some(smp) = module.sample(idx) {
                    chan.volume = smp.volume as i32;
                }
                if chan.ptr_sample != Some(idx) || chan.current_sample_data.is_none() {
                    note = chan.note;
                }
            }
        }

        if *instr as usize >= MAX_INSTRUMENTS {
            *instr = 0;
        }

        if TrackerNote::is_control(note) {
            if *instr != 0 {
                let smp = if instrument_mode {
                    module
                        .instrument(*instr as usize)
                        .and_then(|ins| ins.sample_map.get(self.voices[nchan].note as usize).copied())
                        .unwrap_or(0) as usize
                } else {
                    *instr as usize
                };
                if smp > 0
                    && smp < MAX_SAMPLES
                    && let Some(s) = module.sample(smp)
                {
                    self.voices[nchan].volume = s.volume as i32;
                }
            }
            if !old_effects {
                *instr = 0;
            }
        }

        if TrackerNote::is_control(note) || (note != TrackerNote::NOTE_NONE && !porta) {
            if self.voices[nchan].flags.contains(VoiceFlags::ADLIB) {
                self.opl.note_off(nchan);
                self.opl.touch(nchan, 0);
            }
            self.gm.key_off(nchan);
            self.gm.touch(nchan, 0);
        }

        let previous_new_note = self.voices[nchan].new_note;
        if TrackerNote::is_note(note) {
            self.voices[nchan].new_note = note;
            if !porta {
                self.check_nna(nchan, *instr, note, false);
            }
            let chan = &mut self.voices[nchan];
            if chan.channel_panning > 0 {
                chan.panning = (chan.channel_panning & 0x7FFF) as i32 - 1;
                if chan.channel_panning & 0x8000 != 0 {
                    chan.flags.insert(VoiceFlags::SURROUND);
                }
                chan.channel_panning = 0;
            }
        }

        if *instr != 0 {
            let previous_sample = self.voices[nchan].ptr_sample;
            self.instrument_change(nchan, *instr, porta, true);
            self.patch_drivers(nchan, *instr as usize);
            if TrackerNote::is_note(note) {
                let chan = &mut self.voices[nchan];
                chan.new_instrument = 0;
                if previous_sample != chan.ptr_sample {
                    chan.position = 0;
                }
            }
        }

        if note != TrackerNote::NOTE_NONE {
            let pending = self.voices[nchan].new_instrument as u32;
            if *instr == 0 && pending != 0 && TrackerNote::is_note(note) {
                if TrackerNote::is_note(previous_new_note) {
                    self.voices[nchan].new_note = previous_new_note;
                }
                self.instrument_change(nchan, pending, porta, false);
                self.voices[nchan].new_note = note;
                if instrument_mode && (pending as usize) < MAX_INSTRUMENTS {
                    self.patch_drivers(nchan, pending as usize);
                }
                self.voices[nchan].new_instrument = 0;
            }
            self.note_change(nchan, note, porta, false, *instr == 0);
        }
    }

    /// Load an FM patch and the MIDI program for instrument/sample `idx`
    fn patch_drivers(&mut self, nchan: usize, idx: usize) {
        let module = Arc::clone(&self.module);
        if let Some(smp) = module.sample(idx)
            && smp.flags.contains(SampleFlags::ADLIB)
        {
            self.opl.patch(nchan, &smp.adlib_bytes);
        }
        if self.instrument_mode()
            && let Some(ins) = module.instrument(idx)
        {
            self.gm.dpatch(nchan, ins.midi_program as u8, ins.midi_bank as u8, ins.midi_channel_mask);
        }
    }

    /// Volume column. Volume and panning apply on the note's start tick
    /// (so they follow a note delay); slides run on the other ticks.
    fn handle_volume_effect(&mut self, nchan: usize, volcmd: VolumeEffect, vol: u32, firsttick: bool, start_note: bool) {
        let first = self.first_tick() || firsttick;
        let flag_first = self.first_tick();
        let linear = self.module.uses_linear_slides();
        let chan = &mut self.voices[nchan];

        match volcmd {
            VolumeEffect::None => {}
            VolumeEffect::Volume => {
                if start_note {
                    chan.volume = (vol.min(64) << 2) as i32;
                    chan.flags.insert(VoiceFlags::FAST_VOLUME_RAMP);
                }
            }
            VolumeEffect::Panning => {
                if start_note {
                    panning_reset(chan, (vol.min(64) << 2) as i32);
                }
            }
            VolumeEffect::PortaUp => {
                if !start_note {
                    reg_portamento(chan, first, linear, chan.mem_pitchslide as i32 * 4);
                }
            }
            VolumeEffect::PortaDown => {
                if !start_note {
                    reg_portamento(chan, first, linear, -(chan.mem_pitchslide as i32 * 4));
                }
            }
            VolumeEffect::TonePortamento => {
                if !start_note {
                    let param = chan.mem_portanote;
                    tone_portamento(chan, first, linear, param);
                }
            }
            VolumeEffect::VolSlideUp | VolumeEffect::VolSlideDown => {
                if start_note {
                    if vol != 0 {
                        chan.mem_vc_volslide = vol as u8;
                    }
                } else if volcmd == VolumeEffect::VolSlideUp {
                    volume_up(chan, chan.mem_vc_volslide as u32);
                } else {
                    volume_down(chan, chan.mem_vc_volslide as u32);
                }
            }
            VolumeEffect::FineVolUp | VolumeEffect::FineVolDown => {
                if start_note {
                    let vol = if vol != 0 {
                        chan.mem_vc_volslide = vol as u8;
                        vol
                    } else {
                        chan.mem_vc_volslide as u32
                    };
                    if volcmd == VolumeEffect::FineVolUp {
                        volume_up(chan, vol);
                    } else {
                        volume_down(chan, vol);
                    }
                }
            }
            VolumeEffect::VibratoDepth => vibrato(chan, vol),
            // Sets the speed without starting a vibrato.
            VolumeEffect::VibratoSpeed => chan.vibrato_speed = vol,
            VolumeEffect::PanSlideLeft => panning_slide(chan, flag_first, vol),
            VolumeEffect::PanSlideRight => panning_slide(chan, flag_first, vol << 4),
        }
    }

    fn handle_effect(&mut self, nchan: usize, cmd: Effect, param: u32, firsttick: bool, old_effects: bool) {
        let first = self.first_tick() || firsttick;
        let flag_first = self.first_tick();
        let linear = self.module.uses_linear_slides();

        match cmd {
            Effect::None => {}
            Effect::Volume => {
                if flag_first {
                    let chan = &mut self.voices[nchan];
                    chan.volume = if param < 64 { param as i32 * 4 } else { 256 };
                    chan.flags.insert(VoiceFlags::FAST_VOLUME_RAMP);
                }
            }
            Effect::PortamentoUp | Effect::PortamentoDown => {
                let chan = &mut self.voices[nchan];
                let sign = if cmd == Effect::PortamentoUp { 1 } else { -1 };
                let mem = chan.mem_pitchslide as u32;
                portamento(chan, first, linear, mem, sign);
            }
            Effect::VolumeSlide => volume_slide(&mut self.voices[nchan], first, param),
            Effect::TonePortamento => {
                let chan = &mut self.voices[nchan];
                let mem = chan.mem_portanote;
                tone_portamento(chan, first, linear, mem);
            }
            Effect::TonePortaVol => {
                let chan = &mut self.voices[nchan];
                let mem = chan.mem_portanote;
                tone_portamento(chan, first, linear, mem);
                volume_slide(chan, first, param);
            }
            Effect::Vibrato => vibrato(&mut self.voices[nchan], param),
            Effect::VibratoVol => {
                let chan = &mut self.voices[nchan];
                volume_slide(chan, first, param);
                vibrato(chan, 0);
            }
            Effect::FineVibrato => fine_vibrato(&mut self.voices[nchan], param),
            Effect::Speed => {
                if flag_first && param != 0 {
                    self.tick_count = param;
                    self.current_speed = param;
                }
            }
            Effect::Tempo => self.fx_tempo(nchan, param, flag_first),
            Effect::Offset => {
                if !flag_first {
                    return;
                }
                let chan = &mut self.voices[nchan];
                if param != 0 {
                    chan.mem_offset = (chan.mem_offset & !0xFF00) | (param << 8);
                }
                let note = if chan.row_instr != 0 { chan.new_note } else { chan.row_note };
                if TrackerNote::is_note(note) {
                    let mut pos = chan.mem_offset;
                    if pos > chan.length {
                        pos = if old_effects { chan.length } else { 0 };
                    }
                    chan.set_position(pos);
                }
            }
            Effect::Arpeggio => {
                let chan = &mut self.voices[nchan];
                chan.n_command = TickCommand::Arpeggio;
                if flag_first && param != 0 {
                    chan.mem_arpeggio = param as u8;
                }
            }
            Effect::Retrig => {
                if param != 0 {
                    self.voices[nchan].mem_retrig = (param & 0xFF) as u8;
                }
                let mem = self.voices[nchan].mem_retrig as u32;
                self.fx_retrig(nchan, mem);
            }
            Effect::Tremor => {
                let chan = &mut self.voices[nchan];
                if flag_first {
                    let mut param = param;
                    if param == 0 {
                        param = chan.mem_tremor as u32;
                    } else if !old_effects {
                        if param & 0xF0 != 0 {
                            param -= 0x10;
                        }
                        if param & 0x0F != 0 {
                            param -= 0x01;
                        }
                    }
                    chan.mem_tremor = param as u8;
                    chan.cd_tremor |= 128;
                }
                // Bit 7 marks a running tremor, bit 6 the "off" phase.
                if chan.cd_tremor & 128 != 0 && chan.length != 0 {
                    if chan.cd_tremor == 128 {
                        chan.cd_tremor = (chan.mem_tremor as u32 >> 4) | 192;
                    } else if chan.cd_tremor == 192 {
                        chan.cd_tremor = (chan.mem_tremor as u32 & 0x0F) | 128;
                    } else {
                        chan.cd_tremor -= 1;
                    }
                }
                chan.n_command = TickCommand::Tremor;
            }
            Effect::GlobalVolume => {
                if firsttick && param <= 128 {
                    self.current_global_volume = param as i32;
                }
            }
            Effect::GlobalVolSlide => self.fx_global_volume_slide(nchan, param),
            Effect::Panning => {
                if flag_first {
                    panning_reset(&mut self.voices[nchan], param as i32);
                }
            }
            Effect::PanningSlide => panning_slide(&mut self.voices[nchan], first, param),
            Effect::Tremolo => self.fx_tremolo(nchan, first, param),
            Effect::Special => self.fx_special(nchan, param),
            Effect::KeyOff => {
                if self.current_speed as i64 - self.tick_count as i64 == param as i64 {
                    self.key_off(nchan);
                }
            }
            Effect::ChannelVolume => {
                if flag_first && param <= 64 {
                    let chan = &mut self.voices[nchan];
                    chan.global_volume = param as i32;
                    chan.flags.insert(VoiceFlags::FAST_VOLUME_RAMP);
                }
            }
            Effect::ChannelVolSlide => channel_volume_slide(&mut self.voices[nchan], first, param),
            Effect::Panbrello => self.fx_panbrello(nchan, param),
            Effect::SetEnvPosition => {
                if !flag_first {
                    return;
                }
                let pan_env_end = self.voice_instrument(nchan).and_then(|ins| {
                    let env = &ins.panning_envelope;
                    (!env.points.is_empty()).then(|| env.last_tick())
                });
                let chan = &mut self.voices[nchan];
                chan.vol_env_position = param as i32;
                chan.pan_env_position = param as i32;
                chan.pitch_env_position = param as i32;
                if let Some(end) = pan_env_end
                    && chan.flags.contains(VoiceFlags::PANNING_ENV)
                    && param as i32 > end
                {
                    chan.flags.remove(VoiceFlags::PANNING_ENV);
                }
            }
            Effect::PositionJump => {
                if !self.config.no_backward_jumps || self.process_order < param {
                    self.process_order = param.wrapping_sub(1);
                }
                self.process_row = PROCESS_NEXT_ORDER;
            }
            Effect::PatternBreak => {
                if !self.patloop {
                    self.break_row = param;
                    self.process_row = PROCESS_NEXT_ORDER;
                }
            }
            Effect::Midi => {
                if !flag_first {
                    return;
                }
                let module = Arc::clone(&self.module);
                let gv = self.current_global_volume as i64;
                let chan = &self.voices[nchan];
                let velocity = match chan.ptr_sample.and_then(|s| module.sample(s)) {
                    Some(smp) => muldiv(
                        chan.volume as i64 * gv * chan.global_volume as i64,
                        smp.global_volume as i64 * 2,
                        1 << 21,
                    ) as u32,
                    None => 0,
                };
                let note = chan.note as u32;
                let text = module.midi_config.macro_for_param(param as u8, chan.active_macro);
                self.process_midi_macro(nchan, text, param, note, velocity, 0);
            }
            Effect::NoteSlideUp => note_slide(&mut self.voices[nchan], first, param, 1),
            Effect::NoteSlideDown => note_slide(&mut self.voices[nchan], first, param, -1),
        }
    }

    /// Txx sets the tempo on the first tick; `T0x`/`T1x` slide it down or
    /// up on the later ticks, clamped to 32..=255.
    fn fx_tempo(&mut self, nchan: usize, param: u32, flag_first: bool) {
        let chan = &mut self.voices[nchan];
        if flag_first {
            let param = if param != 0 {
                chan.mem_tempo = param as u8;
                param
            } else {
                chan.mem_tempo as u32
            };
            if param >= 0x20 {
                self.current_tempo = param;
            }
            return;
        }
        let param = chan.mem_tempo as u32;
        match param >> 4 {
            0 => self.current_tempo = self.current_tempo.saturating_sub(param & 0x0F).max(32),
            1 => self.current_tempo = (self.current_tempo + (param & 0x0F)).min(255),
            _ => {}
        }
    }

    fn fx_global_volume_slide(&mut self, nchan: usize, param: u32) {
        let first = self.first_tick();
        let chan = &mut self.voices[nchan];
        let param = if param != 0 {
            chan.mem_global_volslide = param as u8;
            param
        } else {
            chan.mem_global_volslide as u32
        };

        let mut slide = 0i32;
        if param & 0x0F == 0x0F && param & 0xF0 != 0 {
            if first {
                slide = (param >> 4) as i32;
            }
        } else if param & 0xF0 == 0xF0 && param & 0x0F != 0 {
            if first {
                slide = -((param & 0x0F) as i32);
            }
        } else if !first {
            slide = if param & 0xF0 != 0 {
                ((param & 0xF0) >> 4) as i32
            } else {
                -((param & 0x0F) as i32)
            };
        }

        if slide != 0 {
            self.current_global_volume = (self.current_global_volume + slide).clamp(0, 128);
        }
    }

    fn fx_tremolo(&mut self, nchan: usize, first: bool, param: u32) {
        let old_effects = self.old_effects();
        let random = if self.voices[nchan].tremolo_type == WAVE_RANDOM { self.random_delta() } else { 0 };
        let chan = &mut self.voices[nchan];
        let pos = chan.tremolo_position & 0xFF;

        if param & 0x0F != 0 {
            chan.tremolo_depth = (param & 0x0F) << 2;
        }
        if param & 0xF0 != 0 {
            chan.tremolo_speed = (param >> 4) & 0x0F;
        }
        chan.flags.insert(VoiceFlags::TREMOLO);

        if first && old_effects {
            return;
        }

        let delta = match chan.tremolo_type {
            WAVE_RANDOM => random,
            kind => waveform(kind, pos as u8),
        };
        chan.tremolo_position = (pos + 4 * chan.tremolo_speed) & 0xFF;
        chan.tremolo_delta = (delta * chan.tremolo_depth as i32) >> 5;
    }

    fn fx_panbrello(&mut self, nchan: usize, param: u32) {
        let random = if self.voices[nchan].panbrello_type == WAVE_RANDOM { self.random_delta() } else { 0 };
        let chan = &mut self.voices[nchan];
        let pos = chan.panbrello_position & 0xFF;

        if param & 0x0F != 0 {
            chan.panbrello_depth = param & 0x0F;
        }
        if param & 0xF0 != 0 {
            chan.panbrello_speed = (param >> 4) & 0x0F;
        }

        let delta = match chan.panbrello_type {
            WAVE_RANDOM => random,
            kind => waveform(kind, pos as u8),
        };

        // A random panbrello holds each value for `speed` ticks.
        if chan.panbrello_type == WAVE_RANDOM {
            if chan.panbrello_position == 0 || chan.panbrello_position >= chan.panbrello_speed {
                chan.panbrello_position = 0;
            }
            chan.panbrello_position += 1;
        } else {
            chan.panbrello_position += chan.panbrello_speed;
        }
        chan.panbrello_delta = delta;
    }

    /// Qxy: retrigger every `y` ticks, scaling the volume by `x`. Only
    /// retriggers a sample that has started playing.
    fn fx_retrig(&mut self, nchan: usize, param: u32) {
        let first = self.first_tick();
        let chan = &mut self.voices[nchan];
        if first && chan.row_note != TrackerNote::NOTE_NONE {
            chan.cd_retrig = (param & 0x0F) as i32;
            return;
        }
        chan.cd_retrig -= 1;
        if chan.cd_retrig > 0 || chan.position_whole() == 0 {
            return;
        }

        chan.cd_retrig = (param & 0x0F) as i32;
        let x = (param >> 4) as usize & 0x0F;
        if x != 0 {
            let mut vol = chan.volume;
            if RETRIG_TABLE_1[x] != 0 {
                vol = (vol * RETRIG_TABLE_1[x] as i32) >> 4;
            } else {
                vol += (RETRIG_TABLE_2[x] as i32) << 2;
            }
            chan.volume = vol.clamp(0, 256);
            chan.flags.insert(VoiceFlags::FAST_VOLUME_RAMP);
        }

        let note = chan.new_note;
        let frequency = chan.frequency;
        if TrackerNote::is_note(note) && chan.length != 0 {
            self.check_nna(nchan, 0, note, true);
        }
        self.note_change(nchan, note, true, true, false);
        let chan = &mut self.voices[nchan];
        if frequency != 0 && chan.row_note == TrackerNote::NOTE_NONE {
            chan.frequency = frequency;
        }
        chan.position = 0;
    }

    /// SBx: `SB0` marks the loop start, `SBx` jumps back x times
    fn fx_pattern_loop(&mut self, nchan: usize, param: u32) {
        let row = self.row;
        let chan = &mut self.voices[nchan];
        if param == 0 {
            self.patloop = true;
            chan.patloop_row = row;
            return;
        }
        if chan.cd_patloop != 0 {
            chan.cd_patloop -= 1;
            if chan.cd_patloop == 0 {
                // Done; a later SB0 on the same row must not loop again.
                chan.patloop_row = row + 1;
                self.patloop = false;
                return;
            }
        } else {
            chan.cd_patloop = param;
        }
        self.process_row = chan.patloop_row.wrapping_sub(1);
    }

    /// Sxy sub-commands, dispatched on the high nibble
    fn fx_special(&mut self, nchan: usize, param: u32) {
        let first = self.first_tick();
        let command = param & 0xF0;
        let param = param & 0x0F;

        match command {
            0x10 => self.voices[nchan].flags.set(VoiceFlags::GLISSANDO, param != 0),
            0x30 => self.voices[nchan].vib_type = param as u8,
            0x40 => self.voices[nchan].tremolo_type = param as u8,
            0x50 => {
                let chan = &mut self.voices[nchan];
                chan.panbrello_type = if param < 4 { param as u8 } else { 0 };
                chan.panbrello_position = 0;
            }
            0x60 => {
                if first {
                    self.frame_delay += param;
                    self.tick_count += param;
                }
            }
            0x70 => {
                if first {
                    self.fx_envelope_control(nchan, param);
                }
            }
            0x80 => {
                if first {
                    panning_reset(&mut self.voices[nchan], ((param << 4) + 8) as i32);
                }
            }
            0x90 => {
                if param == 1 && first {
                    let chan = &mut self.voices[nchan];
                    chan.flags.insert(VoiceFlags::SURROUND);
                    chan.panbrello_delta = 0;
                    chan.panning = 128;
                    chan.channel_panning = 0;
                }
            }
            // Stored only; applied by the next offset.
            0xA0 => {
                if first {
                    let chan = &mut self.voices[nchan];
                    chan.mem_offset = (param << 16) | (chan.mem_offset & !0xF_0000);
                }
            }
            0xB0 => {
                if first {
                    self.fx_pattern_loop(nchan, param);
                }
            }
            0xC0 => {
                let chan = &mut self.voices[nchan];
                if first {
                    chan.cd_note_cut = if param != 0 { param as i32 } else { 1 };
                } else {
                    chan.cd_note_cut -= 1;
                    if chan.cd_note_cut == 0 {
                        self.note_cut(nchan, true);
                    }
                }
            }
            0xE0 => {
                if first && self.row_count == 0 {
                    self.row_count = param as i32 + 1;
                }
            }
            0xF0 => self.voices[nchan].active_macro = param as u8,
            _ => {}
        }
    }

    /// S7x: act on this channel's background voices or override its
    /// New Note Action and envelope switches
    fn fx_envelope_control(&mut self, nchan: usize, param: u32) {
        match param {
            0..=2 => {
                for i in MAX_CHANNELS..MAX_VOICES {
                    if self.voices[i].master_channel != nchan + 1 {
                        continue;
                    }
                    match param {
                        1 => self.key_off(i),
                        2 => self.voices[i].flags.insert(VoiceFlags::NOTEFADE),
                        _ => {
                            let bkp = &mut self.voices[i];
                            bkp.flags.insert(VoiceFlags::NOTEFADE);
                            bkp.fadeout_volume = 0;
                        }
                    }
                }
            }
            3 => self.voices[nchan].nna = NewNoteAction::Cut as u8,
            4 => self.voices[nchan].nna = NewNoteAction::Continue as u8,
            5 => self.voices[nchan].nna = NewNoteAction::NoteOff as u8,
            6 => self.voices[nchan].nna = NewNoteAction::NoteFade as u8,
            7 => self.voices[nchan].flags.remove(VoiceFlags::VOLUME_ENV),
            8 => self.voices[nchan].flags.insert(VoiceFlags::VOLUME_ENV),
            9 => self.voices[nchan].flags.remove(VoiceFlags::PANNING_ENV),
            10 => self.voices[nchan].flags.insert(VoiceFlags::PANNING_ENV),
            11 => self.voices[nchan].flags.remove(VoiceFlags::PITCH_ENV),
            12 => self.voices[nchan].flags.insert(VoiceFlags::PITCH_ENV),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MixerConfig;
    use nether_tracker::{SongFlags, TrackerModule, TrackerSample};

    fn song_with(flags: SongFlags) -> Song {
        let mut module = TrackerModule::default();
        module.flags = flags;
        module.samples.push(TrackerSample::from_pcm8(vec![40; 2000]).with_loop(0, 2000, false));
        Song::new(module, MixerConfig::default())
    }

    #[test]
    fn test_linear_slide_round_trip() {
        for &freq in &[1000, 8363, 22050, 44100] {
            // The last fine step down is slightly steeper than its inverse.
            for slide in [1, 7, 14, 16, 64, 255, 1020] {
                let up = do_freq_slide(true, freq, slide, false);
                let back = do_freq_slide(true, up, -slide, false);
                assert!((back - freq).abs() <= 1, "{freq} Hz slid by {slide} came back as {back}");
            }
        }
    }

    #[test]
    fn test_linear_slide_always_moves() {
        assert_eq!(do_freq_slide(true, 100, 1, false), 101);
        assert_eq!(do_freq_slide(true, 100, -1, false), 99);
        assert_eq!(do_freq_slide(true, 0, 64, false), 0, "a silent channel stays silent");
    }

    #[test]
    fn test_amiga_slide_limits() {
        assert_eq!(do_freq_slide(false, 8363, 2000, false), 0, "past the period range the note stops");
        assert_eq!(
            do_freq_slide(false, 8363, 2000, true),
            (AMIGA_CLOCK * 8363).min(i32::MAX as i64) as i32,
            "a tone portamento pins instead"
        );
        assert!(do_freq_slide(false, 8363, -4, false) < 8363);
    }

    #[test]
    fn test_tone_portamento_lands_exactly() {
        let mut chan = Voice::default();
        chan.frequency = 8363;
        chan.portamento_target = 16726;
        let mut ticks = 0;
        while chan.portamento_target != 0 {
            tone_portamento(&mut chan, false, true, 0x20);
            ticks += 1;
            assert!(chan.frequency <= 16726, "never overshoots");
            assert!(ticks < 1000);
        }
        assert_eq!(chan.frequency, 16726);
        assert!(chan.flags.contains(VoiceFlags::PORTAMENTO));

        chan.portamento_target = 8363;
        while chan.portamento_target != 0 {
            tone_portamento(&mut chan, false, true, 0x20);
        }
        assert_eq!(chan.frequency, 8363, "downwards too");
    }

    #[test]
    fn test_volume_slide_variants() {
        let mut chan = Voice::default();
        chan.volume = 128;
        volume_slide(&mut chan, true, 0x20);
        assert_eq!(chan.volume, 128, "D20 waits for the second tick");
        volume_slide(&mut chan, false, 0x00);
        assert_eq!(chan.volume, 136, "D00 repeats D20");

        volume_slide(&mut chan, true, 0x0F);
        assert_eq!(chan.volume, 76, "D0F also slides on the first tick");
        volume_slide(&mut chan, true, 0x3F);
        assert_eq!(chan.volume, 88);
        volume_slide(&mut chan, false, 0x3F);
        assert_eq!(chan.volume, 88, "fine slides only on the first tick");
        volume_slide(&mut chan, true, 0xF2);
        assert_eq!(chan.volume, 80);

        chan.volume = 250;
        volume_slide(&mut chan, false, 0x40);
        assert_eq!(chan.volume, 256, "clamped at full volume");
    }

    #[test]
    fn test_portamento_modes() {
        let mut chan = Voice::default();
        chan.frequency = 8363;
        portamento(&mut chan, true, true, 0x10, 1);
        assert_eq!(chan.frequency, 8363, "regular slides skip the first tick");
        portamento(&mut chan, false, true, 0x10, 1);
        let regular = chan.frequency;
        assert!(regular > 8363);

        chan.frequency = 8363;
        portamento(&mut chan, true, true, 0xF4, 1);
        let fine = chan.frequency;
        chan.frequency = 8363;
        portamento(&mut chan, true, true, 0xE4, 1);
        let extra_fine = chan.frequency;
        assert!(fine > extra_fine && extra_fine > 8363);
        assert_eq!(regular, do_freq_slide(true, 8363, 64, false));
        assert_eq!(fine, do_freq_slide(true, 8363, 16, false), "FF4 slides four units of four");
        assert_eq!(extra_fine, do_freq_slide(true, 8363, 4, false));
    }

    #[test]
    fn test_retrig_volume_tables() {
        let mut song = song_with(SongFlags::empty());
        // from volume 128: offsets for 1-5 and 9-D, multipliers for 6, 7, E, F
        let cases = [
            (0x1, 128, 124),
            (0x2, 128, 120),
            (0x3, 128, 112),
            (0x4, 128, 96),
            (0x5, 128, 64),
            (0x6, 128, 80),
            (0x7, 128, 64),
            (0x8, 128, 128),
            (0x9, 128, 132),
            (0xA, 128, 136),
            (0xB, 128, 144),
            (0xC, 128, 160),
            (0xD, 128, 192),
            (0xE, 128, 192),
            (0xF, 128, 256),
            (0x5, 40, 0),
            (0xD, 250, 256),
            (0xF, 200, 256),
        ];
        for (x, start, expected) in cases {
            let chan = &mut song.voices[0];
            chan.volume = start;
            chan.cd_retrig = 1;
            chan.set_position(10);
            chan.new_note = 61;
            song.fx_retrig(0, (x << 4) | 1);
            assert_eq!(song.voices[0].volume, expected, "Q{x:X}1 from {start}");
            assert_eq!(song.voices[0].position, 0, "the sample restarts");
        }
    }

    #[test]
    fn test_retrig_waits_for_playing_sample() {
        let mut song = song_with(SongFlags::empty());
        let chan = &mut song.voices[0];
        chan.volume = 200;
        chan.cd_retrig = 1;
        chan.position = 0;
        song.fx_retrig(0, 0x81);
        assert_eq!(song.voices[0].volume, 200);
    }

    #[test]
    fn test_square_tremolo() {
        let mut song = song_with(SongFlags::empty());
        song.voices[0].tremolo_type = 2;
        song.fx_tremolo(0, false, 0x48);
        assert_eq!(song.voices[0].tremolo_delta, (64 * 32) >> 5);
        assert_eq!(song.voices[0].tremolo_position, 16);
        song.voices[0].tremolo_position = 200;
        song.fx_tremolo(0, false, 0);
        assert_eq!(song.voices[0].tremolo_delta, 0, "square wave low half");
    }

    #[test]
    fn test_old_effects_tremolo_skips_first_tick() {
        let mut song = song_with(SongFlags::OLD_EFFECTS);
        song.fx_tremolo(0, true, 0x44);
        assert_eq!(song.voices[0].tremolo_position, 0);
        assert!(song.voices[0].flags.contains(VoiceFlags::TREMOLO));
    }

    #[test]
    fn test_global_volume_slide() {
        let mut song = song_with(SongFlags::empty());
        song.current_global_volume = 100;
        song.fx_global_volume_slide(0, 0x05);
        assert_eq!(song.global_volume(), 95);
        song.fx_global_volume_slide(0, 0x50);
        assert_eq!(song.global_volume(), 100);
        song.current_global_volume = 126;
        song.fx_global_volume_slide(0, 0xF0);
        assert_eq!(song.global_volume(), 128, "clamped");
    }

    #[test]
    fn test_pattern_loop_runs_twice() {
        let mut song = song_with(SongFlags::empty());
        song.row = 4;
        song.fx_pattern_loop(0, 0);
        assert!(song.patloop);
        song.row = 8;
        song.fx_pattern_loop(0, 2);
        assert_eq!(song.process_row, 3);
        song.fx_pattern_loop(0, 2);
        assert_eq!(song.process_row, 3);
        song.process_row = 8;
        song.fx_pattern_loop(0, 2);
        assert_eq!(song.process_row, 8, "third pass falls through");
        assert!(!song.patloop);
        assert_eq!(song.voices[0].patloop_row, 9);
    }

    #[test]
    fn test_tempo_slide_clamps() {
        let mut song = song_with(SongFlags::empty());
        song.voices[0].mem_tempo = 0x05;
        song.current_tempo = 34;
        song.fx_tempo(0, 0, false);
        assert_eq!(song.current_tempo(), 32);
        song.voices[0].mem_tempo = 0x1F;
        song.current_tempo = 250;
        song.fx_tempo(0, 0, false);
        assert_eq!(song.current_tempo(), 255);
        song.fx_tempo(0, 0x90, true);
        assert_eq!(song.current_tempo(), 0x90);
    }
}
