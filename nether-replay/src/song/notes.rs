//! Note triggering: instrument and note changes, key-off, note cut
//!
//! A row's note and instrument column arrive here from the effects pass.
//! `instrument_change` binds the sample an instrument maps the note to and
//! decides whether envelopes restart; `note_change` computes the pitch and
//! (re)starts the sample unless a portamento is sliding to it.

use std::sync::Arc;

use nether_tracker::{MAX_INSTRUMENTS, MAX_SAMPLES, TrackerNote};

use super::Song;
use crate::tables::frequency_from_note;
use crate::voice::VoiceFlags;

/// Fadeout value of a note that has not started fading
pub(crate) const FADEOUT_FULL: i32 = 65536;

impl Song {
    /// Stop the note on `nchan` immediately. `clear_note` also forgets
    /// the pitch so a following portamento cannot pick it up.
    pub(crate) fn note_cut(&mut self, nchan: usize, clear_note: bool) {
        let chan = &mut self.voices[nchan];
        chan.flags.insert(VoiceFlags::FAST_VOLUME_RAMP);
        chan.length = 0;
        chan.increment = 0;
        if clear_note {
            chan.frequency = 0;
        }
        if chan.flags.contains(VoiceFlags::ADLIB) {
            self.opl.note_off(nchan);
            self.opl.touch(nchan, 0);
        }
        self.gm.key_off(nchan);
        self.gm.touch(nchan, 0);
    }

    /// Release the note on `nchan`: leave the sustain loop and start the
    /// fadeout where the instrument asks for it.
    pub(crate) fn key_off(&mut self, nchan: usize) {
        let module = Arc::clone(&self.module);
        let instrument_mode = module.uses_instruments();

        if self.voices[nchan].flags.contains(VoiceFlags::ADLIB) {
            self.opl.note_off(nchan);
        }
        self.gm.key_off(nchan);

        let chan = &mut self.voices[nchan];
        chan.flags.insert(VoiceFlags::KEYOFF);
        let penv = chan.ptr_instrument.and_then(|i| module.instrument(i));
        if instrument_mode && penv.is_some() && !chan.flags.contains(VoiceFlags::VOLUME_ENV) {
            chan.flags.insert(VoiceFlags::NOTEFADE);
        }
        if chan.length == 0 {
            return;
        }

        if chan.flags.contains(VoiceFlags::SUSTAIN_LOOP)
            && let Some(smp) = chan.ptr_sample.and_then(|s| module.sample(s))
        {
            let sample_flags = VoiceFlags::from_sample(smp.flags);
            if sample_flags.contains(VoiceFlags::LOOP) {
                if sample_flags.contains(VoiceFlags::PINGPONG_LOOP) {
                    chan.flags.insert(VoiceFlags::PINGPONG_LOOP);
                } else {
                    chan.flags.remove(VoiceFlags::PINGPONG_LOOP | VoiceFlags::PINGPONG_FLAG);
                }
                chan.flags.insert(VoiceFlags::LOOP);
                chan.length = smp.length;
                chan.loop_start = smp.loop_start;
                chan.loop_end = smp.loop_end;
                chan.length = chan.length.min(chan.loop_end);
                if chan.position_whole() >= chan.length as i64 {
                    let whole = chan.position_whole() - chan.length as i64 + chan.loop_start as i64;
                    chan.position = (whole << 32) | (chan.position & 0xFFFF_FFFF);
                }
            } else {
                chan.flags
                    .remove(VoiceFlags::LOOP | VoiceFlags::PINGPONG_LOOP | VoiceFlags::PINGPONG_FLAG);
                chan.length = smp.length;
            }
        }

        if instrument_mode
            && let Some(env) = penv
            && env.fadeout > 0
            && env.volume_envelope.has_loop()
        {
            chan.flags.insert(VoiceFlags::NOTEFADE);
        }
    }

    /// Rewind envelopes for a new note. Without `always`, envelopes with
    /// carry enabled keep their position.
    pub(crate) fn env_reset(&mut self, nchan: usize, always: bool) {
        let module = Arc::clone(&self.module);
        let chan = &mut self.voices[nchan];
        if let Some(env) = chan.ptr_instrument.and_then(|i| module.instrument(i)) {
            chan.flags.insert(VoiceFlags::FAST_VOLUME_RAMP);
            if always || !env.volume_envelope.is_carry() {
                chan.vol_env_position = 0;
            }
            if always || !env.panning_envelope.is_carry() {
                chan.pan_env_position = 0;
            }
            if always || !env.pitch_envelope.is_carry() {
                chan.pitch_env_position = 0;
            }
        }
        chan.fadeout_volume = FADEOUT_FULL;
    }

    /// Save the channel panning and apply an instrument or sample default
    pub(crate) fn set_instrument_panning(&mut self, nchan: usize, panning: i32) {
        let chan = &mut self.voices[nchan];
        chan.channel_panning = (chan.panning + 1) as u16;
        if chan.flags.contains(VoiceFlags::SURROUND) {
            chan.channel_panning |= 0x8000;
        }
        chan.panning = panning;
        chan.flags.remove(VoiceFlags::SURROUND);
    }

    /// Sample number a keyboard note plays on instrument `instr`, or
    /// `default` when the map is empty or out of range.
    pub(crate) fn translate_keyboard(&self, instr: usize, note: u8, default: Option<usize>) -> Option<usize> {
        let Some(env) = self.module.instrument(instr) else {
            return default;
        };
        let Some(&n) = (note as usize).checked_sub(1).and_then(|i| env.sample_map.get(i)) else {
            return default;
        };
        let n = n as usize;
        if n > 0 && n < MAX_SAMPLES && self.module.sample(n).is_some() {
            Some(n)
        } else {
            default
        }
    }

    /// Apply an instrument number to `nchan` for the pending `new_note`.
    pub(crate) fn instrument_change(&mut self, nchan: usize, instr: u32, porta: bool, inst_column: bool) {
        let instr = instr as usize;
        if instr >= MAX_INSTRUMENTS {
            return;
        }
        let module = Arc::clone(&self.module);
        let instrument_mode = module.uses_instruments();
        let compat_gxx = module.uses_compat_gxx();
        let old_effects = module.uses_old_effects();

        let penv_idx = if instrument_mode && module.instrument(instr).is_some() {
            Some(instr)
        } else {
            None
        };
        let penv = penv_idx.and_then(|i| module.instrument(i));
        let mut psmp = module.sample(instr).map(|_| instr);
        let oldsmp = self.voices[nchan].ptr_sample;
        let old_instrument_volume = self.voices[nchan].instrument_volume;
        let note = self.voices[nchan].new_note;

        if note == TrackerNote::NOTE_NONE {
            return;
        }

        if let Some(env) = penv
            && TrackerNote::is_note(note)
        {
            if env.sample_map[note as usize - 1] == 0 {
                self.voices[nchan].ptr_instrument = penv_idx;
                return;
            }
            if env.note_map[note as usize - 1] > TrackerNote::NOTE_LAST {
                return;
            }
            psmp = self.translate_keyboard(instr, note, None);
        } else if instrument_mode {
            if !TrackerNote::is_control(note) {
                return;
            }
            if penv.is_none() {
                let chan = &mut self.voices[nchan];
                chan.ptr_instrument = None;
                chan.new_instrument = 0;
                return;
            }
            psmp = None;
        }

        let chan = &mut self.voices[nchan];
        let smp = psmp.and_then(|s| module.sample(s));
        if inst_column && let Some(s) = smp {
            chan.volume = s.volume as i32;
        }

        let mut inst_changed = false;
        if penv_idx != chan.ptr_instrument || chan.current_sample_data.is_none() {
            inst_changed = true;
            chan.ptr_instrument = penv_idx;
        }
        chan.new_instrument = 0;

        if let Some(s) = smp {
            chan.instrument_volume = match penv {
                Some(env) => (s.global_volume as i32 * env.global_volume as i32) >> 7,
                None => s.global_volume as i32,
            };
        }

        // Compatible Gxx keeps the sliding sample
        if chan.ptr_sample.is_some() && psmp != chan.ptr_sample && porta && chan.increment != 0 && compat_gxx {
            psmp = chan.ptr_sample;
        }

        // Multisample instrument number without a note: keep the old sample
        if penv.is_some()
            && !inst_changed
            && psmp != oldsmp
            && chan.ptr_sample.is_some()
            && !TrackerNote::is_note(chan.row_note)
        {
            return;
        }

        if penv.is_none() && psmp != oldsmp && porta {
            chan.flags.insert(VoiceFlags::NEW_NOTE);
        }

        if let Some(env) = penv {
            let reset = chan.length == 0
                || (inst_column && porta && compat_gxx)
                || (inst_column
                    && !porta
                    && chan.flags.intersects(VoiceFlags::NOTEFADE | VoiceFlags::KEYOFF)
                    && old_effects);
            if reset {
                let always = inst_changed || chan.flags.contains(VoiceFlags::KEYOFF);
                self.env_reset(nchan, always);
            } else if !env.volume_envelope.is_enabled() {
                self.voices[nchan].vol_env_position = 0;
            }

            if !porta {
                let (vol_swing, pan_swing) = (env.vol_swing, env.pan_swing);
                let instrument_volume = self.voices[nchan].instrument_volume;
                let mut vs = 0;
                let mut ps = 0;
                if vol_swing > 0 {
                    let d = self.random_unit();
                    vs = (d * vol_swing as f64 / 100.0 * instrument_volume as f64).floor() as i32;
                }
                if pan_swing > 0 {
                    let d = self.random_unit();
                    ps = (d * pan_swing as f64 * 4.0) as i32;
                }
                let chan = &mut self.voices[nchan];
                chan.vol_swing = vs;
                chan.pan_swing = ps;
            }
        }

        let chan = &mut self.voices[nchan];
        let Some(smp) = psmp.and_then(|s| module.sample(s)) else {
            chan.ptr_sample = None;
            chan.instrument_volume = 0;
            return;
        };

        let was_key_off = chan.flags.contains(VoiceFlags::KEYOFF);

        if psmp == chan.ptr_sample && chan.current_sample_data.is_some() && chan.length > 0 {
            if porta && inst_changed && penv.is_some() {
                chan.flags.remove(VoiceFlags::KEYOFF | VoiceFlags::NOTEFADE);
            }
            return;
        }

        if porta && chan.length == 0 {
            chan.increment = 0;
        }

        chan.flags.remove(
            VoiceFlags::SAMPLE_FLAGS
                | VoiceFlags::KEYOFF
                | VoiceFlags::NOTEFADE
                | VoiceFlags::VOLUME_ENV
                | VoiceFlags::PANNING_ENV
                | VoiceFlags::PITCH_ENV,
        );
        if let Some(env) = penv {
            chan.flags.set(VoiceFlags::VOLUME_ENV, env.volume_envelope.is_enabled());
            chan.flags.set(VoiceFlags::PANNING_ENV, env.panning_envelope.is_enabled());
            chan.flags.set(VoiceFlags::PITCH_ENV, env.pitch_envelope.is_enabled());
            if env.filter_cutoff & 0x80 != 0 {
                chan.cutoff = (env.filter_cutoff & 0x7F) as u32;
            }
            if env.filter_resonance & 0x80 != 0 {
                chan.resonance = (env.filter_resonance & 0x7F) as u32;
            }
        }

        if chan.row_note == TrackerNote::NOTE_OFF && old_effects && psmp != oldsmp {
            if let Some(old) = oldsmp.and_then(|s| module.sample(s)) {
                chan.flags.insert(VoiceFlags::from_sample(old.flags));
            }
            if VoiceFlags::from_sample(smp.flags).contains(VoiceFlags::PANNING) {
                chan.panning = smp.panning as i32;
            }
            chan.instrument_volume = old_instrument_volume;
            chan.volume = smp.volume as i32;
            chan.position = 0;
            return;
        }

        chan.autovib_depth = 0;
        chan.autovib_position = 0;

        // No new notes after a note-off or fade
        if chan.flags.intersects(VoiceFlags::KEYOFF | VoiceFlags::NOTEFADE) && inst_column {
            chan.frequency = 0;
        }
        chan.flags.insert(VoiceFlags::from_sample(smp.flags));

        chan.ptr_sample = psmp;
        chan.length = smp.length;
        chan.loop_start = smp.loop_start;
        chan.loop_end = smp.loop_end;
        chan.c5speed = smp.c5_speed;
        chan.current_sample_data = smp.has_data().then(|| smp.data.clone());
        chan.position = 0;

        if chan.flags.contains(VoiceFlags::SUSTAIN_LOOP) && (!porta || (penv.is_some() && !was_key_off)) {
            chan.loop_start = smp.sustain_start;
            chan.loop_end = smp.sustain_end;
            chan.flags.insert(VoiceFlags::LOOP);
            if chan.flags.contains(VoiceFlags::PINGPONG_SUSTAIN) {
                chan.flags.insert(VoiceFlags::PINGPONG_LOOP);
            }
        }
        if chan.flags.contains(VoiceFlags::LOOP) && chan.loop_end < chan.length {
            chan.length = chan.loop_end;
        }
    }

    /// Start `note` on `nchan`, or slide to it when `porta` is set.
    /// `have_inst` keeps the current sample when sliding with an
    /// instrument number present.
    pub(crate) fn note_change(&mut self, nchan: usize, note: u8, porta: bool, retrig: bool, have_inst: bool) {
        if note == TrackerNote::NOTE_NONE {
            return;
        }
        let module = Arc::clone(&self.module);
        let instrument_mode = module.uses_instruments();
        let truenote = note;
        let mut note = note;
        let mut porta = porta;

        let mut pins = self.voices[nchan].ptr_sample;
        let penv_idx = if instrument_mode { self.voices[nchan].ptr_instrument } else { None };
        let penv = penv_idx.and_then(|i| module.instrument(i));

        if let (Some(env), Some(idx)) = (penv, penv_idx)
            && TrackerNote::is_note(note)
        {
            if env.sample_map[note as usize - 1] == 0 {
                return;
            }
            if !(have_inst && porta && pins.is_some()) {
                pins = self.translate_keyboard(idx, note, pins);
            }
            note = env.note_map[note as usize - 1];
        }

        if TrackerNote::is_control(note) {
            let chan = &mut self.voices[nchan];
            chan.note = TrackerNote::NOTE_OFF;
            chan.new_note = TrackerNote::NOTE_OFF;
            match note {
                TrackerNote::NOTE_OFF => {
                    self.key_off(nchan);
                    let chan = &mut self.voices[nchan];
                    if !porta && module.uses_old_effects() && chan.row_instr != 0 {
                        chan.flags.remove(VoiceFlags::NOTEFADE | VoiceFlags::KEYOFF);
                    }
                }
                TrackerNote::NOTE_CUT => self.note_cut(nchan, true),
                // Fade, and anything unknown, fades in instrument mode
                _ => {
                    if instrument_mode {
                        chan.flags.insert(VoiceFlags::NOTEFADE);
                    }
                }
            }
            return;
        }

        let Some(smp) = pins.and_then(|s| module.sample(s)) else {
            return;
        };

        let chan = &mut self.voices[nchan];
        if !porta {
            chan.c5speed = smp.c5_speed;
        }
        if porta && chan.increment == 0 {
            porta = false;
        }

        let note = note.clamp(TrackerNote::NOTE_FIRST, TrackerNote::NOTE_LAST);
        chan.note = truenote.clamp(TrackerNote::NOTE_FIRST, TrackerNote::NOTE_LAST);
        chan.new_instrument = 0;
        let frequency = frequency_from_note(note as i32, chan.c5speed);
        chan.panbrello_delta = 0;

        if frequency != 0 {
            if porta && chan.frequency != 0 {
                chan.portamento_target = frequency;
            } else {
                chan.portamento_target = 0;
                chan.frequency = frequency;
            }
            if !porta || chan.length == 0 {
                chan.ptr_sample = pins;
                chan.current_sample_data = smp.has_data().then(|| smp.data.clone());
                chan.length = smp.length;
                chan.loop_end = smp.length;
                chan.loop_start = 0;
                chan.flags.remove(VoiceFlags::SAMPLE_FLAGS);
                chan.flags.insert(VoiceFlags::from_sample(smp.flags));
                if chan.flags.contains(VoiceFlags::SUSTAIN_LOOP) {
                    chan.loop_start = smp.sustain_start;
                    chan.loop_end = smp.sustain_end;
                    chan.flags.remove(VoiceFlags::PINGPONG_LOOP);
                    chan.flags.insert(VoiceFlags::LOOP);
                    if chan.flags.contains(VoiceFlags::PINGPONG_SUSTAIN) {
                        chan.flags.insert(VoiceFlags::PINGPONG_LOOP);
                    }
                    chan.length = chan.length.min(chan.loop_end);
                } else if chan.flags.contains(VoiceFlags::LOOP) {
                    chan.loop_start = smp.loop_start;
                    chan.loop_end = smp.loop_end;
                    chan.length = chan.length.min(chan.loop_end);
                }
                chan.position = 0;
            }
            if chan.position_whole() >= chan.length as i64 {
                chan.set_position(chan.loop_start);
            }
        } else {
            porta = false;
        }

        if let Some(pan) = penv.and_then(|env| env.default_pan) {
            self.set_instrument_panning(nchan, pan as i32);
        } else if VoiceFlags::from_sample(smp.flags).contains(VoiceFlags::PANNING) {
            self.set_instrument_panning(nchan, smp.panning as i32);
        }

        let chan = &mut self.voices[nchan];
        if let Some(env) = penv
            && env.pitch_pan_separation != 0
        {
            if chan.channel_panning == 0 {
                chan.channel_panning = (chan.panning + 1) as u16;
            }
            // Separation is in 1/512ths per semitone away from the centre
            let delta = (chan.note as i32 - env.pitch_pan_center as i32 - TrackerNote::NOTE_FIRST as i32)
                * env.pitch_pan_separation as i32
                / 2;
            chan.panning = (chan.panning + delta).clamp(0, 256);
        }

        if !porta {
            if let Some(env) = penv {
                chan.nna = env.nna as u8;
            }
            self.env_reset(nchan, false);
        }

        let chan = &mut self.voices[nchan];
        if porta && module.uses_compat_gxx() && chan.row_instr != 0 {
            chan.flags.remove(VoiceFlags::KEYOFF);
        }

        if !porta {
            chan.vu_meter = 0;
            chan.strike = 4;
            chan.flags.remove(VoiceFlags::FILTER);
            chan.flags.insert(VoiceFlags::FAST_VOLUME_RAMP | VoiceFlags::NEW_NOTE);
            if !retrig {
                chan.autovib_depth = 0;
                chan.autovib_position = 0;
                chan.vibrato_position = 0;
            }
            chan.left_volume = 0;
            chan.right_volume = 0;
            match penv {
                Some(env) => {
                    if env.filter_resonance & 0x80 != 0 {
                        chan.resonance = (env.filter_resonance & 0x7F) as u32;
                    }
                    if env.filter_cutoff & 0x80 != 0 {
                        chan.cutoff = (env.filter_cutoff & 0x7F) as u32;
                    }
                }
                None => {
                    chan.vol_swing = 0;
                    chan.pan_swing = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MixerConfig;
    use nether_tracker::{SongFlags, TrackerInstrument, TrackerModule, TrackerSample};

    fn sample_module() -> TrackerModule {
        let mut module = TrackerModule::default();
        module.samples.push(TrackerSample::from_pcm8(vec![10; 1000]).with_loop(100, 800, false));
        module.samples.push(TrackerSample::from_pcm8(vec![20; 500]).with_sustain_loop(50, 200, true));
        module
    }

    #[test]
    fn test_note_change_binds_sample_and_loop() {
        let mut song = Song::new(sample_module(), MixerConfig::default());
        song.voices[0].new_note = 61;
        song.instrument_change(0, 1, false, true);
        song.note_change(0, 61, false, false, true);
        let v = &song.voices[0];
        assert_eq!(v.ptr_sample, Some(1));
        assert_eq!(v.frequency, 8363, "C-5 plays at the sample rate");
        assert_eq!(v.length, 800, "looping sample ends at the loop end");
        assert!(v.flags.contains(VoiceFlags::LOOP | VoiceFlags::NEW_NOTE));
        assert_eq!(v.fadeout_volume, FADEOUT_FULL);
    }

    #[test]
    fn test_sustain_loop_released_by_key_off() {
        let mut song = Song::new(sample_module(), MixerConfig::default());
        song.voices[0].new_note = 61;
        song.instrument_change(0, 2, false, true);
        song.note_change(0, 61, false, false, true);
        assert_eq!(song.voices[0].loop_end, 200);
        assert!(song.voices[0].flags.contains(VoiceFlags::PINGPONG_LOOP));

        song.voices[0].set_position(150);
        song.key_off(0);
        let v = &song.voices[0];
        assert!(v.flags.contains(VoiceFlags::KEYOFF));
        assert!(!v.flags.contains(VoiceFlags::LOOP), "sample has no normal loop");
        assert_eq!(v.length, 500, "plays through to the sample end");
    }

    #[test]
    fn test_note_cut_clears_frequency() {
        let mut song = Song::new(sample_module(), MixerConfig::default());
        song.voices[0].new_note = 61;
        song.instrument_change(0, 1, false, true);
        song.note_change(0, 61, false, false, true);
        song.note_cut(0, true);
        assert_eq!(song.voices[0].length, 0);
        assert_eq!(song.voices[0].frequency, 0);
    }

    #[test]
    fn test_portamento_sets_target() {
        let mut song = Song::new(sample_module(), MixerConfig::default());
        song.voices[0].new_note = 61;
        song.instrument_change(0, 1, false, true);
        song.note_change(0, 61, false, false, true);
        song.voices[0].increment = 0x10000;
        song.note_change(0, 73, true, false, false);
        assert_eq!(song.voices[0].frequency, 8363, "pitch stays until the slide runs");
        assert_eq!(song.voices[0].portamento_target, 16726);
    }

    #[test]
    fn test_empty_keyboard_slot_keeps_instrument_only() {
        let mut module = sample_module();
        module.flags = SongFlags::INSTRUMENT_MODE;
        let mut ins = TrackerInstrument::for_sample(1);
        ins.sample_map[60] = 0;
        module.instruments.push(ins);
        let mut song = Song::new(module, MixerConfig::default());
        song.voices[0].new_note = 61;
        song.instrument_change(0, 1, false, true);
        assert_eq!(song.voices[0].ptr_instrument, Some(1));
        assert_eq!(song.voices[0].ptr_sample, None, "no sample is bound");
    }

    #[test]
    fn test_instrument_volume_combines_globals() {
        let mut module = sample_module();
        module.flags = SongFlags::INSTRUMENT_MODE;
        let mut ins = TrackerInstrument::for_sample(1);
        ins.global_volume = 64;
        module.instruments.push(ins);
        module.samples[0].global_volume = 32;
        let mut song = Song::new(module, MixerConfig::default());
        song.voices[0].new_note = 61;
        song.instrument_change(0, 1, false, true);
        assert_eq!(song.voices[0].instrument_volume, 16);
    }
}
