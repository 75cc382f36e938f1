//! Per-tick pitch and volume modulation
//!
//! These run for every sounding voice once per tick, after the effects, and
//! turn the voice's note state into the volume, panning and frequency the
//! mixer sees for the coming period. Nothing here changes note memory;
//! only waveform and envelope cursors advance.

use std::sync::Arc;

use nether_tracker::{TrackerEnvelope, TrackerInstrument};

use super::Song;
use super::effects::WAVE_RANDOM;
use crate::tables::{
    FINE_LINEAR_SLIDE_DOWN_TABLE, FINE_LINEAR_SLIDE_UP_TABLE, LINEAR_SLIDE_DOWN_TABLE, LINEAR_SLIDE_UP_TABLE,
    calc_halftone, muldiv, waveform,
};
use crate::voice::{Voice, VoiceFlags};

/// Frequency change for a vibrato `delta` in 1/64 semitone units
fn linear_delta(freq: i32, delta: i32) -> i32 {
    let l = delta.unsigned_abs() as usize;
    let (coarse, fine) = if delta < 0 {
        (&LINEAR_SLIDE_DOWN_TABLE, &FINE_LINEAR_SLIDE_DOWN_TABLE)
    } else {
        (&LINEAR_SLIDE_UP_TABLE, &FINE_LINEAR_SLIDE_UP_TABLE)
    };
    let f = freq as i64;
    let mut d = muldiv(f, coarse[(l >> 2).min(255)] as i64, 0x10000) - freq;
    if l & 3 != 0 {
        d += muldiv(f, fine[l & 3] as i64, 0x10000) - freq;
    }
    d
}

/// Ixy off phase silences the voice
pub(crate) fn tremor(chan: &mut Voice, vol: &mut i32) {
    if chan.cd_tremor & 0xC0 == 0x80 {
        *vol = 0;
    }
    chan.flags.insert(VoiceFlags::FAST_VOLUME_RAMP);
}

/// Outcome of moving an envelope cursor one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct EnvStep {
    /// Jumped back to the loop start
    looped: bool,
    /// Held at the final node
    ended: bool,
}

fn advance_envelope(pos: &mut i32, env: &TrackerEnvelope, key_off: bool) -> EnvStep {
    let mut step = EnvStep::default();
    *pos += 1;
    if env.has_loop() && *pos == env.tick_at(env.loop_end) + 1 {
        *pos = env.tick_at(env.loop_begin);
        step.looped = true;
    }
    if env.has_sustain() && *pos == env.tick_at(env.sustain_end) + 1 && !key_off {
        *pos = env.tick_at(env.sustain_begin);
    } else if *pos > env.last_tick() {
        *pos = env.last_tick();
        step.ended = true;
    }
    step
}

/// Advance every enabled envelope cursor of `chan`.
///
/// A volume envelope that loops on a single zero node, or ends on zero,
/// finishes the note.
pub(crate) fn increment_env_pos(chan: &mut Voice, ins: &TrackerInstrument) {
    let key_off = chan.flags.contains(VoiceFlags::KEYOFF);

    let env = &ins.volume_envelope;
    if chan.flags.contains(VoiceFlags::VOLUME_ENV) && !env.points.is_empty() {
        let step = advance_envelope(&mut chan.vol_env_position, env, key_off);
        if step.looped && env.loop_end == env.loop_begin && env.value_at_node(env.loop_begin) == 0 {
            chan.flags.insert(VoiceFlags::NOTEFADE);
            chan.fadeout_volume = 0;
        }
        if step.ended {
            chan.flags.insert(VoiceFlags::NOTEFADE);
            if env.points.last().is_some_and(|&(_, v)| v == 0) {
                chan.fadeout_volume = 0;
                chan.final_volume = 0;
            }
        }
    }

    let env = &ins.panning_envelope;
    if chan.flags.contains(VoiceFlags::PANNING_ENV) && !env.points.is_empty() {
        advance_envelope(&mut chan.pan_env_position, env, key_off);
    }

    let env = &ins.pitch_envelope;
    if chan.flags.contains(VoiceFlags::PITCH_ENV) && !env.points.is_empty() {
        advance_envelope(&mut chan.pitch_env_position, env, key_off);
    }
}

/// Apply the pitch envelope, or read it as a filter modifier.
///
/// Returns `(envpitch, freq)`: the envelope value in -256..=256 and the
/// frequency, unchanged for filter envelopes.
pub(crate) fn pitch_filter_envelope(chan: &Voice, env: &TrackerEnvelope, freq: i32) -> (i32, i32) {
    let envpitch = env
        .interpolate(chan.pitch_env_position, 0, |v| (v as i32 - 32) * 8)
        .clamp(-256, 256);
    if env.is_filter() {
        return (envpitch, freq);
    }
    let l = envpitch.unsigned_abs().min(255) as usize;
    let factor = if envpitch < 0 {
        LINEAR_SLIDE_DOWN_TABLE[l]
    } else {
        LINEAR_SLIDE_UP_TABLE[l]
    };
    (envpitch, muldiv(freq as i64, factor as i64, 0x10000))
}

impl Song {
    /// Hxy/Uxy: offset `freq` by the vibrato waveform and advance it
    pub(crate) fn apply_vibrato(&mut self, nchan: usize, freq: i32) -> i32 {
        let old_effects = self.old_effects();
        let linear = self.module.uses_linear_slides();
        let first = self.first_tick();
        let random = if self.voices[nchan].vib_type == WAVE_RANDOM { self.random_delta() } else { 0 };

        let chan = &mut self.voices[nchan];
        let pos = chan.vibrato_position & 0xFF;
        let mut delta = match chan.vib_type {
            WAVE_RANDOM => random,
            kind => waveform(kind, pos as u8),
        };
        let shift = if old_effects {
            delta = -delta;
            5
        } else {
            6
        };
        delta = (delta * chan.vibrato_depth as i32) >> shift;
        if linear {
            delta = linear_delta(freq, delta);
        }

        if !first || !old_effects {
            chan.vibrato_position = (pos + 4 * chan.vibrato_speed) & 0xFF;
        }
        freq - delta
    }

    /// Sample auto-vibrato: depth sweeps up at the sample's rate until it
    /// reaches the sample's depth.
    pub(crate) fn sample_vibrato(&mut self, nchan: usize, freq: i32) -> i32 {
        let Some((kind, rate, depth, speed)) = self
            .voice_sample(nchan)
            .map(|s| (s.vibrato_type as u8, s.vibrato_rate, s.vibrato_depth, s.vibrato_speed))
        else {
            return freq;
        };
        let random = if kind == WAVE_RANDOM { self.random_delta() } else { 0 };

        let chan = &mut self.voices[nchan];
        let pos = chan.autovib_position & 0xFF;
        let adepth = (chan.autovib_depth + rate as i32).min((depth as i32) << 8);
        chan.autovib_depth = adepth;
        chan.autovib_position = chan.autovib_position.wrapping_add(speed as u32);

        let wave = match kind {
            WAVE_RANDOM => random,
            kind => waveform(kind, pos as u8),
        };
        freq - linear_delta(freq, (wave * (adepth >> 8)) >> 6)
    }

    /// Jxy: cycle base, +x and +y semitones across ticks
    pub(crate) fn arpeggio(&self, nchan: usize, freq: i32) -> i32 {
        let mem = self.voices[nchan].mem_arpeggio;
        let semitones = match self.elapsed_ticks().rem_euclid(3) {
            1 => mem >> 4,
            2 => mem & 0x0F,
            _ => 0,
        };
        if semitones == 0 { freq } else { calc_halftone(freq, semitones as i32) }
    }

    /// Volume and panning envelopes, note fade and pitch-pan separation.
    /// Takes and returns the 14-bit working volume.
    pub(crate) fn process_envelopes(&mut self, nchan: usize, vol: i32) -> i32 {
        let module = Arc::clone(&self.module);
        let Some(ins) = self.voices[nchan].ptr_instrument.and_then(|i| module.instrument(i)) else {
            return vol;
        };
        let chan = &mut self.voices[nchan];
        let mut vol = vol;

        let env = &ins.volume_envelope;
        if chan.flags.contains(VoiceFlags::VOLUME_ENV) && !env.points.is_empty() {
            let level = env.interpolate(chan.vol_env_position, 0, |v| (v as i32) << 2).clamp(0, 256);
            vol = (vol * level) >> 8;
        }

        let env = &ins.panning_envelope;
        if chan.flags.contains(VoiceFlags::PANNING_ENV) && !env.points.is_empty() {
            let envpan = env.interpolate(chan.pan_env_position, 128, |v| v as i32).clamp(0, 64);
            let pan = chan.panning;
            chan.final_panning = if pan >= 128 {
                pan + (envpan - 32) * (256 - pan) / 32
            } else {
                pan + (envpan - 32) * pan / 32
            };
        }

        if chan.flags.contains(VoiceFlags::NOTEFADE) {
            if ins.fadeout != 0 {
                chan.fadeout_volume = (chan.fadeout_volume - (ins.fadeout << 1) as i32).max(0);
                vol = ((vol as i64 * chan.fadeout_volume as i64) >> 16) as i32;
            } else if chan.fadeout_volume == 0 {
                vol = 0;
            }
        }

        if ins.pitch_pan_separation != 0 && chan.final_panning != 0 && chan.note != 0 {
            chan.final_panning +=
                (chan.note as i32 - ins.pitch_pan_center as i32 - 1) * ins.pitch_pan_separation as i32 / 4;
        }
        vol
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MixerConfig;
    use nether_tracker::{EnvelopeFlags, SongFlags, TrackerModule, TrackerSample, VibratoType};

    fn envelope(points: &[(u16, u8)]) -> TrackerEnvelope {
        TrackerEnvelope {
            points: points.to_vec(),
            flags: EnvelopeFlags::ENABLED,
            ..TrackerEnvelope::default()
        }
    }

    fn instrument_with(volume_envelope: TrackerEnvelope) -> TrackerInstrument {
        let mut ins = TrackerInstrument::for_sample(1);
        ins.volume_envelope = volume_envelope;
        ins
    }

    fn voice_with_env() -> Voice {
        let mut chan = Voice::default();
        chan.flags.insert(VoiceFlags::VOLUME_ENV);
        chan.fadeout_volume = 65536;
        chan
    }

    #[test]
    fn test_envelope_holds_at_end() {
        let ins = instrument_with(envelope(&[(0, 64), (4, 32)]));
        let mut chan = voice_with_env();
        for _ in 0..10 {
            increment_env_pos(&mut chan, &ins);
        }
        assert_eq!(chan.vol_env_position, 4, "cursor stops on the last node");
        assert!(chan.flags.contains(VoiceFlags::NOTEFADE), "finished volume envelope starts the fade");
        assert_eq!(chan.fadeout_volume, 65536, "non-zero end keeps the fade level");
    }

    #[test]
    fn test_envelope_ending_on_zero_silences() {
        let ins = instrument_with(envelope(&[(0, 64), (2, 0)]));
        let mut chan = voice_with_env();
        chan.final_volume = 1000;
        for _ in 0..3 {
            increment_env_pos(&mut chan, &ins);
        }
        assert_eq!(chan.fadeout_volume, 0);
        assert_eq!(chan.final_volume, 0);
    }

    #[test]
    fn test_envelope_loop_wraps() {
        let mut env = envelope(&[(0, 64), (2, 48), (6, 16), (10, 0)]);
        env.flags = EnvelopeFlags::ENABLED | EnvelopeFlags::LOOP;
        env.loop_begin = 1;
        env.loop_end = 2;
        let ins = instrument_with(env);
        let mut chan = voice_with_env();
        let mut seen = Vec::new();
        for _ in 0..8 {
            increment_env_pos(&mut chan, &ins);
            seen.push(chan.vol_env_position);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 2, 3]);
        assert!(!chan.flags.contains(VoiceFlags::NOTEFADE));
    }

    #[test]
    fn test_sustain_releases_on_key_off() {
        let mut env = envelope(&[(0, 64), (3, 64), (8, 0)]);
        env.flags = EnvelopeFlags::ENABLED | EnvelopeFlags::SUSTAIN_LOOP;
        env.sustain_begin = 1;
        env.sustain_end = 1;
        let ins = instrument_with(env);
        let mut chan = voice_with_env();
        for _ in 0..12 {
            increment_env_pos(&mut chan, &ins);
        }
        assert_eq!(chan.vol_env_position, 3, "sustained on node 1");

        chan.flags.insert(VoiceFlags::KEYOFF);
        for _ in 0..12 {
            increment_env_pos(&mut chan, &ins);
        }
        assert_eq!(chan.vol_env_position, 8, "released to the end");
        assert_eq!(chan.fadeout_volume, 0);
    }

    #[test]
    fn test_single_zero_loop_fades_note() {
        let mut env = envelope(&[(0, 64), (2, 0), (4, 0)]);
        env.flags = EnvelopeFlags::ENABLED | EnvelopeFlags::LOOP;
        env.loop_begin = 1;
        env.loop_end = 1;
        let ins = instrument_with(env);
        let mut chan = voice_with_env();
        for _ in 0..3 {
            increment_env_pos(&mut chan, &ins);
        }
        assert!(chan.flags.contains(VoiceFlags::NOTEFADE));
        assert_eq!(chan.fadeout_volume, 0);
    }

    #[test]
    fn test_pitch_envelope_shifts_frequency() {
        let chan = Voice::default();
        let up = envelope(&[(0, 64)]);
        let (envpitch, freq) = pitch_filter_envelope(&chan, &up, 8363);
        assert_eq!(envpitch, 256);
        assert!(freq > 8363 * 3 / 2, "top of the envelope is a big step up, got {freq}");

        let mut filter = envelope(&[(0, 0)]);
        filter.flags = EnvelopeFlags::ENABLED | EnvelopeFlags::FILTER;
        let (envpitch, freq) = pitch_filter_envelope(&chan, &filter, 8363);
        assert_eq!(envpitch, -256);
        assert_eq!(freq, 8363, "filter envelopes leave the pitch alone");
    }

    fn song() -> Song {
        let mut module = TrackerModule::default();
        module.flags = SongFlags::INSTRUMENT_MODE | SongFlags::LINEAR_SLIDES;
        let mut sample = TrackerSample::from_pcm8(vec![0; 100]);
        sample.vibrato_type = VibratoType::Square;
        sample.vibrato_rate = 64;
        sample.vibrato_depth = 8;
        sample.vibrato_speed = 16;
        module.samples.push(sample);
        let mut ins = TrackerInstrument::for_sample(1);
        ins.fadeout = 1024;
        module.instruments.push(ins);
        Song::new(module, MixerConfig::default())
    }

    #[test]
    fn test_arpeggio_cycles_semitones() {
        let mut song = song();
        song.voices[0].mem_arpeggio = 0x47;
        song.current_speed = 6;
        song.frame_delay = 0;
        let mut freqs = Vec::new();
        for tick_count in (1..=6).rev() {
            song.tick_count = tick_count;
            freqs.push(song.arpeggio(0, 1000));
        }
        assert_eq!(freqs, vec![1000, 1260, 1498, 1000, 1260, 1498]);
    }

    #[test]
    fn test_auto_vibrato_depth_sweeps() {
        let mut song = song();
        song.voices[0].ptr_sample = Some(1);
        let mut depths = Vec::new();
        for _ in 0..40 {
            song.sample_vibrato(0, 8363);
            depths.push(song.voices[0].autovib_depth);
        }
        assert_eq!(depths[0], 64);
        assert!(depths.windows(2).all(|w| w[0] <= w[1]), "depth only grows");
        assert_eq!(*depths.last().unwrap(), 8 << 8, "capped at the sample depth");
        assert_eq!(song.voices[0].autovib_position, 40 * 16);
    }

    #[test]
    fn test_fadeout_reduces_volume() {
        let mut song = song();
        let chan = &mut song.voices[0];
        chan.ptr_instrument = Some(1);
        chan.fadeout_volume = 65536;
        chan.flags.insert(VoiceFlags::NOTEFADE);
        let vol = song.process_envelopes(0, 1 << 14);
        assert_eq!(song.voices[0].fadeout_volume, 65536 - 2048);
        assert_eq!(vol, ((1i64 << 14) * (65536 - 2048) >> 16) as i32);

        song.voices[0].fadeout_volume = 100;
        song.process_envelopes(0, 1 << 14);
        assert_eq!(song.voices[0].fadeout_volume, 0, "fade floors at zero");
    }

    #[test]
    fn test_tremor_off_phase_mutes() {
        let mut chan = Voice::default();
        let mut vol = 100;
        chan.cd_tremor = 0x80 | 3;
        tremor(&mut chan, &mut vol);
        assert_eq!(vol, 0);
        assert!(chan.flags.contains(VoiceFlags::FAST_VOLUME_RAMP));

        let mut vol = 100;
        chan.cd_tremor = 0xC0 | 3;
        tremor(&mut chan, &mut vol);
        assert_eq!(vol, 100, "on phase keeps the volume");
    }

    #[test]
    fn test_vibrato_swings_around_the_note() {
        let mut song = song();
        let chan = &mut song.voices[0];
        chan.vib_type = 0;
        chan.vibrato_depth = 32;
        chan.vibrato_speed = 16;
        chan.vibrato_position = 64;
        let low = song.apply_vibrato(0, 8363);
        assert_eq!(song.voices[0].vibrato_position, 128, "advanced by four times the speed");
        song.voices[0].vibrato_position = 192;
        let high = song.apply_vibrato(0, 8363);
        assert!(low < 8363 && high > 8363, "sine swings both ways: {low} {high}");
    }
}
