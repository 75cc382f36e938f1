//! Per-tick voice setup and the PCM output loop
//!
//! [`Song::read`] alternates between two steps: when the current tick's
//! frames are used up, `read_note` advances the sequencer one tick and
//! turns every voice's note state into mixer parameters (increment,
//! ramped volumes, filter); then up to [`MIX_BUFFER_SIZE`] frames are
//! mixed, post-processed and converted to the output format.

use std::sync::Arc;

use nether_opl::OPL_RATE_BASE;
use nether_tracker::{MAX_CHANNELS, SongFlags, TrackerInstrument, TrackerNote};
use tracing::trace;

use super::{PlayFlags, Song, modulation};
use crate::config::Interpolation;
use crate::mixer::convert::{MIXING_ATTENUATION, PeakTracker, clip_and_convert};
use crate::mixer::{self, VOLUME_RAMP_PRECISION};
use crate::tables::{find_gm_volume, frequency_from_note, muldiv, note_from_frequency};
use crate::voice::{TickCommand, Voice, VoiceFlags};
use crate::{MAX_VOICES, MIX_BUFFER_SIZE};

/// VU fall per tick for FM voices, which have no sample data to measure
const VUMETER_DECAY: u32 = 16;

/// Shortest smoothed ramp with a high quality resampler
const HQ_RAMP_MIN: i32 = 1 << (VOLUME_RAMP_PRECISION - 1);

/// Refresh the voice's level meter from its volume and the sample under
/// the cursor.
fn update_vu_meter(chan: &mut Voice) {
    let vut = ((chan.final_volume >> 6).max(0) as u32).min(0xFF);
    if chan.flags.contains(VoiceFlags::ADLIB) {
        chan.vu_meter = chan.vu_meter.saturating_sub(VUMETER_DECAY);
        if chan.vu_meter >= 0x100 {
            chan.vu_meter = vut;
        }
        return;
    }
    match &chan.current_sample_data {
        Some(data) if vut != 0 => {
            let pos = chan.position_whole().max(0) as usize;
            let index = if chan.flags.contains(VoiceFlags::STEREO) { pos * 2 } else { pos };
            let n = (data.get(index) >> 8).unsigned_abs();
            let level = (vut * n) >> 7;
            if level != 0 {
                chan.vu_meter = level;
            }
        }
        _ => chan.vu_meter = 0,
    }
}

impl Song {
    /// Render PCM into `out` in the configured format and return the number
    /// of frames produced. The read the song ends in rings out to the end of
    /// `out`; every read after that returns 0 and fills `out` with silence.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let frame_size = self.config.frame_size();
        let max = out.len() / frame_size;
        if max == 0 {
            return 0;
        }
        let stereo = self.config.channels >= 2;
        let bits = self.config.bits;
        self.peaks = PeakTracker::default();

        let silence = if bits == 8 { 0x80 } else { 0 };
        if self.flags.contains(PlayFlags::END_REACHED) {
            out.fill(silence);
            self.vu = [0; 2];
            return 0;
        }

        let mut left = max;
        let mut written = 0;

        while left > 0 {
            if self.buffer_count == 0 {
                self.buffer_count = left as u32;
                if !self.read_note() {
                    self.flags.insert(PlayFlags::END_REACHED);
                    trace!(order = self.current_order, row = self.row, "end of song");
                    if self.stop_at.is_some() || left == max {
                        break;
                    }
                    // Let the voices ring out over the rest of the buffer
                    self.buffer_count = left as u32;
                }
                self.flush_gm();
                if self.buffer_count == 0 {
                    break;
                }
            }

            let count = (self.buffer_count as usize).min(MIX_BUFFER_SIZE).min(left);
            self.mix_period(count);
            let samples = if stereo { count * 2 } else { count };
            written += clip_and_convert(&mut out[written..], &self.mix_buffer[..samples], bits, &mut self.peaks);

            left -= count;
            self.buffer_count -= count as u32;
        }

        out[written..].fill(silence);
        self.vu = self.peaks.meters();
        let rendered = max - left;
        self.samples_played += rendered as u64;
        rendered
    }

    /// Mix `count` frames of every voice set up for this tick into the
    /// accumulator and run the output DSP.
    fn mix_period(&mut self, count: usize) {
        self.gm
            .increment_song_counter(count as u32, self.config.sample_rate, self.current_tempo);
        self.flush_gm();

        let buffer = &mut self.mix_buffer[..count * 2];
        mixer::stereo_fill(buffer, &mut self.dry);

        let interpolation = self.config.interpolation;
        let max_voices = self.config.max_voices as usize;
        let mute_channel_mode = self.config.mute_channel_mode;
        let mut mixed = 0;
        for (i, &n) in self.voice_mix.iter().enumerate() {
            let voice = &mut self.voices[n];
            if (voice.current_sample_data.is_none() || voice.ptr_sample.is_none())
                && voice.left_ofs == 0
                && voice.right_ofs == 0
            {
                continue;
            }
            if !mute_channel_mode && voice.flags.contains(VoiceFlags::MUTE) {
                continue;
            }
            if mixer::mix_voice(voice, buffer, interpolation, i >= max_voices, &mut self.dry) {
                mixed += 1;
            }
        }
        self.mixed_voices = mixed;

        self.opl.mix_to(buffer, count);

        if self.config.channels >= 2 {
            if self.config.noise_reduction {
                self.noise.process_stereo(buffer);
            }
            if self.config.eq {
                self.eq.process_stereo(buffer);
            }
        } else {
            mixer::mono_from_stereo(buffer, count);
            let mono = &mut buffer[..count];
            if self.config.noise_reduction {
                self.noise.process_mono(mono);
            }
            if self.config.eq {
                self.eq.process_mono(mono);
            }
        }
    }

    /// One tick while the transport is paused: live notes keep their
    /// effects running but no rows are read.
    fn paused_tick(&mut self) {
        if self.current_speed == 0 {
            self.current_speed = match self.module.initial_speed {
                0 => 6,
                s => s as u32,
            };
        }
        if self.current_tempo == 0 {
            self.current_tempo = match self.module.initial_tempo {
                0 => 125,
                t => t as u32,
            };
        }
        self.flags.remove(PlayFlags::FIRST_TICK);

        self.tick_count = self.tick_count.saturating_sub(1);
        if self.tick_count == 0 {
            self.tick_count = self.current_speed;
            self.row_count = (self.row_count - 1).max(0);
            for chan in &mut self.voices[..MAX_CHANNELS] {
                chan.row_note = TrackerNote::NOTE_NONE;
                chan.row_instr = 0;
                chan.row_vol_effect = Default::default();
                chan.row_vol_param = 0;
                chan.row_effect = Default::default();
                chan.row_param = 0;
                chan.n_command = TickCommand::None;
            }
        }
        self.process_effects(false);
    }

    /// Advance one tick and prepare every voice for the coming mix period.
    /// Returns false once playback has ended.
    pub(crate) fn read_note(&mut self) -> bool {
        if self.flags.contains(PlayFlags::PAUSED) {
            self.paused_tick();
        } else if !self.process_tick() {
            return false;
        }

        if self.current_tempo == 0 {
            return false;
        }
        self.buffer_count = self.config.sample_rate * 5 / (self.current_tempo * 2);

        if let Some((order, row)) = self.stop_at
            && order <= self.current_order
            && row <= self.row
        {
            return false;
        }

        let master_vol = (self.module.mixing_volume as i32) << 2;
        let module = Arc::clone(&self.module);
        let instrument_mode = module.uses_instruments();
        self.voice_mix.clear();
        self.num_voices = 0;

        for n in 0..MAX_VOICES {
            let chan = &mut self.voices[n];
            if chan.flags.contains(VoiceFlags::NOTEFADE)
                && (chan.fadeout_volume | chan.right_volume | chan.left_volume) == 0
            {
                chan.length = 0;
                chan.left_ofs = 0;
                chan.right_ofs = 0;
                continue;
            }
            if n >= MAX_CHANNELS && chan.length == 0 {
                continue;
            }

            chan.increment = 0;
            chan.final_volume = 0;
            chan.final_panning = chan.panning + chan.pan_swing + chan.panbrello_delta;
            chan.ramp_length = 0;

            let ins = if instrument_mode {
                chan.ptr_instrument.and_then(|i| module.instrument(i))
            } else {
                None
            };
            if chan.frequency != 0 && chan.length != 0 {
                self.setup_voice(n, ins);
            }
            if let Some(ins) = ins {
                modulation::increment_env_pos(&mut self.voices[n], ins);
            }

            let chan = &mut self.voices[n];
            chan.final_panning = chan.final_panning.clamp(0, 256);
            chan.flags.set(
                VoiceFlags::VOLUME_RAMP,
                chan.final_volume != 0 || chan.left_volume != 0 || chan.right_volume != 0,
            );
            if chan.strike > 0 {
                chan.strike -= 1;
            }
            if ((chan.increment >> 16) as i64 + 1) >= chan.loop_end as i64 - chan.loop_start as i64 {
                chan.flags.remove(VoiceFlags::LOOP);
            }

            chan.left_volume_new = 0;
            chan.right_volume_new = 0;
            if chan.length == 0 || chan.increment == 0 {
                chan.current_sample_data = None;
            }
            update_vu_meter(chan);

            if chan.current_sample_data.is_some() {
                if !self.update_sample(n, master_vol) {
                    break;
                }
            } else {
                chan.left_volume = 0;
                chan.right_volume = 0;
                chan.length = 0;
            }
        }

        if self.num_voices >= self.config.max_voices as usize {
            let voices = &self.voices;
            self.voice_mix
                .sort_by(|&a, &b| voices[b].final_volume.cmp(&voices[a].final_volume));
        }
        true
    }

    /// Compute the final volume, panning, frequency and increment of a
    /// sounding voice for this tick.
    fn setup_voice(&mut self, n: usize, ins: Option<&TrackerInstrument>) {
        let rate = self.config.sample_rate;
        let global_volume = self.current_global_volume as i64;

        let chan = &mut self.voices[n];
        let mut vol = chan.volume + chan.vol_swing;
        if chan.flags.contains(VoiceFlags::TREMOLO) {
            vol += chan.tremolo_delta;
        }
        vol = vol.clamp(0, 256);
        if chan.n_command == TickCommand::Tremor {
            modulation::tremor(chan, &mut vol);
        }
        vol = vol.clamp(0, 256) << 6;

        if ins.is_some() {
            vol = self.process_envelopes(n, vol);
        } else if chan.flags.contains(VoiceFlags::NOTEFADE) {
            chan.fadeout_volume = 0;
            vol = 0;
        }

        let chan = &mut self.voices[n];
        if vol != 0 {
            chan.final_volume = muldiv(
                vol as i64 * global_volume,
                chan.global_volume as i64 * chan.instrument_volume as i64,
                1 << 19,
            );
        }

        let mut freq = chan.frequency;
        if chan.flags.contains(VoiceFlags::GLISSANDO | VoiceFlags::PORTAMENTO) {
            freq = frequency_from_note(note_from_frequency(freq, chan.c5speed), chan.c5speed);
        }
        if chan.n_command == TickCommand::Arpeggio {
            freq = self.arpeggio(n, freq);
        }

        let mut envpitch = 0;
        if let Some(ins) = ins
            && self.voices[n].flags.contains(VoiceFlags::PITCH_ENV)
            && !ins.pitch_envelope.points.is_empty()
        {
            (envpitch, freq) = modulation::pitch_filter_envelope(&self.voices[n], &ins.pitch_envelope, freq);
        }

        if self.voices[n].flags.contains(VoiceFlags::VIBRATO) {
            freq = self.apply_vibrato(n, freq);
        }
        if self.voice_sample(n).is_some_and(|s| s.vibrato_depth != 0) {
            freq = self.sample_vibrato(n, freq);
        }

        if !self.voices[n].flags.contains(VoiceFlags::NOTEFADE) {
            self.gen_key(n, freq, vol);
        }

        let chan = &mut self.voices[n];
        if let Some(ins) = ins
            && ins.pitch_envelope.is_filter()
        {
            let reset = !chan.flags.contains(VoiceFlags::FILTER);
            chan.setup_filter(reset, envpitch, rate);
        }

        chan.sample_freq = freq.max(0) as u32;
        let mut ninc = muldiv(freq.max(0) as i64, 0x10000, rate as i64);
        if (0xFFB0..=0x10090).contains(&ninc) {
            ninc = 0x10000;
        }
        ninc = ninc.min(0xFF_0000);
        chan.increment = (ninc + 1) & !3;
    }

    /// Drive the MIDI and OPL outputs from the voice's pitch and volume
    fn gen_key(&mut self, n: usize, freq: i32, vol: i32) {
        let chan = &self.voices[n];
        if chan.flags.contains(VoiceFlags::MUTE) {
            return;
        }
        let adlib = chan.flags.contains(VoiceFlags::ADLIB);
        let key_off = chan.flags.contains(VoiceFlags::KEYOFF);
        let instrument_volume = chan.instrument_volume;

        if self.voice_instrument(n).is_some_and(TrackerInstrument::is_midi) {
            let volume = if adlib && vol > 0 {
                find_gm_volume(vol.min(u16::MAX as i32) as u16) as i32 * instrument_volume / 64
            } else {
                vol * instrument_volume / 8192
            };
            self.gm.set_freq_and_vol(n, freq, volume, key_off);
        }

        if adlib {
            // The chip's f-number scale sits 249/164 away from voice Hz
            let fnum_hz = freq.max(0) as i64 * 164 / 249;
            let millihertz = (fnum_hz * OPL_RATE_BASE as i64 * 1000) >> 20;
            self.opl.hertz_touch(n, millihertz.min(u32::MAX as i64) as u32, key_off);
            let level = vol as i64 * instrument_volume as i64 * 63 / (1 << 20);
            self.opl.touch(n, level.max(0) as u32);
        }
    }

    /// Turn final volume and panning into ramped mixer volumes and queue
    /// the voice for mixing. False once the mix list is full.
    fn update_sample(&mut self, n: usize, master_vol: i32) -> bool {
        let mono = self.config.channels < 2 || self.module.flags.contains(SongFlags::NO_STEREO);
        let surround = self.voices[n].flags.contains(VoiceFlags::SURROUND) && !self.config.no_surround;
        let realvol = self.voices[n].final_volume * master_vol;

        let (left, right) = if mono {
            (realvol >> 8, realvol >> 8)
        } else if surround {
            (realvol >> 8, -(realvol >> 8))
        } else {
            let mut pan = (self.voices[n].final_panning - 128) * self.module.pan_separation as i32 / 128;
            if self.voice_instrument(n).is_some_and(TrackerInstrument::is_midi) {
                self.gm.pan(n, pan);
            }
            pan = (pan + 128).clamp(0, 256);
            if self.config.reverse_stereo {
                pan = 256 - pan;
            }
            let realvol = realvol >> 7;
            ((realvol * (256 - pan)) >> 8, (realvol * pan) >> 8)
        };

        let interpolation = self.config.interpolation;
        let ramping = self.config.ramping;
        let (ramp_up, ramp_down) = (self.ramp_up_samples, self.ramp_down_samples);
        let buffer_count = self.buffer_count as i32;

        let chan = &mut self.voices[n];
        chan.left_volume_new = left.min(0xFFFF);
        chan.right_volume_new = right.min(0xFFFF);

        let hq = matches!(interpolation, Interpolation::Spline | Interpolation::Fir);
        chan.flags.set(
            VoiceFlags::NO_IDO,
            chan.increment == 0x10000 || (!hq && chan.increment >= 0xFF00),
        );

        chan.left_volume_new >>= MIXING_ATTENUATION;
        chan.right_volume_new >>= MIXING_ATTENUATION;
        chan.left_ramp = 0;
        chan.right_ramp = 0;

        if chan.flags.contains(VoiceFlags::PINGPONG_FLAG) {
            chan.increment = -chan.increment;
        }

        if chan.flags.contains(VoiceFlags::MUTE) {
            chan.left_volume = 0;
            chan.right_volume = 0;
        } else if ramping
            && chan.flags.contains(VoiceFlags::VOLUME_RAMP)
            && (chan.left_volume != chan.left_volume_new || chan.right_volume != chan.right_volume_new)
        {
            let rising = chan.left_volume_new.abs() + chan.right_volume_new.abs()
                > chan.left_volume.abs() + chan.right_volume.abs();
            let mut len = if rising { ramp_up } else { ramp_down };
            if hq
                && (chan.left_volume | chan.right_volume) != 0
                && (chan.left_volume_new | chan.right_volume_new) != 0
                && !chan.flags.contains(VoiceFlags::FAST_VOLUME_RAMP)
            {
                len = if buffer_count < HQ_RAMP_MIN {
                    HQ_RAMP_MIN
                } else {
                    buffer_count.min(len)
                };
            }
            let len = len.max(1);

            chan.left_ramp = ((chan.left_volume_new - chan.left_volume) << VOLUME_RAMP_PRECISION) / len;
            chan.right_ramp = ((chan.right_volume_new - chan.right_volume) << VOLUME_RAMP_PRECISION) / len;
            chan.left_volume = chan.left_volume_new - ((chan.left_ramp * len) >> VOLUME_RAMP_PRECISION);
            chan.right_volume = chan.right_volume_new - ((chan.right_ramp * len) >> VOLUME_RAMP_PRECISION);

            if (chan.left_ramp | chan.right_ramp) != 0 {
                chan.ramp_length = len;
            } else {
                chan.flags.remove(VoiceFlags::VOLUME_RAMP);
                chan.left_volume = chan.left_volume_new;
                chan.right_volume = chan.right_volume_new;
            }
        } else {
            chan.flags.remove(VoiceFlags::VOLUME_RAMP);
            chan.left_volume = chan.left_volume_new;
            chan.right_volume = chan.right_volume_new;
        }

        chan.left_ramp_volume = chan.left_volume << VOLUME_RAMP_PRECISION;
        chan.right_ramp_volume = chan.right_volume << VOLUME_RAMP_PRECISION;

        self.voice_mix.push(n);
        self.num_voices += 1;
        self.num_voices < MAX_VOICES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MixerConfig;
    use nether_tracker::{TrackerModule, TrackerSample};

    fn song_with(config: MixerConfig) -> Song {
        let mut module = TrackerModule::default();
        module.samples.push(TrackerSample::from_pcm16(vec![8000; 4000]).with_loop(0, 4000, false));
        Song::new(module, config)
    }

    /// Put a looping note on voice `n` directly
    fn sound(song: &mut Song, n: usize, volume: i32, panning: i32) {
        song.voices[n].new_note = TrackerNote::NOTE_MIDDLE_C;
        song.instrument_change(n, 1, false, true);
        song.note_change(n, TrackerNote::NOTE_MIDDLE_C, false, false, true);
        song.voices[n].volume = volume;
        song.voices[n].panning = panning;
        if n >= MAX_CHANNELS {
            song.voices[n].master_channel = 1;
        }
    }

    #[test]
    fn test_tick_length_follows_tempo() {
        let mut song = song_with(MixerConfig::default());
        song.flags.remove(PlayFlags::END_REACHED);
        song.current_tempo = 125;
        assert!(song.read_note());
        assert_eq!(song.buffer_count, 882, "2.5 / 125 seconds at 44.1 kHz");

        song.current_tempo = 250;
        song.read_note();
        assert_eq!(song.buffer_count, 441);
    }

    #[test]
    fn test_hard_panning() {
        let mut config = MixerConfig::default();
        config.ramping = false;
        let mut song = song_with(config);
        sound(&mut song, 0, 256, 0);
        sound(&mut song, 1, 256, 256);
        song.read_note();
        let (l0, r0) = (song.voices[0].left_volume, song.voices[0].right_volume);
        let (l1, r1) = (song.voices[1].left_volume, song.voices[1].right_volume);
        assert!(l0 > 0 && r0 == 0, "pan 0 is left only: {l0} {r0}");
        assert!(r1 > 0 && l1 == 0, "pan 256 is right only: {l1} {r1}");
        assert_eq!(l0, r1);
    }

    #[test]
    fn test_reverse_stereo_swaps_sides() {
        let mut config = MixerConfig::default();
        config.ramping = false;
        config.reverse_stereo = true;
        let mut song = song_with(config);
        sound(&mut song, 0, 256, 0);
        song.read_note();
        assert_eq!(song.voices[0].left_volume, 0);
        assert!(song.voices[0].right_volume > 0);
    }

    #[test]
    fn test_surround_inverts_one_side() {
        let mut config = MixerConfig::default();
        config.ramping = false;
        let mut song = song_with(config);
        sound(&mut song, 0, 256, 128);
        song.voices[0].flags.insert(VoiceFlags::SURROUND);
        song.read_note();
        assert!(song.voices[0].left_volume > 0);
        assert_eq!(song.voices[0].right_volume, -song.voices[0].left_volume);
    }

    #[test]
    fn test_mono_output_ignores_panning() {
        let mut config = MixerConfig::default();
        config.ramping = false;
        config.channels = 1;
        let mut song = song_with(config);
        sound(&mut song, 0, 256, 0);
        song.read_note();
        assert_eq!(song.voices[0].left_volume, song.voices[0].right_volume);
    }

    #[test]
    fn test_volume_change_is_ramped() {
        let mut song = song_with(MixerConfig::default());
        sound(&mut song, 0, 256, 128);
        song.read_note();
        assert_eq!(song.voices[0].ramp_length, song.ramp_up_samples, "note start ramps up");
        assert_eq!(song.voices[0].left_volume, 0);

        song.voices[0].left_volume = song.voices[0].left_volume_new;
        song.voices[0].right_volume = song.voices[0].right_volume_new;
        song.voices[0].volume = 64;
        song.read_note();
        assert_eq!(song.voices[0].ramp_length, song.ramp_down_samples);
    }

    #[test]
    fn test_voice_limit_sorts_loudest_first() {
        let mut config = MixerConfig::default();
        config.max_voices = 4;
        let mut song = song_with(config);
        for (i, n) in (MAX_CHANNELS..MAX_CHANNELS + 10).enumerate() {
            sound(&mut song, n, 20 + 20 * i as i32, 128);
        }
        song.read_note();
        assert_eq!(song.active_voices(), 10);
        let volumes: Vec<i32> = song.voice_mix.iter().map(|&n| song.voices[n].final_volume).collect();
        assert!(volumes.windows(2).all(|w| w[0] >= w[1]), "sorted loudest first: {volumes:?}");
        assert_eq!(song.voice_mix[0], MAX_CHANNELS + 9);
    }

    #[test]
    fn test_faded_voice_is_released() {
        let mut song = song_with(MixerConfig::default());
        sound(&mut song, 70, 256, 128);
        song.voices[70].flags.insert(VoiceFlags::NOTEFADE);
        song.voices[70].fadeout_volume = 0;
        song.read_note();
        assert_eq!(song.voices[70].length, 0);
        assert!(!song.voice_mix.contains(&70));
    }

    #[test]
    fn test_increment_snaps_to_unity() {
        let mut song = song_with(MixerConfig::default());
        sound(&mut song, 0, 256, 128);
        song.voices[0].frequency = 44110;
        song.read_note();
        assert_eq!(song.voices[0].increment, 0x10000);
        assert!(song.voices[0].flags.contains(VoiceFlags::NO_IDO), "unity step skips interpolation");
    }

    #[test]
    fn test_read_fills_silence_when_ended() {
        let mut config = MixerConfig::default();
        config.bits = 8;
        let mut song = song_with(config);
        let mut out = vec![0u8; 64];
        assert_eq!(song.read(&mut out), 0, "a new song has not started");
        assert!(out.iter().all(|&b| b == 0x80), "8-bit silence is unsigned mid-scale");
    }

    #[test]
    fn test_vu_meter_tracks_sample_level() {
        let mut chan = Voice {
            current_sample_data: Some(nether_tracker::SampleData::Pcm16(Arc::from(vec![-0x4000i16; 4]))),
            final_volume: 1 << 14,
            ..Default::default()
        };
        update_vu_meter(&mut chan);
        assert_eq!(chan.vu_meter, (0xFF * 0x40) >> 7);

        chan.final_volume = 0;
        update_vu_meter(&mut chan);
        assert_eq!(chan.vu_meter, 0);
    }
}
