//! Transport and live-play control
//!
//! Starting, stopping, seeking and looping, plus the keyboard-style entry
//! points a host uses to audition notes while the song is stopped.

use std::sync::Arc;

use nether_tracker::{MAX_CHANNELS, MAX_ORDERS, MAX_PATTERNS, TrackerNote, VolumeEffect};
use tracing::{debug, info};

use super::{MidiOutState, PROCESS_NEXT_ORDER, PlayFlags, Song};
use crate::voice::{TickCommand, Voice, VoiceFlags};

impl Song {
    /// Rewind to the first order with the module's initial speed, tempo
    /// and channel settings. Clears pause, pattern loop, stop point and
    /// repeat count.
    pub(crate) fn reset_playback(&mut self) {
        self.opl.reset();
        self.set_current_order(0);
        self.repeat_count = 0;
        self.buffer_count = 0;
        self.flags.remove(PlayFlags::PAUSED | PlayFlags::PATTERN_LOOP | PlayFlags::END_REACHED);
        self.stop_at = None;
        self.samples_played = 0;
    }

    /// Reset every voice to its channel defaults and load the module's
    /// initial speed, tempo and global volume.
    pub fn set_current_pos_0(&mut self) {
        let module = Arc::clone(&self.module);
        for (i, voice) in self.voices.iter_mut().enumerate() {
            *voice = Voice::default();
            if let Some(settings) = module.channels.get(i) {
                voice.panning = settings.panning.min(256) as i32;
                voice.global_volume = settings.volume.min(64) as i32;
                voice.flags.set(VoiceFlags::MUTE, settings.muted);
                voice.flags.set(VoiceFlags::SURROUND, settings.surround);
            }
        }
        self.current_global_volume = module.initial_global_volume.min(128) as i32;
        self.current_speed = match module.initial_speed {
            0 => 6,
            s => s as u32,
        };
        self.current_tempo = match module.initial_tempo {
            0 => 125,
            t => (t as u32).max(32),
        };
        self.patloop = false;
        self.frame_delay = 0;
    }

    /// Jump to `order`. Playback picks up from its first row on the next
    /// tick; order 0 also resets the channels.
    pub fn set_current_order(&mut self, order: u32) {
        let vibrato_start = if self.old_effects() { 0 } else { 0x10 };
        for voice in &mut self.voices {
            voice.frequency = 0;
            voice.note = 0;
            voice.new_note = 0;
            voice.new_instrument = 0;
            voice.portamento_target = 0;
            voice.n_command = TickCommand::None;
            voice.cd_patloop = 0;
            voice.patloop_row = 0;
            voice.cd_tremor = 0;
            voice.vibrato_position = vibrato_start;
            voice.tremolo_position = 0;
        }
        let order = if order as usize > MAX_ORDERS { 0 } else { order };
        if order == 0 {
            self.set_current_pos_0();
        }

        self.process_order = order.wrapping_sub(1);
        self.process_row = PROCESS_NEXT_ORDER;
        self.row = 0;
        self.break_row = 0;
        self.tick_count = 1;
        self.row_count = 0;
        self.buffer_count = 0;
        self.flags.remove(PlayFlags::PATTERN_LOOP | PlayFlags::END_REACHED);
        debug!(order, "seek");
    }

    /// Play from the first order, looping per the repeat count
    pub fn start(&mut self) {
        self.reset_playback();
        self.gm.song_start();
        self.flush_gm();
        info!(orders = self.module.orders.len(), "playback started");
    }

    /// Play the song through a single time without backward jumps
    pub fn start_once(&mut self) {
        self.start();
        self.config.no_backward_jumps = true;
        self.repeat_count = -1;
    }

    /// Play from `row` of `order`
    pub fn start_at_order(&mut self, order: u32, row: u32) {
        self.reset_playback();
        self.set_current_order(order);
        self.break_row = row;
        self.gm.song_start();
        self.flush_gm();
        info!(order, row, "playback started");
    }

    /// Repeat one pattern from `row`, ignoring the order list. An
    /// unallocated pattern ends pattern-loop mode instead.
    pub fn loop_pattern(&mut self, pattern: u32, row: u32) {
        self.reset_playback();
        let rows = match self.module.pattern(pattern as usize) {
            Some(p) if (pattern as usize) < MAX_PATTERNS => p.num_rows as u32,
            _ => {
                self.flags.remove(PlayFlags::PATTERN_LOOP);
                return;
            }
        };
        self.process_order = 0;
        self.process_row = PROCESS_NEXT_ORDER;
        self.break_row = if row < rows { row } else { 0 };
        self.tick_count = 1;
        self.row_count = 0;
        self.current_pattern = pattern;
        self.buffer_count = 0;
        self.flags.insert(PlayFlags::PATTERN_LOOP);
        self.gm.song_start();
        self.flush_gm();
        info!(pattern, row, "looping pattern");
    }

    /// Stop playback, silence every output and rewind
    pub fn stop(&mut self) {
        self.midi_out_all_off();
        let module = Arc::clone(&self.module);
        self.process_midi_macro(0, &module.midi_config.stop, 0, 0, 0, 0);

        self.opl.reset();
        self.gm.reset(false);
        self.gm.song_stop();
        self.flush_gm();
        self.midi_out = [MidiOutState::default(); MAX_CHANNELS];

        self.reset_playback();
        self.flags.insert(PlayFlags::PAUSED | PlayFlags::END_REACHED);
        self.vu = [0; 2];
        info!("playback stopped");
    }

    /// Hold the song where it is. Rendering produces silence until
    /// [`resume`](Self::resume).
    pub fn pause(&mut self) {
        if !self.flags.contains(PlayFlags::PAUSED) {
            self.flags.insert(PlayFlags::END_REACHED);
            debug!(order = self.current_order, row = self.row, "paused");
        }
    }

    pub fn resume(&mut self) {
        if !self.flags.contains(PlayFlags::PAUSED) && self.flags.contains(PlayFlags::END_REACHED) {
            self.flags.remove(PlayFlags::END_REACHED);
            self.gm.song_continue();
            self.flush_gm();
            debug!(order = self.current_order, row = self.row, "resumed");
        }
    }

    /// End playback when `row` of `order` is reached
    pub fn set_stop_at(&mut self, order: u32, row: u32) {
        self.stop_at = Some((order, row));
    }

    pub fn clear_stop_at(&mut self) {
        self.stop_at = None;
    }

    /// -n plays the song n times, 0 loops forever. Starting playback
    /// resets it to 0, so set it afterwards.
    pub fn set_repeat_count(&mut self, count: i32) {
        self.repeat_count = count;
    }

    pub fn repeat_count(&self) -> i32 {
        self.repeat_count
    }

    /// Keep playing the current order instead of following the order list
    pub fn set_order_lock(&mut self, locked: bool) {
        if locked {
            self.flags.insert(PlayFlags::ORDER_LOCKED);
        } else {
            self.flags.remove(PlayFlags::ORDER_LOCKED);
        }
    }

    /// Silence every voice playing sample `sample` (1-based)
    pub fn stop_sample(&mut self, sample: usize) {
        let Some(data) = self.module.sample(sample).map(|s| s.data.clone()) else {
            return;
        };
        for voice in &mut self.voices {
            let uses = voice.ptr_sample == Some(sample)
                || matches!(&voice.current_sample_data, Some(d) if d.same_buffer(&data));
            if uses {
                release_voice(voice);
            }
        }
    }

    /// Silence every voice at once
    pub fn stop_all_voices(&mut self) {
        for voice in &mut self.voices {
            release_voice(voice);
        }
        self.opl.reset();
        self.gm.reset(false);
        self.flush_gm();
    }

    /// Mute or unmute channel `channel` and the background voices it
    /// released. Whether muted voices still run through the mixer depends
    /// on `mute_channel_mode`.
    pub fn set_channel_mute(&mut self, channel: usize, muted: bool) {
        if channel >= MAX_CHANNELS {
            return;
        }
        self.voices[channel].flags.set(VoiceFlags::MUTE, muted);
        for voice in &mut self.voices[MAX_CHANNELS..] {
            if voice.master_channel == channel + 1 {
                voice.flags.set(VoiceFlags::MUTE, muted);
            }
        }
        if muted {
            if self.voices[channel].flags.contains(VoiceFlags::ADLIB) {
                self.opl.touch(channel, 0);
            }
            self.gm.touch(channel, 0);
            self.flush_gm();
        }
        debug!(channel, muted, "channel mute");
    }

    pub fn is_channel_muted(&self, channel: usize) -> bool {
        self.voices.get(channel).is_some_and(|v| v.flags.contains(VoiceFlags::MUTE))
    }

    /// Play `note` on `channel` right away, as if typed on a keyboard.
    ///
    /// `instrument` 0 reuses the channel's last instrument (or sample in
    /// sample mode); `volume` is 0..=64, `None` for the sample default.
    /// Note-off, note-cut and fade values release the playing note.
    /// Returns false when nothing could be played.
    pub fn note_on(&mut self, channel: usize, note: u8, instrument: u32, volume: Option<u32>) -> bool {
        if channel >= MAX_CHANNELS || note == TrackerNote::NOTE_NONE {
            return false;
        }
        let instr = if instrument != 0 { instrument } else { self.voices[channel].last_instrument as u32 };

        if TrackerNote::is_note(note) {
            if instr == 0 {
                return false;
            }
            if self.instrument_mode() {
                self.check_nna(channel, instr, note, false);
            }
            let chan = &mut self.voices[channel];
            chan.last_instrument = instr.min(u8::MAX as u32) as u8;
            chan.new_note = note;
            chan.master_channel = 0;
            chan.length = 0;
            self.instrument_change(channel, instr, false, true);
            if self.voices[channel].ptr_sample.is_none() {
                return false;
            }
            if let Some(vol) = volume {
                self.voices[channel].volume = (vol.min(64) << 2) as i32;
            }
        }
        self.note_change(channel, note, false, false, true);

        let cell = TrackerNote::new(note, instr.min(u8::MAX as u32) as u8)
            .with_volume(VolumeEffect::Volume, volume.unwrap_or(64).min(64) as u8);
        self.midi_out_note(channel, Some(&cell));
        self.flush_gm();

        if self.flags.contains(PlayFlags::END_REACHED) {
            self.flags.remove(PlayFlags::END_REACHED);
            self.flags.insert(PlayFlags::PAUSED);
        }
        true
    }

    /// Release the note playing on `channel`
    pub fn note_off(&mut self, channel: usize) -> bool {
        self.note_on(channel, TrackerNote::NOTE_OFF, 0, None)
    }

    /// Audition one row of `pattern`: every unmuted channel with a note
    /// plays it live.
    pub fn step_row(&mut self, pattern: u32, row: u32) {
        let module = Arc::clone(&self.module);
        let Some(cells) = module.pattern(pattern as usize).and_then(|p| p.row(row as u16)) else {
            return;
        };
        for (channel, cell) in cells.iter().enumerate().take(MAX_CHANNELS) {
            if self.voices[channel].flags.contains(VoiceFlags::MUTE) || cell.note == TrackerNote::NOTE_NONE {
                continue;
            }
            let volume = (cell.vol_effect == VolumeEffect::Volume).then_some(cell.vol_param as u32);
            self.note_on(channel, cell.note, cell.instrument as u32, volume);
        }
    }
}

/// Cut a voice and forget its sample binding
fn release_voice(voice: &mut Voice) {
    voice.note = 0;
    voice.new_note = 0;
    voice.new_instrument = 0;
    voice.fadeout_volume = 0;
    voice.flags.insert(VoiceFlags::KEYOFF | VoiceFlags::NOTEFADE);
    voice.frequency = 0;
    voice.silence();
    voice.loop_start = 0;
    voice.loop_end = 0;
    voice.current_sample_data = None;
    voice.ptr_sample = None;
    voice.ptr_instrument = None;
    voice.left_volume_new = 0;
    voice.right_volume_new = 0;
    voice.left_ramp = 0;
    voice.right_ramp = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MixerConfig;
    use nether_tracker::{ChannelSettings, TrackerModule, TrackerPattern, TrackerSample};

    fn module() -> TrackerModule {
        let mut module = TrackerModule::default();
        module.orders = vec![0, 1];
        module.set_pattern(0, TrackerPattern::empty(8));
        module.set_pattern(1, TrackerPattern::empty(8));
        module.samples.push(TrackerSample::from_pcm8(vec![40; 2000]).with_loop(0, 2000, false));
        module.initial_speed = 3;
        module.initial_tempo = 150;
        module.channels[2] = ChannelSettings { panning: 32, volume: 40, muted: true, surround: false };
        module
    }

    #[test]
    fn test_start_loads_module_defaults() {
        let mut song = Song::new(module(), MixerConfig::default());
        song.current_speed = 9;
        song.start();
        assert_eq!(song.current_speed(), 3);
        assert_eq!(song.current_tempo(), 150);
        assert!(!song.is_stopped());
        assert_eq!(song.voices[2].panning, 32);
        assert_eq!(song.voices[2].global_volume, 40);
        assert!(song.is_channel_muted(2));
        assert_eq!(song.voices[0].panning, 128, "other channels keep the centre default");
    }

    #[test]
    fn test_start_at_order_begins_at_row() {
        let mut song = Song::new(module(), MixerConfig::default());
        song.start_at_order(1, 5);
        assert!(song.read_note());
        assert_eq!((song.current_order(), song.current_row()), (1, 5));
    }

    #[test]
    fn test_loop_pattern_ignores_missing_pattern() {
        let mut song = Song::new(module(), MixerConfig::default());
        song.loop_pattern(7, 0);
        assert!(!song.is_pattern_loop());
        song.loop_pattern(1, 99);
        assert!(song.is_pattern_loop());
        assert_eq!(song.break_row, 0, "out-of-range row starts at the top");
    }

    #[test]
    fn test_stop_point_ends_playback() {
        let mut song = Song::new(module(), MixerConfig::default());
        song.start();
        song.set_stop_at(0, 2);
        let mut ticks = 0;
        while song.read_note() {
            ticks += 1;
            assert!(ticks < 100, "stop point never reached");
        }
        assert_eq!(song.current_row(), 2);
        assert_eq!(ticks, 6, "two rows at speed 3");
    }

    #[test]
    fn test_pause_and_resume() {
        let mut song = Song::new(module(), MixerConfig::default());
        song.start();
        song.pause();
        let mut buf = [0u8; 64];
        assert_eq!(song.read(&mut buf), 0, "a paused song renders nothing");
        song.resume();
        assert_eq!(song.read(&mut buf), 16);
        assert!(!song.is_end_reached());
    }

    #[test]
    fn test_stop_rewinds_and_halts() {
        let mut song = Song::new(module(), MixerConfig::default());
        song.start();
        let mut buf = vec![0u8; 44100];
        song.read(&mut buf);
        song.stop();
        assert!(song.is_stopped());
        assert!(song.is_end_reached());
        assert_eq!(song.samples_played(), 0);
        assert_eq!(song.current_row(), 0);
    }

    #[test]
    fn test_note_on_plays_while_stopped() {
        let mut song = Song::new(module(), MixerConfig::default());
        assert!(song.note_on(0, TrackerNote::NOTE_MIDDLE_C, 1, Some(32)));
        assert!(song.is_stopped(), "live notes keep the transport stopped");
        assert!(!song.is_end_reached(), "but rendering resumes");
        assert_eq!(song.voices[0].volume, 128);
        assert_eq!(song.voices[0].ptr_sample, Some(1));

        let mut buf = [0u8; 256];
        assert_eq!(song.read(&mut buf), 64);
        assert!(buf.iter().any(|&b| b != 0), "the note is audible");
    }

    #[test]
    fn test_note_on_rejects_unknown_sample() {
        let mut song = Song::new(module(), MixerConfig::default());
        assert!(!song.note_on(0, TrackerNote::NOTE_MIDDLE_C, 0, None), "no instrument yet");
        assert!(!song.note_on(MAX_CHANNELS, TrackerNote::NOTE_MIDDLE_C, 1, None));
    }

    #[test]
    fn test_note_off_releases_channel() {
        let mut song = Song::new(module(), MixerConfig::default());
        song.note_on(0, TrackerNote::NOTE_MIDDLE_C, 1, None);
        assert!(song.note_off(0));
        assert!(song.voices[0].flags.contains(VoiceFlags::KEYOFF));
    }

    #[test]
    fn test_stop_sample_releases_voices() {
        let mut song = Song::new(module(), MixerConfig::default());
        song.note_on(0, TrackerNote::NOTE_MIDDLE_C, 1, None);
        song.note_on(1, TrackerNote::NOTE_MIDDLE_C, 1, None);
        song.stop_sample(1);
        assert!(song.voices[..2].iter().all(|v| v.ptr_sample.is_none() && v.length == 0));
    }

    #[test]
    fn test_mute_follows_background_voices() {
        let mut song = Song::new(module(), MixerConfig::default());
        song.voices[80].master_channel = 4;
        song.set_channel_mute(3, true);
        assert!(song.voices[80].flags.contains(VoiceFlags::MUTE));
        song.set_channel_mute(3, false);
        assert!(!song.is_channel_muted(3));
        assert!(!song.voices[80].flags.contains(VoiceFlags::MUTE));
    }

    #[test]
    fn test_step_row_skips_muted_channels() {
        let mut m = module();
        if let Some(Some(p)) = m.patterns.get_mut(0) {
            for ch in [0, 2] {
                if let Some(n) = p.note_mut(4, ch) {
                    *n = TrackerNote::new(TrackerNote::NOTE_MIDDLE_C, 1);
                }
            }
        }
        let mut song = Song::new(m, MixerConfig::default());
        song.step_row(0, 4);
        assert_eq!(song.voices[0].ptr_sample, Some(1));
        assert_eq!(song.voices[2].ptr_sample, None, "channel 3 starts muted");
    }
}
