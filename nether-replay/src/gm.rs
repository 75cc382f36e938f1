//! General MIDI output for instruments routed to a MIDI channel mask.
//!
//! Tracker voices are mapped onto the 16 MIDI channels. Channel 9 is
//! reserved for percussion; melodic notes pick the best scoring free
//! channel that the instrument's channel mask allows. Per-channel state
//! is cached so that only changes produce MIDI traffic.
//!
//! The driver never talks to a device. Messages are queued in an outbox
//! that the song drains through its MIDI send path.

use smallvec::{SmallVec, smallvec};

use crate::MAX_VOICES;

/// A single short MIDI message
pub type MidiMessage = SmallVec<[u8; 4]>;

const MIDI_CHANNELS: usize = 16;
const PERCUSSION_CHANNEL: u8 = 9;
const PITCH_BEND_CENTER: i32 = 0x2000;
/// One octave of bend range in either direction
const SEMITONE_BEND_DEPTH: i32 = 0x2000 / 12;

const CC_BANK_SELECT: u8 = 0;
const CC_DATA_ENTRY: u8 = 6;
const CC_VOLUME: u8 = 7;
const CC_PAN: u8 = 10;
const CC_DATA_ENTRY_LSB: u8 = 38;
const CC_RPN: u8 = 100;
const CC_ALL_SOUND_OFF: u8 = 120;
const CC_RESET_CONTROLLERS: u8 = 121;
const CC_ALL_NOTES_OFF: u8 = 123;
const RPN_RESET: u32 = 0x4080;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VoiceRoute {
    note: u8,
    /// Bit 7 marks a percussion patch
    patch: u8,
    bank: u8,
    pan: i8,
    channel: Option<u8>,
    channel_mask: u32,
}

impl Default for VoiceRoute {
    fn default() -> Self {
        Self {
            note: 0,
            patch: 0,
            bank: 0,
            pan: 0,
            channel: None,
            channel_mask: u32::MAX,
        }
    }
}

impl VoiceRoute {
    fn active_channel(&self) -> Option<u8> {
        self.channel.filter(|_| self.note != 0)
    }

    fn is_percussion(&self) -> bool {
        self.patch & 0x80 != 0 || self.channel_mask & (1 << PERCUSSION_CHANNEL) != 0
    }
}

/// Last values sent on a MIDI channel. `None` means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChannelState {
    volume: Option<u8>,
    patch: Option<u8>,
    bank: Option<u8>,
    bend: i32,
    pan: i8,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            volume: None,
            patch: None,
            bank: None,
            bend: PITCH_BEND_CENTER,
            pan: 0,
        }
    }
}

/// General MIDI voice router
#[derive(Debug, Clone)]
pub struct GmDriver {
    enabled: bool,
    voices: Box<[VoiceRoute; MAX_VOICES]>,
    channels: [ChannelState; MIDI_CHANNELS],
    song_counter: f64,
    running_status: u8,
    outbox: Vec<MidiMessage>,
}

impl Default for GmDriver {
    fn default() -> Self {
        Self::new(false)
    }
}

impl GmDriver {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            voices: Box::new([VoiceRoute::default(); MAX_VOICES]),
            channels: [ChannelState::default(); MIDI_CHANNELS],
            song_counter: 0.0,
            running_status: 0,
            outbox: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turn message output on or off. Routing state is tracked either way.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Take every message queued since the last drain
    pub fn drain(&mut self) -> std::vec::Drain<'_, MidiMessage> {
        self.outbox.drain(..)
    }

    fn send(&mut self, msg: MidiMessage) {
        if !self.enabled {
            return;
        }
        match msg.first().copied() {
            Some(status @ 0x80..=0xEF) => self.running_status = status,
            Some(0xF0..=0xF7) => self.running_status = 0,
            _ => {}
        }
        self.outbox.push(msg);
    }

    fn ctrl(&mut self, mc: u8, cc: u8, value: u8) {
        self.send(smallvec![0xB0 + mc, cc, value & 0x7F]);
    }

    fn note_on_raw(&mut self, mc: u8, key: u8, velocity: u8) {
        self.send(smallvec![0x90 + mc, key & 0x7F, velocity & 0x7F]);
    }

    /// Note-off, or a zero velocity note-on while running status allows it
    fn note_off_raw(&mut self, mc: u8, key: u8) {
        if self.running_status == 0x90 + mc {
            self.note_on_raw(mc, key, 0);
        } else {
            self.send(smallvec![0x80 + mc, key & 0x7F, 0]);
        }
    }

    fn send_rpn(&mut self, mc: u8, param: u32, hi: u8, lo: u8) {
        self.ctrl(mc, CC_RPN + 1, (param >> 7) as u8);
        self.ctrl(mc, CC_RPN, (param & 0x80) as u8);
        if param != RPN_RESET {
            self.ctrl(mc, CC_DATA_ENTRY, hi);
            if lo != 0 {
                self.ctrl(mc, CC_DATA_ENTRY_LSB, lo);
            }
        }
    }

    fn set_channel_volume(&mut self, mc: u8, volume: u8) {
        let state = &mut self.channels[mc as usize];
        if state.volume != Some(volume) {
            state.volume = Some(volume);
            self.ctrl(mc, CC_VOLUME, volume);
        }
    }

    fn set_channel_patch(&mut self, mc: u8, patch: u8, bank: u8) {
        if self.channels[mc as usize].bank != Some(bank) {
            self.channels[mc as usize].bank = Some(bank);
            self.ctrl(mc, CC_BANK_SELECT, bank);
        }
        if self.channels[mc as usize].patch != Some(patch) {
            self.channels[mc as usize].patch = Some(patch);
            self.send(smallvec![0xC0 + mc, patch & 0x7F]);
        }
    }

    fn set_channel_bend(&mut self, mc: u8, bend: i32) {
        let state = &mut self.channels[mc as usize];
        if state.bend != bend {
            state.bend = bend;
            self.send(smallvec![0xE0 + mc, (bend & 0x7F) as u8, ((bend >> 7) & 0x7F) as u8]);
        }
    }

    fn set_channel_pan(&mut self, mc: u8, pan: i8) {
        let state = &mut self.channels[mc as usize];
        if state.pan != pan {
            state.pan = pan;
            self.ctrl(mc, CC_PAN, ((pan as i32 + 128) / 2) as u8);
        }
    }

    /// Pick a melodic MIDI channel for `key` on `voice`.
    ///
    /// A mask of 0x10000 or more pins the voice to `voice % 16`.
    fn allocate_melody_channel(&self, voice: usize, patch: u8, bank: u8, key: u8, mask: u32) -> u8 {
        let mut used = [false; MIDI_CHANNELS];
        let mut same_key = [false; MIDI_CHANNELS];
        for route in self.voices.iter().filter(|r| !r.is_percussion()) {
            if let Some(mc) = route.active_channel() {
                used[mc as usize] = true;
                if route.note == key {
                    same_key[mc as usize] = true;
                }
            }
        }

        let home = (voice % MIDI_CHANNELS) as u8;
        let mut best = home;
        let mut best_score = -999;
        for mc in 0..MIDI_CHANNELS as u8 {
            if mc == PERCUSSION_CHANNEL {
                continue;
            }
            let allowed = if mask >= 0x10000 { mc == home } else { mask & (1 << mc) != 0 };
            if !allowed {
                continue;
            }

            let state = &self.channels[mc as usize];
            let mut score = 0;
            if state.patch.is_some() {
                if state.patch != Some(patch) {
                    score -= 4;
                }
                if state.bank != Some(bank) {
                    score -= 6;
                }
            }
            if same_key[mc as usize] {
                score -= 9;
            }
            if !used[mc as usize] {
                score += 2;
            }
            if score > best_score {
                best_score = score;
                best = mc;
            }
        }
        best
    }

    /// Select program, bank and channel mask for a voice. Nothing is sent
    /// until the next key-on.
    pub fn dpatch(&mut self, voice: usize, program: u8, bank: u8, channel_mask: u32) {
        if let Some(route) = self.voices.get_mut(voice) {
            route.patch = program;
            route.bank = bank;
            route.channel_mask = channel_mask;
        }
    }

    pub fn key_on(&mut self, voice: usize, key: u8, volume: u8) {
        if voice >= MAX_VOICES {
            return;
        }
        self.key_off(voice);
        let route = self.voices[voice];
        if route.active_channel().is_some() {
            return;
        }
        let volume = volume.min(127);

        if route.is_percussion() {
            let percussion_key = if route.patch & 0x80 != 0 { route.patch - 128 } else { key };
            let mc = PERCUSSION_CHANNEL;
            self.voices[voice].channel = Some(mc);
            self.set_channel_patch(mc, route.patch, route.bank);
            self.set_channel_pan(mc, route.pan);
            self.set_channel_volume(mc, volume);
            self.voices[voice].note = percussion_key;
            self.note_on_raw(mc, percussion_key, 127);
        } else {
            let mc = self.allocate_melody_channel(voice, route.patch, route.bank, key, route.channel_mask);
            self.voices[voice].channel = Some(mc);
            self.set_channel_patch(mc, route.patch, route.bank);
            self.set_channel_volume(mc, volume);
            self.voices[voice].note = key;
            self.note_on_raw(mc, key, 127);
            self.set_channel_pan(mc, route.pan);
        }
    }

    /// Release the key on a voice. The channel bend is left alone so
    /// sustained tails do not jump.
    pub fn key_off(&mut self, voice: usize) {
        let Some(route) = self.voices.get(voice).copied() else {
            return;
        };
        let Some(mc) = route.active_channel() else {
            return;
        };
        self.note_off_raw(mc, route.note);
        let route = &mut self.voices[voice];
        route.channel = None;
        route.note = 0;
        route.pan = 0;
    }

    /// Channel volume for a sounding voice
    pub fn touch(&mut self, voice: usize, volume: u8) {
        if let Some(mc) = self.voices.get(voice).and_then(VoiceRoute::active_channel) {
            self.set_channel_volume(mc, volume.min(127));
        }
    }

    pub fn bend(&mut self, voice: usize, bend: i32) {
        if let Some(mc) = self.voices.get(voice).and_then(VoiceRoute::active_channel) {
            self.set_channel_bend(mc, bend);
        }
    }

    /// Store the voice pan (-128..=127) and apply it if a note is sounding
    pub fn pan(&mut self, voice: usize, pan: i32) {
        let Some(route) = self.voices.get_mut(voice) else {
            return;
        };
        let pan = pan.clamp(-128, 127) as i8;
        route.pan = pan;
        if let Some(mc) = route.active_channel() {
            self.set_channel_pan(mc, pan);
        }
    }

    /// Follow a voice's frequency and volume. Starts a note on the nearest
    /// key when nothing is sounding, then bends towards the exact pitch.
    pub fn set_freq_and_vol(&mut self, voice: usize, hertz: i32, volume: i32, keyoff: bool) {
        if voice >= MAX_VOICES || hertz <= 0 {
            return;
        }
        // Voice frequencies run five octaves above MIDI pitch
        let midi_note = 69.0 + 12.0 * (hertz as f64 / 440.0).log2() - 60.0;
        let volume = volume.clamp(0, 127) as u8;

        let mut note = self.voices[voice].note as i32;
        if self.voices[voice].active_channel().is_none() && !keyoff {
            note = ((midi_note + 0.5) as i32).clamp(1, 127);
            self.key_on(voice, note as u8, volume);
        }

        if !self.voices[voice].is_percussion() {
            let bend = ((midi_note - note as f64) * SEMITONE_BEND_DEPTH as f64) as i32 + PITCH_BEND_CENTER;
            self.bend(voice, bend.clamp(0, 0x3FFF));
        }
        self.touch(voice, volume);
    }

    /// Silence everything and reprogram the bend range. With `quitting`
    /// the range returns to the usual single semitone.
    pub fn reset(&mut self, quitting: bool) {
        for voice in 0..MAX_VOICES {
            self.key_off(voice);
            self.voices[voice] = VoiceRoute::default();
        }

        let semitones_x128 = if quitting { 128 } else { 128 * 0x2000 / SEMITONE_BEND_DEPTH };
        for mc in 0..MIDI_CHANNELS as u8 {
            self.ctrl(mc, CC_ALL_SOUND_OFF, 0);
            self.ctrl(mc, CC_ALL_NOTES_OFF, 0);
            self.ctrl(mc, CC_RESET_CONTROLLERS, 0);
            self.set_channel_pan(mc, 0);
            self.set_channel_volume(mc, 127);
            self.set_channel_bend(mc, PITCH_BEND_CENTER);
            self.channels[mc as usize] = ChannelState::default();

            self.send_rpn(mc, 0, (semitones_x128 / 128) as u8, (semitones_x128 % 128) as u8);
            self.send_rpn(mc, RPN_RESET, 0, 0);
        }
        self.song_counter = 0.0;
        self.running_status = 0;
    }

    pub fn song_start(&mut self) {
        self.send(smallvec![0xFA]);
        self.song_counter = 0.0;
    }

    pub fn song_stop(&mut self) {
        self.send(smallvec![0xFC]);
        self.song_counter = 0.0;
    }

    pub fn song_continue(&mut self) {
        self.send(smallvec![0xFB]);
        self.song_counter = 0.0;
    }

    /// Song position pointer in sixteenth notes
    pub fn song_position(&mut self, sixteenths: u32) {
        self.send(smallvec![0xF2, (sixteenths & 0x7F) as u8, ((sixteenths >> 7) & 0x7F) as u8]);
        self.song_counter = 0.0;
    }

    /// Advance the MIDI clock by `samples` output frames. One tracker tick
    /// is one clock pulse; a tick lasts `5 * rate / (2 * tempo)` frames.
    pub fn increment_song_counter(&mut self, samples: u32, mix_rate: u32, tempo: u32) {
        if tempo == 0 {
            return;
        }
        let tick_length = (5 * mix_rate) as f64 / (2 * tempo) as f64;
        self.song_counter += samples as f64 / tick_length;
        let ticks = self.song_counter as u32;
        for _ in 0..ticks {
            self.send(smallvec![0xF8]);
        }
        self.song_counter -= ticks as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(gm: &mut GmDriver) -> Vec<Vec<u8>> {
        gm.drain().map(|m| m.to_vec()).collect()
    }

    #[test]
    fn test_disabled_driver_stays_quiet() {
        let mut gm = GmDriver::new(false);
        gm.dpatch(0, 5, 0, 1);
        gm.key_on(0, 60, 100);
        assert!(messages(&mut gm).is_empty());
        assert_eq!(gm.voices[0].active_channel(), Some(0), "routing is tracked anyway");
    }

    #[test]
    fn test_melody_never_uses_percussion_channel() {
        let mut gm = GmDriver::new(true);
        for voice in 0..32 {
            gm.dpatch(voice, 1, 0, 0xFFFF & !(1 << 9));
            gm.key_on(voice, 40 + voice as u8, 100);
            assert_ne!(gm.voices[voice].active_channel(), Some(PERCUSSION_CHANNEL));
        }
    }

    #[test]
    fn test_percussion_goes_to_channel_9() {
        let mut gm = GmDriver::new(true);
        gm.dpatch(3, 0x80 + 36, 0, 0xFFFF);
        gm.key_on(3, 60, 90);
        let msgs = messages(&mut gm);
        assert!(msgs.contains(&vec![0x99, 36, 127]), "patch selects the drum key: {msgs:?}");
    }

    #[test]
    fn test_key_off_sends_note_off() {
        let mut gm = GmDriver::new(true);
        gm.dpatch(0, 0, 0, 1);
        gm.key_on(0, 64, 127);
        gm.drain();
        gm.key_off(0);
        assert_eq!(messages(&mut gm), vec![vec![0x90, 64, 0]], "running status note-on");
        gm.key_off(0);
        assert!(messages(&mut gm).is_empty(), "second key off is a no-op");

        gm.key_on(0, 65, 127);
        gm.touch(0, 20);
        gm.drain();
        gm.key_off(0);
        assert_eq!(messages(&mut gm), vec![vec![0x80, 65, 0]], "controller broke running status");
    }

    #[test]
    fn test_unused_channel_preferred_over_busy_one() {
        let mut gm = GmDriver::new(true);
        gm.dpatch(0, 0, 0, 0b11);
        gm.dpatch(1, 0, 0, 0b11);
        gm.key_on(0, 60, 100);
        gm.key_on(1, 60, 100);
        assert_ne!(gm.voices[0].channel, gm.voices[1].channel);
    }

    #[test]
    fn test_channel_state_suppresses_repeats() {
        let mut gm = GmDriver::new(true);
        gm.dpatch(0, 0, 0, 1);
        gm.key_on(0, 60, 100);
        gm.drain();
        gm.touch(0, 100);
        assert!(messages(&mut gm).is_empty(), "volume unchanged");
        gm.touch(0, 50);
        assert_eq!(messages(&mut gm), vec![vec![0xB0, CC_VOLUME, 50]]);
    }

    #[test]
    fn test_freq_and_vol_bends_towards_pitch() {
        let mut gm = GmDriver::new(true);
        gm.dpatch(0, 0, 0, 1);
        // A4 at five octaves up lands exactly on key 69
        gm.set_freq_and_vol(0, 440 * 32, 100, false);
        assert_eq!(gm.voices[0].note, 69);
        assert_eq!(gm.channels[0].bend, PITCH_BEND_CENTER, "exact pitch needs no bend");

        // a quarter tone sharp bends up without retriggering
        let sharp = (440.0 * 32.0 * 2f64.powf(0.5 / 12.0)) as i32;
        gm.set_freq_and_vol(0, sharp, 100, false);
        assert_eq!(gm.voices[0].note, 69);
        assert!(gm.channels[0].bend > PITCH_BEND_CENTER);
    }

    #[test]
    fn test_reset_reprograms_bend_range() {
        let mut gm = GmDriver::new(true);
        gm.reset(false);
        let msgs = messages(&mut gm);
        assert!(msgs.contains(&vec![0xB0, CC_DATA_ENTRY, 12]), "twelve semitone range");
        assert!(msgs.contains(&vec![0xBF, CC_ALL_SOUND_OFF, 0]));

        gm.reset(true);
        let msgs = messages(&mut gm);
        assert!(msgs.contains(&vec![0xB0, CC_DATA_ENTRY, 1]));
    }

    #[test]
    fn test_song_counter_emits_clock() {
        let mut gm = GmDriver::new(true);
        // 44100 Hz at tempo 125 gives 882 frames per tick
        gm.increment_song_counter(882 * 3 + 10, 44100, 125);
        assert_eq!(messages(&mut gm), vec![vec![0xF8]; 3]);
        gm.increment_song_counter(880, 44100, 125);
        assert_eq!(messages(&mut gm).len(), 1, "remainder carries over");
    }
}
