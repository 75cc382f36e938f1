//! MIDI macro expansion and MIDI note output
//!
//! Macro strings mix hex nibbles with substitution letters:
//!
//! | Letter | Substituted with                          |
//! |--------|-------------------------------------------|
//! | `c`    | MIDI channel (a nibble)                   |
//! | `n`    | note                                      |
//! | `v`    | velocity, 1..=127                         |
//! | `u`    | computed channel volume, 1..=127          |
//! | `x`/`y`| panning / final panning                   |
//! | `a`/`b`| MIDI bank high / low byte                 |
//! | `p`    | MIDI program                              |
//! | `z`    | Zxx parameter                             |
//! | `h`    | host (tracker) channel                    |
//! | `m`    | ping-pong direction                       |
//! | `o`    | raw offset memory                         |
//!
//! The expanded bytes are split into messages with running status. `F0 F0`
//! messages drive the voice's resonant filter instead of leaving the
//! engine.

use std::sync::Arc;

use nether_tracker::{MACRO_LENGTH, MAX_INSTRUMENTS, TrackerNote, VolumeEffect};
use smallvec::SmallVec;
use tracing::trace;

use super::Song;
use crate::voice::VoiceFlags;

/// Expanded macro bytes
type MacroBytes = SmallVec<[u8; 64]>;

/// MIDI note bookkeeping for one tracker channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiOutState {
    /// Sounding note, 0 for none
    pub note: u8,
    /// Instrument that played it
    pub instrument: u8,
    /// Last program sent, -1 before any
    pub program: i32,
    /// Last bank sent, -1 before any
    pub bank: i32,
}

impl Default for MidiOutState {
    fn default() -> Self {
        Self { note: 0, instrument: 0, program: -1, bank: -1 }
    }
}

/// Bytes in a MIDI message starting with `status`
fn midi_event_length(status: u8) -> usize {
    match status & 0xF0 {
        0xC0 | 0xD0 => 2,
        0xF0 => match status {
            0xF1 | 0xF3 => 2,
            0xF2 => 3,
            _ => 1,
        },
        _ => 3,
    }
}

impl Song {
    /// Deliver one MIDI message from channel `nchan`.
    ///
    /// Start, stop and reset messages reset every voice's filter. Internal
    /// filter messages are consumed here; everything else goes to the
    /// sink unless `fake` marks a message for a channel with no MIDI
    /// routing.
    pub(crate) fn midi_send(&mut self, data: &[u8], nchan: usize, fake: bool) {
        if matches!(data.first(), Some(0xFA | 0xFC | 0xFF)) {
            for voice in &mut self.voices {
                voice.cutoff = 0x7F;
                voice.resonance = 0;
            }
        }

        if data.len() >= 4 && data[0] == 0xF0 && data[1] == 0xF0 {
            let rate = self.config.sample_rate;
            let chan = &mut self.voices[nchan];
            let value = data[3] as u32;
            match data[2] {
                0x00 if value < 0x80 => {
                    chan.cutoff = value;
                    let reset = !chan.flags.contains(VoiceFlags::FILTER);
                    chan.setup_filter(reset, 256, rate);
                }
                0x01 if value < 0x80 => {
                    chan.resonance = value;
                    let reset = !chan.flags.contains(VoiceFlags::FILTER);
                    chan.setup_filter(reset, 256, rate);
                }
                _ => {}
            }
        } else if !fake && let Some(sink) = self.midi_sink.as_mut() {
            sink(data, self.buffer_count);
        }
    }

    /// Expand `text` for channel `nchan` and send the resulting messages.
    /// `use_instr` names the instrument for bank/program letters, 0 for
    /// the channel's last instrument.
    pub(crate) fn process_midi_macro(
        &mut self,
        nchan: usize,
        text: &str,
        param: u32,
        note: u32,
        velocity: u32,
        use_instr: usize,
    ) {
        let module = Arc::clone(&self.module);
        let chan = &self.voices[nchan];
        let penv = if module.uses_instruments() && (chan.last_instrument as usize) < MAX_INSTRUMENTS {
            let idx = if use_instr != 0 { use_instr } else { chan.last_instrument as usize };
            module.instrument(idx)
        } else {
            None
        };

        let (midi_channel, fake_channel) = match penv {
            Some(ins) if ins.midi_channel_mask >= 0x10000 => ((nchan.wrapping_sub(1) % 16) as u8, false),
            Some(ins) if ins.midi_channel_mask != 0 => (ins.midi_channel_mask.trailing_zeros() as u8, false),
            _ => (15, true),
        };

        let mut out = MacroBytes::new();
        let mut half: Option<u8> = None;
        let mut saw_channel = false;

        for ch in text.bytes().take(MACRO_LENGTH + 1) {
            let (data, nibble) = match ch {
                b'0'..=b'9' => (ch - b'0', true),
                b'A'..=b'F' => (ch - b'A' + 10, true),
                b'c' => {
                    saw_channel = true;
                    (midi_channel, true)
                }
                b'n' => ((note as u8).wrapping_sub(1), false),
                b'v' => (velocity.clamp(1, 0x7F) as u8, false),
                b'u' => {
                    let v = if chan.flags.contains(VoiceFlags::MUTE) {
                        0
                    } else {
                        (chan.final_volume >> 7).clamp(1, 0x7F) as u8
                    };
                    (v, false)
                }
                b'x' => (chan.panning.clamp(0, 0x7F) as u8, false),
                b'y' => (chan.final_panning.clamp(0, 0x7F) as u8, false),
                b'a' => (penv.filter(|i| i.midi_bank != -1).map_or(0, |i| ((i.midi_bank >> 7) & 0x7F) as u8), false),
                b'b' => (penv.filter(|i| i.midi_bank != -1).map_or(0, |i| (i.midi_bank & 0x7F) as u8), false),
                b'p' => (penv.filter(|i| i.midi_program != -1).map_or(0, |i| (i.midi_program & 0x7F) as u8), false),
                b'z' => (param as u8, false),
                b'h' => ((nchan & 0x7F) as u8, false),
                b'm' => (chan.flags.contains(VoiceFlags::PINGPONG_FLAG) as u8, false),
                b'o' => (((chan.mem_offset >> 8) & 0xFF) as u8, false),
                _ => continue,
            };

            if nibble {
                match half.take() {
                    Some(hi) => out.push((hi << 4) | data),
                    None => half = Some(data),
                }
            } else {
                if let Some(hi) = half.take() {
                    out.push(hi);
                }
                out.push(data);
            }
        }
        if let Some(hi) = half {
            out.push(hi);
        }

        let fake = saw_channel && fake_channel;
        let mut pos = 0;
        let mut running_status = 0u8;
        while pos < out.len() {
            let len = if out[pos] == 0xF0 {
                if out.len() - pos >= 4 && out[pos + 1] == 0xF0 {
                    4
                } else if let Some(end) = out[pos + 1..].iter().position(|&b| b == 0xF7) {
                    end + 2
                } else {
                    // Unterminated SysEx
                    out.push(0xF7);
                    out.len() - pos
                }
            } else if out[pos] & 0x80 == 0 {
                if running_status != 0 {
                    pos -= 1;
                    out[pos] = running_status;
                } else {
                    pos += 1;
                }
                continue;
            } else {
                midi_event_length(out[pos]).min(out.len() - pos)
            };

            if out[pos] < 0xF0 {
                running_status = out[pos];
            }
            let message: MacroBytes = out[pos..pos + len].iter().copied().collect();
            self.midi_send(&message, nchan, fake);
            pos += len;
        }
    }

    /// Track the row's note on `nchan` and mirror it to MIDI through the
    /// note-on, note-off, bank and program macros. Only instruments with a
    /// MIDI channel mask produce output, and only while the General MIDI
    /// driver is not already playing them.
    pub(crate) fn midi_out_note(&mut self, nchan: usize, note: Option<&TrackerNote>) {
        let Some(note) = note else {
            return;
        };
        if nchan >= self.midi_out.len() || self.config.midi_like_tracker || !self.instrument_mode() {
            return;
        }
        if note.note == TrackerNote::NOTE_NONE {
            if note.instrument != 0 {
                self.midi_out[nchan].instrument = note.instrument;
            }
            return;
        }

        let module = Arc::clone(&self.module);
        let config = &module.midi_config;
        let state = self.midi_out[nchan];

        if state.note != 0 {
            self.process_midi_macro(nchan, &config.note_off, 0, state.note as u32, 0, state.instrument as usize);
            self.midi_out[nchan].note = 0;
        }
        if !TrackerNote::is_note(note.note) {
            return;
        }

        let instrument = if note.instrument != 0 { note.instrument } else { state.instrument };
        let Some(ins) = module.instrument(instrument as usize).filter(|i| i.is_midi()) else {
            return;
        };

        if ins.midi_bank != -1 && ins.midi_bank != state.bank && !config.set_bank.is_empty() {
            self.process_midi_macro(nchan, &config.set_bank, 0, 0, 0, instrument as usize);
        }
        if ins.midi_program != -1 && (ins.midi_program != state.program || ins.midi_bank != state.bank) {
            self.process_midi_macro(nchan, &config.set_program, 0, 0, 0, instrument as usize);
        }

        let velocity = match note.vol_effect {
            VolumeEffect::Volume => note.vol_param.min(64) as u32 * 127 / 64,
            _ => 127,
        };
        self.process_midi_macro(nchan, &config.note_on, 0, note.note as u32, velocity, instrument as usize);
        trace!(channel = nchan, note = note.note, instrument, "midi note on");

        self.midi_out[nchan] = MidiOutState {
            note: note.note,
            instrument,
            program: ins.midi_program,
            bank: ins.midi_bank,
        };
    }

    /// Send note-off for every note still tracked as sounding
    pub(crate) fn midi_out_all_off(&mut self) {
        let module = Arc::clone(&self.module);
        for nchan in 0..self.midi_out.len() {
            let state = self.midi_out[nchan];
            if state.note != 0 {
                self.process_midi_macro(
                    nchan,
                    &module.midi_config.note_off,
                    0,
                    state.note as u32,
                    0,
                    state.instrument as usize,
                );
                self.midi_out[nchan].note = 0;
            }
        }
    }

    /// MIDI note bookkeeping for `channel`
    pub fn midi_out_state(&self, channel: usize) -> Option<MidiOutState> {
        self.midi_out.get(channel).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MixerConfig;
    use nether_tracker::{SongFlags, TrackerInstrument, TrackerModule, TrackerSample};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<Vec<u8>>>>;

    fn midi_song() -> (Song, Log) {
        let mut module = TrackerModule::default();
        module.flags = SongFlags::INSTRUMENT_MODE;
        module.samples.push(TrackerSample::from_pcm8(vec![0; 100]));
        let mut ins = TrackerInstrument::for_sample(1);
        ins.midi_channel_mask = 1 << 2;
        ins.midi_program = 5;
        module.instruments.push(ins);
        let mut song = Song::new(module, MixerConfig::default());
        let log: Log = Arc::default();
        let sink_log = Arc::clone(&log);
        song.set_midi_sink(Some(Box::new(move |bytes, _| {
            sink_log.lock().unwrap().push(bytes.to_vec());
        })));
        song.voices[0].last_instrument = 1;
        (song, log)
    }

    #[test]
    fn test_event_lengths() {
        assert_eq!(midi_event_length(0x90), 3);
        assert_eq!(midi_event_length(0xC3), 2);
        assert_eq!(midi_event_length(0xF2), 3);
        assert_eq!(midi_event_length(0xF8), 1);
    }

    #[test]
    fn test_note_on_macro_expands_channel_and_note() {
        let (mut song, log) = midi_song();
        song.process_midi_macro(0, "9c n v", 0, 61, 100, 0);
        assert_eq!(log.lock().unwrap().as_slice(), &[vec![0x92, 60, 100]]);
    }

    #[test]
    fn test_running_status_fills_missing_status() {
        let (mut song, log) = midi_song();
        song.process_midi_macro(0, "90 3C 40 3E 40", 0, 0, 0, 0);
        assert_eq!(log.lock().unwrap().as_slice(), &[vec![0x90, 0x3C, 0x40], vec![0x90, 0x3E, 0x40]]);
    }

    #[test]
    fn test_unterminated_sysex_is_closed() {
        let (mut song, log) = midi_song();
        song.process_midi_macro(0, "F0 41 10", 0, 0, 0, 0);
        assert_eq!(log.lock().unwrap().as_slice(), &[vec![0xF0, 0x41, 0x10, 0xF7]]);
    }

    #[test]
    fn test_filter_macro_sets_cutoff_without_output() {
        let (mut song, log) = midi_song();
        song.process_midi_macro(0, "F0F000z", 0x40, 0, 0, 0);
        assert_eq!(song.voices[0].cutoff, 0x40);
        assert!(song.voices[0].flags.contains(VoiceFlags::FILTER));
        assert!(log.lock().unwrap().is_empty(), "internal macros never reach the sink");

        song.process_midi_macro(0, "FF", 0, 0, 0, 0);
        assert_eq!(song.voices[0].cutoff, 0x7F, "reset reopens the filter");
        assert_eq!(song.voices[0].resonance, 0);
    }

    #[test]
    fn test_unrouted_channel_output_is_dropped() {
        let (mut song, log) = midi_song();
        song.voices[3].last_instrument = 0;
        song.process_midi_macro(3, "9c n v", 0, 61, 100, 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_note_tracking_sends_program_and_note_off() {
        let (mut song, log) = midi_song();
        song.midi_out_note(0, Some(&TrackerNote::new(61, 1)));
        song.midi_out_note(0, None);
        song.midi_out_note(0, Some(&TrackerNote::new(TrackerNote::NOTE_OFF, 0)));
        let log = log.lock().unwrap();
        assert_eq!(log.as_slice(), &[vec![0xC2, 5], vec![0x92, 60, 127], vec![0x92, 60, 0]]);
        assert_eq!(song.midi_out_state(0).map(|s| s.note), Some(0));
    }
}
