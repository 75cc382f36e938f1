//! New Note Actions and duplicate note checks
//!
//! When a channel starts a new note, the note it was playing can move to a
//! background voice (indices `MAX_CHANNELS..MAX_VOICES`) and keep sounding
//! under the old instrument's New Note Action. Before that, Duplicate
//! Check Type/Action may cut, release or fade earlier background copies of
//! the same note, sample or instrument.

use std::sync::Arc;

use nether_tracker::{
    DuplicateCheckAction, DuplicateCheckType, MAX_CHANNELS, MAX_INSTRUMENTS, MAX_SAMPLES, NewNoteAction,
    TrackerNote,
};
use tracing::trace;

use super::Song;
use crate::MAX_VOICES;
use crate::voice::{TickCommand, VoiceFlags};

impl Song {
    /// Pick a background voice to carry a note released from `nchan`.
    ///
    /// Free voices come first. Otherwise the quietest voice is stolen, with
    /// looping voices counting half and ties going to the one furthest into
    /// its volume envelope. `None` when the pool is exhausted.
    pub(crate) fn get_nna_channel(&mut self, nchan: usize) -> Option<usize> {
        for i in MAX_CHANNELS..MAX_VOICES {
            let voice = &mut self.voices[i];
            if voice.length != 0 {
                continue;
            }
            if voice.flags.contains(VoiceFlags::MUTE) {
                if voice.flags.contains(VoiceFlags::NNA_MUTE) {
                    voice.flags.remove(VoiceFlags::NNA_MUTE | VoiceFlags::MUTE);
                } else {
                    continue;
                }
            }
            return Some(i);
        }

        if self.voices[nchan].fadeout_volume == 0 {
            trace!(channel = nchan, "background voice pool exhausted");
            return None;
        }

        let mut result = None;
        let mut quietest: u64 = 64 * 65536;
        let mut envpos = 0xFF_FFFF;
        for j in MAX_CHANNELS..MAX_VOICES {
            let voice = &self.voices[j];
            if voice.fadeout_volume == 0 {
                return Some(j);
            }
            let mut v = voice.volume.max(0) as u64;
            if voice.flags.contains(VoiceFlags::NOTEFADE) {
                v *= voice.fadeout_volume.max(0) as u64;
            } else {
                v <<= 16;
            }
            if voice.flags.contains(VoiceFlags::LOOP) {
                v >>= 1;
            }
            if v < quietest || (v == quietest && voice.vol_env_position > envpos) {
                envpos = voice.vol_env_position;
                quietest = v;
                result = Some(j);
            }
        }

        match result {
            Some(j) => self.voices[j].flags.remove(VoiceFlags::MUTE | VoiceFlags::NNA_MUTE),
            None => trace!(channel = nchan, "no background voice quiet enough to steal"),
        }
        result
    }

    /// Move the note playing on `nchan` into background voice `n` and
    /// silence the channel so it can start fresh.
    fn move_to_background(&mut self, nchan: usize, n: usize) {
        let mut copy = self.voices[nchan].clone();
        copy.flags.remove(VoiceFlags::VIBRATO | VoiceFlags::TREMOLO | VoiceFlags::PORTAMENTO);
        copy.panbrello_delta = 0;
        copy.tremolo_delta = 0;
        copy.master_channel = nchan + 1;
        copy.n_command = TickCommand::None;
        self.voices[n] = copy;
    }

    /// Apply duplicate checks and the New Note Action before `note` starts
    /// on `nchan` with instrument `instr` (0 keeps the current one).
    /// `force_cut` always moves the old note out with a fast fade.
    pub(crate) fn check_nna(&mut self, nchan: usize, instr: u32, note: u8, force_cut: bool) {
        if !TrackerNote::is_note(note) {
            return;
        }
        let module = Arc::clone(&self.module);
        let instrument_mode = module.uses_instruments();

        if force_cut || !instrument_mode {
            let chan = &self.voices[nchan];
            if chan.length == 0
                || chan.flags.contains(VoiceFlags::MUTE)
                || (chan.left_volume == 0 && chan.right_volume == 0)
            {
                return;
            }
            let Some(n) = self.get_nna_channel(nchan) else {
                return;
            };
            self.move_to_background(nchan, n);
            let p = &mut self.voices[n];
            p.fadeout_volume = 0;
            p.flags.insert(VoiceFlags::NOTEFADE | VoiceFlags::FAST_VOLUME_RAMP);

            let chan = &mut self.voices[nchan];
            chan.silence();
            if chan.flags.contains(VoiceFlags::ADLIB) {
                self.opl.note_off(nchan);
                self.opl.touch(nchan, 0);
            }
            self.gm.key_off(nchan);
            self.gm.touch(nchan, 0);
            return;
        }

        let instr = if (instr as usize) < MAX_INSTRUMENTS { instr as usize } else { 0 };
        let mut data = self.voices[nchan].current_sample_data.clone();
        let ptr_instrument = if instr > 0 {
            module.instrument(instr).map(|_| instr)
        } else {
            self.voices[nchan].ptr_instrument
        };
        if let Some(ins) = ptr_instrument.and_then(|i| module.instrument(i)) {
            let n = ins.sample_map[note as usize - 1] as usize;
            if n > 0 && n < MAX_SAMPLES {
                data = module.sample(n).map(|s| s.data.clone());
            } else {
                return;
            }
        }

        if self.voices[nchan].ptr_instrument.is_none() {
            return;
        }

        for i in nchan..MAX_VOICES {
            let p = &self.voices[i];
            let related = (i >= MAX_CHANNELS || i == nchan) && (p.master_channel == nchan + 1 || i == nchan);
            let Some(p_ins) = p.ptr_instrument.and_then(|x| module.instrument(x)).filter(|_| related) else {
                continue;
            };
            let same_instrument = ptr_instrument == p.ptr_instrument;
            let duplicate = match p_ins.dct {
                DuplicateCheckType::Off => false,
                DuplicateCheckType::Note => p.note == note && same_instrument,
                DuplicateCheckType::Sample => {
                    same_instrument
                        && matches!((&data, &p.current_sample_data), (Some(a), Some(b)) if a.same_buffer(b))
                }
                DuplicateCheckType::Instrument => same_instrument,
            };
            if !duplicate {
                continue;
            }

            match p_ins.dca {
                DuplicateCheckAction::Cut => self.note_cut(i, true),
                DuplicateCheckAction::NoteOff => self.key_off(i),
                DuplicateCheckAction::NoteFade => self.voices[i].flags.insert(VoiceFlags::NOTEFADE),
            }
            let p = &mut self.voices[i];
            if p.volume == 0 {
                p.fadeout_volume = 0;
                p.flags.insert(VoiceFlags::NOTEFADE | VoiceFlags::FAST_VOLUME_RAMP);
            }
        }

        let chan = &self.voices[nchan];
        if chan.flags.contains(VoiceFlags::MUTE) || chan.increment == 0 || chan.length == 0 {
            return;
        }
        let Some(n) = self.get_nna_channel(nchan) else {
            return;
        };
        self.move_to_background(nchan, n);
        match NewNoteAction::from_u8(self.voices[nchan].nna) {
            NewNoteAction::NoteOff => self.key_off(n),
            NewNoteAction::Cut => {
                let p = &mut self.voices[n];
                p.fadeout_volume = 0;
                p.flags.insert(VoiceFlags::NOTEFADE);
            }
            NewNoteAction::NoteFade => self.voices[n].flags.insert(VoiceFlags::NOTEFADE),
            NewNoteAction::Continue => {}
        }
        let p = &mut self.voices[n];
        if p.volume == 0 {
            p.fadeout_volume = 0;
            p.flags.insert(VoiceFlags::NOTEFADE | VoiceFlags::FAST_VOLUME_RAMP);
        }

        let chan = &mut self.voices[nchan];
        chan.length = 0;
        chan.position = 0;
        chan.left_ofs = 0;
        chan.right_ofs = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MixerConfig;
    use nether_tracker::{SongFlags, TrackerInstrument, TrackerModule, TrackerSample};

    fn instrument_module(nna: NewNoteAction, dct: DuplicateCheckType) -> TrackerModule {
        let mut module = TrackerModule::default();
        module.flags = SongFlags::INSTRUMENT_MODE;
        module.samples.push(TrackerSample::from_pcm8(vec![50; 4000]).with_loop(0, 4000, false));
        let mut ins = TrackerInstrument::for_sample(1);
        ins.nna = nna;
        ins.dct = dct;
        module.instruments.push(ins);
        module
    }

    fn play(song: &mut Song, nchan: usize, note: u8) {
        song.check_nna(nchan, 1, note, false);
        song.voices[nchan].new_note = note;
        song.instrument_change(nchan, 1, false, true);
        song.note_change(nchan, note, false, false, true);
        song.voices[nchan].increment = 0x10000;
        song.voices[nchan].left_volume = 100;
        song.voices[nchan].right_volume = 100;
    }

    fn background(song: &Song) -> Vec<usize> {
        (MAX_CHANNELS..MAX_VOICES).filter(|&i| song.voices[i].length > 0).collect()
    }

    #[test]
    fn test_continue_leaves_one_background_voice() {
        let mut song = Song::new(instrument_module(NewNoteAction::Continue, DuplicateCheckType::Off), MixerConfig::default());
        play(&mut song, 0, 61);
        play(&mut song, 0, 65);
        let bg = background(&song);
        assert_eq!(bg.len(), 1, "the first note moved to the background");
        let v = &song.voices[bg[0]];
        assert_eq!(v.master_channel, 1);
        assert_eq!(v.note, 61);
        assert!(!v.flags.contains(VoiceFlags::NOTEFADE), "continue keeps it at full volume");
        assert_eq!(song.voices[0].note, 65);
    }

    #[test]
    fn test_cut_action_fades_immediately() {
        let mut song = Song::new(instrument_module(NewNoteAction::Cut, DuplicateCheckType::Off), MixerConfig::default());
        play(&mut song, 0, 61);
        play(&mut song, 0, 65);
        let bg = background(&song);
        assert_eq!(bg.len(), 1);
        assert_eq!(song.voices[bg[0]].fadeout_volume, 0);
        assert!(song.voices[bg[0]].flags.contains(VoiceFlags::NOTEFADE));
    }

    #[test]
    fn test_duplicate_note_is_cut() {
        let mut song = Song::new(instrument_module(NewNoteAction::Continue, DuplicateCheckType::Note), MixerConfig::default());
        play(&mut song, 0, 61);
        play(&mut song, 0, 65);
        play(&mut song, 0, 61);
        let bg = background(&song);
        assert_eq!(bg.len(), 1, "the earlier C-5 was cut, only E-5 remains");
        assert_eq!(song.voices[bg[0]].note, 65);
    }

    #[test]
    fn test_sample_mode_always_fades_old_note() {
        let mut module = TrackerModule::default();
        module.samples.push(TrackerSample::from_pcm8(vec![50; 4000]));
        let mut song = Song::new(module, MixerConfig::default());
        play(&mut song, 3, 61);
        play(&mut song, 3, 61);
        let bg = background(&song);
        assert_eq!(bg.len(), 1);
        assert_eq!(song.voices[bg[0]].master_channel, 4);
        assert!(song.voices[bg[0]].flags.contains(VoiceFlags::NOTEFADE | VoiceFlags::FAST_VOLUME_RAMP));
    }

    #[test]
    fn test_pool_exhaustion_steals_quietest() {
        let mut song = Song::new(instrument_module(NewNoteAction::Continue, DuplicateCheckType::Off), MixerConfig::default());
        for i in MAX_CHANNELS..MAX_VOICES {
            let v = &mut song.voices[i];
            v.length = 100;
            v.fadeout_volume = 65536;
            v.volume = 200;
        }
        song.voices[100].volume = 10;
        song.voices[0].fadeout_volume = 65536;
        assert_eq!(song.get_nna_channel(0), Some(100));

        song.voices[0].fadeout_volume = 0;
        song.voices[100].volume = 200;
        assert_eq!(song.get_nna_channel(0), None, "a silent note is not worth a voice");
    }
}
