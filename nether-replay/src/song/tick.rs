//! Tick and row sequencing
//!
//! Each tick counts down toward the next row; each row counts down (for
//! SEx row delays) toward reading a fresh row from the current pattern.
//! When a pattern runs out the order list is advanced, skipping `+++`
//! entries and wrapping or stopping at `---` according to the repeat count.

use nether_tracker::{MAX_CHANNELS, MAX_PATTERNS, ORDER_LAST, ORDER_SKIP, TrackerNote};
use tracing::{debug, trace};

use super::{PROCESS_NEXT_ORDER, PlayFlags, Song};
use crate::voice::{TickCommand, VoiceFlags};

impl Song {
    /// Bump the repeat counter at the end of the song. False means this
    /// was the last pass.
    fn count_repeat(&mut self) -> bool {
        self.repeat_count = self.repeat_count.wrapping_add(1);
        if self.repeat_count == 0 {
            self.process_row = PROCESS_NEXT_ORDER;
            return false;
        }
        true
    }

    /// Move to the next order (or restart the looped pattern). False when
    /// the song is over.
    fn increment_order(&mut self) -> bool {
        self.process_row = self.break_row;
        self.break_row = 0;

        if self.flags.contains(PlayFlags::PATTERN_LOOP) {
            // process_order only marks that the loop already started once
            if self.process_order != 0 {
                if !self.count_repeat() {
                    debug!(pattern = self.current_pattern, "pattern loop finished");
                    return false;
                }
            } else {
                self.process_order = 1;
            }
        } else if !self.flags.contains(PlayFlags::ORDER_LOCKED) {
            loop {
                self.process_order = self.process_order.wrapping_add(1);
                if self.module.order(self.process_order as usize) != ORDER_SKIP {
                    break;
                }
            }

            if self.module.order(self.process_order as usize) == ORDER_LAST {
                if !self.count_repeat() {
                    debug!(order = self.process_order, "end of order list");
                    return false;
                }
                debug!(repeat = self.repeat_count, "order list wrapped");
                self.process_order = 0;
                while self.module.order(self.process_order as usize) == ORDER_SKIP {
                    self.process_order += 1;
                }
            }

            let pattern = self.module.order(self.process_order as usize);
            if pattern as usize >= MAX_PATTERNS {
                self.process_row = PROCESS_NEXT_ORDER;
                return false;
            }
            self.current_order = self.process_order;
            self.current_pattern = pattern as u32;
        }
        // Cxx past the end of the destination pattern starts it from the top
        if self.process_row >= self.current_pattern_rows() {
            self.process_row = 0;
        }
        true
    }

    /// Rows in the pattern being played; missing patterns play as blank
    /// 64-row patterns.
    pub(crate) fn current_pattern_rows(&self) -> u32 {
        self.module.pattern_rows(self.current_pattern as usize) as u32
    }

    /// Advance one tick: read a new row when the row's ticks are used up,
    /// then run the effects. False once the song is over.
    pub(crate) fn process_tick(&mut self) -> bool {
        self.flags.remove(PlayFlags::FIRST_TICK);

        self.tick_count = self.tick_count.saturating_sub(1);
        if self.tick_count != 0 {
            for nchan in 0..MAX_CHANNELS {
                self.midi_out_note(nchan, None);
                self.notify_note(nchan, None);
            }
            self.process_effects(false);
            return true;
        }

        self.tick_count = self.current_speed;
        self.row_count -= 1;
        if self.row_count <= 0 {
            self.row_count = 0;
            self.process_row = self.process_row.wrapping_add(1);
            if self.process_row >= self.current_pattern_rows() && !self.increment_order() {
                return false;
            }
            self.row = self.process_row;
            self.frame_delay = 0;
            self.flags.insert(PlayFlags::FIRST_TICK);
            trace!(order = self.current_order, pattern = self.current_pattern, row = self.row, "row");
        }

        let module = std::sync::Arc::clone(&self.module);
        let row = module
            .pattern(self.current_pattern as usize)
            .and_then(|p| p.row(self.row as u16));
        let blank = TrackerNote::default();

        for nchan in 0..MAX_CHANNELS {
            let note = row.and_then(|r| r.get(nchan)).unwrap_or(&blank);
            self.midi_out_note(nchan, Some(note));
            self.notify_note(nchan, Some(note));

            let chan = &mut self.voices[nchan];
            chan.row_note = note.note;
            if note.instrument != 0 {
                chan.last_instrument = note.instrument;
            }
            chan.row_instr = note.instrument;
            chan.row_vol_effect = note.vol_effect;
            chan.row_vol_param = note.vol_param;
            chan.row_effect = note.effect;
            chan.row_param = note.param;

            chan.left_volume = chan.left_volume_new;
            chan.right_volume = chan.right_volume_new;
            chan.flags.remove(VoiceFlags::PORTAMENTO | VoiceFlags::VIBRATO | VoiceFlags::TREMOLO);
            chan.n_command = TickCommand::None;
        }

        self.process_effects(true);
        true
    }

    fn notify_note(&mut self, nchan: usize, note: Option<&TrackerNote>) {
        if let Some(callback) = self.note_callback.as_mut() {
            callback(nchan, note);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::MixerConfig;
    use nether_tracker::{Effect, TrackerModule, TrackerPattern};

    fn module(orders: &[u8], rows: u16) -> TrackerModule {
        let mut module = TrackerModule::default();
        module.orders = orders.to_vec();
        for &o in orders {
            if (o as usize) < MAX_PATTERNS {
                module.set_pattern(o as usize, TrackerPattern::empty(rows));
            }
        }
        module
    }

    fn playing(module: TrackerModule, repeat: i32) -> Song {
        let mut song = Song::new(module, MixerConfig::default());
        song.start();
        song.set_repeat_count(repeat);
        song
    }

    /// Run whole rows and collect (order, row) on each first tick
    fn rows(song: &mut Song, ticks: usize) -> Vec<(u32, u32)> {
        let mut seen = Vec::new();
        for _ in 0..ticks {
            if !song.process_tick() {
                break;
            }
            if song.first_tick() {
                seen.push((song.current_order, song.row));
            }
        }
        seen
    }

    #[test]
    fn test_rows_advance_every_speed_ticks() {
        let mut song = playing(module(&[0], 4), -1);
        song.current_speed = 3;
        song.tick_count = 1;
        let seen = rows(&mut song, 12);
        assert_eq!(seen, vec![(0, 0), (0, 1), (0, 2), (0, 3)], "one row per three ticks");
    }

    #[test]
    fn test_skip_orders_are_passed_over() {
        let mut song = playing(module(&[0, ORDER_SKIP, 1], 2), -1);
        song.current_speed = 1;
        let seen = rows(&mut song, 10);
        assert_eq!(seen, vec![(0, 0), (0, 1), (2, 0), (2, 1)]);
        assert_eq!(song.repeat_count, 0, "the single pass is used up after order 2");
    }

    #[test]
    fn test_repeat_forever_wraps_to_first_order() {
        let mut song = playing(module(&[0, 1], 1), 0);
        song.current_speed = 1;
        let seen = rows(&mut song, 5);
        assert_eq!(seen, vec![(0, 0), (1, 0), (0, 0), (1, 0), (0, 0)]);
        assert_eq!(song.repeat_count, 2, "two completed passes");
    }

    #[test]
    fn test_missing_pattern_plays_as_blank() {
        let mut m = TrackerModule::default();
        m.orders = vec![5];
        let mut song = playing(m, -1);
        song.current_speed = 1;
        let seen = rows(&mut song, 100);
        assert_eq!(seen.len(), 64, "an unallocated pattern lasts 64 rows");
    }

    #[test]
    fn test_pattern_break_jumps_to_row() {
        let mut m = module(&[0, 1], 4);
        if let Some(Some(p)) = m.patterns.get_mut(0)
            && let Some(n) = p.note_mut(0, 0)
        {
            n.effect = Effect::PatternBreak;
            n.param = 2;
        }
        let mut song = playing(m, -1);
        song.current_speed = 1;
        let seen = rows(&mut song, 3);
        assert_eq!(seen, vec![(0, 0), (1, 2), (1, 3)]);
    }

    #[test]
    fn test_pattern_loop_mode_repeats_one_pattern() {
        let mut song = Song::new(module(&[0, 1], 2), MixerConfig::default());
        song.loop_pattern(1, 0);
        song.current_speed = 1;
        song.tick_count = 1;
        let mut patterns = Vec::new();
        for _ in 0..6 {
            assert!(song.process_tick());
            patterns.push((song.current_pattern, song.row));
        }
        assert_eq!(patterns, vec![(1, 0), (1, 1), (1, 0), (1, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn test_note_callback_sees_rows_then_none() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut song = playing(module(&[0], 2), -1);
        song.current_speed = 2;
        song.set_note_callback(Some(Box::new(move |nchan, note| {
            if nchan == 0
                && let Ok(mut v) = sink.lock()
            {
                v.push(note.is_some());
            }
        })));
        rows(&mut song, 4);
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![true, false, true, false], "row note on first tick, None after");
    }

    #[test]
    fn test_row_delay_holds_the_row() {
        let mut m = module(&[0], 4);
        if let Some(Some(p)) = m.patterns.get_mut(0)
            && let Some(n) = p.note_mut(0, 0)
        {
            n.effect = Effect::Special;
            n.param = 0xE2;
        }
        let mut song = playing(m, -1);
        song.current_speed = 1;
        let mut rows_at = Vec::new();
        for _ in 0..5 {
            song.process_tick();
            rows_at.push(song.row);
        }
        assert_eq!(rows_at, vec![0, 0, 0, 1, 2], "SE2 plays row 0 three times");
    }
}
